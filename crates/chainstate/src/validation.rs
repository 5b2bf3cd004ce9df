//! Consensus rules applied to candidate blocks, in the order the chain engine runs them.

use schilling_consensus::constants::{MAX_BLOCK_SIZE, MIN_BLOCK_VERSION};
use schilling_consensus::{ConsensusParams, Hash256};
use schilling_pow::difficulty::{get_next_work_required, DifficultyError, HeaderInfo};
use schilling_pow::{check_proof_of_work, PowError};
use schilling_primitives::{Block, BlockHeader};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("block version {0} below minimum")]
    BadVersion(i32),
    #[error("first transaction is not a coinbase")]
    FirstNotCoinbase,
    #[error("transaction {0} is an extra coinbase")]
    ExtraCoinbase(usize),
    #[error("merkle root does not commit to the transactions")]
    MerkleMismatch,
    #[error("block of {0} bytes exceeds size limit")]
    Oversized(usize),
    #[error("proof of work: {0}")]
    Pow(#[from] PowError),
    #[error("block time {time} not after median time past {median_time_past}")]
    TimeTooEarly { time: u32, median_time_past: i64 },
    #[error("block time {time} too far in the future (limit {limit})")]
    TimeTooNew { time: u32, limit: i64 },
    #[error("bad difficulty bits at height {height}: expected {expected:#x}, got {actual:#x}")]
    BadDifficulty {
        height: i32,
        expected: u32,
        actual: u32,
    },
    #[error("retarget: {0}")]
    Retarget(DifficultyError),
    #[error("block at height {height} conflicts with checkpoint")]
    CheckpointMismatch { height: i32 },
}

/// Rule 1: structure. Header-only blocks only carry the version check.
pub fn check_block_structure(block: &Block) -> Result<(), VerificationError> {
    if block.header.version < MIN_BLOCK_VERSION {
        return Err(VerificationError::BadVersion(block.header.version));
    }
    if block.is_header_only() {
        return Ok(());
    }
    if !block.transactions[0].is_coinbase() {
        return Err(VerificationError::FirstNotCoinbase);
    }
    if let Some(index) = block
        .transactions
        .iter()
        .skip(1)
        .position(|tx| tx.is_coinbase())
    {
        return Err(VerificationError::ExtraCoinbase(index + 1));
    }
    let size = block.consensus_encode().len();
    if size > MAX_BLOCK_SIZE {
        return Err(VerificationError::Oversized(size));
    }
    if block.compute_merkle_root() != block.header.merkle_root {
        return Err(VerificationError::MerkleMismatch);
    }
    Ok(())
}

/// Rule 2: the header hash meets its declared target.
pub fn check_header_pow(
    hash: &Hash256,
    header: &BlockHeader,
    params: &ConsensusParams,
) -> Result<(), VerificationError> {
    check_proof_of_work(hash, header.bits, params)?;
    Ok(())
}

/// Median of up to the last eleven block times, newest first in `times`.
pub fn median_time_past(times: &[i64]) -> i64 {
    if times.is_empty() {
        return 0;
    }
    let mut sorted = times.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

pub fn check_timestamp(
    header: &BlockHeader,
    median_time_past: i64,
    now: i64,
    params: &ConsensusParams,
) -> Result<(), VerificationError> {
    let time = i64::from(header.time);
    if time <= median_time_past {
        return Err(VerificationError::TimeTooEarly {
            time: header.time,
            median_time_past,
        });
    }
    let limit = now + params.max_future_block_time;
    if time > limit {
        return Err(VerificationError::TimeTooNew {
            time: header.time,
            limit,
        });
    }
    Ok(())
}

/// Rule 3: declared bits equal the retarget result for the child of `parent`.
pub fn check_difficulty_transition(
    header: &BlockHeader,
    parent: &HeaderInfo,
    window_start: Option<&HeaderInfo>,
    params: &ConsensusParams,
) -> Result<(), VerificationError> {
    let expected = get_next_work_required(parent, window_start, params)
        .map_err(VerificationError::Retarget)?;
    if header.bits != expected {
        return Err(VerificationError::BadDifficulty {
            height: (parent.height + 1) as i32,
            expected,
            actual: header.bits,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use schilling_consensus::{chain_params, Network};

    fn header(time: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time,
            bits: 0x207f_ffff,
            nonce: 0,
        }
    }

    #[test]
    fn median_uses_middle_of_sorted_window() {
        assert_eq!(median_time_past(&[5, 1, 3]), 3);
        assert_eq!(median_time_past(&[10, 20, 30, 40]), 30);
    }

    #[test]
    fn timestamp_bounds() {
        let params = chain_params(Network::Regtest).consensus;
        assert!(check_timestamp(&header(100), 99, 100, &params).is_ok());
        assert!(matches!(
            check_timestamp(&header(99), 99, 100, &params),
            Err(VerificationError::TimeTooEarly { .. })
        ));
        let far = 100 + params.max_future_block_time as u32 + 1;
        assert!(matches!(
            check_timestamp(&header(far), 0, 100, &params),
            Err(VerificationError::TimeTooNew { .. })
        ));
    }

    #[test]
    fn header_only_block_passes_structure() {
        assert!(check_block_structure(&Block::header_only(header(1))).is_ok());
        let mut old = header(1);
        old.version = 0;
        assert_eq!(
            check_block_structure(&Block::header_only(old)),
            Err(VerificationError::BadVersion(0))
        );
    }
}

//! Difficulty and compact target utilities.

use std::cmp::Ordering;

use primitive_types::U256;
use schilling_consensus::{ConsensusParams, Hash256};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CompactError {
    #[error("compact target has negative sign bit")]
    Negative,
    #[error("compact target overflows 256-bit range")]
    Overflow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DifficultyError {
    /// The first block of the retarget window is not available.
    #[error("retarget window start at height {0} is unavailable")]
    MissingAncestor(i64),
    #[error("retarget window start at height {expected} but got {actual}")]
    WrongAncestor { expected: i64, actual: i64 },
    #[error(transparent)]
    Compact(#[from] CompactError),
}

#[derive(Clone, Copy, Debug)]
pub struct HeaderInfo {
    pub height: i64,
    pub time: i64,
    pub bits: u32,
}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative && word != 0 {
        return Err(CompactError::Negative);
    }

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3))
    };

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected number of hashes needed to find a block at `bits`.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::one();
    Ok((!target / (target + one)) + one)
}

/// Compares two little-endian 256-bit values numerically.
pub fn cmp_le(a: &Hash256, b: &Hash256) -> Ordering {
    U256::from_little_endian(a).cmp(&U256::from_little_endian(b))
}

pub fn is_retarget_height(height: i64, params: &ConsensusParams) -> bool {
    height % params.difficulty_adjustment_interval() == 0
}

/// Height of the first block of the window that closes with `last_height`.
pub fn retarget_window_start(last_height: i64, params: &ConsensusParams) -> i64 {
    last_height - (params.difficulty_adjustment_interval() - 1)
}

/// Bits required for the child of `last`.
///
/// Off a retarget boundary (or when retargeting is disabled) the bits carry over
/// unchanged. On a boundary, `first` must be the block at
/// [`retarget_window_start`]; the observed timespan is clamped to a factor of
/// `pow_max_adjust_factor` and the result is capped at the proof-of-work limit.
pub fn get_next_work_required(
    last: &HeaderInfo,
    first: Option<&HeaderInfo>,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    if params.pow_no_retargeting || !is_retarget_height(last.height + 1, params) {
        return Ok(last.bits);
    }

    let expected = retarget_window_start(last.height, params);
    let first = first.ok_or(DifficultyError::MissingAncestor(expected))?;
    if first.height != expected {
        return Err(DifficultyError::WrongAncestor {
            expected,
            actual: first.height,
        });
    }

    calculate_next_work_required(last.bits, last.time, first.time, params)
}

pub fn calculate_next_work_required(
    last_bits: u32,
    last_time: i64,
    first_time: i64,
    params: &ConsensusParams,
) -> Result<u32, DifficultyError> {
    let actual_timespan = (last_time - first_time).clamp(
        params.min_actual_timespan(),
        params.max_actual_timespan(),
    );

    let pow_limit = U256::from_little_endian(&params.pow_limit);
    let target = compact_to_u256(last_bits)?;
    let next = target
        .checked_mul(U256::from(actual_timespan as u64))
        .map(|scaled| scaled / U256::from(params.pow_target_timespan as u64))
        .unwrap_or(pow_limit);

    Ok(u256_to_compact(next.min(pow_limit)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use schilling_consensus::{chain_params, Network};

    #[test]
    fn compact_encodes_back_to_same_bits() {
        for bits in [0x1d00_ffffu32, 0x1b04_04cb, 0x207f_ffff, 0x0412_3456] {
            let value = compact_to_u256(bits).expect("decode");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn negative_and_overflowing_compact_rejected() {
        assert_eq!(compact_to_u256(0x0480_0001), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff12_3456), Err(CompactError::Overflow));
        assert!(compact_to_u256(0x0180_0000).expect("zero word").is_zero());
    }

    #[test]
    fn proof_of_difficulty_one_block() {
        assert_eq!(
            block_proof(0x1d00_ffff).expect("proof"),
            U256::from(0x1_0001_0001u64)
        );
    }

    #[test]
    fn mainnet_retarget_vectors() {
        let params = chain_params(Network::Mainnet).consensus;
        let cases = [
            (1_261_130_161i64, 1_262_152_739i64, 0x1d00_ffffu32, 0x1d00_d86au32),
            (1_231_006_505, 1_233_061_996, 0x1d00_ffff, 0x1d00_ffff),
            (1_279_008_237, 1_279_297_671, 0x1c05_a3f4, 0x1c01_68fd),
            (1_263_163_443, 1_269_211_443, 0x1c38_7f6f, 0x1d00_e1fd),
        ];
        for (first_time, last_time, bits, expected) in cases {
            let next = calculate_next_work_required(bits, last_time, first_time, &params)
                .expect("retarget");
            assert_eq!(next, expected, "bits {bits:#x}");
        }
    }

    #[test]
    fn bits_carry_over_between_retargets() {
        let params = chain_params(Network::Mainnet).consensus;
        let last = HeaderInfo {
            height: 100,
            time: 1_528_800_000,
            bits: 0x1c05_a3f4,
        };
        assert_eq!(get_next_work_required(&last, None, &params), Ok(0x1c05_a3f4));
    }

    #[test]
    fn retarget_needs_window_start() {
        let params = chain_params(Network::Mainnet).consensus;
        let last = HeaderInfo {
            height: 2015,
            time: 1_528_800_000,
            bits: 0x1d00_ffff,
        };
        assert_eq!(
            get_next_work_required(&last, None, &params),
            Err(DifficultyError::MissingAncestor(0))
        );
        let first = HeaderInfo {
            height: 0,
            time: 1_528_800_000 - params.pow_target_timespan,
            bits: 0x1d00_ffff,
        };
        assert_eq!(
            get_next_work_required(&last, Some(&first), &params),
            Ok(0x1d00_ffff)
        );
    }
}

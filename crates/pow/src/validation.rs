use schilling_consensus::{ConsensusParams, Hash256};
use thiserror::Error;

use crate::difficulty::{compact_to_u256, CompactError};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PowError {
    #[error("invalid difficulty bits: {0}")]
    InvalidBits(#[from] CompactError),
    #[error("difficulty target is zero")]
    ZeroTarget,
    #[error("difficulty target above proof-of-work limit")]
    AboveLimit,
    #[error("block hash does not meet its target")]
    HashAboveTarget,
}

/// Checks that `hash` satisfies the target encoded in `bits` and that the target itself
/// is within the network limit.
pub fn check_proof_of_work(
    hash: &Hash256,
    bits: u32,
    params: &ConsensusParams,
) -> Result<(), PowError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Err(PowError::ZeroTarget);
    }
    if target > U256::from_little_endian(&params.pow_limit) {
        return Err(PowError::AboveLimit);
    }
    if U256::from_little_endian(hash) > target {
        return Err(PowError::HashAboveTarget);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use schilling_consensus::{chain_params, Network};

    #[test]
    fn regtest_genesis_hash_meets_its_bits() {
        let params = chain_params(Network::Regtest).consensus;
        assert_eq!(
            check_proof_of_work(&params.hash_genesis_block, params.genesis.bits, &params),
            Ok(())
        );
    }

    #[test]
    fn rejects_easy_bits_and_high_hash() {
        let params = chain_params(Network::Mainnet).consensus;
        assert_eq!(
            check_proof_of_work(&[0u8; 32], 0x207f_ffff, &params),
            Err(PowError::AboveLimit)
        );
        assert_eq!(
            check_proof_of_work(&[0xffu8; 32], 0x1d00_ffff, &params),
            Err(PowError::HashAboveTarget)
        );
        assert_eq!(check_proof_of_work(&[0u8; 32], 0, &params), Err(PowError::ZeroTarget));
    }
}

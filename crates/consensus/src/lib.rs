//! Network parameters and consensus-wide constants.

pub mod constants;
pub mod params;

pub type Hash256 = [u8; 32];

pub use params::{
    chain_params, hash256_from_hex, hash256_to_hex, ChainParams, Checkpoint, ConsensusParams,
    Network,
};

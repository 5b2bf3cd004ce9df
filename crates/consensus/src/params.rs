//! Per-network chain parameters.
//!
//! Parameters are plain values built by [`chain_params`] and handed to every component by
//! reference (usually behind an `Arc`); nothing here is global.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Network {
    type Err = ParseNetworkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "main" | "mainnet" => Ok(Network::Mainnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(ParseNetworkError(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown network {0:?} (expected main or regtest)")]
pub struct ParseNetworkError(String);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseHashError {
    #[error("hash hex must be 64 characters, got {0}")]
    Length(usize),
    #[error("invalid hex digit in hash")]
    InvalidDigit,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// Header fields of the genesis block. The block itself is anchored by
/// [`ConsensusParams::hash_genesis_block`].
#[derive(Clone, Debug)]
pub struct GenesisParams {
    pub version: i32,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub hash_genesis_block: Hash256,
    pub genesis: GenesisParams,
    /// Easiest allowed target, little-endian.
    pub pow_limit: Hash256,
    pub pow_target_timespan: i64,
    pub pow_target_spacing: i64,
    /// Retargets may move the target by at most this factor in either direction.
    pub pow_max_adjust_factor: i64,
    pub pow_no_retargeting: bool,
    pub max_future_block_time: i64,
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    pub fn difficulty_adjustment_interval(&self) -> i64 {
        self.pow_target_timespan / self.pow_target_spacing
    }

    pub fn min_actual_timespan(&self) -> i64 {
        self.pow_target_timespan / self.pow_max_adjust_factor
    }

    pub fn max_actual_timespan(&self) -> i64 {
        self.pow_target_timespan * self.pow_max_adjust_factor
    }
}

#[derive(Clone, Copy, Debug)]
pub struct AddressPrefixes {
    pub pubkey_hash: u8,
    pub script_hash: u8,
    pub secret_key: u8,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub dns_seeds: &'static [&'static str],
    pub fixed_seeds: &'static [&'static str],
    pub address_prefixes: AddressPrefixes,
    pub spendable_coinbase_depth: i32,
}

const TARGET_TIMESPAN: i64 = 14 * 24 * 60 * 60;
const TARGET_SPACING: i64 = 10 * 60;

const MAINNET_GENESIS_HASH: Hash256 =
    hash_from_be_hex("00000000b45c8fb2ef515c4cf22f29bbe47a7acca246fb25b0ea241577d46e2f");
const MAINNET_POW_LIMIT: Hash256 =
    hash_from_be_hex("00000000ffff0000000000000000000000000000000000000000000000000000");

const REGTEST_GENESIS_HASH: Hash256 =
    hash_from_be_hex("20dd39315c13773b0d55f182bd50ec5f30965f1422e5eeee1554c77f4a14a9c8");
const REGTEST_POW_LIMIT: Hash256 =
    hash_from_be_hex("7fffff0000000000000000000000000000000000000000000000000000000000");
const REGTEST_GENESIS_MERKLE_ROOT: Hash256 =
    hash_from_be_hex("4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b");

const MAINNET_DNS_SEEDS: &[&str] = &[
    "seed1.schillingcoin.com",
    "seed2.schillingcoin.com",
    "explorer.schillingcoin.com",
    "pool.schillingcoin.com",
    "dev.miu.at",
];

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_params(),
        Network::Regtest => regtest_params(),
    }
}

fn mainnet_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        consensus: ConsensusParams {
            hash_genesis_block: MAINNET_GENESIS_HASH,
            genesis: GenesisParams {
                version: 1,
                // Not carried. Mainnet genesis is anchored by MAINNET_GENESIS_HASH and the
                // stored entry is never re-hashed.
                merkle_root: [0u8; 32],
                time: 1_528_727_751,
                bits: 0x1d00_ffff,
                nonce: 907_246_021,
            },
            pow_limit: MAINNET_POW_LIMIT,
            pow_target_timespan: TARGET_TIMESPAN,
            pow_target_spacing: TARGET_SPACING,
            pow_max_adjust_factor: 4,
            pow_no_retargeting: false,
            max_future_block_time: crate::constants::MAX_FUTURE_BLOCK_TIME,
            checkpoints: vec![Checkpoint {
                height: 0,
                hash: MAINNET_GENESIS_HASH,
            }],
        },
        message_start: [0xe8, 0xf8, 0xa4, 0x22],
        default_port: 9976,
        dns_seeds: MAINNET_DNS_SEEDS,
        fixed_seeds: &[],
        address_prefixes: AddressPrefixes {
            pubkey_hash: 63,
            script_hash: 125,
            secret_key: 183,
        },
        spendable_coinbase_depth: 500,
    }
}

fn regtest_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        consensus: ConsensusParams {
            hash_genesis_block: REGTEST_GENESIS_HASH,
            genesis: GenesisParams {
                version: 1,
                merkle_root: REGTEST_GENESIS_MERKLE_ROOT,
                time: 1_528_727_751,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            pow_limit: REGTEST_POW_LIMIT,
            pow_target_timespan: TARGET_TIMESPAN,
            pow_target_spacing: TARGET_SPACING,
            pow_max_adjust_factor: 4,
            pow_no_retargeting: true,
            max_future_block_time: crate::constants::MAX_FUTURE_BLOCK_TIME,
            checkpoints: vec![Checkpoint {
                height: 0,
                hash: REGTEST_GENESIS_HASH,
            }],
        },
        message_start: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 19976,
        dns_seeds: &[],
        fixed_seeds: &[],
        address_prefixes: AddressPrefixes {
            pubkey_hash: 111,
            script_hash: 196,
            secret_key: 239,
        },
        spendable_coinbase_depth: 100,
    }
}

/// Parses a display-order (big-endian) hash into internal byte order.
pub fn hash256_from_hex(hex: &str) -> Result<Hash256, ParseHashError> {
    let bytes = hex.trim().as_bytes();
    if bytes.len() != 64 {
        return Err(ParseHashError::Length(bytes.len()));
    }
    let mut out = [0u8; 32];
    for (index, pair) in bytes.chunks_exact(2).enumerate() {
        let high = (pair[0] as char)
            .to_digit(16)
            .ok_or(ParseHashError::InvalidDigit)?;
        let low = (pair[1] as char)
            .to_digit(16)
            .ok_or(ParseHashError::InvalidDigit)?;
        out[31 - index] = ((high << 4) | low) as u8;
    }
    Ok(out)
}

/// Formats an internal-order hash in display (big-endian) order.
pub fn hash256_to_hex(hash: &Hash256) -> String {
    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        out.push(hex_digit(byte >> 4));
        out.push(hex_digit(byte & 0x0f));
    }
    out
}

fn hex_digit(value: u8) -> char {
    match value {
        0..=9 => (b'0' + value) as char,
        _ => (b'a' + (value - 10)) as char,
    }
}

const fn hex_value(byte: u8) -> u8 {
    match byte {
        b'0'..=b'9' => byte - b'0',
        b'a'..=b'f' => byte - b'a' + 10,
        b'A'..=b'F' => byte - b'A' + 10,
        _ => panic!("invalid hex digit in hash constant"),
    }
}

const fn hash_from_be_hex(hex: &str) -> Hash256 {
    let bytes = hex.as_bytes();
    assert!(bytes.len() == 64, "hash constant must be 64 hex characters");
    let mut out = [0u8; 32];
    let mut index = 0;
    while index < 32 {
        out[31 - index] = (hex_value(bytes[2 * index]) << 4) | hex_value(bytes[2 * index + 1]);
        index += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_reverses_byte_order() {
        let hex = "00000000b45c8fb2ef515c4cf22f29bbe47a7acca246fb25b0ea241577d46e2f";
        let hash = hash256_from_hex(hex).expect("parse");
        assert_eq!(hash[31], 0x00);
        assert_eq!(hash[0], 0x2f);
        assert_eq!(hash256_to_hex(&hash), hex);
        assert_eq!(hash, MAINNET_GENESIS_HASH);
    }

    #[test]
    fn rejects_malformed_hex() {
        assert_eq!(hash256_from_hex("abcd"), Err(ParseHashError::Length(4)));
        let bad = "zz".repeat(32);
        assert_eq!(hash256_from_hex(&bad), Err(ParseHashError::InvalidDigit));
    }

    #[test]
    fn mainnet_retarget_interval() {
        let params = chain_params(Network::Mainnet);
        assert_eq!(params.consensus.difficulty_adjustment_interval(), 2016);
        assert_eq!(params.consensus.checkpoints[0].hash, params.consensus.hash_genesis_block);
        assert_eq!("main".parse::<Network>().expect("network"), Network::Mainnet);
    }
}

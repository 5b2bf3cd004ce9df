//! Consensus-wide constants shared across validation.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_001;
/// Peers announcing an older protocol version are disconnected after `version`.
pub const MIN_PEER_PROTOCOL_VERSION: i32 = 70_000;
/// Blocks may not be timestamped further than this into the future (network rule).
pub const MAX_FUTURE_BLOCK_TIME: i64 = 2 * 60 * 60;
/// Number of previous blocks whose median time a new block must exceed (network rule).
pub const MEDIAN_TIME_SPAN: usize = 11;
/// The minimum allowed block version (network rule).
pub const MIN_BLOCK_VERSION: i32 = 1;
/// Version written into locally built headers.
pub const CURRENT_BLOCK_VERSION: i32 = 1;
/// Upper bound on a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: usize = 1_000_000;

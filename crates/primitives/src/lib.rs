//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod transaction;

pub use block::{Block, BlockHeader};
pub use encoding::{DecodeError, Decoder, Encoder};
pub use hash::{sha256, sha256d};
pub use transaction::{OutPoint, Transaction, TxIn, TxOut};

//! Block-tree state for the SPV client: stored blocks, checkpoints, orphans and chain
//! selection.

pub mod block_store;
pub mod chain;
pub mod events;
pub mod orphans;
pub mod stored_block;
pub mod valid_hashes;
pub mod validation;

pub use block_store::{BlockStore, KvBlockStore, MemoryBlockStore, StoreError};
pub use chain::{AddOutcome, BlockChain, BlockSource, BlockStatus, ChainError, RejectedBlock};
pub use events::{AcceptAll, ChainEvent, TransactionFilter};
pub use stored_block::StoredBlock;
pub use valid_hashes::{ValidHashError, ValidHashStore};
pub use validation::VerificationError;

//! Block-metadata persistence: stored blocks keyed by hash plus the chain head pointer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use schilling_consensus::{hash256_to_hex, Hash256};
use schilling_primitives::encoding::DecodeError;
use schilling_storage::{Column, KeyValueStore, WriteBatch};
use thiserror::Error;

use crate::stored_block::StoredBlock;

/// Blocks retained by [`MemoryBlockStore`] unless configured otherwise.
pub const DEFAULT_MEMORY_CAPACITY: usize = 5000;

const META_CHAIN_HEAD_KEY: &[u8] = b"chain_head";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Backend(#[from] schilling_storage::StoreError),
    #[error("stored block {hash} is corrupt: {source}")]
    Corrupt { hash: String, source: DecodeError },
    #[error("block store has no chain head")]
    MissingHead,
}

impl StoreError {
    fn corrupt(hash: &Hash256, source: DecodeError) -> Self {
        StoreError::Corrupt {
            hash: hash256_to_hex(hash),
            source,
        }
    }
}

pub trait BlockStore: Send + Sync {
    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StoreError>;
    fn put(&self, block: &StoredBlock) -> Result<(), StoreError>;
    fn chain_head(&self) -> Result<StoredBlock, StoreError>;
    fn set_chain_head(&self, head: &StoredBlock) -> Result<(), StoreError>;
    /// Writes `blocks` and moves the head in one atomic step.
    fn put_with_head(&self, blocks: &[StoredBlock], head: &StoredBlock) -> Result<(), StoreError>;
}

impl<T: BlockStore + ?Sized> BlockStore for Arc<T> {
    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StoreError> {
        self.as_ref().get(hash)
    }

    fn put(&self, block: &StoredBlock) -> Result<(), StoreError> {
        self.as_ref().put(block)
    }

    fn chain_head(&self) -> Result<StoredBlock, StoreError> {
        self.as_ref().chain_head()
    }

    fn set_chain_head(&self, head: &StoredBlock) -> Result<(), StoreError> {
        self.as_ref().set_chain_head(head)
    }

    fn put_with_head(&self, blocks: &[StoredBlock], head: &StoredBlock) -> Result<(), StoreError> {
        self.as_ref().put_with_head(blocks, head)
    }
}

/// Block store over any [`KeyValueStore`] backend.
pub struct KvBlockStore<S> {
    store: S,
    head: RwLock<Option<StoredBlock>>,
}

impl<S: KeyValueStore> KvBlockStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            head: RwLock::new(None),
        }
    }

    fn cache_head(&self, head: &StoredBlock) {
        *self.head.write().unwrap_or_else(PoisonError::into_inner) = Some(head.clone());
    }
}

impl<S: KeyValueStore> BlockStore for KvBlockStore<S> {
    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StoreError> {
        let Some(bytes) = self.store.get(Column::StoredBlock, hash)? else {
            return Ok(None);
        };
        StoredBlock::decode(*hash, &bytes)
            .map(Some)
            .map_err(|err| StoreError::corrupt(hash, err))
    }

    fn put(&self, block: &StoredBlock) -> Result<(), StoreError> {
        self.store
            .put(Column::StoredBlock, &block.hash, &block.encode())?;
        Ok(())
    }

    fn chain_head(&self) -> Result<StoredBlock, StoreError> {
        if let Some(head) = self
            .head
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Ok(head);
        }
        let hash_bytes = self
            .store
            .get(Column::Meta, META_CHAIN_HEAD_KEY)?
            .ok_or(StoreError::MissingHead)?;
        let hash: Hash256 = hash_bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::corrupt(&[0u8; 32], DecodeError::UnexpectedEof))?;
        let head = self.get(&hash)?.ok_or(StoreError::MissingHead)?;
        self.cache_head(&head);
        Ok(head)
    }

    fn set_chain_head(&self, head: &StoredBlock) -> Result<(), StoreError> {
        self.store.put(Column::Meta, META_CHAIN_HEAD_KEY, &head.hash)?;
        self.cache_head(head);
        Ok(())
    }

    fn put_with_head(&self, blocks: &[StoredBlock], head: &StoredBlock) -> Result<(), StoreError> {
        let mut batch = WriteBatch::new();
        for block in blocks {
            batch.put(Column::StoredBlock, block.hash.to_vec(), block.encode());
        }
        batch.put(Column::Meta, META_CHAIN_HEAD_KEY.to_vec(), head.hash.to_vec());
        self.store.write_batch(&batch)?;
        self.cache_head(head);
        Ok(())
    }
}

struct MemoryInner {
    blocks: HashMap<Hash256, StoredBlock>,
    order: VecDeque<Hash256>,
    head: Option<StoredBlock>,
}

/// Bounded in-memory store keeping only the most recently written blocks.
///
/// Lookups of evicted blocks return `Ok(None)`. The current head is never evicted.
pub struct MemoryBlockStore {
    inner: Mutex<MemoryInner>,
    capacity: usize,
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                blocks: HashMap::new(),
                order: VecDeque::new(),
                head: None,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(inner: &mut MemoryInner, block: &StoredBlock, capacity: usize) {
        if inner.blocks.insert(block.hash, block.clone()).is_some() {
            return;
        }
        inner.order.push_back(block.hash);
        while inner.blocks.len() > capacity {
            let Some(evicted) = inner.order.pop_front() else {
                break;
            };
            let is_head = inner
                .head
                .as_ref()
                .is_some_and(|head| head.hash == evicted);
            if is_head {
                inner.order.push_back(evicted);
                if inner.order.len() == 1 {
                    break;
                }
                continue;
            }
            inner.blocks.remove(&evicted);
        }
    }
}

impl BlockStore for MemoryBlockStore {
    fn get(&self, hash: &Hash256) -> Result<Option<StoredBlock>, StoreError> {
        Ok(self.lock().blocks.get(hash).cloned())
    }

    fn put(&self, block: &StoredBlock) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::insert(&mut inner, block, self.capacity);
        Ok(())
    }

    fn chain_head(&self) -> Result<StoredBlock, StoreError> {
        self.lock().head.clone().ok_or(StoreError::MissingHead)
    }

    fn set_chain_head(&self, head: &StoredBlock) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.head = Some(head.clone());
        Self::insert(&mut inner, head, self.capacity);
        Ok(())
    }

    fn put_with_head(&self, blocks: &[StoredBlock], head: &StoredBlock) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.head = Some(head.clone());
        for block in blocks {
            Self::insert(&mut inner, block, self.capacity);
        }
        Self::insert(&mut inner, head, self.capacity);
        Ok(())
    }
}

//! The block-tree engine: validates candidate blocks, parks orphans, selects the chain with
//! the most work and publishes what changed.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use schilling_consensus::constants::MEDIAN_TIME_SPAN;
use schilling_consensus::{hash256_to_hex, ChainParams, ConsensusParams, Hash256};
use schilling_pow::difficulty::{is_retarget_height, retarget_window_start, HeaderInfo};
use schilling_primitives::{Block, BlockHeader, Transaction};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::block_store::{BlockStore, StoreError};
use crate::events::{AcceptAll, ChainEvent, EventBus, TransactionFilter};
use crate::orphans::OrphanPool;
use crate::stored_block::StoredBlock;
use crate::valid_hashes::ValidHashStore;
use crate::validation::{
    check_block_structure, check_difficulty_transition, check_header_pow, check_timestamp,
    median_time_past, VerificationError,
};

/// Blocks whose transactions are remembered for later disconnect/reconnect notifications.
const TX_CACHE_BLOCKS: usize = 2_000;
/// Locator entries listed one by one before the step starts doubling.
const LOCATOR_DENSE_ENTRIES: usize = 10;

/// Where a candidate block came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockSource {
    Peer { addr: SocketAddr, trusted: bool },
    Local,
}

impl BlockSource {
    pub fn is_untrusted(&self) -> bool {
        matches!(self, BlockSource::Peer { trusted: false, .. })
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            BlockSource::Peer { addr, .. } => Some(*addr),
            BlockSource::Local => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockStatus {
    /// Extended the best chain by one block.
    Extended,
    /// Became the head of a heavier fork; the best chain switched to it.
    Reorganized,
    /// Stored on a fork with no more work than the current head.
    SideChain,
    /// Parked until its parent arrives.
    Orphaned,
    AlreadyKnown,
}

/// A parked orphan that failed validation once its parent arrived.
#[derive(Clone, Debug)]
pub struct RejectedBlock {
    pub hash: Hash256,
    pub source: BlockSource,
    pub error: VerificationError,
}

/// Result of [`BlockChain::add_block`]: the candidate's own status plus any parked
/// descendants that were rejected while being connected behind it.
#[derive(Debug)]
pub struct AddOutcome {
    pub status: BlockStatus,
    pub rejected_orphans: Vec<RejectedBlock>,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("block rejected: {0}")]
    Verification(#[from] VerificationError),
    #[error("block store: {0}")]
    Store(#[from] StoreError),
    #[error("block store genesis {found} does not match network genesis {expected}")]
    GenesisMismatch { expected: String, found: String },
    #[error("ancestor {0} is not retained by the block store")]
    MissingAncestor(String),
}

impl ChainError {
    /// Storage failures leave the chain in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::Store(_) | ChainError::GenesisMismatch { .. })
    }
}

struct TxCache {
    entries: HashMap<Hash256, Arc<Vec<Transaction>>>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl TxCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, hash: &Hash256) -> Option<Arc<Vec<Transaction>>> {
        self.entries.get(hash).cloned()
    }

    fn insert(&mut self, hash: Hash256, transactions: Vec<Transaction>) {
        if self.entries.insert(hash, Arc::new(transactions)).is_some() {
            return;
        }
        self.order.push_back(hash);
        while self.entries.len() > self.capacity {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&evicted);
        }
    }
}

struct ChainInner {
    orphans: OrphanPool,
    tx_cache: TxCache,
    filter: Arc<dyn TransactionFilter>,
}

pub struct BlockChain {
    params: Arc<ChainParams>,
    store: Arc<dyn BlockStore>,
    valid_hashes: Arc<ValidHashStore>,
    inner: Mutex<ChainInner>,
    head: RwLock<StoredBlock>,
    events: EventBus,
}

impl BlockChain {
    /// Opens the chain over `store`, seeding it with the genesis block when empty.
    pub fn new(
        params: Arc<ChainParams>,
        store: Arc<dyn BlockStore>,
        valid_hashes: Arc<ValidHashStore>,
    ) -> Result<Self, ChainError> {
        let consensus = &params.consensus;
        let head = match store.chain_head() {
            Ok(head) => {
                verify_genesis(store.as_ref(), consensus, &head)?;
                info!(
                    height = head.height,
                    hash = %hash256_to_hex(&head.hash),
                    "resuming chain"
                );
                head
            }
            Err(StoreError::MissingHead) => {
                let genesis = StoredBlock::genesis(consensus)
                    .map_err(|err| VerificationError::Pow(err.into()))?;
                store.put_with_head(std::slice::from_ref(&genesis), &genesis)?;
                info!(hash = %hash256_to_hex(&genesis.hash), "initialized chain at genesis");
                genesis
            }
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            params,
            store,
            valid_hashes,
            inner: Mutex::new(ChainInner {
                orphans: OrphanPool::default(),
                tx_cache: TxCache::new(TX_CACHE_BLOCKS),
                filter: Arc::new(AcceptAll),
            }),
            head: RwLock::new(head),
            events: EventBus::default(),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Last committed head; never observes a half-applied reorganization.
    pub fn chain_head(&self) -> StoredBlock {
        self.head
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn best_height(&self) -> i32 {
        self.head
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .height
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Option<StoredBlock>, ChainError> {
        Ok(self.store.get(hash)?)
    }

    pub fn is_orphan(&self, hash: &Hash256) -> bool {
        self.lock_inner().orphans.contains(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.lock_inner().orphans.len()
    }

    /// Header of the earliest parked ancestor of `hash`; its parent is what is missing.
    pub fn orphan_root(&self, hash: &Hash256) -> Option<BlockHeader> {
        self.lock_inner().orphans.root(hash)
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChainEvent> {
        self.events.subscribe()
    }

    pub fn set_transaction_filter(&self, filter: Arc<dyn TransactionFilter>) {
        self.lock_inner().filter = filter;
    }

    /// Hashes from the head back to genesis: ten dense entries, then doubling steps.
    pub fn block_locator(&self) -> Result<Vec<Hash256>, ChainError> {
        let genesis = self.params.consensus.hash_genesis_block;
        let mut locator = Vec::new();
        let mut step = 1;
        let mut cursor = Some(self.chain_head());
        while let Some(block) = cursor {
            locator.push(block.hash);
            if block.height == 0 {
                break;
            }
            if locator.len() >= LOCATOR_DENSE_ENTRIES {
                step *= 2;
            }
            let target = (block.height - step).max(0);
            cursor = self.ancestor_at(&block, target)?;
        }
        if locator.last() != Some(&genesis) {
            locator.push(genesis);
        }
        Ok(locator)
    }

    /// Validates `block` and applies it to the block tree.
    ///
    /// Consensus rejections return [`ChainError::Verification`] and publish
    /// [`ChainEvent::BlockRejected`]; the chain is left untouched. Events for committed
    /// changes are published before this returns.
    pub fn add(&self, block: Block, source: BlockSource) -> Result<BlockStatus, ChainError> {
        self.add_block(block, source).map(|outcome| outcome.status)
    }

    /// Like [`BlockChain::add`], also reporting orphans rejected while connecting behind
    /// the candidate so their senders can be held to account.
    pub fn add_block(&self, block: Block, source: BlockSource) -> Result<AddOutcome, ChainError> {
        let mut inner = self.lock_inner();
        let mut events = Vec::new();
        let mut rejected_orphans = Vec::new();
        let result = self
            .add_locked(&mut inner, block, source, &mut events, &mut rejected_orphans)
            .map(|status| AddOutcome {
                status,
                rejected_orphans,
            });
        self.events.publish(events);
        result
    }

    fn add_locked(
        &self,
        inner: &mut ChainInner,
        block: Block,
        source: BlockSource,
        events: &mut Vec<ChainEvent>,
        rejected: &mut Vec<RejectedBlock>,
    ) -> Result<BlockStatus, ChainError> {
        let hash = block.hash();
        if self.store.get(&hash)?.is_some() {
            return Ok(BlockStatus::AlreadyKnown);
        }
        if inner.orphans.contains(&hash) {
            return Ok(BlockStatus::Orphaned);
        }

        let now = Instant::now();
        let expired = inner.orphans.expire(now);
        if !expired.is_empty() {
            debug!(count = expired.len(), "expired orphan blocks");
        }

        let context_free = check_block_structure(&block)
            .and_then(|()| check_header_pow(&hash, &block.header, &self.params.consensus));
        if let Err(err) = context_free {
            return Err(self.reject(hash, source, err, events));
        }

        let Some(parent) = self.store.get(&block.header.prev_block)? else {
            for dropped in inner.orphans.insert(hash, block, source, now) {
                debug!(hash = %hash256_to_hex(&dropped), "orphan pool full, dropped oldest");
            }
            debug!(hash = %hash256_to_hex(&hash), "parked orphan block");
            return Ok(BlockStatus::Orphaned);
        };

        let status = match self.connect(inner, hash, block, &parent, &source, events) {
            Ok(status) => status,
            Err(ChainError::Verification(err)) => {
                return Err(self.reject(hash, source, err, events));
            }
            Err(err) => return Err(err),
        };
        self.connect_orphans(inner, hash, events, rejected)?;
        Ok(status)
    }

    fn connect_orphans(
        &self,
        inner: &mut ChainInner,
        root: Hash256,
        events: &mut Vec<ChainEvent>,
        rejected: &mut Vec<RejectedBlock>,
    ) -> Result<(), ChainError> {
        let mut queue = VecDeque::from([root]);
        while let Some(parent_hash) = queue.pop_front() {
            for (child_hash, entry) in inner.orphans.take_children(&parent_hash) {
                let Some(parent) = self.store.get(&parent_hash)? else {
                    continue;
                };
                match self.connect(inner, child_hash, entry.block, &parent, &entry.source, events) {
                    Ok(status) => {
                        let hash = hash256_to_hex(&child_hash);
                        debug!(%hash, ?status, "connected orphan block");
                        queue.push_back(child_hash);
                    }
                    Err(ChainError::Verification(err)) => {
                        self.reject(child_hash, entry.source.clone(), err.clone(), events);
                        let dropped = discard_descendants(&mut inner.orphans, child_hash);
                        if dropped > 0 {
                            debug!(
                                hash = %hash256_to_hex(&child_hash),
                                dropped,
                                "dropped orphans descending from a rejected block"
                            );
                        }
                        rejected.push(RejectedBlock {
                            hash: child_hash,
                            source: entry.source,
                            error: err,
                        });
                    }
                    Err(ChainError::MissingAncestor(missing)) => {
                        warn!(%missing, "orphan could not be connected");
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Runs the parent-dependent rules and links `block` under `parent`.
    fn connect(
        &self,
        inner: &mut ChainInner,
        hash: Hash256,
        block: Block,
        parent: &StoredBlock,
        source: &BlockSource,
        events: &mut Vec<ChainEvent>,
    ) -> Result<BlockStatus, ChainError> {
        self.check_contextual(&block.header, parent)?;
        if !self
            .valid_hashes
            .is_valid_hash(&hash, Some(parent), source.is_untrusted())
        {
            return Err(VerificationError::CheckpointMismatch {
                height: parent.height + 1,
            }
            .into());
        }

        let stored = parent
            .build_next(block.header)
            .map_err(|err| VerificationError::Pow(err.into()))?;
        if !block.transactions.is_empty() {
            inner.tx_cache.insert(hash, block.transactions);
        }

        let head = self.chain_head();
        if !stored.more_work_than(&head) {
            self.store.put(&stored)?;
            debug!(
                height = stored.height,
                hash = %hash256_to_hex(&hash),
                "stored side-chain block"
            );
            return Ok(BlockStatus::SideChain);
        }

        if stored.header.prev_block == head.hash {
            self.store
                .put_with_head(std::slice::from_ref(&stored), &stored)?;
            self.set_head(stored.clone());
            self.push_connected(inner, &stored, events);
            events.push(ChainEvent::HeadChanged { head: stored });
            return Ok(BlockStatus::Extended);
        }

        self.reorganize(inner, head, stored, events)?;
        Ok(BlockStatus::Reorganized)
    }

    fn reorganize(
        &self,
        inner: &mut ChainInner,
        old_head: StoredBlock,
        new_head: StoredBlock,
        events: &mut Vec<ChainEvent>,
    ) -> Result<(), ChainError> {
        let mut disconnected = Vec::new();
        let mut connected = vec![new_head.clone()];
        let mut old_cursor = old_head.clone();
        let mut new_cursor = self.load(&new_head.header.prev_block)?;

        while old_cursor.hash != new_cursor.hash {
            if old_cursor.height >= new_cursor.height {
                let prev = self.load(&old_cursor.header.prev_block)?;
                disconnected.push(std::mem::replace(&mut old_cursor, prev));
            }
            if new_cursor.height > old_cursor.height {
                let prev = self.load(&new_cursor.header.prev_block)?;
                connected.push(std::mem::replace(&mut new_cursor, prev));
            }
        }
        let split = old_cursor;

        self.store
            .put_with_head(std::slice::from_ref(&new_head), &new_head)?;
        self.set_head(new_head.clone());

        info!(
            split_height = split.height,
            old_height = old_head.height,
            new_height = new_head.height,
            disconnected = disconnected.len(),
            connected = connected.len(),
            "chain reorganized"
        );

        for block in &disconnected {
            self.push_disconnected(inner, block, events);
        }
        for block in connected.iter().rev() {
            self.push_connected(inner, block, events);
        }
        events.push(ChainEvent::Reorganized {
            split,
            old_head,
            new_head: new_head.clone(),
        });
        events.push(ChainEvent::HeadChanged { head: new_head });
        Ok(())
    }

    fn check_contextual(
        &self,
        header: &BlockHeader,
        parent: &StoredBlock,
    ) -> Result<(), ChainError> {
        let consensus = &self.params.consensus;
        let times = self.recent_times(parent)?;
        check_timestamp(header, median_time_past(&times), current_time_secs(), consensus)?;

        let parent_info = header_info(parent);
        let next_height = i64::from(parent.height) + 1;
        let retargets = !consensus.pow_no_retargeting && is_retarget_height(next_height, consensus);
        let window_start = if retargets {
            let start_height = retarget_window_start(parent_info.height, consensus);
            match self.ancestor_at(parent, start_height as i32)? {
                Some(start) => Some(header_info(&start)),
                None => {
                    warn!(
                        height = next_height,
                        "retarget window start not retained; skipping difficulty check"
                    );
                    return Ok(());
                }
            }
        } else {
            None
        };
        check_difficulty_transition(header, &parent_info, window_start.as_ref(), consensus)?;
        Ok(())
    }

    fn recent_times(&self, parent: &StoredBlock) -> Result<Vec<i64>, ChainError> {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = Some(parent.clone());
        while let Some(block) = cursor {
            times.push(i64::from(block.header.time));
            if times.len() == MEDIAN_TIME_SPAN || block.height == 0 {
                break;
            }
            cursor = self.store.get(&block.header.prev_block)?;
        }
        Ok(times)
    }

    /// Walks back from `from` to `height`. `None` when the walk leaves the retained window.
    fn ancestor_at(
        &self,
        from: &StoredBlock,
        height: i32,
    ) -> Result<Option<StoredBlock>, ChainError> {
        if height > from.height || height < 0 {
            return Ok(None);
        }
        let mut cursor = from.clone();
        while cursor.height > height {
            match self.store.get(&cursor.header.prev_block)? {
                Some(prev) => cursor = prev,
                None => return Ok(None),
            }
        }
        Ok(Some(cursor))
    }

    fn load(&self, hash: &Hash256) -> Result<StoredBlock, ChainError> {
        self.store
            .get(hash)?
            .ok_or_else(|| ChainError::MissingAncestor(hash256_to_hex(hash)))
    }

    fn push_connected(
        &self,
        inner: &ChainInner,
        block: &StoredBlock,
        events: &mut Vec<ChainEvent>,
    ) {
        events.push(ChainEvent::BlockConnected {
            block: block.clone(),
        });
        if let Some(transactions) = inner.tx_cache.get(&block.hash) {
            for tx in transactions.iter() {
                if inner.filter.is_relevant(tx) {
                    events.push(ChainEvent::TransactionConnected {
                        txid: tx.txid(),
                        tx: tx.clone(),
                        block_hash: block.hash,
                        height: block.height,
                    });
                }
            }
        }
    }

    fn push_disconnected(
        &self,
        inner: &ChainInner,
        block: &StoredBlock,
        events: &mut Vec<ChainEvent>,
    ) {
        if let Some(transactions) = inner.tx_cache.get(&block.hash) {
            for tx in transactions.iter().rev() {
                if inner.filter.is_relevant(tx) {
                    events.push(ChainEvent::TransactionDisconnected {
                        txid: tx.txid(),
                        tx: tx.clone(),
                        block_hash: block.hash,
                        height: block.height,
                    });
                }
            }
        }
        events.push(ChainEvent::BlockDisconnected {
            block: block.clone(),
        });
    }

    fn reject(
        &self,
        hash: Hash256,
        source: BlockSource,
        error: VerificationError,
        events: &mut Vec<ChainEvent>,
    ) -> ChainError {
        warn!(
            hash = %hash256_to_hex(&hash),
            peer = ?source.peer(),
            %error,
            "rejected block"
        );
        events.push(ChainEvent::BlockRejected {
            hash,
            source,
            error: error.clone(),
        });
        ChainError::Verification(error)
    }

    fn set_head(&self, head: StoredBlock) {
        *self.head.write().unwrap_or_else(PoisonError::into_inner) = head;
    }

    fn lock_inner(&self) -> MutexGuard<'_, ChainInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn verify_genesis(
    store: &dyn BlockStore,
    consensus: &ConsensusParams,
    head: &StoredBlock,
) -> Result<(), ChainError> {
    let expected = consensus.hash_genesis_block;
    match store.get(&expected)? {
        Some(genesis) if genesis.height == 0 => Ok(()),
        None if head.height > 0 => {
            warn!("genesis block no longer retained by the block store");
            Ok(())
        }
        _ => Err(ChainError::GenesisMismatch {
            expected: hash256_to_hex(&expected),
            found: hash256_to_hex(&head.hash),
        }),
    }
}

/// Removes every parked block built on `rejected`, at any depth.
fn discard_descendants(orphans: &mut OrphanPool, rejected: Hash256) -> usize {
    let mut dropped = 0;
    let mut queue = VecDeque::from([rejected]);
    while let Some(parent) = queue.pop_front() {
        for (child, _) in orphans.take_children(&parent) {
            dropped += 1;
            queue.push_back(child);
        }
    }
    dropped
}

fn header_info(block: &StoredBlock) -> HeaderInfo {
    HeaderInfo {
        height: i64::from(block.height),
        time: i64::from(block.header.time),
        bits: block.header.bits,
    }
}

fn current_time_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

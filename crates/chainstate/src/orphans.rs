use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use schilling_consensus::Hash256;
use schilling_primitives::{Block, BlockHeader};

use crate::chain::BlockSource;

/// Orphans held at once; the oldest is dropped to make room.
pub const MAX_ORPHAN_BLOCKS: usize = 500;
/// Orphans older than this are discarded.
pub const ORPHAN_EXPIRY: Duration = Duration::from_secs(20 * 60);

pub struct OrphanEntry {
    pub block: Block,
    pub source: BlockSource,
    received: Instant,
}

/// Blocks whose parent has not been seen yet, indexed by hash and by parent hash.
pub struct OrphanPool {
    blocks: HashMap<Hash256, OrphanEntry>,
    by_prev: HashMap<Hash256, Vec<Hash256>>,
    order: VecDeque<Hash256>,
    capacity: usize,
    expiry: Duration,
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new(MAX_ORPHAN_BLOCKS, ORPHAN_EXPIRY)
    }
}

impl OrphanPool {
    pub fn new(capacity: usize, expiry: Duration) -> Self {
        Self {
            blocks: HashMap::new(),
            by_prev: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            expiry,
        }
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.blocks.contains_key(hash)
    }

    /// Parks `block`. Returns the hashes evicted to stay within capacity.
    pub fn insert(
        &mut self,
        hash: Hash256,
        block: Block,
        source: BlockSource,
        now: Instant,
    ) -> Vec<Hash256> {
        if self.blocks.contains_key(&hash) {
            return Vec::new();
        }
        self.by_prev
            .entry(block.header.prev_block)
            .or_default()
            .push(hash);
        self.blocks.insert(
            hash,
            OrphanEntry {
                block,
                source,
                received: now,
            },
        );
        self.order.push_back(hash);

        let mut evicted = Vec::new();
        while self.blocks.len() > self.capacity {
            let Some(oldest) = self.order.front().copied() else {
                break;
            };
            self.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    pub fn remove(&mut self, hash: &Hash256) -> Option<OrphanEntry> {
        let entry = self.blocks.remove(hash)?;
        self.order.retain(|queued| queued != hash);
        let prev = entry.block.header.prev_block;
        if let Some(children) = self.by_prev.get_mut(&prev) {
            children.retain(|child| child != hash);
            if children.is_empty() {
                self.by_prev.remove(&prev);
            }
        }
        Some(entry)
    }

    /// Removes and returns every orphan whose parent is `prev_hash`, oldest first.
    pub fn take_children(&mut self, prev_hash: &Hash256) -> Vec<(Hash256, OrphanEntry)> {
        let Some(children) = self.by_prev.remove(prev_hash) else {
            return Vec::new();
        };
        children
            .into_iter()
            .filter_map(|child| {
                let entry = self.blocks.remove(&child)?;
                self.order.retain(|queued| *queued != child);
                Some((child, entry))
            })
            .collect()
    }

    /// Walks parent links through the pool and returns the earliest orphan's header.
    pub fn root(&self, hash: &Hash256) -> Option<BlockHeader> {
        let mut cursor = self.blocks.get(hash)?;
        while let Some(parent) = self.blocks.get(&cursor.block.header.prev_block) {
            cursor = parent;
        }
        Some(cursor.block.header.clone())
    }

    /// Drops orphans received before `now - expiry`.
    pub fn expire(&mut self, now: Instant) -> Vec<Hash256> {
        let mut expired = Vec::new();
        while let Some(oldest) = self.order.front().copied() {
            let stale = self
                .blocks
                .get(&oldest)
                .map_or(true, |entry| {
                    now.saturating_duration_since(entry.received) >= self.expiry
                });
            if !stale {
                break;
            }
            self.remove(&oldest);
            self.order.retain(|queued| *queued != oldest);
            expired.push(oldest);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(prev: u8, nonce: u32) -> (Hash256, Block) {
        let block = Block::header_only(BlockHeader {
            version: 1,
            prev_block: [prev; 32],
            merkle_root: [0u8; 32],
            time: 0,
            bits: 0x207f_ffff,
            nonce,
        });
        (block.hash(), block)
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let mut pool = OrphanPool::new(2, ORPHAN_EXPIRY);
        let now = Instant::now();
        let (a, block_a) = block(1, 1);
        let (b, block_b) = block(2, 2);
        let (c, block_c) = block(3, 3);
        assert!(pool.insert(a, block_a, BlockSource::Local, now).is_empty());
        assert!(pool.insert(b, block_b, BlockSource::Local, now).is_empty());
        assert_eq!(pool.insert(c, block_c, BlockSource::Local, now), vec![a]);
        assert!(!pool.contains(&a));
        assert!(pool.contains(&b) && pool.contains(&c));
        assert!(pool.take_children(&[1u8; 32]).is_empty());
    }

    #[test]
    fn root_follows_parent_links() {
        let mut pool = OrphanPool::default();
        let now = Instant::now();
        let (first, first_block) = block(9, 1);
        let second_block = Block::header_only(BlockHeader {
            prev_block: first,
            ..first_block.header.clone()
        });
        let second = second_block.hash();
        pool.insert(first, first_block, BlockSource::Local, now);
        pool.insert(second, second_block, BlockSource::Local, now);

        let root = pool.root(&second).expect("root");
        assert_eq!(root.hash(), first);
        assert_eq!(root.prev_block, [9u8; 32]);

        let children = pool.take_children(&first);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].0, second);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn expiry_drops_stale_orphans() {
        let mut pool = OrphanPool::new(10, Duration::from_secs(60));
        let start = Instant::now();
        let (a, block_a) = block(1, 1);
        let (b, block_b) = block(2, 2);
        pool.insert(a, block_a, BlockSource::Local, start);
        pool.insert(b, block_b, BlockSource::Local, start + Duration::from_secs(50));
        assert_eq!(pool.expire(start + Duration::from_secs(70)), vec![a]);
        assert_eq!(pool.len(), 1);
    }
}

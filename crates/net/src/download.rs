//! Splitting a batch of announced headers into download jobs, and releasing finished jobs
//! in the order the chain needs them.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;

use schilling_consensus::Hash256;
use schilling_primitives::BlockHeader;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobKind {
    /// Old enough to skip transaction download; fed to the chain as bare headers.
    HeaderOnly(Vec<BlockHeader>),
    /// Full blocks to fetch with `getdata`.
    Fetch(Vec<Hash256>),
}

#[derive(Clone, Debug)]
pub struct DownloadJob {
    pub seq: u64,
    pub kind: JobKind,
    /// Peers that already failed this job; skipped while others are available.
    pub failed_peers: HashSet<SocketAddr>,
}

impl DownloadJob {
    fn new(seq: u64, kind: JobKind) -> Self {
        Self {
            seq,
            kind,
            failed_peers: HashSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        match &self.kind {
            JobKind::HeaderOnly(headers) => headers.len(),
            JobKind::Fetch(hashes) => hashes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns one `headers` reply into jobs numbered from zero in chain order.
///
/// Headers the chain already holds are skipped. Headers timestamped before
/// `fast_catchup_time` form a single header-only job; from the first header at or after it,
/// everything is fetched in full in chunks of `job_size`.
pub fn plan_jobs(
    headers: &[BlockHeader],
    is_known: impl Fn(&Hash256) -> bool,
    fast_catchup_time: u64,
    job_size: usize,
) -> Vec<DownloadJob> {
    let mut header_only = Vec::new();
    let mut fetch = Vec::new();
    for header in headers {
        let hash = header.hash();
        if is_known(&hash) {
            continue;
        }
        if fetch.is_empty() && u64::from(header.time) < fast_catchup_time {
            header_only.push(header.clone());
        } else {
            fetch.push(hash);
        }
    }

    let mut jobs = Vec::new();
    if !header_only.is_empty() {
        jobs.push(DownloadJob::new(0, JobKind::HeaderOnly(header_only)));
    }
    for chunk in fetch.chunks(job_size.max(1)) {
        let seq = jobs.len() as u64;
        jobs.push(DownloadJob::new(seq, JobKind::Fetch(chunk.to_vec())));
    }
    jobs
}

/// Holds completed jobs until every earlier job has been released.
pub struct ReorderBuffer<T> {
    next: u64,
    waiting: BTreeMap<u64, T>,
    capacity: usize,
}

impl<T> ReorderBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            next: 0,
            waiting: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn next_seq(&self) -> u64 {
        self.next
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Buffers `item` under `seq`. When the buffer is full the entry furthest ahead is
    /// handed back (possibly `item` itself) so its job can be retried later. The next
    /// expected sequence number is always accepted.
    pub fn insert(&mut self, seq: u64, item: T) -> Option<(u64, T)> {
        if seq < self.next || self.waiting.contains_key(&seq) {
            return None;
        }
        self.waiting.insert(seq, item);
        if self.waiting.len() <= self.capacity {
            return None;
        }
        let last = self.waiting.keys().next_back().copied()?;
        if last == self.next {
            return None;
        }
        self.waiting.remove(&last).map(|item| (last, item))
    }

    /// Releases the next item if it has arrived.
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.waiting.remove(&self.next)?;
        self.next += 1;
        Some(item)
    }
}

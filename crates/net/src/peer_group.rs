//! Keeps a pool of peer connections, downloads the chain from them in parallel jobs, and
//! feeds every block through a single validation worker.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use schilling_chainstate::{
    BlockChain, BlockSource, BlockStatus, ChainError, RejectedBlock, VerificationError,
};
use schilling_consensus::{hash256_to_hex, ChainParams, Hash256};
use schilling_primitives::{Block, BlockHeader};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::addr_book::AddrBook;
use crate::download::{plan_jobs, DownloadJob, JobKind, ReorderBuffer};
use crate::message::{InvType, MAX_HEADERS_RESULTS};
use crate::peer::{NetTotals, NetTotalsSnapshot, Peer, PeerError, PeerEvent, PeerSettings};
use crate::peer_book::{BannedPeerInfo, PeerBook};

const WORK_QUEUE_DEPTH: usize = 64;
const SEED_REFRESH: Duration = Duration::from_secs(10 * 60);
const PEERS_PERSIST_INTERVAL: Duration = Duration::from_secs(60);
const RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PeerGroupConfig {
    /// Connections the group tries to keep open.
    pub max_connections: usize,
    /// Covers both the TCP connect and the version handshake.
    pub handshake_timeout_secs: u64,
    pub block_timeout_secs: u64,
    pub headers_timeout_secs: u64,
    /// Block hashes per download job.
    pub job_size: usize,
    pub max_jobs_per_peer: usize,
    /// Completed jobs held while an earlier one is still outstanding.
    pub reorder_capacity: usize,
    /// Unix time; blocks stamped earlier are accepted as bare headers.
    pub fast_catchup_time: u64,
    pub maintenance_interval_secs: u64,
    pub user_agent: String,
    pub use_dns_seeds: bool,
    pub peers_file: Option<PathBuf>,
}

impl Default for PeerGroupConfig {
    fn default() -> Self {
        Self {
            max_connections: 8,
            handshake_timeout_secs: 8,
            block_timeout_secs: 30,
            headers_timeout_secs: 20,
            job_size: 128,
            max_jobs_per_peer: 2,
            reorder_capacity: 32,
            fast_catchup_time: 0,
            maintenance_interval_secs: 5,
            user_agent: format!("/schilling-spv:{}/", env!("CARGO_PKG_VERSION")),
            use_dns_seeds: true,
            peers_file: None,
        }
    }
}

impl PeerGroupConfig {
    fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    fn block_timeout(&self) -> Duration {
        Duration::from_secs(self.block_timeout_secs.max(1))
    }

    fn headers_timeout(&self) -> Duration {
        Duration::from_secs(self.headers_timeout_secs.max(1))
    }

    fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs.max(1))
    }
}

/// Published on every change; `wait_for_sync` and `wait_for_peers` watch it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncState {
    pub chain_height: i32,
    pub best_peer_height: i32,
    pub peers: usize,
    pub synced: bool,
    pub stopped: bool,
    pub failure: Option<String>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PeerGroupError {
    #[error("peer group stopped")]
    Stopped,
    #[error("peer group is not running")]
    NotStarted,
    #[error("peer group already started")]
    AlreadyStarted,
    #[error("chain sync halted: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
enum SyncError {
    #[error("stopped")]
    Stopped,
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error("download task: {0}")]
    Task(String),
}

enum WorkItem {
    Blocks { blocks: Vec<Block>, source: BlockSource },
    /// Acknowledged once everything queued before it has been applied.
    Barrier(oneshot::Sender<()>),
}

#[derive(Default)]
struct BatchOutcome {
    accepted: usize,
    orphans: Vec<Hash256>,
    rejected_orphans: Vec<RejectedBlock>,
    error: Option<ChainError>,
}

struct Completed {
    job: DownloadJob,
    blocks: Vec<Block>,
    source: BlockSource,
}

struct JobResult {
    job: DownloadJob,
    peer: Peer,
    outcome: Result<Vec<Block>, PeerError>,
}

struct GroupInner {
    params: Arc<ChainParams>,
    config: PeerGroupConfig,
    chain: Arc<BlockChain>,
    addr_book: AddrBook,
    peer_book: PeerBook,
    totals: Arc<NetTotals>,
    peers: Mutex<HashMap<SocketAddr, Peer>>,
    connecting: Mutex<HashSet<SocketAddr>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    event_queue: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    work: Mutex<Option<mpsc::Sender<WorkItem>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    sync: watch::Sender<SyncState>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    sync_wake: Notify,
    maintenance_wake: Notify,
    seeds_resolved_at: Mutex<Option<Instant>>,
}

pub struct PeerGroup {
    inner: Arc<GroupInner>,
}

impl PeerGroup {
    pub fn new(params: Arc<ChainParams>, chain: Arc<BlockChain>, config: PeerGroupConfig) -> Self {
        let (events, event_queue) = mpsc::unbounded_channel();
        let initial = SyncState {
            chain_height: chain.best_height(),
            ..SyncState::default()
        };
        let (sync, _) = watch::channel(initial);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(GroupInner {
                params,
                config,
                chain,
                addr_book: AddrBook::new(),
                peer_book: PeerBook::default(),
                totals: Arc::new(NetTotals::default()),
                peers: Mutex::new(HashMap::new()),
                connecting: Mutex::new(HashSet::new()),
                events,
                event_queue: Mutex::new(Some(event_queue)),
                work: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                sync,
                shutdown,
                started: AtomicBool::new(false),
                sync_wake: Notify::new(),
                maintenance_wake: Notify::new(),
                seeds_resolved_at: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &PeerGroupConfig {
        &self.inner.config
    }

    /// Adds a manually configured node. Manual nodes are trusted and dialed first.
    pub fn add_address(&self, addr: SocketAddr) {
        self.inner.addr_book.add_trusted(addr);
        self.inner.maintenance_wake.notify_one();
    }

    pub fn known_addresses(&self) -> usize {
        self.inner.addr_book.len()
    }

    /// Spawns discovery, connection upkeep, the sync scheduler, and the validation worker.
    pub fn start(&self) -> Result<(), PeerGroupError> {
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(PeerGroupError::Stopped);
        }
        if inner.started.swap(true, Ordering::AcqRel) {
            return Err(PeerGroupError::AlreadyStarted);
        }
        let Some(event_queue) = lock(&inner.event_queue).take() else {
            return Err(PeerGroupError::AlreadyStarted);
        };
        if let Some(path) = &inner.config.peers_file {
            match AddrBook::load(path) {
                Ok(addrs) => {
                    let loaded = inner.addr_book.insert_many(addrs);
                    info!(count = loaded, path = %path.display(), "loaded known peers");
                }
                Err(err) => warn!(path = %path.display(), error = %err, "ignoring peers file"),
            }
        }

        let (work, work_queue) = mpsc::channel(WORK_QUEUE_DEPTH);
        *lock(&inner.work) = Some(work);
        let handles = vec![
            tokio::spawn(validation_worker(Arc::clone(inner), work_queue)),
            tokio::spawn(event_loop(Arc::clone(inner), event_queue)),
            tokio::spawn(maintenance_loop(Arc::clone(inner))),
            tokio::spawn(sync_loop(Arc::clone(inner))),
        ];
        lock(&inner.tasks).extend(handles);
        inner.refresh_sync_state();
        info!(
            network = %inner.params.network,
            target = inner.config.max_connections,
            height = inner.chain.best_height(),
            "peer group started"
        );
        Ok(())
    }

    pub fn sync_state(&self) -> SyncState {
        self.inner.sync.borrow().clone()
    }

    pub fn subscribe_sync(&self) -> watch::Receiver<SyncState> {
        self.inner.sync.subscribe()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.connected_peers().len()
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.inner.connected_peers()
    }

    pub fn net_totals(&self) -> NetTotalsSnapshot {
        self.inner.totals.snapshot()
    }

    pub fn banned_peers(&self) -> Vec<BannedPeerInfo> {
        self.inner.peer_book.banned_peers()
    }

    pub async fn wait_for_peers(&self, count: usize) -> Result<usize, PeerGroupError> {
        self.wait_until(|state| state.peers >= count)
            .await
            .map(|state| state.peers)
    }

    /// Resolves once the chain has caught up with the best height announced by connected
    /// peers. Fails instead of hanging when the group stops or chain sync halts.
    pub async fn wait_for_sync(&self) -> Result<SyncState, PeerGroupError> {
        self.wait_until(|state| state.synced).await
    }

    /// Kicks the scheduler and waits for the chain to catch up.
    pub async fn download_block_chain(&self) -> Result<SyncState, PeerGroupError> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(PeerGroupError::NotStarted);
        }
        self.inner.sync_wake.notify_one();
        self.wait_for_sync().await
    }

    async fn wait_until(
        &self,
        ready: impl Fn(&SyncState) -> bool,
    ) -> Result<SyncState, PeerGroupError> {
        let mut updates = self.inner.sync.subscribe();
        loop {
            let state = updates.borrow_and_update().clone();
            if let Some(reason) = &state.failure {
                return Err(PeerGroupError::Fatal(reason.clone()));
            }
            if state.stopped {
                return Err(PeerGroupError::Stopped);
            }
            if ready(&state) {
                return Ok(state);
            }
            if updates.changed().await.is_err() {
                return Err(PeerGroupError::Stopped);
            }
        }
    }

    /// Cancels every task (including connects still in handshake), disconnects all peers,
    /// closes the worker queue and wakes all waiters. Calling it again does nothing.
    pub async fn stop(&self) {
        let inner = &self.inner;
        if inner.shutdown.send_replace(true) {
            return;
        }
        info!("stopping peer group");
        let tasks = std::mem::take(&mut *lock(&inner.tasks));
        for task in &tasks {
            task.abort();
        }
        lock(&inner.work).take();
        lock(&inner.connecting).clear();
        let peers: Vec<Peer> = lock(&inner.peers).drain().map(|(_, peer)| peer).collect();
        for peer in peers {
            peer.disconnect().await;
        }
        inner.save_peers();
        inner.sync.send_modify(|state| {
            state.stopped = true;
            state.synced = false;
            state.peers = 0;
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolves when the shutdown flag is raised or its sender is gone.
async fn shutdown_signal(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

impl GroupInner {
    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn has_failed(&self) -> bool {
        self.sync.borrow().failure.is_some()
    }

    fn connected_peers(&self) -> Vec<Peer> {
        lock(&self.peers)
            .values()
            .filter(|peer| peer.is_connected())
            .cloned()
            .collect()
    }

    fn peer(&self, addr: &SocketAddr) -> Option<Peer> {
        lock(&self.peers)
            .get(addr)
            .filter(|peer| peer.is_connected())
            .cloned()
    }

    fn source_for(&self, addr: SocketAddr) -> BlockSource {
        BlockSource::Peer {
            addr,
            trusted: self.addr_book.is_trusted(&addr),
        }
    }

    fn chain_knows(&self, hash: &Hash256) -> bool {
        matches!(self.chain.get_block(hash), Ok(Some(_))) || self.chain.is_orphan(hash)
    }

    fn peer_settings(&self) -> PeerSettings {
        PeerSettings {
            magic: self.params.message_start,
            user_agent: self.config.user_agent.clone(),
            start_height: self.chain.best_height(),
            handshake_timeout: self.config.handshake_timeout(),
        }
    }

    fn refresh_sync_state(&self) {
        let peers = self.connected_peers();
        let chain_height = self.chain.best_height();
        let best_peer_height = peers.iter().map(Peer::best_height).max().unwrap_or(0).max(0);
        let count = peers.len();
        self.sync.send_if_modified(|state| {
            let next = SyncState {
                chain_height,
                best_peer_height,
                peers: count,
                synced: count > 0 && chain_height >= best_peer_height,
                stopped: state.stopped,
                failure: state.failure.clone(),
            };
            if *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    fn fail(&self, reason: String) {
        error!(error = %reason, "chain sync halted");
        self.sync.send_modify(|state| {
            state.failure = Some(reason);
            state.synced = false;
        });
    }

    fn save_peers(&self) {
        let Some(path) = &self.config.peers_file else {
            return;
        };
        match self.addr_book.save(path) {
            Ok(()) => debug!(path = %path.display(), count = self.addr_book.len(), "saved peers"),
            Err(err) => warn!(path = %path.display(), error = %err, "failed to persist peers"),
        }
    }

    async fn submit(&self, item: WorkItem) -> Result<(), SyncError> {
        let sender = lock(&self.work).clone();
        match sender {
            Some(sender) => sender.send(item).await.map_err(|_| SyncError::Stopped),
            None => Err(SyncError::Stopped),
        }
    }

    async fn punish(&self, addr: SocketAddr, reason: &VerificationError) {
        warn!(peer = %addr, error = %reason, "banning peer for invalid block");
        self.peer_book.record_misbehavior(addr);
        let peer = lock(&self.peers).remove(&addr);
        if let Some(peer) = peer {
            peer.disconnect().await;
        }
        self.refresh_sync_state();
        self.maintenance_wake.notify_one();
    }

    /// Returns false when the chain can no longer be trusted.
    async fn after_batch(&self, outcome: BatchOutcome, source: &BlockSource) -> bool {
        trace!(accepted = outcome.accepted, orphans = outcome.orphans.len(), "applied batch");
        if let Some(last) = outcome.orphans.last() {
            if let Some(root) = self.chain.orphan_root(last) {
                debug!(
                    orphan = %hash256_to_hex(last),
                    missing = %hash256_to_hex(&root.prev_block),
                    "orphan block, requesting ancestors"
                );
            }
            if let Some(peer) = source.peer().and_then(|addr| self.peer(&addr)) {
                peer.note_height(self.chain.best_height() + 1);
            }
            self.sync_wake.notify_one();
        }
        let mut punished = HashSet::new();
        for rejected in &outcome.rejected_orphans {
            if let Some(addr) = rejected.source.peer() {
                if punished.insert(addr) {
                    self.punish(addr, &rejected.error).await;
                }
            }
        }
        match outcome.error {
            None => true,
            Some(err) if err.is_fatal() => {
                self.fail(err.to_string());
                false
            }
            Some(ChainError::Verification(err)) => {
                match source.peer() {
                    Some(addr) => self.punish(addr, &err).await,
                    None => warn!(error = %err, "locally supplied block rejected"),
                }
                true
            }
            Some(err) => {
                warn!(error = %err, "block batch abandoned");
                true
            }
        }
    }

    async fn handle_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::Disconnected { addr, error } => {
                let replaced = {
                    let mut peers = lock(&self.peers);
                    let replaced = peers.get(&addr).is_some_and(Peer::is_connected);
                    if !replaced {
                        peers.remove(&addr);
                    }
                    replaced
                };
                if !replaced {
                    debug!(peer = %addr, error = %error, "removed peer");
                    self.addr_book.mark_disconnected(addr, Instant::now());
                }
                self.refresh_sync_state();
                self.maintenance_wake.notify_one();
            }
            PeerEvent::Inventory { addr, items } => {
                let announced: Vec<Hash256> = items
                    .iter()
                    .filter(|item| item.kind == InvType::Block)
                    .map(|item| item.hash)
                    .collect();
                self.on_announcement(addr, &announced);
            }
            PeerEvent::Headers { addr, headers } => {
                let announced: Vec<Hash256> = headers.iter().map(BlockHeader::hash).collect();
                self.on_announcement(addr, &announced);
            }
            PeerEvent::Block { addr, block } => {
                debug!(peer = %addr, hash = %hash256_to_hex(&block.hash()), "unsolicited block");
                let item = WorkItem::Blocks {
                    blocks: vec![block],
                    source: self.source_for(addr),
                };
                if self.submit(item).await.is_err() {
                    debug!(peer = %addr, "worker queue closed, dropping block");
                }
            }
            PeerEvent::Transaction { addr, tx } => {
                let txid = hash256_to_hex(&tx.txid());
                trace!(peer = %addr, txid = %txid, "ignoring loose transaction");
            }
            PeerEvent::Addresses { addr, entries } => {
                let port = self.params.default_port;
                let learned = entries
                    .iter()
                    .filter_map(|entry| entry.address.socket_addr())
                    .filter(|candidate| candidate.port() == port && !candidate.ip().is_loopback());
                let added = self.addr_book.insert_many(learned);
                if added > 0 {
                    debug!(peer = %addr, added, "learned addresses");
                }
            }
        }
    }

    fn on_announcement(&self, addr: SocketAddr, hashes: &[Hash256]) {
        let unknown = hashes.iter().filter(|hash| !self.chain_knows(hash)).count();
        if unknown == 0 {
            return;
        }
        if let Some(peer) = self.peer(&addr) {
            peer.note_height(self.chain.best_height() + unknown as i32);
        }
        debug!(peer = %addr, count = unknown, "new blocks announced");
        self.refresh_sync_state();
        self.sync_wake.notify_one();
    }

    fn prune_disconnected(&self) {
        lock(&self.peers).retain(|_, peer| peer.is_connected());
    }

    fn should_resolve_seeds(&self) -> bool {
        lock(&self.seeds_resolved_at).map_or(true, |at| at.elapsed() >= SEED_REFRESH)
    }

    async fn resolve_seeds(&self) {
        *lock(&self.seeds_resolved_at) = Some(Instant::now());
        let port = self.params.default_port;
        let mut found = Vec::new();
        for seed in self.params.fixed_seeds {
            if let Ok(addr) = seed.parse::<SocketAddr>() {
                found.push(addr);
            } else if let Ok(ip) = seed.parse::<IpAddr>() {
                found.push(SocketAddr::new(ip, port));
            } else {
                warn!(seed, "unparseable fixed seed");
            }
        }
        if self.config.use_dns_seeds {
            for seed in self.params.dns_seeds {
                match timeout(
                    self.config.handshake_timeout(),
                    tokio::net::lookup_host((*seed, port)),
                )
                .await
                {
                    Ok(Ok(addrs)) => found.extend(addrs),
                    Ok(Err(err)) => debug!(seed, error = %err, "seed lookup failed"),
                    Err(_) => debug!(seed, "seed lookup timed out"),
                }
            }
        }
        if found.is_empty() {
            return;
        }
        let added = self.addr_book.insert_many(found);
        info!(added, known = self.addr_book.len(), "resolved seed addresses");
    }

    async fn top_up(self: &Arc<Self>, connects: &mut JoinSet<()>) {
        let connected = self.connected_peers().len();
        let in_progress = lock(&self.connecting).len();
        let target = self.config.max_connections;
        if connected + in_progress >= target {
            return;
        }
        let wanted = target - connected - in_progress;

        let mut exclude: HashSet<SocketAddr> = lock(&self.peers).keys().copied().collect();
        exclude.extend(lock(&self.connecting).iter().copied());
        exclude.extend(self.peer_book.banned_peers().into_iter().map(|ban| ban.addr));

        let mut candidates = self.addr_book.candidates(Instant::now(), wanted, &exclude);
        if candidates.is_empty() && self.should_resolve_seeds() {
            self.resolve_seeds().await;
            candidates = self.addr_book.candidates(Instant::now(), wanted, &exclude);
        }
        for addr in candidates {
            lock(&self.connecting).insert(addr);
            connects.spawn(connect_peer(Arc::clone(self), addr));
        }
    }

    async fn admit(&self, peer: Peer) {
        let addr = peer.addr();
        if self.is_stopped() || self.peer_book.is_banned(&addr) {
            peer.disconnect().await;
            return;
        }
        lock(&self.peers).insert(addr, peer.clone());
        if self.is_stopped() {
            lock(&self.peers).remove(&addr);
            peer.disconnect().await;
            return;
        }
        self.addr_book.mark_connected(addr);
        let info = peer.info();
        info!(
            peer = %addr,
            version = info.version,
            user_agent = %info.user_agent,
            height = info.start_height,
            trusted = self.addr_book.is_trusted(&addr),
            "peer connected"
        );
        if let Err(err) = peer.request_addresses().await {
            debug!(peer = %addr, error = %err, "getaddr failed");
        }
        self.refresh_sync_state();
        self.sync_wake.notify_one();
    }

    /// The connected peer furthest ahead of the local chain, if any.
    fn sync_peer(&self) -> Option<Peer> {
        let height = self.chain.best_height();
        self.connected_peers()
            .into_iter()
            .filter(|peer| peer.best_height() > height)
            .max_by_key(|peer| {
                (
                    peer.best_height(),
                    self.addr_book.is_trusted(&peer.addr()),
                    self.peer_book.score(&peer.addr()),
                )
            })
    }

    /// Least-loaded eligible peer for a download job.
    fn pick_peer(
        &self,
        load: &HashMap<SocketAddr, usize>,
        exclude: &HashSet<SocketAddr>,
    ) -> Option<Peer> {
        let max_jobs = self.config.max_jobs_per_peer.max(1);
        let in_flight = |peer: &Peer| load.get(&peer.addr()).copied().unwrap_or(0);
        self.connected_peers()
            .into_iter()
            .filter(|peer| !exclude.contains(&peer.addr()) && in_flight(peer) < max_jobs)
            .min_by_key(|peer| (in_flight(peer), Reverse(self.peer_book.score(&peer.addr()))))
    }

    /// Header rounds against `peer` until it answers with nothing new.
    ///
    /// After a full batch, or one that left the head where it was, the next request
    /// continues from the last header received. A heavier fork that forks below the
    /// locator is then walked to its tip instead of being asked for again from the top.
    async fn sync_with(self: &Arc<Self>, peer: &Peer) -> Result<(), SyncError> {
        let mut resume_from: Option<Hash256> = None;
        loop {
            let start_head = self.chain.chain_head().hash;
            let mut locator = self.chain.block_locator()?;
            if let Some(last) = resume_from {
                locator.insert(0, last);
            }
            let headers = peer
                .get_headers(locator, [0u8; 32], self.config.headers_timeout())
                .await?;
            let Some(last) = headers.last().map(BlockHeader::hash) else {
                peer.settle_height(self.chain.best_height());
                return Ok(());
            };
            if resume_from == Some(last) {
                // Same tip as the previous reply: the peer has nothing past it.
                peer.settle_height(self.chain.best_height());
                return Ok(());
            }
            let full_batch = headers.len() >= MAX_HEADERS_RESULTS;
            debug!(peer = %peer.addr(), count = headers.len(), "received headers");
            self.download(peer, &headers).await?;

            let head = self.chain.chain_head();
            info!(
                height = head.height,
                peer_height = peer.best_height(),
                hash = %hash256_to_hex(&head.hash),
                "chain progress"
            );
            let moved = head.hash != start_head;
            if moved && !full_batch {
                return Ok(());
            }
            resume_from = Some(last);
        }
    }

    /// Fetches the blocks behind `headers` from every eligible peer and hands them to the
    /// worker in chain order. Returns once the worker has applied all of them.
    async fn download(
        self: &Arc<Self>,
        sync_peer: &Peer,
        headers: &[BlockHeader],
    ) -> Result<(), SyncError> {
        let jobs = plan_jobs(
            headers,
            |hash| self.chain_knows(hash),
            self.config.fast_catchup_time,
            self.config.job_size,
        );
        let total = jobs.len() as u64;
        let mut queue: VecDeque<DownloadJob> = jobs.into();
        let mut buffer: ReorderBuffer<Completed> = ReorderBuffer::new(self.config.reorder_capacity);
        let mut in_flight: JoinSet<JobResult> = JoinSet::new();
        let mut load: HashMap<SocketAddr, usize> = HashMap::new();
        let mut shutdown = self.shutdown.subscribe();

        while buffer.next_seq() < total {
            let mut deferred = Vec::new();
            while let Some(job) = queue.pop_front() {
                let hashes = match &job.kind {
                    JobKind::Fetch(hashes) => hashes.clone(),
                    JobKind::HeaderOnly(headers) => {
                        let blocks: Vec<Block> =
                            headers.iter().cloned().map(Block::header_only).collect();
                        let seq = job.seq;
                        let done = Completed {
                            job,
                            blocks,
                            source: self.source_for(sync_peer.addr()),
                        };
                        if let Some((_, evicted)) = buffer.insert(seq, done) {
                            deferred.push(evicted.job);
                        }
                        continue;
                    }
                };
                let Some(peer) = self.pick_peer(&load, &job.failed_peers) else {
                    queue.push_front(job);
                    break;
                };
                *load.entry(peer.addr()).or_default() += 1;
                let limit = self.config.block_timeout();
                in_flight.spawn(async move {
                    let outcome = fetch_blocks(&peer, &hashes, limit).await;
                    JobResult { job, peer, outcome }
                });
            }
            queue.extend(deferred);

            while let Some(done) = buffer.pop_ready() {
                self.submit(WorkItem::Blocks {
                    blocks: done.blocks,
                    source: done.source,
                })
                .await?;
            }
            if buffer.next_seq() >= total {
                break;
            }

            if in_flight.is_empty() {
                // Every peer has failed the queued work or none is connected.
                for job in queue.iter_mut() {
                    job.failed_peers.clear();
                }
                tokio::select! {
                    _ = shutdown_signal(&mut shutdown) => return Err(SyncError::Stopped),
                    _ = self.sync_wake.notified() => {}
                    _ = sleep(RETRY_PAUSE) => {}
                }
                continue;
            }

            let joined = tokio::select! {
                _ = shutdown_signal(&mut shutdown) => return Err(SyncError::Stopped),
                joined = in_flight.join_next() => joined,
            };
            let result = match joined {
                Some(Ok(result)) => result,
                Some(Err(err)) => return Err(SyncError::Task(err.to_string())),
                None => continue,
            };
            let addr = result.peer.addr();
            if let Some(count) = load.get_mut(&addr) {
                *count = count.saturating_sub(1);
            }
            match result.outcome {
                Ok(blocks) => {
                    self.peer_book.record_success(addr);
                    let done = Completed {
                        blocks,
                        source: self.source_for(addr),
                        job: result.job,
                    };
                    if let Some((seq, evicted)) = buffer.insert(done.job.seq, done) {
                        debug!(seq, "reorder buffer full, deferring job");
                        queue.push_back(evicted.job);
                    }
                }
                Err(err) => {
                    debug!(
                        peer = %addr,
                        seq = result.job.seq,
                        error = %err,
                        "download job failed, reassigning"
                    );
                    self.peer_book.record_failure(addr);
                    let mut job = result.job;
                    job.failed_peers.insert(addr);
                    queue.push_front(job);
                }
            }
        }

        let (done, applied) = oneshot::channel();
        self.submit(WorkItem::Barrier(done)).await?;
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => Err(SyncError::Stopped),
            applied = applied => applied.map_err(|_| SyncError::Stopped),
        }
    }
}

async fn fetch_blocks(
    peer: &Peer,
    hashes: &[Hash256],
    limit: Duration,
) -> Result<Vec<Block>, PeerError> {
    let pending = peer.get_blocks(hashes).await?;
    let mut blocks = Vec::with_capacity(pending.len());
    for request in pending {
        blocks.push(request.wait(limit).await?);
    }
    Ok(blocks)
}

fn apply_blocks(chain: &BlockChain, blocks: Vec<Block>, source: &BlockSource) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for block in blocks {
        let hash = block.hash();
        match chain.add_block(block, source.clone()) {
            Ok(added) => {
                outcome.rejected_orphans.extend(added.rejected_orphans);
                match added.status {
                    BlockStatus::Orphaned => outcome.orphans.push(hash),
                    _ => outcome.accepted += 1,
                }
            }
            Err(err) => {
                outcome.error = Some(err);
                break;
            }
        }
    }
    outcome
}

async fn validation_worker(inner: Arc<GroupInner>, mut queue: mpsc::Receiver<WorkItem>) {
    while let Some(item) = queue.recv().await {
        match item {
            WorkItem::Barrier(done) => {
                let _ = done.send(());
            }
            WorkItem::Blocks { blocks, source } => {
                let chain = Arc::clone(&inner.chain);
                let batch_source = source.clone();
                let applied =
                    tokio::task::spawn_blocking(move || apply_blocks(&chain, blocks, &batch_source))
                        .await;
                let healthy = match applied {
                    Ok(outcome) => inner.after_batch(outcome, &source).await,
                    Err(err) => {
                        inner.fail(format!("validation task failed: {err}"));
                        false
                    }
                };
                inner.refresh_sync_state();
                if !healthy {
                    break;
                }
            }
        }
    }
    debug!("validation worker exiting");
}

async fn event_loop(inner: Arc<GroupInner>, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
    while let Some(event) = events.recv().await {
        inner.handle_event(event).await;
    }
}

async fn connect_peer(inner: Arc<GroupInner>, addr: SocketAddr) {
    let settings = inner.peer_settings();
    let totals = Arc::clone(&inner.totals);
    let result = Peer::connect(addr, &settings, totals, inner.events.clone()).await;
    lock(&inner.connecting).remove(&addr);
    match result {
        Ok(peer) => inner.admit(peer).await,
        Err(err) => {
            debug!(peer = %addr, error = %err, "connection attempt failed");
            inner.addr_book.mark_failed(addr, Instant::now());
            inner.maintenance_wake.notify_one();
        }
    }
}

async fn maintenance_loop(inner: Arc<GroupInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut connects: JoinSet<()> = JoinSet::new();
    let mut saved_revision = inner.addr_book.revision();
    let mut saved_at = Instant::now();
    loop {
        inner.prune_disconnected();
        inner.top_up(&mut connects).await;
        let dirty = inner.addr_book.revision() != saved_revision;
        if dirty && saved_at.elapsed() >= PEERS_PERSIST_INTERVAL {
            inner.save_peers();
            saved_revision = inner.addr_book.revision();
            saved_at = Instant::now();
        }
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => break,
            _ = inner.maintenance_wake.notified() => {}
            _ = sleep(inner.config.maintenance_interval()) => {}
            Some(_) = connects.join_next(), if !connects.is_empty() => {}
        }
    }
}

async fn sync_loop(inner: Arc<GroupInner>) {
    let mut shutdown = inner.shutdown.subscribe();
    loop {
        if inner.is_stopped() || inner.has_failed() {
            break;
        }
        let mut pause = inner.config.maintenance_interval();
        if let Some(peer) = inner.sync_peer() {
            match inner.sync_with(&peer).await {
                Ok(()) => pause = Duration::ZERO,
                Err(SyncError::Stopped) => break,
                Err(SyncError::Chain(err)) if err.is_fatal() => {
                    inner.fail(err.to_string());
                    break;
                }
                Err(err) => {
                    debug!(peer = %peer.addr(), error = %err, "sync round failed");
                    pause = RETRY_PAUSE;
                }
            }
            inner.refresh_sync_state();
        }
        if pause.is_zero() {
            continue;
        }
        tokio::select! {
            _ = shutdown_signal(&mut shutdown) => break,
            _ = inner.sync_wake.notified() => {}
            _ = sleep(pause) => {}
        }
    }
}

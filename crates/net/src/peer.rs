//! One remote node: version handshake, a reader task that decodes inbound frames, and
//! correlation of replies with the requests that asked for them.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant, SystemTime};

use schilling_consensus::constants::MIN_PEER_PROTOCOL_VERSION;
use schilling_consensus::{hash256_to_hex, Hash256};
use schilling_primitives::{Block, BlockHeader, Transaction};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::message::{
    read_frame, write_message, AddrEntry, GetBlocksMessage, InvType, Inventory, NetworkMessage,
    ProtocolError, VersionMessage,
};

/// Consecutive unanswered requests after which the peer is dropped.
pub const MAX_REQUEST_TIMEOUTS: u32 = 3;

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("i/o: {0}")]
    Io(std::io::Error),
    #[error("protocol violation: {0}")]
    Protocol(ProtocolError),
    #[error("handshake did not complete in time")]
    HandshakeTimeout,
    #[error("peer protocol version {0} is too old")]
    ObsoleteVersion(i32),
    #[error("request timed out")]
    Timeout,
    #[error("peer does not have {0}")]
    NotFound(String),
    #[error("connection lost")]
    ConnectionLost,
    #[error("disconnected locally")]
    Closed,
}

impl From<std::io::Error> for PeerError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => {
                PeerError::ConnectionLost
            }
            _ => PeerError::Io(err),
        }
    }
}

impl From<ProtocolError> for PeerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(err) => err.into(),
            other => PeerError::Protocol(other),
        }
    }
}

/// Messages a peer hands upward instead of resolving a pending request.
#[derive(Debug)]
pub enum PeerEvent {
    Inventory {
        addr: SocketAddr,
        items: Vec<Inventory>,
    },
    Headers {
        addr: SocketAddr,
        headers: Vec<BlockHeader>,
    },
    Block {
        addr: SocketAddr,
        block: Block,
    },
    Transaction {
        addr: SocketAddr,
        tx: Transaction,
    },
    Addresses {
        addr: SocketAddr,
        entries: Vec<AddrEntry>,
    },
    Disconnected {
        addr: SocketAddr,
        error: PeerError,
    },
}

#[derive(Clone, Debug)]
pub struct PeerSettings {
    pub magic: [u8; 4],
    pub user_agent: String,
    pub start_height: i32,
    pub handshake_timeout: Duration,
}

/// What the remote said about itself during the handshake.
#[derive(Clone, Debug)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub version: i32,
    pub services: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub connected_since: SystemTime,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetTotalsSnapshot {
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub connections: usize,
}

/// Process-wide traffic counters shared by every peer.
#[derive(Debug, Default)]
pub struct NetTotals {
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    connections: AtomicUsize,
}

impl NetTotals {
    pub fn add_recv(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    fn dec_connections(&self) {
        self.connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            })
            .ok();
    }

    pub fn snapshot(&self) -> NetTotalsSnapshot {
        NetTotalsSnapshot {
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, PeerError>>;

#[derive(Default)]
struct Pending {
    closed: bool,
    next_id: u64,
    blocks: HashMap<Hash256, Vec<(u64, Reply<Block>)>>,
    headers: VecDeque<HeadersRequest>,
    /// Header requests that timed out; their replies may still be on the way.
    late_headers: usize,
    pings: HashMap<u64, (Instant, Reply<Duration>)>,
}

struct HeadersRequest {
    id: u64,
    locator: Vec<Hash256>,
    reply: Reply<Vec<BlockHeader>>,
}

impl HeadersRequest {
    /// A non-empty reply has to continue from one of the locator hashes.
    fn answered_by(&self, headers: &[BlockHeader]) -> bool {
        match headers.first() {
            Some(first) => self.locator.is_empty() || self.locator.contains(&first.prev_block),
            None => true,
        }
    }
}

impl Pending {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn fail_all(&mut self) {
        self.closed = true;
        for (_, waiters) in self.blocks.drain() {
            for (_, reply) in waiters {
                let _ = reply.send(Err(PeerError::ConnectionLost));
            }
        }
        for request in self.headers.drain(..) {
            let _ = request.reply.send(Err(PeerError::ConnectionLost));
        }
        for (_, (_, reply)) in self.pings.drain() {
            let _ = reply.send(Err(PeerError::ConnectionLost));
        }
    }
}

struct PeerInner {
    info: PeerInfo,
    magic: [u8; 4],
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<Pending>,
    best_height: AtomicI32,
    timeouts: AtomicU32,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    totals: Arc<NetTotals>,
}

/// Cheap to clone; every clone talks to the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.inner.info.addr)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Peer {
    /// Dials `addr`, completes the version handshake, and starts the reader task.
    pub async fn connect(
        addr: SocketAddr,
        settings: &PeerSettings,
        totals: Arc<NetTotals>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, PeerError> {
        let stream = match timeout(settings.handshake_timeout, TcpStream::connect(addr)).await {
            Ok(stream) => stream?,
            Err(_) => return Err(PeerError::HandshakeTimeout),
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %err, "failed to set TCP_NODELAY");
        }
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let handshake = handshake(&mut reader, &mut write_half, addr, settings, &totals);
        let remote = match timeout(settings.handshake_timeout, handshake).await {
            Ok(remote) => remote?,
            Err(_) => return Err(PeerError::HandshakeTimeout),
        };

        totals.inc_connections();
        let inner = Arc::new(PeerInner {
            info: PeerInfo {
                addr,
                version: remote.version,
                services: remote.services,
                user_agent: remote.user_agent,
                start_height: remote.start_height,
                connected_since: SystemTime::now(),
            },
            magic: settings.magic,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending: Mutex::new(Pending::default()),
            best_height: AtomicI32::new(remote.start_height),
            timeouts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
            events,
            totals,
        });
        let task = tokio::spawn(read_loop(Arc::downgrade(&inner), settings.magic, reader));
        *inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        Ok(Self { inner })
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.info.addr
    }

    pub fn info(&self) -> &PeerInfo {
        &self.inner.info
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }

    /// Highest chain height the remote is believed to have.
    pub fn best_height(&self) -> i32 {
        self.inner.best_height.load(Ordering::Relaxed)
    }

    pub fn note_height(&self, height: i32) {
        self.inner.best_height.fetch_max(height, Ordering::Relaxed);
    }

    /// Lowers the believed height once the remote proves it has nothing further.
    pub fn settle_height(&self, height: i32) {
        self.inner.best_height.store(height, Ordering::Relaxed);
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.inner.timeouts.load(Ordering::Relaxed)
    }

    /// Sends `message`; a failed write drops the connection.
    pub async fn send(&self, message: &NetworkMessage) -> Result<(), PeerError> {
        match self.inner.send(message).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.inner.close(PeerError::ConnectionLost).await;
                Err(err)
            }
        }
    }

    pub async fn get_block(&self, hash: Hash256) -> Result<PendingBlock, PeerError> {
        let mut pending = self.get_blocks(&[hash]).await?;
        pending.pop().ok_or(PeerError::ConnectionLost)
    }

    /// Requests every hash in one `getdata` and returns a handle per block.
    pub async fn get_blocks(&self, hashes: &[Hash256]) -> Result<Vec<PendingBlock>, PeerError> {
        let handles = {
            let mut pending = self.inner.lock_pending();
            if pending.closed {
                return Err(PeerError::ConnectionLost);
            }
            let mut handles = Vec::with_capacity(hashes.len());
            for hash in hashes {
                let id = pending.next_id();
                let (reply, receiver) = oneshot::channel();
                pending.blocks.entry(*hash).or_default().push((id, reply));
                handles.push(PendingBlock {
                    peer: self.clone(),
                    hash: *hash,
                    id,
                    reply: receiver,
                });
            }
            handles
        };
        let items = hashes.iter().copied().map(Inventory::block).collect();
        self.send(&NetworkMessage::GetData(items)).await?;
        Ok(handles)
    }

    /// Sends `getheaders` and waits for the next `headers` reply.
    pub async fn get_headers(
        &self,
        locator: Vec<Hash256>,
        stop: Hash256,
        limit: Duration,
    ) -> Result<Vec<BlockHeader>, PeerError> {
        let (id, receiver) = {
            let mut pending = self.inner.lock_pending();
            if pending.closed {
                return Err(PeerError::ConnectionLost);
            }
            let id = pending.next_id();
            let (reply, receiver) = oneshot::channel();
            pending.headers.push_back(HeadersRequest {
                id,
                locator: locator.clone(),
                reply,
            });
            (id, receiver)
        };
        let request = NetworkMessage::GetHeaders(GetBlocksMessage::new(locator, stop));
        if let Err(err) = self.send(&request).await {
            self.inner.forget_headers(id);
            return Err(err);
        }
        self.await_reply(receiver, limit, |inner| inner.forget_headers(id))
            .await
    }

    /// Round-trip time of a nonce-tagged ping.
    pub async fn ping(&self, limit: Duration) -> Result<Duration, PeerError> {
        let nonce: u64 = rand::random();
        let receiver = {
            let mut pending = self.inner.lock_pending();
            if pending.closed {
                return Err(PeerError::ConnectionLost);
            }
            let (reply, receiver) = oneshot::channel();
            pending.pings.insert(nonce, (Instant::now(), reply));
            receiver
        };
        if let Err(err) = self.send(&NetworkMessage::Ping(nonce)).await {
            self.inner.forget_ping(nonce);
            return Err(err);
        }
        self.await_reply(receiver, limit, |inner| inner.forget_ping(nonce))
            .await
    }

    pub async fn request_addresses(&self) -> Result<(), PeerError> {
        self.send(&NetworkMessage::GetAddr).await
    }

    /// Closes the connection; pending requests fail with `ConnectionLost`. Safe to repeat.
    pub async fn disconnect(&self) {
        self.inner.close(PeerError::Closed).await;
    }

    async fn await_reply<T>(
        &self,
        receiver: oneshot::Receiver<Result<T, PeerError>>,
        limit: Duration,
        forget: impl FnOnce(&PeerInner),
    ) -> Result<T, PeerError> {
        match timeout(limit, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PeerError::ConnectionLost),
            Err(_) => {
                forget(&self.inner);
                self.note_timeout().await;
                Err(PeerError::Timeout)
            }
        }
    }

    async fn note_timeout(&self) {
        let count = self.inner.timeouts.fetch_add(1, Ordering::Relaxed) + 1;
        if count >= MAX_REQUEST_TIMEOUTS {
            warn!(peer = %self.addr(), timeouts = count, "peer stopped answering requests");
            self.inner.close(PeerError::Timeout).await;
        }
    }
}

/// A block requested from one peer. Dropping the handle withdraws the request.
pub struct PendingBlock {
    peer: Peer,
    hash: Hash256,
    id: u64,
    reply: oneshot::Receiver<Result<Block, PeerError>>,
}

impl PendingBlock {
    pub fn hash(&self) -> Hash256 {
        self.hash
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    /// Waits up to `limit`. A timeout fails only this request; the connection stays up
    /// until `MAX_REQUEST_TIMEOUTS` requests in a row go unanswered.
    pub async fn wait(mut self, limit: Duration) -> Result<Block, PeerError> {
        let hash = self.hash;
        let id = self.id;
        let peer = self.peer.clone();
        let receiver = std::mem::replace(&mut self.reply, oneshot::channel().1);
        peer.await_reply(receiver, limit, |inner| inner.forget_block(&hash, id))
            .await
    }
}

impl Drop for PendingBlock {
    fn drop(&mut self) {
        self.peer.inner.forget_block(&self.hash, self.id);
    }
}

impl PeerInner {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn forget_block(&self, hash: &Hash256, id: u64) {
        let mut pending = self.lock_pending();
        if let Some(waiters) = pending.blocks.get_mut(hash) {
            waiters.retain(|(waiter, _)| *waiter != id);
            if waiters.is_empty() {
                pending.blocks.remove(hash);
            }
        }
    }

    fn forget_headers(&self, id: u64) {
        let mut pending = self.lock_pending();
        let before = pending.headers.len();
        pending.headers.retain(|request| request.id != id);
        if pending.headers.len() < before {
            pending.late_headers += 1;
        }
    }

    fn forget_ping(&self, nonce: u64) {
        self.lock_pending().pings.remove(&nonce);
    }

    async fn send(&self, message: &NetworkMessage) -> Result<(), PeerError> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(PeerError::ConnectionLost);
        };
        let written = write_message(stream, self.magic, message).await?;
        self.totals.add_sent(written);
        trace!(peer = %self.info.addr, command = message.command(), bytes = written, "sent");
        Ok(())
    }

    fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    async fn dispatch(&self, message: NetworkMessage) -> Result<(), PeerError> {
        let addr = self.info.addr;
        match message {
            NetworkMessage::Ping(nonce) => self.send(&NetworkMessage::Pong(nonce)).await?,
            NetworkMessage::Pong(nonce) => {
                let waiter = self.lock_pending().pings.remove(&nonce);
                if let Some((sent, reply)) = waiter {
                    self.timeouts.store(0, Ordering::Relaxed);
                    let _ = reply.send(Ok(sent.elapsed()));
                }
            }
            NetworkMessage::Headers(headers) => {
                let waiter = {
                    let mut pending = self.lock_pending();
                    let answers = pending
                        .headers
                        .front()
                        .map(|request| request.answered_by(&headers));
                    match answers {
                        Some(true) if headers.is_empty() && pending.late_headers > 0 => {
                            pending.late_headers -= 1;
                            trace!(peer = %addr, "dropping late empty headers reply");
                            return Ok(());
                        }
                        Some(true) => pending.headers.pop_front(),
                        Some(false) => {
                            pending.late_headers = pending.late_headers.saturating_sub(1);
                            None
                        }
                        None => None,
                    }
                };
                match waiter {
                    Some(request) => {
                        self.timeouts.store(0, Ordering::Relaxed);
                        let _ = request.reply.send(Ok(headers));
                    }
                    None => self.emit(PeerEvent::Headers { addr, headers }),
                }
            }
            NetworkMessage::Block(block) => {
                let hash = block.hash();
                let waiters = self.lock_pending().blocks.remove(&hash);
                match waiters {
                    Some(waiters) => {
                        self.timeouts.store(0, Ordering::Relaxed);
                        for (_, reply) in waiters {
                            let _ = reply.send(Ok(block.clone()));
                        }
                    }
                    None => self.emit(PeerEvent::Block { addr, block }),
                }
            }
            NetworkMessage::NotFound(items) => {
                let mut pending = self.lock_pending();
                for item in items.iter().filter(|item| item.kind == InvType::Block) {
                    for (_, reply) in pending.blocks.remove(&item.hash).unwrap_or_default() {
                        let _ = reply.send(Err(PeerError::NotFound(hash256_to_hex(&item.hash))));
                    }
                }
            }
            NetworkMessage::Inv(items) => self.emit(PeerEvent::Inventory { addr, items }),
            NetworkMessage::Tx(tx) => self.emit(PeerEvent::Transaction { addr, tx }),
            NetworkMessage::Addr(entries) => self.emit(PeerEvent::Addresses { addr, entries }),
            NetworkMessage::Reject(reject) => {
                debug!(
                    peer = %addr,
                    message = %reject.message,
                    code = reject.code,
                    reason = %reject.reason,
                    "peer rejected our message"
                );
            }
            other => {
                trace!(peer = %addr, command = other.command(), "ignoring message");
            }
        }
        Ok(())
    }

    async fn close(&self, error: PeerError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lock_pending().fail_all();
        self.totals.dec_connections();
        let addr = self.info.addr;
        match &error {
            PeerError::Closed => debug!(peer = %addr, "disconnecting peer"),
            other => info!(peer = %addr, error = %other, "peer disconnected"),
        }
        self.emit(PeerEvent::Disconnected { addr, error });
        if let Some(mut stream) = self.writer.lock().await.take() {
            let _ = stream.shutdown().await;
        }
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

impl Drop for PeerInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.totals.dec_connections();
        }
        let reader = self
            .reader
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

async fn handshake<R, W>(
    reader: &mut R,
    writer: &mut W,
    addr: SocketAddr,
    settings: &PeerSettings,
    totals: &NetTotals,
) -> Result<VersionMessage, PeerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let magic = settings.magic;
    let ours = VersionMessage::outbound(addr, &settings.user_agent, settings.start_height);
    totals.add_sent(write_message(writer, magic, &NetworkMessage::Version(ours)).await?);

    let mut remote = None;
    let mut got_verack = false;
    loop {
        if got_verack {
            if let Some(version) = remote.take() {
                return Ok(version);
            }
        }
        let raw = read_frame(reader, magic).await?;
        totals.add_recv(raw.wire_len());
        match NetworkMessage::from_raw(&raw)? {
            NetworkMessage::Version(version) => {
                if version.version < MIN_PEER_PROTOCOL_VERSION {
                    return Err(PeerError::ObsoleteVersion(version.version));
                }
                totals.add_sent(write_message(writer, magic, &NetworkMessage::Verack).await?);
                remote = Some(version);
            }
            NetworkMessage::Verack => got_verack = true,
            NetworkMessage::Ping(nonce) => {
                totals.add_sent(write_message(writer, magic, &NetworkMessage::Pong(nonce)).await?);
            }
            other => {
                let command = other.command();
                debug!(peer = %addr, command, "ignoring message before handshake");
            }
        }
    }
}

/// Holds only a weak handle so a peer nobody references any more is torn down.
async fn read_loop(inner: Weak<PeerInner>, magic: [u8; 4], mut reader: BufReader<OwnedReadHalf>) {
    let (inner, error) = loop {
        let frame = read_frame(&mut reader, magic).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let raw = match frame {
            Ok(raw) => raw,
            Err(err) => break (inner, PeerError::from(err)),
        };
        inner.totals.add_recv(raw.wire_len());
        let message = match NetworkMessage::from_raw(&raw) {
            Ok(message) => message,
            Err(err) => break (inner, PeerError::from(err)),
        };
        if let Err(err) = inner.dispatch(message).await {
            break (inner, err);
        }
    };
    if let PeerError::Protocol(err) = &error {
        warn!(peer = %inner.info.addr, error = %err, "malformed traffic, dropping peer");
    }
    inner.close(error).await;
}

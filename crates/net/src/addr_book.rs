//! Known peer addresses with per-address reconnect backoff, persisted as `peers.json`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ADDR_BOOK_MAX: usize = 5000;
pub const PEERS_FILE_VERSION: u32 = 1;
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(10 * 60);
const BACKOFF_MULTIPLIER: f64 = 1.5;

#[derive(Debug, Error)]
pub enum PeersFileError {
    #[error("peers file i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid peers file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported peers file version {found} (expected {expected})")]
    Version { found: u32, expected: u32 },
}

#[derive(Debug, Deserialize, Serialize)]
struct PeersFile {
    version: u32,
    addrs: Vec<String>,
}

#[derive(Clone, Debug)]
struct KnownAddress {
    trusted: bool,
    backoff: Duration,
    retry_at: Option<Instant>,
    failures: u32,
}

impl KnownAddress {
    fn new(trusted: bool) -> Self {
        Self {
            trusted,
            backoff: INITIAL_BACKOFF,
            retry_at: None,
            failures: 0,
        }
    }

    fn eligible(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| at <= now)
    }
}

#[derive(Default)]
pub struct AddrBook {
    addrs: Mutex<HashMap<SocketAddr, KnownAddress>>,
    revision: AtomicU64,
}

impl AddrBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SocketAddr, KnownAddress>> {
        self.addrs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::Relaxed);
    }

    /// Changes whenever the set of addresses changes; used to skip redundant saves.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Learns untrusted addresses (seeds, gossip, the peers file); stops at `ADDR_BOOK_MAX`.
    pub fn insert_many(&self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        let mut inserted = 0;
        {
            let mut book = self.lock();
            for addr in addrs {
                if book.len() >= ADDR_BOOK_MAX {
                    break;
                }
                if addr.port() == 0 || book.contains_key(&addr) {
                    continue;
                }
                book.insert(addr, KnownAddress::new(false));
                inserted += 1;
            }
        }
        if inserted > 0 {
            self.bump();
        }
        inserted
    }

    /// A manually configured address: always kept, and its blocks may trigger checkpoint reloads.
    pub fn add_trusted(&self, addr: SocketAddr) {
        let mut book = self.lock();
        let entry = book
            .entry(addr)
            .or_insert_with(|| KnownAddress::new(true));
        entry.trusted = true;
        entry.retry_at = None;
        drop(book);
        self.bump();
    }

    pub fn is_trusted(&self, addr: &SocketAddr) -> bool {
        self.lock().get(addr).is_some_and(|entry| entry.trusted)
    }

    /// Addresses whose backoff has elapsed, trusted ones first, the rest shuffled.
    pub fn candidates(
        &self,
        now: Instant,
        limit: usize,
        exclude: &HashSet<SocketAddr>,
    ) -> Vec<SocketAddr> {
        if limit == 0 {
            return Vec::new();
        }
        let book = self.lock();
        let mut trusted = Vec::new();
        let mut others = Vec::new();
        for (addr, entry) in book.iter() {
            if exclude.contains(addr) || !entry.eligible(now) {
                continue;
            }
            if entry.trusted {
                trusted.push(*addr);
            } else {
                others.push(*addr);
            }
        }
        drop(book);
        trusted.sort();
        others.shuffle(&mut rand::thread_rng());
        trusted.extend(others);
        trusted.truncate(limit);
        trusted
    }

    /// A connection attempt failed: wait out the current backoff, then grow it.
    pub fn mark_failed(&self, addr: SocketAddr, now: Instant) {
        let mut book = self.lock();
        if let Some(entry) = book.get_mut(&addr) {
            entry.retry_at = Some(now + entry.backoff);
            entry.backoff = entry.backoff.mul_f64(BACKOFF_MULTIPLIER).min(MAX_BACKOFF);
            entry.failures = entry.failures.saturating_add(1);
        }
    }

    /// A handshake succeeded: the backoff starts over.
    pub fn mark_connected(&self, addr: SocketAddr) {
        let mut book = self.lock();
        if let Some(entry) = book.get_mut(&addr) {
            entry.backoff = INITIAL_BACKOFF;
            entry.retry_at = None;
            entry.failures = 0;
        }
    }

    /// An established connection dropped: hold off for the current backoff before redialing.
    pub fn mark_disconnected(&self, addr: SocketAddr, now: Instant) {
        let mut book = self.lock();
        if let Some(entry) = book.get_mut(&addr) {
            entry.retry_at = Some(now + entry.backoff);
        }
    }

    pub fn backoff(&self, addr: &SocketAddr) -> Option<Duration> {
        self.lock().get(addr).map(|entry| entry.backoff)
    }

    pub fn snapshot(&self) -> Vec<SocketAddr> {
        self.lock().keys().copied().collect()
    }

    pub fn load(path: &Path) -> Result<Vec<SocketAddr>, PeersFileError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let file: PeersFile = serde_json::from_slice(&bytes)?;
        if file.version != PEERS_FILE_VERSION {
            return Err(PeersFileError::Version {
                found: file.version,
                expected: PEERS_FILE_VERSION,
            });
        }
        let mut seen = HashSet::new();
        Ok(file
            .addrs
            .iter()
            .filter_map(|raw| raw.parse::<SocketAddr>().ok())
            .filter(|addr| addr.port() != 0 && seen.insert(*addr))
            .take(ADDR_BOOK_MAX)
            .collect())
    }

    pub fn save(&self, path: &Path) -> Result<(), PeersFileError> {
        let mut addrs: Vec<String> = self.snapshot().iter().map(ToString::to_string).collect();
        addrs.sort();
        addrs.truncate(ADDR_BOOK_MAX);
        let file = PeersFile {
            version: PEERS_FILE_VERSION,
            addrs,
        };
        let json = serde_json::to_vec_pretty(&file)?;
        write_file_atomic(path, &json)
    }
}

fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), PeersFileError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    if fs::rename(&tmp, path).is_err() {
        let _ = fs::remove_file(path);
        fs::rename(&tmp, path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    #[test]
    fn backoff_grows_then_resets_on_connect() {
        let book = AddrBook::new();
        let target = addr(9976);
        book.insert_many([target]);
        let start = Instant::now();

        book.mark_failed(target, start);
        assert_eq!(book.backoff(&target), Some(Duration::from_millis(1500)));
        assert!(book.candidates(start, 10, &HashSet::new()).is_empty());
        assert_eq!(
            book.candidates(start + Duration::from_secs(1), 10, &HashSet::new()),
            vec![target]
        );

        for _ in 0..40 {
            book.mark_failed(target, start);
        }
        assert_eq!(book.backoff(&target), Some(MAX_BACKOFF));

        book.mark_connected(target);
        assert_eq!(book.backoff(&target), Some(INITIAL_BACKOFF));
        assert_eq!(book.candidates(start, 10, &HashSet::new()), vec![target]);
    }

    #[test]
    fn trusted_addresses_come_first() {
        let book = AddrBook::new();
        book.insert_many((1..=20).map(addr));
        book.add_trusted(addr(7));
        book.add_trusted(addr(40));

        let picked = book.candidates(Instant::now(), 3, &HashSet::new());
        assert_eq!(&picked[..2], &[addr(7), addr(40)]);
        assert!(book.is_trusted(&addr(7)));
        assert!(!book.is_trusted(&addr(8)));

        let exclude: HashSet<SocketAddr> = [addr(7)].into_iter().collect();
        assert_eq!(book.candidates(Instant::now(), 1, &exclude), vec![addr(40)]);
    }

    #[test]
    fn peers_file_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peers.json");
        assert!(AddrBook::load(&path).expect("missing file").is_empty());

        let book = AddrBook::new();
        book.insert_many([addr(1), addr(2), addr(0)]);
        book.save(&path).expect("save");

        let mut loaded = AddrBook::load(&path).expect("load");
        loaded.sort();
        assert_eq!(loaded, vec![addr(1), addr(2)]);
    }

    #[test]
    fn unknown_peers_file_version_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("peers.json");
        fs::write(&path, br#"{"version": 9, "addrs": []}"#).expect("write");
        assert!(matches!(
            AddrBook::load(&path),
            Err(PeersFileError::Version { found: 9, .. })
        ));
    }
}

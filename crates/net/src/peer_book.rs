//! Reputation and temporary bans for peers that served bad chain data.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

/// How long a peer that delivered a consensus-invalid block stays banned.
pub const MISBEHAVIOR_BAN: Duration = Duration::from_secs(15 * 60);

#[derive(Clone, Debug)]
pub struct BannedPeerInfo {
    pub addr: SocketAddr,
    pub banned_until: SystemTime,
}

#[derive(Default)]
pub struct PeerBook {
    scores: Mutex<HashMap<SocketAddr, i32>>,
    banned: Mutex<HashMap<SocketAddr, Instant>>,
}

impl PeerBook {
    fn scores(&self) -> MutexGuard<'_, HashMap<SocketAddr, i32>> {
        self.scores.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn banned(&self) -> MutexGuard<'_, HashMap<SocketAddr, Instant>> {
        self.banned.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A download job finished on this peer.
    pub fn record_success(&self, addr: SocketAddr) {
        let mut scores = self.scores();
        let entry = scores.entry(addr).or_insert(0);
        *entry = entry.saturating_add(3);
    }

    pub fn record_failure(&self, addr: SocketAddr) {
        let mut scores = self.scores();
        let entry = scores.entry(addr).or_insert(0);
        *entry = entry.saturating_sub(1);
    }

    pub fn score(&self, addr: &SocketAddr) -> i32 {
        self.scores().get(addr).copied().unwrap_or(0)
    }

    pub fn record_misbehavior(&self, addr: SocketAddr) {
        self.record_failure(addr);
        self.ban_for(addr, MISBEHAVIOR_BAN);
    }

    pub fn ban_for(&self, addr: SocketAddr, duration: Duration) {
        self.banned().insert(addr, Instant::now() + duration);
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        let now = Instant::now();
        let mut banned = self.banned();
        match banned.get(addr).copied() {
            Some(until) if until > now => true,
            Some(_) => {
                banned.remove(addr);
                false
            }
            None => false,
        }
    }

    pub fn banned_peers(&self) -> Vec<BannedPeerInfo> {
        let now_instant = Instant::now();
        let now_system = SystemTime::now();
        let mut banned = self.banned();
        banned.retain(|_, until| *until > now_instant);
        banned
            .iter()
            .map(|(addr, until)| BannedPeerInfo {
                addr: *addr,
                banned_until: now_system + (*until - now_instant),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misbehavior_bans_and_lowers_score() {
        let book = PeerBook::default();
        let addr = SocketAddr::from(([10, 0, 0, 2], 9976));
        book.record_success(addr);
        book.record_misbehavior(addr);

        assert!(book.is_banned(&addr));
        assert_eq!(book.score(&addr), 2);
        let banned = book.banned_peers();
        assert_eq!(banned.len(), 1);
        assert!(banned[0].banned_until > SystemTime::now() + Duration::from_secs(14 * 60));
    }

    #[test]
    fn expired_bans_are_lifted() {
        let book = PeerBook::default();
        let addr = SocketAddr::from(([10, 0, 0, 3], 9976));
        book.ban_for(addr, Duration::ZERO);
        assert!(!book.is_banned(&addr));
        assert!(book.banned_peers().is_empty());
    }
}

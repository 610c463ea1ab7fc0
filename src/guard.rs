use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const ATTEMPT_WINDOW: Duration = Duration::from_secs(60);
pub const MAX_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone, Copy)]
struct Attempt {
    count: u32,
    last_seen: Instant,
}

/// Counts connection attempts per peer address inside a sliding window.
/// A peer is blocked once it exceeds `max_attempts` before its record goes
/// stale.
pub struct BruteForceGuard {
    by_peer: Mutex<HashMap<IpAddr, Attempt>>,
    max_attempts: u32,
    window: Duration,
}

impl BruteForceGuard {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            by_peer: Mutex::new(HashMap::new()),
            max_attempts,
            window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record one attempt from `peer` and report whether it is now blocked.
    pub fn check(&self, peer: IpAddr, now: Instant) -> bool {
        let mut attempts = self.by_peer.lock().unwrap_or_else(PoisonError::into_inner);
        attempts.retain(|_, attempt| now.saturating_duration_since(attempt.last_seen) <= self.window);

        let attempt = attempts.entry(peer).or_insert(Attempt {
            count: 0,
            last_seen: now,
        });
        attempt.count = attempt.count.saturating_add(1);
        attempt.last_seen = now;
        attempt.count > self.max_attempts
    }

    pub fn tracked_peers(&self) -> usize {
        self.by_peer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for BruteForceGuard {
    fn default() -> Self {
        Self::new(MAX_ATTEMPTS, ATTEMPT_WINDOW)
    }
}

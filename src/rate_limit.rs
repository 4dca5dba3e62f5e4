// src/rate_limit.rs - Per-IP action scoring, bans and connection caps
use crate::constants::MAX_CONNECTIONS_PER_IP;
use crate::util;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Score weights of rate-limited actions
pub mod action {
    pub const CONNECT: u32 = 10;
    pub const SHARE_SUBMIT: u32 = 1;
    pub const INVALID_POW: u32 = 200;
}

/// Accumulated score above which an IP is banned
pub const MAX_SCORE: u32 = 2_000;

/// Scores are reset (and expired bans collected) at this interval
pub const RESET_INTERVAL: Duration = Duration::from_secs(120);

/// Ban length in seconds
pub const BAN_DURATION: u64 = 5 * 60;

#[derive(Default)]
struct Scores {
    /// Per-IP accumulated action score, cleared every reset sweep
    scores: HashMap<String, u32>,
    /// ip -> unix time the ban ends
    bans: HashMap<String, u64>,
}

/// Per-IP rate limiter. One instance per slave process; every operation
/// is O(1) under a single lock.
pub struct RateLimiter {
    inner: Mutex<Scores>,
    /// Open connections per IP, maintained by accept and kick paths
    connections: DashMap<String, u32>,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            inner: Mutex::new(Scores::default()),
            connections: DashMap::new(),
        }
    }

    /// Charge `weight` to `ip` and report whether the action may proceed.
    /// Returns false while the IP is banned or once its score overflows
    /// (which also starts a ban).
    pub fn can_do_action(&self, ip: &str, weight: u32) -> bool {
        let mut inner = self.inner.lock();

        let score = inner.scores.entry(ip.to_string()).or_insert(0);
        *score = score.saturating_add(weight);
        let score = *score;

        let now = util::now();

        if inner.bans.get(ip).copied().unwrap_or(0) > now {
            return false;
        }

        if score > MAX_SCORE {
            log::warn!("IP {} exceeded rate-limit score ({}), banning", ip, score);
            inner.bans.insert(ip.to_string(), now + BAN_DURATION);
            return false;
        }

        true
    }

    /// Ban an IP until `ends` (unix seconds)
    pub fn ban(&self, ip: &str, ends: u64) {
        self.inner.lock().bans.insert(ip.to_string(), ends);
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.inner.lock().bans.get(ip).copied().unwrap_or(0) > util::now()
    }

    /// Admit a new connection from `ip`, unless the per-IP cap is reached.
    /// Increments the open-connection count on success.
    pub fn can_connect(&self, ip: &str) -> bool {
        let mut count = self.connections.entry(ip.to_string()).or_insert(0);
        if *count > MAX_CONNECTIONS_PER_IP {
            return false;
        }
        *count += 1;
        true
    }

    /// Release one connection slot for `ip`. Every kick/close path must
    /// call this exactly once per admitted connection.
    pub fn disconnect(&self, ip: &str) {
        if let Some(mut count) = self.connections.get_mut(ip) {
            *count = count.saturating_sub(1);
        }
        self.connections.remove_if(ip, |_, count| *count == 0);
    }

    pub fn open_connections(&self, ip: &str) -> u32 {
        self.connections.get(ip).map(|c| *c).unwrap_or(0)
    }

    /// Clear all scores and collect expired bans
    pub fn reset_sweep(&self) {
        let mut inner = self.inner.lock();
        inner.scores.clear();

        let now = util::now();
        inner.bans.retain(|_, ends| *ends > now);
    }

    /// Spawn the periodic reset task
    pub fn start_reset_task(self: Arc<Self>) {
        let limiter = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RESET_INTERVAL);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                limiter.reset_sweep();
            }
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_overflow_bans() {
        let limiter = RateLimiter::new();
        let admits = MAX_SCORE / action::CONNECT;

        for _ in 0..admits {
            assert!(limiter.can_do_action("1.2.3.4", action::CONNECT));
        }
        // next action pushes the score past the cap
        assert!(!limiter.can_do_action("1.2.3.4", action::CONNECT));
        assert!(limiter.is_banned("1.2.3.4"));

        // an unrelated IP is unaffected
        assert!(limiter.can_do_action("5.6.7.8", action::CONNECT));
    }

    #[test]
    fn test_ban_survives_score_reset() {
        let limiter = RateLimiter::new();
        limiter.ban("1.2.3.4", util::now() + 600);
        limiter.reset_sweep();
        assert!(!limiter.can_do_action("1.2.3.4", action::SHARE_SUBMIT));
    }

    #[test]
    fn test_expired_ban_collected_on_sweep() {
        let limiter = RateLimiter::new();
        limiter.ban("1.2.3.4", util::now().saturating_sub(1));
        limiter.reset_sweep();
        assert!(!limiter.is_banned("1.2.3.4"));
        assert!(limiter.can_do_action("1.2.3.4", action::SHARE_SUBMIT));
    }

    #[test]
    fn test_connection_cap() {
        let limiter = RateLimiter::new();
        for _ in 0..=MAX_CONNECTIONS_PER_IP {
            assert!(limiter.can_connect("1.2.3.4"));
        }
        assert!(!limiter.can_connect("1.2.3.4"));

        limiter.disconnect("1.2.3.4");
        assert!(limiter.can_connect("1.2.3.4"));
    }

    #[test]
    fn test_disconnect_below_zero_is_harmless() {
        let limiter = RateLimiter::new();
        limiter.disconnect("9.9.9.9");
        assert_eq!(limiter.open_connections("9.9.9.9"), 0);
    }
}

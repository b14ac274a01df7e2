//! Sliding-window rate limiting for authentication attempts.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Tracks authentication attempts per source IP over a sliding window.
pub struct RateLimiter {
    max_attempts: u32,
    window: Duration,
    attempts: HashMap<IpAddr, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window_secs: u64) -> Self {
        Self {
            max_attempts,
            window: Duration::from_secs(window_secs),
            attempts: HashMap::new(),
        }
    }

    /// Record an attempt from `ip` and report whether it is allowed.
    ///
    /// Attempts older than the window are discarded as a side effect.
    pub fn check(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let window = self.window;
        let entries = self.attempts.entry(ip).or_default();
        entries.retain(|t| now.duration_since(*t) < window);
        if entries.len() >= self.max_attempts as usize {
            return false;
        }
        entries.push(now);
        true
    }

    /// Drop IPs whose attempts have all aged out of the window.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.attempts
            .retain(|_, entries| entries.iter().any(|t| now.duration_since(*t) < window));
    }

    #[cfg(test)]
    fn tracked_ips(&self) -> usize {
        self.attempts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn allows_up_to_limit() {
        let mut rl = RateLimiter::new(3, 60);
        assert!(rl.check(ip("10.0.0.1")));
        assert!(rl.check(ip("10.0.0.1")));
        assert!(rl.check(ip("10.0.0.1")));
        assert!(!rl.check(ip("10.0.0.1")));
    }

    #[test]
    fn limits_are_per_ip() {
        let mut rl = RateLimiter::new(1, 60);
        assert!(rl.check(ip("10.0.0.1")));
        assert!(!rl.check(ip("10.0.0.1")));
        assert!(rl.check(ip("10.0.0.2")));
    }

    #[test]
    fn gc_drops_empty_entries() {
        let mut rl = RateLimiter::new(5, 0);
        rl.check(ip("10.0.0.1"));
        rl.check(ip("10.0.0.2"));
        rl.gc();
        assert_eq!(rl.tracked_ips(), 0);
    }

    #[test]
    fn window_zero_expires_immediately() {
        let mut rl = RateLimiter::new(1, 0);
        assert!(rl.check(ip("10.0.0.1")));
        // The first attempt has already aged out of a zero-length window.
        assert!(rl.check(ip("10.0.0.1")));
    }
}

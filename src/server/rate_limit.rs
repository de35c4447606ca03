//! Per-client sliding-window rate limiting.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Default budget: 200 messages per second per client key.
pub const DEFAULT_MAX_REQUESTS: usize = 200;
/// Default window width.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(1000);

/// Sliding-window message counter keyed by client identity (remote address).
///
/// Timestamps older than the window are evicted lazily on every `check`.
/// Not internally synchronized; the broker serializes access.
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    hits: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: HashMap::new(),
        }
    }

    /// Record one request for `key`. Returns false if the budget for the
    /// current window is already exhausted.
    pub fn check(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let hits = self.hits.entry(key.to_string()).or_default();

        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) > self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= self.max_requests {
            return false;
        }

        hits.push_back(now);
        true
    }

    /// Forget a client entirely (called on disconnect).
    pub fn remove(&mut self, key: &str) {
        self.hits.remove(key);
    }

    /// Number of tracked keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_budget() {
        let mut limiter = RateLimiter::new(5, Duration::from_secs(1));
        for _ in 0..5 {
            assert!(limiter.check("client"));
        }
        assert!(!limiter.check("client"));
    }

    #[test]
    fn test_window_expiry_readmits() {
        let mut limiter = RateLimiter::new(2, Duration::from_millis(50));
        assert!(limiter.check("client"));
        assert!(limiter.check("client"));
        assert!(!limiter.check("client"));

        std::thread::sleep(Duration::from_millis(60));
        assert!(limiter.check("client"));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(1));
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
        assert!(limiter.check("b"));
    }

    #[test]
    fn test_remove_resets_budget() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(1));
        assert!(limiter.check("client"));
        assert!(!limiter.check("client"));

        limiter.remove("client");
        assert!(limiter.check("client"));
    }
}

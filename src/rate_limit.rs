//! Sliding-window rate limiter
//!
//! Keeps a log of request instants per identifier. Each admission prunes the
//! identifier's log and appends to it inside the same map entry guard, so two
//! concurrent requests for one identifier can't both take the last slot.
//! State is process-local and intentionally not persisted.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub allowed: bool,
    /// Epoch millis at which the oldest counted request leaves the window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<i64>,
}

impl Admission {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reset_at: None,
        }
    }

    /// Milliseconds until the window has room again, relative to `now_ms`
    pub fn retry_after_ms(&self, now_ms: i64) -> Option<i64> {
        self.reset_at.map(|reset| (reset - now_ms).max(0))
    }
}

/// A named admission policy (max requests per window)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub max_requests: u32,
    pub window: Duration,
}

impl RatePolicy {
    pub const fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(60),
        }
    }
}

/// In-memory sliding-window log keyed by an opaque identifier
#[derive(Debug, Default)]
pub struct RateLimiter {
    entries: DashMap<String, VecDeque<i64>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and record a request for `identifier` at the current wall clock
    pub fn admit(&self, identifier: &str, policy: RatePolicy) -> Admission {
        self.admit_at(identifier, policy, chrono::Utc::now().timestamp_millis())
    }

    /// Check and record a request for `identifier` at `now_ms`
    pub fn admit_at(&self, identifier: &str, policy: RatePolicy, now_ms: i64) -> Admission {
        let window_ms = policy.window.as_millis() as i64;
        let window_start = now_ms - window_ms;

        let mut log = self.entries.entry(identifier.to_string()).or_default();

        while log.front().is_some_and(|&ts| ts <= window_start) {
            log.pop_front();
        }

        if log.len() >= policy.max_requests as usize {
            let reset_at = log.front().map(|oldest| oldest + window_ms).unwrap_or(now_ms);
            debug!(identifier, count = log.len(), reset_at, "Request rate limited");
            return Admission {
                allowed: false,
                reset_at: Some(reset_at),
            };
        }

        log.push_back(now_ms);
        Admission::allowed()
    }

    /// Drop identifiers with no requests left inside `window`
    pub fn cleanup(&self, window: Duration) {
        self.cleanup_at(window, chrono::Utc::now().timestamp_millis());
    }

    pub fn cleanup_at(&self, window: Duration, now_ms: i64) {
        let window_start = now_ms - window.as_millis() as i64;
        self.entries.retain(|_, log| {
            log.retain(|&ts| ts > window_start);
            !log.is_empty()
        });
    }

    /// Number of identifiers currently tracked
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }

    /// Forget all state
    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const POLICY: RatePolicy = RatePolicy {
        max_requests: 3,
        window: Duration::from_secs(60),
    };

    #[test]
    fn test_burst_rejects_only_the_extra_request() {
        let limiter = RateLimiter::new();
        let now = 1_000_000;

        for i in 0..3 {
            assert!(limiter.admit_at("wallet-a", POLICY, now + i).allowed);
        }
        let rejected = limiter.admit_at("wallet-a", POLICY, now + 3);
        assert!(!rejected.allowed);
        assert_eq!(rejected.reset_at, Some(now + 60_000));
        assert!(rejected.reset_at.unwrap() > now + 3);
    }

    #[test]
    fn test_admits_again_after_reset() {
        let limiter = RateLimiter::new();
        let now = 5_000;
        for _ in 0..3 {
            limiter.admit_at("k", POLICY, now);
        }
        let rejected = limiter.admit_at("k", POLICY, now + 10);
        let reset_at = rejected.reset_at.unwrap();

        assert!(!limiter.admit_at("k", POLICY, reset_at - 1).allowed);
        assert!(limiter.admit_at("k", POLICY, reset_at).allowed);
    }

    #[test]
    fn test_identifiers_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.admit_at("conquer:a", POLICY, 0);
        }
        assert!(!limiter.admit_at("conquer:a", POLICY, 1).allowed);
        assert!(limiter.admit_at("recolor:a", POLICY, 1).allowed);
    }

    #[test]
    fn test_rejected_requests_are_not_recorded() {
        let limiter = RateLimiter::new();
        let policy = RatePolicy {
            max_requests: 1,
            window: Duration::from_millis(100),
        };
        assert!(limiter.admit_at("k", policy, 0).allowed);
        assert!(!limiter.admit_at("k", policy, 50).allowed);
        assert!(!limiter.admit_at("k", policy, 99).allowed);
        assert!(limiter.admit_at("k", policy, 100).allowed);
    }

    #[test]
    fn test_cleanup_drops_idle_identifiers() {
        let limiter = RateLimiter::new();
        limiter.admit_at("old", POLICY, 0);
        limiter.admit_at("fresh", POLICY, 100_000);
        limiter.cleanup_at(POLICY.window, 120_000);
        assert_eq!(limiter.tracked(), 1);
    }

    #[test]
    fn test_concurrent_admissions_respect_limit() {
        let limiter = Arc::new(RateLimiter::new());
        let policy = RatePolicy {
            max_requests: 5,
            window: Duration::from_secs(60),
        };

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || limiter.admit_at("shared", policy, 42).allowed)
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(admitted, 5);
    }
}

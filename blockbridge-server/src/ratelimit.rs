//! Per-subject token buckets for the sync trigger endpoints.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Bucket capacity
    pub burst: u32,
    /// Tokens refilled per second
    pub refill_rate: f64,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 10,
            refill_rate: 1.0,
            enabled: true,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: u32) -> Self {
        Self {
            tokens: f64::from(capacity),
            last_refill: Instant::now(),
        }
    }

    /// Take one token, or report how long until one is available.
    fn take(&mut self, config: &RateLimitConfig) -> Result<(), Duration> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * config.refill_rate).min(f64::from(config.burst));
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if config.refill_rate <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::from_secs_f64((1.0 - self.tokens) / config.refill_rate))
    }
}

/// Token buckets keyed by token subject.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// `Err(retry_after)` when `identity` has run dry.
    pub fn check(&self, identity: &str) -> Result<(), Duration> {
        if !self.config.enabled {
            return Ok(());
        }
        self.buckets
            .entry(identity.to_string())
            .or_insert_with(|| Bucket::full(self.config.burst))
            .take(&self.config)
    }

    /// Forget buckets idle for longer than `max_idle`; returns how many went.
    pub fn sweep(&self, max_idle: Duration) -> usize {
        let before = self.buckets.len();
        let now = Instant::now();
        self.buckets
            .retain(|_, bucket| now.duration_since(bucket.last_refill) < max_idle);
        before - self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(burst: u32, refill_rate: f64, enabled: bool) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            burst,
            refill_rate,
            enabled,
        })
    }

    #[test]
    fn test_burst_then_limited() {
        let limiter = limiter(3, 1.0, true);
        for _ in 0..3 {
            assert!(limiter.check("bot").is_ok());
        }
        let wait = limiter.check("bot").unwrap_err();
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(1));
    }

    #[test]
    fn test_subjects_have_separate_buckets() {
        let limiter = limiter(1, 0.1, true);
        assert!(limiter.check("alice").is_ok());
        assert!(limiter.check("bob").is_ok());
        assert!(limiter.check("alice").is_err());
    }

    #[test]
    fn test_disabled_always_allows() {
        let limiter = limiter(1, 0.0, false);
        for _ in 0..100 {
            assert!(limiter.check("bot").is_ok());
        }
    }

    #[test]
    fn test_zero_refill_never_recovers() {
        let limiter = limiter(1, 0.0, true);
        assert!(limiter.check("bot").is_ok());
        assert_eq!(limiter.check("bot"), Err(Duration::MAX));
    }

    #[test]
    fn test_sweep_drops_idle_buckets() {
        let limiter = limiter(2, 1.0, true);
        limiter.check("alice").unwrap();
        limiter.check("bob").unwrap();
        assert_eq!(limiter.sweep(Duration::from_secs(3600)), 0);
        assert_eq!(limiter.sweep(Duration::ZERO), 2);
    }
}

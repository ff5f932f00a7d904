//! Token-bucket admission control for the HTTP surface.
//!
//! Two independent buckets: one for ordinary API calls and one reserved for
//! the batch ingestion endpoints. Tokens are refilled lazily from elapsed
//! monotonic time on every call.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use serde_json::json;

use crate::config::RateLimitConfig;

/// Paths served from the batch bucket.
pub const BATCH_PATH_SUFFIXES: [&str; 2] = ["/api/v1/logs/batch", "/api/v1/metrics/batch"];

/// Float slack so a refill of exactly one token is not lost to rounding.
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket. Starts full.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket refilling `rate` tokens per second up to `capacity`.
    ///
    /// A zero capacity falls back to the rate.
    pub fn new(rate: u32, capacity: u32) -> Self {
        let capacity = if capacity == 0 { rate } else { capacity };
        Self::starting_at(rate, capacity, Instant::now())
    }

    fn starting_at(rate: u32, capacity: u32, now: Instant) -> Self {
        Self {
            rate: f64::from(rate),
            capacity: f64::from(capacity),
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    /// Take one token as of `now`.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if !elapsed.is_zero() {
            state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens + TOKEN_EPSILON >= 1.0 {
            state.tokens = (state.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity as u32
    }

    pub fn rate(&self) -> u32 {
        self.rate as u32
    }
}

/// Which bucket a request is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Default,
    Batch,
}

impl Tier {
    /// Classify a request path.
    pub fn for_path(path: &str) -> Self {
        if BATCH_PATH_SUFFIXES.iter().any(|s| path.ends_with(s)) {
            Self::Batch
        } else {
            Self::Default
        }
    }
}

/// Default and batch buckets behind one switch.
#[derive(Debug)]
pub struct DualRateLimiter {
    enabled: bool,
    default: TokenBucket,
    batch: TokenBucket,
}

impl DualRateLimiter {
    pub fn new(enabled: bool, default: TokenBucket, batch: TokenBucket) -> Self {
        Self {
            enabled,
            default,
            batch,
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            config.enabled,
            TokenBucket::new(config.rate, config.capacity),
            TokenBucket::new(config.batch_rate, config.batch_capacity),
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn bucket(&self, tier: Tier) -> &TokenBucket {
        match tier {
            Tier::Default => &self.default,
            Tier::Batch => &self.batch,
        }
    }

    /// Admit or reject a request for `path`. Always admits when disabled.
    pub fn check(&self, path: &str) -> bool {
        !self.enabled || self.bucket(Tier::for_path(path)).try_acquire()
    }
}

/// Axum middleware rejecting over-limit requests with `429`.
pub async fn rate_limit_layer(
    State(limiter): State<Arc<DualRateLimiter>>,
    req: Request,
    next: Next,
) -> Response {
    if limiter.check(req.uri().path()) {
        return next.run(req).await;
    }

    tracing::debug!(path = %req.uri().path(), "Rate limit exceeded");
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "error": "rate limit exceeded, please retry later" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_single_refill() {
        let rate = 10;
        let capacity = 5;
        let t0 = Instant::now();
        let bucket = TokenBucket::starting_at(rate, capacity, t0);

        let allowed = (0..=capacity).filter(|_| bucket.try_acquire_at(t0)).count();
        assert_eq!(allowed, capacity as usize);

        let t1 = t0 + Duration::from_secs_f64(1.0 / f64::from(rate));
        assert!(bucket.try_acquire_at(t1));
        assert!(!bucket.try_acquire_at(t1));
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let t0 = Instant::now();
        let bucket = TokenBucket::starting_at(100, 3, t0);
        let later = t0 + Duration::from_secs(60);

        let allowed = (0..10).filter(|_| bucket.try_acquire_at(later)).count();
        assert_eq!(allowed, 3);
    }

    #[test]
    fn test_capacity_defaults_to_rate() {
        let bucket = TokenBucket::new(7, 0);
        assert_eq!(bucket.capacity(), 7);
        assert_eq!(bucket.rate(), 7);
    }

    #[test]
    fn test_tier_for_path() {
        assert_eq!(Tier::for_path("/api/v1/logs/batch"), Tier::Batch);
        assert_eq!(Tier::for_path("/api/v1/metrics/batch"), Tier::Batch);
        assert_eq!(Tier::for_path("/api/v1/logs"), Tier::Default);
        assert_eq!(Tier::for_path("/healthz"), Tier::Default);
    }

    #[test]
    fn test_tiers_are_independent() {
        let limiter = DualRateLimiter::new(true, TokenBucket::new(1, 1), TokenBucket::new(1, 2));

        assert!(limiter.check("/api/v1/logs"));
        assert!(!limiter.check("/api/v1/logs"));

        // The exhausted default bucket does not affect batch traffic.
        assert!(limiter.check("/api/v1/logs/batch"));
        assert!(limiter.check("/api/v1/metrics/batch"));
        assert!(!limiter.check("/api/v1/logs/batch"));
    }

    #[test]
    fn test_disabled_admits_everything() {
        let limiter = DualRateLimiter::new(false, TokenBucket::new(1, 1), TokenBucket::new(1, 1));
        assert!((0..100).all(|_| limiter.check("/api/v1/logs")));
    }

    #[test]
    fn test_concurrent_callers_never_exceed_capacity() {
        let t0 = Instant::now();
        let bucket = Arc::new(TokenBucket::starting_at(1, 100, t0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let bucket = Arc::clone(&bucket);
                std::thread::spawn(move || (0..50).filter(|_| bucket.try_acquire_at(t0)).count())
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }
}

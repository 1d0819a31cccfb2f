//! Throttle & Concurrency Gate (C8, spec.md §4.8).
//!
//! Two guards applied in order: a per-actor token bucket (reject with a
//! `Retry-After` hint), then a pair of bounded semaphores — one global for
//! heavy queries, one per-actor for everything else. Light queries bypass
//! both semaphores.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::EngineError;

/// A query counts as heavy when it requests a large page or a total-row
/// count alongside it (spec.md §4.8).
pub fn is_heavy(limit: Option<u64>, include_total: bool) -> bool {
    include_total || limit.map(|l| l >= 5000).unwrap_or(false)
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64) -> Self {
        TokenBucket {
            tokens: burst,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, rate: f64, burst: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = now;
    }
}

/// Holds the semaphore permits acquired for one in-flight query. Dropping it
/// releases them.
pub struct ConcurrencyGuard {
    _heavy: Option<OwnedSemaphorePermit>,
    _user: Option<OwnedSemaphorePermit>,
}

pub struct Throttle {
    rate_per_sec: f64,
    burst: f64,
    buckets: Mutex<HashMap<String, TokenBucket>>,
    heavy_sem: Arc<Semaphore>,
    user_sems: Mutex<HashMap<String, Arc<Semaphore>>>,
    user_query_concurrency: usize,
}

impl Throttle {
    pub fn new(rate_per_sec: f64, burst: f64, heavy_query_concurrency: usize, user_query_concurrency: usize) -> Self {
        Throttle {
            rate_per_sec,
            burst,
            buckets: Mutex::new(HashMap::new()),
            heavy_sem: Arc::new(Semaphore::new(heavy_query_concurrency)),
            user_sems: Mutex::new(HashMap::new()),
            user_query_concurrency,
        }
    }

    /// Attempt to take one token for `actor`. On rejection, returns the
    /// number of seconds the caller should wait before retrying.
    pub fn try_acquire_token(&self, actor: &str) -> std::result::Result<(), EngineError> {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry(actor.to_string())
            .or_insert_with(|| TokenBucket::new(self.burst));
        bucket.refill(self.rate_per_sec, self.burst);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / self.rate_per_sec).ceil().max(1.0) as u64;
            Err(EngineError::RateLimited { retry_after_secs })
        }
    }

    fn user_semaphore(&self, actor: &str) -> Arc<Semaphore> {
        self.user_sems
            .lock()
            .entry(actor.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.user_query_concurrency)))
            .clone()
    }

    /// Acquire the concurrency permits for a query. Light queries only take
    /// the per-actor permit; heavy queries also take the global heavy-query
    /// permit (spec.md §4.8).
    pub async fn acquire_concurrency(&self, actor: &str, heavy: bool) -> ConcurrencyGuard {
        let user_permit = self
            .user_semaphore(actor)
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        let heavy_permit = if heavy {
            Some(
                self.heavy_sem
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("semaphore never closed"),
            )
        } else {
            None
        };
        ConcurrencyGuard {
            _heavy: heavy_permit,
            _user: Some(user_permit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heavy_detection_matches_spec_thresholds() {
        assert!(is_heavy(Some(5000), false));
        assert!(is_heavy(Some(100), true));
        assert!(!is_heavy(Some(100), false));
        assert!(!is_heavy(None, false));
    }

    #[test]
    fn token_bucket_rejects_after_burst_exhausted() {
        let throttle = Throttle::new(1.0, 2.0, 8, 2);
        assert!(throttle.try_acquire_token("actor-1").is_ok());
        assert!(throttle.try_acquire_token("actor-1").is_ok());
        let err = throttle.try_acquire_token("actor-1").unwrap_err();
        match err {
            EngineError::RateLimited { retry_after_secs } => assert!(retry_after_secs >= 1),
            _ => panic!("expected RateLimited"),
        }
    }

    #[test]
    fn buckets_are_independent_per_actor() {
        let throttle = Throttle::new(1.0, 1.0, 8, 2);
        assert!(throttle.try_acquire_token("actor-a").is_ok());
        assert!(throttle.try_acquire_token("actor-b").is_ok());
    }

    #[tokio::test]
    async fn light_query_does_not_touch_heavy_semaphore() {
        let throttle = Throttle::new(10.0, 10.0, 1, 5);
        let _g1 = throttle.acquire_concurrency("actor-1", false).await;
        let _g2 = throttle.acquire_concurrency("actor-1", false).await;
    }

    #[tokio::test]
    async fn heavy_query_acquires_global_permit() {
        let throttle = Throttle::new(10.0, 10.0, 1, 5);
        let guard = throttle.acquire_concurrency("actor-1", true).await;
        assert!(guard._heavy.is_some());
    }
}

//! Token-bucket rate limiter shared across all calls to a given endpoint
//! key. Acquisition may block until a permit becomes available.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use elspeth_core::config::RateLimitConfig;
use elspeth_core::RateLimiter;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(rate: f64, burst: u32) -> Self {
        Bucket { tokens: burst as f64, capacity: burst as f64, rate_per_sec: rate, last_refill: Instant::now() }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Try to take one token; if unavailable, the wait needed before a
    /// token accrues.
    fn try_take(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.rate_per_sec.max(f64::MIN_POSITIVE)))
        }
    }
}

/// Endpoint-keyed rate limiter. Endpoints absent from the configured map
/// are unlimited, so a run with no `rate_limit` section behaves exactly
/// like one with no limiter at all.
pub struct RateLimiterRegistry {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiterRegistry {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiterRegistry { config, buckets: Mutex::new(HashMap::new()) }
    }

    /// Block until a token is available for `endpoint_key`, or return
    /// immediately if no bucket is configured for it.
    async fn acquire_inner(&self, endpoint_key: &str) {
        let Some(limit) = self.config.endpoints.get(endpoint_key) else { return };
        loop {
            let wait = {
                let mut buckets = self.buckets.lock().expect("poisoned");
                let bucket = buckets
                    .entry(endpoint_key.to_string())
                    .or_insert_with(|| Bucket::new(limit.rate, limit.burst));
                bucket.try_take()
            };
            match wait {
                Ok(()) => return,
                Err(delay) => tokio::time::sleep(delay).await,
            }
        }
    }
}

#[async_trait]
impl RateLimiter for RateLimiterRegistry {
    async fn acquire(&self, endpoint_key: &str) {
        self.acquire_inner(endpoint_key).await
    }
}

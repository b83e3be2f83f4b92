//! Run-scoped context: the handles every plugin and engine component
//! needs, threaded through explicitly rather than relying on any
//! global/process-wide mutable state.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::config::RunConfig;

/// Clock abstraction so trigger evaluation and tests don't depend on wall
/// clock time. `SystemClock` is the production implementation; tests use
/// a controllable fake.
pub trait Clock: Send + Sync {
    fn now(&self) -> chrono::DateTime<chrono::Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::Utc::now()
    }
}

/// The rate-limit registry contract: external calls pass through a
/// configurable rate limiter shared across all calls to a given endpoint
/// key. The trait lives here (like `AuditRecorder`) so plugins can depend
/// on `ctx.rate_limiter` without this crate depending on the concrete
/// token-bucket implementation in `elspeth-exec`.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Block until a token is available for `endpoint_key`, or return
    /// immediately if the key carries no configured limit.
    async fn acquire(&self, endpoint_key: &str);
}

/// No-op limiter used when a run has no `rate_limit` configuration.
pub struct NoopRateLimiter;

#[async_trait]
impl RateLimiter for NoopRateLimiter {
    async fn acquire(&self, _endpoint_key: &str) {}
}

/// Carries every run-wide handle a plugin or engine component needs: the
/// run id, the audit recorder, the clock, the rate limiter, and the run's
/// config fingerprint. Cheap to clone (everything behind `Arc`).
#[derive(Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub audit: Arc<dyn AuditRecorder>,
    pub clock: Arc<dyn Clock>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub config_fingerprint: String,
}

impl RunContext {
    pub fn new(run_id: Uuid, audit: Arc<dyn AuditRecorder>, clock: Arc<dyn Clock>, config: &RunConfig) -> Self {
        RunContext {
            run_id,
            audit,
            clock,
            rate_limiter: Arc::new(NoopRateLimiter),
            config_fingerprint: config.config_fingerprint(),
        }
    }

    /// Attach a concrete rate limiter (e.g. `elspeth_exec::rate_limit::RateLimiterRegistry`).
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}

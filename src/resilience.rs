//! Resilience utilities: retry backoff and upstream request throttling.
//!
//! - [`RetryConfig`]: bounded exponential backoff for transient failures.
//!   Delays are a pure function of the attempt number, so retry schedules
//!   are unit-testable without sleeping.
//! - [`Throttle`]: paces requests to the shared replication server at one
//!   request per configured period, applied to every request regardless
//!   of outcome.
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use std::time::Duration;
//! use changeset_sync::resilience::{RetryConfig, Throttle};
//!
//! let retry = RetryConfig::default();
//! let delay = retry.delay_for_attempt(3); // no clock involved
//!
//! let throttle = Throttle::new(Duration::from_secs(1));
//! throttle.acquire().await; // blocks until the next slot
//! # }
//! ```

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};

/// Configuration for retry behavior on transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts before giving up.
    /// Set to `usize::MAX` for infinite retries (daemon mode).
    pub max_attempts: usize,

    /// Initial delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual request attempt.
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Fast-fail retry for startup probes (config errors should surface
    /// quickly, not after minutes of backoff).
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay     Cumulative
    /// -------  -----     ----------
    /// 1        500ms     500ms
    /// 2        1s        1.5s
    /// 3        2s        3.5s
    /// 4        4s        7.5s
    /// 5        8s        ~15s (total)
    /// ```
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Infinite retry for the long-running daemon.
    ///
    /// Retries forever with exponential backoff capped at 5 minutes.
    /// Upstream outages can last hours; the daemon recovers without a
    /// manual restart once the server is reachable again.
    ///
    /// Note this governs connection-level retries, not per-sequence
    /// fetches - those stay bounded so a poisoned sequence gets recorded
    /// as failed rather than retried forever.
    pub fn daemon() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Fast-fail retry for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            request_timeout: Duration::from_millis(500),
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs);

        std::cmp::min(delay, self.max_delay)
    }
}

// =============================================================================
// Request Throttle
// =============================================================================

/// Paces requests to the upstream replication server.
///
/// One permit becomes available per `period`; every fetch acquires a
/// permit before issuing its request, success or not, so the engine
/// never exceeds the configured request rate even while draining a
/// backlog. A zero period disables throttling.
pub struct Throttle {
    limiter: Option<GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>>,
    period: Duration,
}

impl Throttle {
    /// Create a throttle admitting one request per `period`.
    pub fn new(period: Duration) -> Self {
        let limiter = Quota::with_period(period).map(|quota| {
            GovLimiter::direct(quota.allow_burst(NonZeroU32::MIN))
        });
        Self { limiter, period }
    }

    /// Acquire a request slot, waiting until one is available.
    ///
    /// Cancel-safe: a cancelled wait consumes no slot.
    pub async fn acquire(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }
    }

    /// Try to acquire a slot without blocking.
    pub fn try_acquire(&self) -> bool {
        match &self.limiter {
            Some(limiter) => limiter.check().is_ok(),
            None => true,
        }
    }

    /// The configured pacing period.
    pub fn period(&self) -> Duration {
        self.period
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("period", &self.period)
            .finish()
    }
}

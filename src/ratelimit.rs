//! Throughput control for outbound requests.
//!
//! Two primitives — a token bucket with continuous refill and a sliding
//! window counter — plus the composite [`RateLimiter`] the client uses:
//! one global bucket, and optionally one lazily created bucket per host.
//!
//! The bucket's wait path is deliberately optimistic: it sleeps for the
//! computed deficit and then zeroes the bucket without re-reading the
//! clock. Under sustained contention this slightly under-delivers the
//! nominal rate; downstream throughput expectations are calibrated against
//! that behavior, so it must not be tightened into a recompute loop.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Rate limiting errors.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// The limiter has no capacity and the caller declined to wait.
    #[error("rate limit exceeded for {scope}: retry in {retry_after:.2}s")]
    Exhausted {
        /// Which limiter refused: `global`, a host name, or `window`.
        scope: String,
        /// Seconds until capacity is expected back.
        retry_after: f64,
    },
}

impl RateLimitError {
    /// Rewrite the scope so composite limiters can name the bucket that
    /// actually refused.
    fn with_scope(self, scope: &str) -> Self {
        match self {
            Self::Exhausted { retry_after, .. } => Self::Exhausted {
                scope: scope.to_owned(),
                retry_after,
            },
        }
    }
}

/// Configuration for the composite [`RateLimiter`].
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RateLimiterConfig {
    /// Sustained request rate, tokens per second.
    pub requests_per_sec: f64,
    /// Burst capacity — the bucket's token cap.
    pub burst: u32,
    /// Whether to additionally limit each distinct host.
    pub per_host: bool,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_sec: 10.0,
            burst: 20,
            per_host: false,
        }
    }
}

/// Mutable bucket state, guarded by one mutex per bucket.
#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket with continuous refill.
///
/// Tokens accumulate at `rate` per second up to `burst` and are observed
/// only within `[0, burst]`. The mutex is held across the wait-path sleep,
/// so same-bucket waiters queue in arrival order.
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    burst: f64,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    pub fn new(rate: f64, burst: u32) -> Self {
        let burst = f64::from(burst);
        Self {
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
            rate,
            burst,
        }
    }

    /// Acquire `tokens` from the bucket.
    ///
    /// Refills from elapsed time first. If capacity is short and `wait` is
    /// false, fails with [`RateLimitError::Exhausted`]. If `wait` is true,
    /// sleeps for `deficit / rate` seconds, then forces the bucket to zero
    /// and succeeds — the optimistic wait described in the module docs.
    ///
    /// The bucket mutex is held across that sleep, so any caller arriving
    /// meanwhile — including `wait = false` callers and [`available`] —
    /// queues behind the sleeper. Fail-fast latency is therefore bounded by
    /// the longest in-flight wait on the same bucket, not zero.
    ///
    /// [`available`]: TokenBucket::available
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exhausted`] only when `wait` is false.
    pub async fn acquire(&self, tokens: f64, wait: bool) -> Result<(), RateLimitError> {
        let mut state = self.state.lock().await;

        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = Instant::now();

        if state.tokens >= tokens {
            state.tokens -= tokens;
            return Ok(());
        }

        let deficit = tokens - state.tokens;
        let wait_secs = deficit / self.rate;

        if !wait {
            return Err(RateLimitError::Exhausted {
                scope: "bucket".to_owned(),
                retry_after: wait_secs,
            });
        }

        debug!(wait_secs, "token bucket exhausted, sleeping");
        tokio::time::sleep(Duration::from_secs_f64(wait_secs)).await;

        // Optimistic: charge the full deficit against future refill instead
        // of re-reading the clock.
        state.tokens = 0.0;
        state.last_refill = Instant::now();
        Ok(())
    }

    /// Tokens currently available, after refreshing from elapsed time.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = Instant::now();
        state.tokens
    }
}

/// Sliding-window counter: at most `max_requests` within the trailing
/// `window`. Expired timestamps are pruned on every acquire.
#[derive(Debug)]
pub struct SlidingWindow {
    timestamps: Mutex<VecDeque<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl SlidingWindow {
    /// Create a window admitting `max_requests` per `window`.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Mutex::new(VecDeque::new()),
            max_requests,
            window,
        }
    }

    /// Acquire a slot in the window.
    ///
    /// If the window is full and `wait` is true, sleeps until the oldest
    /// entry expires and retries once.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exhausted`] when the window is full and
    /// either `wait` is false or the single retry also finds it full.
    pub async fn acquire(&self, wait: bool) -> Result<(), RateLimitError> {
        let mut timestamps = self.timestamps.lock().await;
        let now = Instant::now();
        prune(&mut timestamps, now, self.window);

        if timestamps.len() < self.max_requests {
            timestamps.push_back(now);
            return Ok(());
        }

        let wait_for = match timestamps.front() {
            Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
            None => Duration::ZERO,
        };

        if !wait {
            return Err(RateLimitError::Exhausted {
                scope: "window".to_owned(),
                retry_after: wait_for.as_secs_f64(),
            });
        }

        debug!(wait_secs = wait_for.as_secs_f64(), "sliding window full, sleeping");
        tokio::time::sleep(wait_for).await;

        let now = Instant::now();
        prune(&mut timestamps, now, self.window);
        if timestamps.len() < self.max_requests {
            timestamps.push_back(now);
            return Ok(());
        }

        Err(RateLimitError::Exhausted {
            scope: "window".to_owned(),
            retry_after: self.window.as_secs_f64(),
        })
    }

    /// Number of requests currently inside the window.
    pub async fn occupancy(&self) -> usize {
        let mut timestamps = self.timestamps.lock().await;
        prune(&mut timestamps, Instant::now(), self.window);
        timestamps.len()
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while timestamps
        .front()
        .is_some_and(|t| now.duration_since(*t) > window)
    {
        timestamps.pop_front();
    }
}

/// Point-in-time limiter statistics for observability surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    /// Tokens currently available in the global bucket.
    pub global_available: f64,
    /// Configured sustained rate.
    pub requests_per_sec: f64,
    /// Configured burst capacity.
    pub burst: u32,
    /// Distinct hosts with a live per-host bucket.
    pub tracked_hosts: usize,
}

/// Composite limiter: one global bucket, optionally one bucket per host.
///
/// Per-host buckets are created lazily on first use and are never garbage
/// collected — only [`RateLimiter::reset`] clears them. Unbounded host
/// cardinality is an accepted caveat of this layer.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    global: TokenBucket,
    per_host: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl RateLimiter {
    /// Create a limiter from its configuration.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            global: TokenBucket::new(config.requests_per_sec, config.burst),
            per_host: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire one request slot for `host`.
    ///
    /// The global bucket is always charged first; the per-host bucket (if
    /// enabled) is charged second, so a single noisy host cannot starve the
    /// global budget ordering.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::Exhausted`] only when `wait` is false.
    pub async fn acquire(&self, host: &str, wait: bool) -> Result<(), RateLimitError> {
        self.global
            .acquire(1.0, wait)
            .await
            .map_err(|e| e.with_scope("global"))?;

        if self.config.per_host {
            let bucket = self.host_bucket(host).await;
            bucket
                .acquire(1.0, wait)
                .await
                .map_err(|e| e.with_scope(host))?;
        }

        Ok(())
    }

    /// Drop all per-host buckets and refill the global bucket.
    pub async fn reset(&self) {
        self.per_host.lock().await.clear();
        let mut state = self.global.state.lock().await;
        state.tokens = self.global.burst;
        state.last_refill = Instant::now();
    }

    /// Snapshot the limiter state.
    pub async fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            global_available: self.global.available().await,
            requests_per_sec: self.config.requests_per_sec,
            burst: self.config.burst,
            tracked_hosts: self.per_host.lock().await.len(),
        }
    }

    async fn host_bucket(&self, host: &str) -> Arc<TokenBucket> {
        let mut buckets = self.per_host.lock().await;
        Arc::clone(buckets.entry(host.to_owned()).or_insert_with(|| {
            Arc::new(TokenBucket::new(
                self.config.requests_per_sec,
                self.config.burst,
            ))
        }))
    }
}

//! Backoff for Bitfinex REST calls
//!
//! Two separate concerns:
//! - `ReadRetry` retries idempotent order lookups on network failures only.
//! - `RateLimitGate` remembers a rate-limit answer. Bitfinex blocks the
//!   caller for a fixed window, and every request sent inside it extends the
//!   block, so requests fail locally until the window has passed.

use super::bfx_errors::GatewayError;
use crate::types::OrderId;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, warn};

/// How long Bitfinex blocks a key after `ERR_RATE_LIMIT`
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

/// Backoff for order lookups
#[derive(Debug, Clone)]
pub struct ReadRetry {
    /// Total attempts, including the first one
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReadRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl ReadRetry {
    /// Pause before the next attempt, or `None` to give up.
    /// `attempt` is the 1-based number of the attempt that just failed.
    pub fn delay_after(&self, err: &GatewayError, attempt: u32) -> Option<Duration> {
        if attempt >= self.attempts || !err.is_retryable() {
            return None;
        }
        let shift = attempt.saturating_sub(1).min(16);
        Some(self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay))
    }

    /// Look up `order_id` with `fetch`, retrying transient network failures
    pub async fn fetch_order<T, F, Fut>(&self, order_id: OrderId, mut fetch: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match fetch().await {
                Ok(found) => return Ok(found),
                Err(err) => err,
            };

            match self.delay_after(&err, attempt) {
                Some(delay) => {
                    debug!(
                        "[Bitfinex] Lookup of order {} failed ({}), attempt {}/{}, retrying in {:?}",
                        order_id, err, attempt, self.attempts, delay
                    );
                    sleep(delay).await;
                }
                None => {
                    if err.is_retryable() {
                        warn!("[Bitfinex] Lookup of order {} gave up after {} attempts: {}", order_id, attempt, err);
                    }
                    return Err(err);
                }
            }
        }
    }
}

/// Local record of a Bitfinex rate-limit block
#[derive(Debug)]
pub struct RateLimitGate {
    origin: Instant,
    /// Milliseconds after `origin` until which requests are held back; 0 when open
    blocked_until_ms: AtomicU64,
}

impl Default for RateLimitGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitGate {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            blocked_until_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    /// Fail fast while a block is in force
    pub fn check(&self) -> Result<(), GatewayError> {
        let until = self.blocked_until_ms.load(Ordering::SeqCst);
        if until > self.now_ms() {
            return Err(GatewayError::RateLimited);
        }
        Ok(())
    }

    /// Start (or extend) a block of `window` from now
    pub fn trip(&self, window: Duration) {
        let until = self.now_ms().saturating_add(window.as_millis() as u64);
        let previous = self.blocked_until_ms.fetch_max(until, Ordering::SeqCst);
        if previous < until {
            warn!("[Bitfinex] Rate limited, holding requests for {:?}", window);
        }
    }

    /// Record the outcome of a request
    pub fn observe<T>(&self, result: &Result<T, GatewayError>, window: Duration) {
        if matches!(result, Err(GatewayError::RateLimited)) {
            self.trip(window);
        }
    }
}

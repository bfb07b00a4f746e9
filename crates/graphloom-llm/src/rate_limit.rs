//! Rate limiting for model providers
//!
//! Providers meter both requests per minute and tokens per minute, so each
//! [`AsyncRateLimiter`] carries two token buckets and an acquire only
//! completes once both can cover the requested amounts.
//!
//! ## Architecture
//!
//! - [`Bucket`]: classic continuous-refill token bucket (capacity refills
//!   over one minute, fractional tokens for smooth refill)
//! - [`AsyncRateLimiter`]: both buckets behind one async mutex; waiting
//!   callers compute the deficit-based wait time, sleep in bounded
//!   increments and re-check
//!
//! A bucket configured with zero capacity is disabled: it always satisfies
//! requests and is never deducted.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Shortest sleep between availability checks.
const MIN_WAIT: Duration = Duration::from_millis(50);

/// Longest single sleep; long waits re-check periodically so a refill is
/// never missed by more than this.
const MAX_WAIT: Duration = Duration::from_secs(5);

/// Continuous-refill token bucket.
#[derive(Debug)]
struct Bucket {
    /// Maximum tokens; also the per-minute budget. Zero disables the bucket.
    capacity: f64,
    /// Tokens added per second (`capacity / 60`).
    refill_per_s: f64,
    /// Currently available tokens (fractional).
    available: f64,
    /// Timestamp of the last refill calculation.
    last_refill: Instant,
}

impl Bucket {
    fn new(per_minute: u64, now: Instant) -> Self {
        let capacity = per_minute as f64;
        Self {
            capacity,
            refill_per_s: if capacity > 0.0 { capacity / 60.0 } else { 0.0 },
            available: capacity,
            last_refill: now,
        }
    }

    fn disabled(&self) -> bool {
        self.capacity <= 0.0
    }

    /// Advances the bucket to `now`, capping at capacity.
    fn refill(&mut self, now: Instant) {
        if self.disabled() {
            self.available = self.capacity;
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.available = (self.available + elapsed * self.refill_per_s).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// True when the bucket can cover `need` (disabled buckets always can).
    fn can_cover(&self, need: f64) -> bool {
        self.disabled() || self.available >= need
    }

    /// Seconds until `need` tokens will be available.
    fn wait_for(&self, need: f64) -> f64 {
        if self.disabled() || self.available >= need || self.refill_per_s <= 0.0 {
            return 0.0;
        }
        (need - self.available) / self.refill_per_s
    }
}

/// Dual token-bucket limiter: requests per minute and tokens per minute.
///
/// Shared per provider as `Arc<AsyncRateLimiter>`. Fairness beyond arrival
/// order is not attempted; waiters sleep and re-check, and traffic that fits
/// under the configured rate never starves.
#[derive(Debug)]
pub struct AsyncRateLimiter {
    inner: Mutex<(Bucket, Bucket)>,
}

impl AsyncRateLimiter {
    /// Creates a limiter with the given per-minute budgets. Zero disables
    /// the corresponding bucket; both zero makes `acquire` a no-op.
    pub fn new(rpm: u32, tpm: u32) -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new((Bucket::new(rpm as u64, now), Bucket::new(tpm as u64, now))),
        }
    }

    /// Blocks until both buckets can cover the requested amounts, then
    /// deducts them atomically.
    ///
    /// Requests larger than a bucket's capacity can never be covered by
    /// refill alone; they are satisfied once the bucket is full, so a single
    /// oversized batch degrades to "wait for a quiet minute" rather than
    /// deadlocking.
    pub async fn acquire(&self, requests: u32, tokens: u64) {
        let req_need = requests as f64;
        let tok_need = tokens as f64;

        loop {
            let wait = {
                let mut guard = self.inner.lock().await;
                let (req, tok) = &mut *guard;
                let now = Instant::now();
                req.refill(now);
                tok.refill(now);

                let req_need_eff = req_need.min(req.capacity.max(0.0));
                let tok_need_eff = tok_need.min(tok.capacity.max(0.0));

                if req.can_cover(req_need_eff) && tok.can_cover(tok_need_eff) {
                    if !req.disabled() {
                        req.available -= req_need_eff;
                    }
                    if !tok.disabled() {
                        tok.available -= tok_need_eff;
                    }
                    return;
                }

                req.wait_for(req_need_eff).max(tok.wait_for(tok_need_eff))
            };

            let sleep = Duration::from_secs_f64(wait)
                .max(MIN_WAIT)
                .min(MAX_WAIT);
            debug!(wait_ms = sleep.as_millis() as u64, "rate limit reached, waiting for refill");
            tokio::time::sleep(sleep).await;
        }
    }

    /// Current availability `(requests, tokens)` after refill.
    pub async fn available(&self) -> (f64, f64) {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        guard.0.refill(now);
        guard.1.refill(now);
        (guard.0.available, guard.1.available)
    }
}

//! Token-bucket admission gate for pipeline stages.
//!
//! Controls how many fresh (non-retry) items a stage dequeues per second.
//! Retried items bypass the gate entirely; their pacing comes from the
//! per-item backoff delay instead.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Token-bucket rate limiter.
///
/// Allows up to `burst` acquisitions instantaneously and refills at
/// `rate` tokens per second. `acquire` suspends the caller until a token
/// is available, so a stage worker simply awaits the gate before picking
/// up a new item.
pub struct AdmissionGate {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl AdmissionGate {
    /// Creates a gate admitting `rate` items per second with `burst`
    /// allowed instantaneously.
    ///
    /// Both values are clamped to at least 1 so a zero-configured stage
    /// still makes progress.
    pub fn new(rate: usize, burst: usize) -> Self {
        let burst = burst.max(1) as f64;
        Self {
            rate: rate.max(1) as f64,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Waits until a token is available and consumes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("admission gate lock poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }

                // Time until one full token accrues.
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// Consumes a token if one is available without waiting.
    ///
    /// Returns `false` when the bucket is empty.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("admission gate lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_is_available_immediately() {
        let gate = AdmissionGate::new(1, 3);

        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
    }

    #[tokio::test]
    async fn test_zero_config_is_clamped() {
        let gate = AdmissionGate::new(0, 0);
        assert!(gate.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_at_configured_rate() {
        let gate = AdmissionGate::new(2, 1);

        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());

        // 2 tokens/sec: after 500ms one token has accrued.
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let gate = AdmissionGate::new(10, 1);

        gate.acquire().await;

        let start = Instant::now();
        gate.acquire().await;
        let waited = start.elapsed();

        // 10 tokens/sec means roughly 100ms per token.
        assert!(waited >= Duration::from_millis(90), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(200), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_does_not_exceed_burst() {
        let gate = AdmissionGate::new(100, 2);

        tokio::time::advance(Duration::from_secs(60)).await;

        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
    }
}

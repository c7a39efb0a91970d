//! Process-local token bucket.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

/// Token bucket refilled at `rate` permits per second with burst capacity
/// equal to the rate. Waits are cancellable.
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_second: usize) -> Self {
        let rate = rate_per_second.max(1) as f64;
        Self {
            rate,
            capacity: rate,
            state: Mutex::new(BucketState {
                tokens: rate,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Take one permit, sleeping until the bucket refills. Returns
    /// `Cancelled` when the token fires first.
    pub async fn acquire(&self, cancellation: &CancellationToken) -> EngineResult<()> {
        loop {
            let wait = {
                let mut state = self.state.lock().expect("bucket poisoned");
                let now = Instant::now();
                let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
                state.refilled_at = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::select! {
                _ = cancellation.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_then_paced() {
        let limiter = RateLimiter::new(10);
        let cancellation = CancellationToken::new();

        // Burst drains the initial capacity without sleeping.
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire(&cancellation).await.unwrap();
        }
        assert_eq!(start.elapsed(), Duration::ZERO);

        // The next permit waits for a refill.
        limiter.acquire(&cancellation).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_honors_cancellation() {
        let limiter = RateLimiter::new(1);
        let cancellation = CancellationToken::new();
        limiter.acquire(&cancellation).await.unwrap();

        cancellation.cancel();
        let err = limiter.acquire(&cancellation).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}

//! Client-side token-bucket rate limiter
//!
//! Sits in front of every provider call, independent of any HTTP
//! middleware the provider applies. A caller that keeps hitting the bucket
//! empty accumulates violations; past the configured threshold the limiter
//! auto-blocks for a fixed window.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::config::RateLimitConfiguration;

use super::errors::{ProviderError, ProviderResult};

/// Extensibility hooks for rate-limit policy decisions
pub trait PolicyHooks: Send + Sync {
    /// Called when a caller has to wait for a token
    fn on_limit_wait(&self, _wait: Duration) {}

    /// Called once when the limiter auto-blocks
    fn on_auto_block(&self, _violations: u32) {}
}

/// Default hooks: do nothing
pub struct NoopHooks;

impl PolicyHooks for NoopHooks {}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    blocked_until: Option<Instant>,
}

/// Token-bucket limiter with violation tracking and auto-block
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    block_after_violations: u32,
    block_for: Duration,
    bucket: Mutex<Bucket>,
    violations: AtomicU32,
    hooks: Arc<dyn PolicyHooks>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfiguration) -> Self {
        Self::with_hooks(config, Arc::new(NoopHooks))
    }

    pub fn with_hooks(config: &RateLimitConfiguration, hooks: Arc<dyn PolicyHooks>) -> Self {
        Self {
            capacity: config.burst as f64,
            refill_per_sec: config.per_second,
            block_after_violations: config.block_after_violations,
            block_for: Duration::from_secs(config.block_seconds),
            bucket: Mutex::new(Bucket {
                tokens: config.burst as f64,
                last_refill: Instant::now(),
                blocked_until: None,
            }),
            violations: AtomicU32::new(0),
            hooks,
        }
    }

    /// Take one token, waiting for the refill if the bucket is empty.
    /// Returns `RateLimited` without waiting while an auto-block is active.
    pub async fn acquire(&self) -> ProviderResult<()> {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                let now = Instant::now();

                if let Some(until) = bucket.blocked_until {
                    if now < until {
                        return Err(ProviderError::RateLimited {
                            retry_after: Some((until - now).as_secs().max(1)),
                        });
                    }
                    bucket.blocked_until = None;
                    self.violations.store(0, Ordering::SeqCst);
                }

                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(());
                }

                let deficit = 1.0 - bucket.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };

            let violations = self.violations.fetch_add(1, Ordering::SeqCst) + 1;
            if violations > self.block_after_violations {
                let until = Instant::now() + self.block_for;
                self.bucket.lock().blocked_until = Some(until);
                self.hooks.on_auto_block(violations);
                warn!(
                    "provider rate limiter auto-blocked after {} violations",
                    violations
                );
                return Err(ProviderError::RateLimited {
                    retry_after: Some(self.block_for.as_secs()),
                });
            }

            self.hooks.on_limit_wait(wait);
            tokio::time::sleep(wait).await;
        }
    }

    /// Current violation count
    pub fn violations(&self) -> u32 {
        self.violations.load(Ordering::SeqCst)
    }

    /// Whether the limiter is currently auto-blocked
    pub fn is_blocked(&self) -> bool {
        self.bucket
            .lock()
            .blocked_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(burst: u32, per_second: f64, block_after: u32) -> RateLimitConfiguration {
        RateLimitConfiguration {
            burst,
            per_second,
            block_after_violations: block_after,
            block_seconds: 60,
        }
    }

    #[tokio::test]
    async fn test_burst_is_free() {
        let limiter = RateLimiter::new(&config(3, 1.0, 50));

        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }
        assert_eq!(limiter.violations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_bucket_waits_for_refill() {
        let limiter = RateLimiter::new(&config(1, 10.0, 50));

        limiter.acquire().await.unwrap();
        // The second acquire must wait ~100ms for a token; with the paused
        // clock the sleep resolves deterministically.
        limiter.acquire().await.unwrap();
        assert_eq!(limiter.violations(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_block_after_violations() {
        let limiter = RateLimiter::new(&config(1, 0.5, 2));
        limiter.acquire().await.unwrap();

        // Each empty-bucket wait counts one violation; the third trips the block
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        let result = limiter.acquire().await;

        assert!(matches!(
            result,
            Err(ProviderError::RateLimited { retry_after: Some(_) })
        ));
        assert!(limiter.is_blocked());
    }
}

//! Bounded polling
//!
//! Every wait in a node run (API readiness, overlay readiness, credential
//! availability) goes through [`retry_until`]: a fixed attempt budget, a sleep
//! between attempts, and a permanent failure once the budget is spent.
//! Intervals are fixed unless a backoff multiplier or jitter is configured.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::common::config::{PollSettings, RetrySettings};
use crate::common::{Error, Result};

/// Retry policy for one polling site
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up (the first try counts)
    pub max_attempts: u32,
    /// Sleep after the first failed attempt
    pub interval: Duration,
    /// Growth factor applied to the interval after each attempt (1.0 = fixed)
    pub backoff_multiplier: f64,
    /// Upper bound for a grown interval
    pub max_interval: Duration,
    /// Scale each sleep by a random factor in 0.5..1.5
    pub jitter: bool,
}

impl RetryPolicy {
    /// Fixed interval, no backoff, no jitter
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            backoff_multiplier: 1.0,
            max_interval: interval,
            jitter: false,
        }
    }

    /// Policy for a configured polling site, honoring global backoff/jitter
    pub fn from_settings(poll: &PollSettings, global: &RetrySettings) -> Self {
        Self::fixed(poll.max_attempts, poll.interval)
            .with_backoff(global.backoff_multiplier, poll.interval * 8)
            .with_jitter(global.jitter)
    }

    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sleep before attempt `attempt + 1`, given `attempt` already failed (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let grown = self.interval.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1).min(64) as i32);
        let capped = if self.backoff_multiplier > 1.0 {
            grown.min(self.max_interval.as_secs_f64())
        } else {
            grown
        };
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..1.5)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }

    /// Upper bound of the total wait, ignoring jitter
    pub fn budget(&self) -> Duration {
        (1..self.max_attempts.max(1)).map(|a| self.delay_after_nominal(a)).sum()
    }

    fn delay_after_nominal(&self, attempt: u32) -> Duration {
        Self {
            jitter: false,
            ..self.clone()
        }
        .delay_after(attempt)
    }
}

/// Outcome of one probe
#[derive(Debug)]
pub enum Attempt<T> {
    /// Condition met, stop polling
    Ready(T),
    /// Not yet; the reason is logged
    NotReady(String),
}

impl<T> From<Result<T>> for Attempt<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(v) => Attempt::Ready(v),
            Err(e) => Attempt::NotReady(e.to_string()),
        }
    }
}

/// Poll `probe` until it reports ready or the attempt budget is spent.
///
/// `probe` receives the 1-based attempt number. No sleep follows the final
/// attempt. Exhaustion yields [`Error::RetriesExhausted`].
pub async fn retry_until<F, Fut, T>(policy: &RetryPolicy, operation: &str, mut probe: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    for attempt in 1..=policy.max_attempts {
        match probe(attempt).await {
            Attempt::Ready(value) => {
                debug!(
                    operation = %operation,
                    attempt = %format!("{}/{}", attempt, policy.max_attempts),
                    "Condition met"
                );
                return Ok(value);
            }
            Attempt::NotReady(reason) => {
                if attempt == policy.max_attempts {
                    warn!(
                        operation = %operation,
                        attempt = %format!("{}/{}", attempt, policy.max_attempts),
                        reason = %reason,
                        "Not ready, attempts exhausted"
                    );
                    break;
                }

                let delay = policy.delay_after(attempt);
                warn!(
                    operation = %operation,
                    attempt = %format!("{}/{}", attempt, policy.max_attempts),
                    reason = %reason,
                    delay_ms = delay.as_millis() as u64,
                    "Not ready, retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(Error::RetriesExhausted {
        operation: operation.to_string(),
        attempts: policy.max_attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let result = retry_until(&policy, "op", |_| async { Attempt::Ready(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_exhausts_exactly_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let policy = RetryPolicy::fixed(5, Duration::ZERO);

        let result: Result<()> = retry_until(&policy, "op", |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Attempt::NotReady("never".into())
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::RetriesExhausted { attempts: 5, .. })
        ));
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_stops_at_first_success() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let policy = RetryPolicy::fixed(5, Duration::ZERO);

        let result = retry_until(&policy, "op", |attempt| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                if attempt == 3 {
                    Attempt::Ready(attempt)
                } else {
                    Attempt::NotReady("pending".into())
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_interval_timing() {
        let policy = RetryPolicy::fixed(4, Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        let result: Result<()> =
            retry_until(&policy, "op", |_| async { Attempt::NotReady("no".into()) }).await;
        assert!(result.is_err());
        // three sleeps between four attempts
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::fixed(10, Duration::from_secs(1))
            .with_backoff(2.0, Duration::from_secs(5));
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::fixed(3, Duration::from_secs(10)).with_jitter(true);
        for _ in 0..50 {
            let d = policy.delay_after(1);
            assert!(d >= Duration::from_secs(5) && d < Duration::from_secs(15));
        }
    }

    #[test]
    fn test_budget() {
        assert_eq!(
            RetryPolicy::fixed(24, Duration::from_secs(5)).budget(),
            Duration::from_secs(115)
        );
        assert_eq!(RetryPolicy::fixed(1, Duration::from_secs(5)).budget(), Duration::ZERO);
    }

    #[test]
    fn test_attempt_from_result() {
        assert!(matches!(Attempt::from(Ok::<_, Error>(1)), Attempt::Ready(1)));
        assert!(matches!(
            Attempt::<()>::from(Err(Error::Channel("down".into()))),
            Attempt::NotReady(_)
        ));
    }
}

//! Centralized retry policy.
//!
//! All retry and backoff decisions live here; fetchers and schedulers ask
//! the policy for a delay instead of sleeping on their own. Each
//! [`ErrorKind`] gets its own treatment:
//!
//! - `IpBlocked`: long randomized cool-down, the address needs to go cold
//! - `FrequencyLimited`: short randomized wait, honoring a larger
//!   platform-provided `Retry-After`
//! - `TransientNetwork`: capped exponential backoff with jitter
//! - `Unclassified`: exactly one retry after the base delay
//! - `AuthInvalid` and `NotFound`: never retried

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{CrawlError, ErrorKind};

/// Retry budget and wait ranges for one crawl.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per logical request, first try included.
    pub max_attempts: u32,
    /// Randomized wait window after an IP block.
    pub ip_block_wait: (Duration, Duration),
    /// Randomized wait window after a rate limit.
    pub frequency_wait: (Duration, Duration),
    /// First transient-network backoff step; doubles per attempt.
    pub base_backoff: Duration,
    /// Upper bound for the transient-network backoff before jitter.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            ip_block_wait: (Duration::from_secs(30), Duration::from_secs(180)),
            frequency_wait: (Duration::from_secs(10), Duration::from_secs(30)),
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Computes the wait before attempt `attempt + 1`, or `None` when the
    /// error must not be retried. `attempt` is zero-based: the value for
    /// the try that just failed.
    #[must_use]
    pub fn delay_for(&self, error: &CrawlError, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        match error.kind() {
            ErrorKind::AuthInvalid | ErrorKind::NotFound => None,
            ErrorKind::IpBlocked => Some(random_in(self.ip_block_wait)),
            ErrorKind::FrequencyLimited => {
                let wait = random_in(self.frequency_wait);
                // The platform's own figure wins when it asks for more.
                match error.retry_after() {
                    Some(hinted) if hinted > wait => Some(hinted),
                    _ => Some(wait),
                }
            }
            ErrorKind::TransientNetwork => Some(self.backoff_step(attempt)),
            ErrorKind::Unclassified => (attempt == 0).then_some(self.base_backoff),
        }
    }

    /// Exponential step with up to 50% additive jitter, capped before the
    /// jitter is applied.
    fn backoff_step(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        let jitter = exp.mul_f64(rand::thread_rng().gen_range(0.0..=0.5));
        exp + jitter
    }

    /// Drives `op` under this policy. `op` receives the zero-based attempt
    /// number; signing is expected to happen inside it so every retry
    /// carries a fresh signature.
    ///
    /// # Errors
    ///
    /// The last error once the policy declines a further retry.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, CrawlError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CrawlError>>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => match self.delay_for(&error, attempt) {
                    Some(delay) => {
                        warn!(
                            %label,
                            attempt,
                            kind = %error.kind().as_str(),
                            wait_ms = delay.as_millis(),
                            "retrying after error: {error}"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(error),
                },
            }
        }
    }
}

fn random_in((low, high): (Duration, Duration)) -> Duration {
    if high <= low {
        return low;
    }
    let span = high - low;
    low + span.mul_f64(rand::thread_rng().r#gen::<f64>())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::SigningError;
    use crate::platform::Platform;

    fn platform_error(kind: ErrorKind) -> CrawlError {
        CrawlError::platform(Platform::Xhs, kind, 0, "test")
    }

    #[test]
    fn test_abort_kinds_never_retry() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(&platform_error(ErrorKind::NotFound), 0), None);
        let auth = CrawlError::from(SigningError::missing(Platform::Xhs, "x-s"));
        assert_eq!(policy.delay_for(&auth, 0), None);
    }

    #[test]
    fn test_unclassified_retries_exactly_once() {
        let policy = RetryPolicy::default();
        let error = platform_error(ErrorKind::Unclassified);
        assert!(policy.delay_for(&error, 0).is_some());
        assert_eq!(policy.delay_for(&error, 1), None);
    }

    #[test]
    fn test_ip_block_wait_stays_in_window() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let delay = policy
                .delay_for(&platform_error(ErrorKind::IpBlocked), 0)
                .unwrap();
            assert!(delay >= Duration::from_secs(30));
            assert!(delay <= Duration::from_secs(180));
        }
    }

    #[test]
    fn test_frequency_limit_honors_larger_retry_after() {
        let policy = RetryPolicy::default();
        let error = platform_error(ErrorKind::FrequencyLimited)
            .with_retry_after(Duration::from_secs(600));
        let delay = policy.delay_for(&error, 0).unwrap();
        assert_eq!(delay, Duration::from_secs(600));

        // A smaller platform figure never shrinks the local window.
        let error = platform_error(ErrorKind::FrequencyLimited)
            .with_retry_after(Duration::from_secs(1));
        let delay = policy.delay_for(&error, 0).unwrap();
        assert!(delay >= Duration::from_secs(10));
    }

    #[test]
    fn test_transient_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 20,
            ..RetryPolicy::default()
        };
        let error = platform_error(ErrorKind::TransientNetwork);
        let early = policy.delay_for(&error, 0).unwrap();
        assert!(early >= Duration::from_secs(1));
        assert!(early <= Duration::from_millis(1500));

        let late = policy.delay_for(&error, 10).unwrap();
        // Capped at 60s plus at most 50% jitter.
        assert!(late >= Duration::from_secs(60));
        assert!(late <= Duration::from_secs(90));
    }

    #[test]
    fn test_budget_exhaustion_stops_all_kinds() {
        let policy = RetryPolicy {
            max_attempts: 2,
            ..RetryPolicy::default()
        };
        let error = platform_error(ErrorKind::IpBlocked);
        assert!(policy.delay_for(&error, 0).is_some());
        assert_eq!(policy.delay_for(&error, 1), None);
    }

    #[tokio::test]
    async fn test_run_resigns_each_attempt() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            ..RetryPolicy::default()
        };
        let mut seen = Vec::new();
        let result = policy
            .run("test-op", |attempt| {
                seen.push(attempt);
                async move {
                    if attempt < 2 {
                        Err(CrawlError::platform(
                            Platform::Douyin,
                            ErrorKind::TransientNetwork,
                            0,
                            "flaky",
                        ))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(seen, vec![0, 1, 2]);
    }
}

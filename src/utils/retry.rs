use std::future::Future;
use std::time::Duration;

/// Exponential backoff schedule: `initial_delay * factor^attempt` before the
/// next try.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub factor: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy {
            initial_delay: Duration::from_secs(1),
            factor: 2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial_delay * self.factor.saturating_pow(attempt)
    }
}

/// Runs `operation` up to `max_attempts` times, sleeping per `policy` between
/// failures. The last error is returned once attempts are exhausted.
pub async fn with_retry<T, E, F, Fut>(
    max_attempts: u32,
    policy: BackoffPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(err);
                }
                log::error!(
                    "Attempt {}/{} failed: {}, retrying",
                    attempt,
                    max_attempts,
                    err
                );
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_grows_exponentially() {
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(100),
            factor: 2,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(1),
            factor: 2,
        };

        let result: Result<u32, String> = with_retry(3, policy, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err("transient".to_string())
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = BackoffPolicy {
            initial_delay: Duration::from_millis(1),
            factor: 2,
        };

        let result: Result<(), String> = with_retry(3, policy, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("permanent".to_string()) }
        })
        .await;

        assert_eq!(result, Err("permanent".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}

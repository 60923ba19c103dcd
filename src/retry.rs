// src/retry.rs - Two-layer retry: a single-call deadline guard and a
// bounded repeat-with-backoff driver around a stage.
//
// The layers are deliberately separate. RetryPolicy bounds one logical
// external call and never repeats it (its retry count is fixed at zero);
// deciding whether to repeat a stage belongs to `retry_stage`.

use crate::error::PipelineError;
use crate::types::Provider;
use std::future::Future;
use std::time::Duration;

/// Deadline guard around one logical external call.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    deadline: Duration,
    max_retries: u32,
}

/// Default overall deadline for one provider call.
pub const DEFAULT_CALL_DEADLINE_SECS: u64 = 500;

impl RetryPolicy {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            max_retries: 0,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run the call under the deadline. Expiry is classified as a timeout
    /// (`PollTimeout`); every other error re-raises unchanged.
    pub async fn run<T, F>(&self, provider: Provider, fut: F) -> Result<T, PipelineError>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    "{} call timed out after {}s",
                    provider,
                    self.deadline.as_secs()
                );
                Err(PipelineError::PollTimeout {
                    provider,
                    elapsed_secs: self.deadline.as_secs(),
                })
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_CALL_DEADLINE_SECS))
    }
}

/// Attempts per retryable stage (generation, video assembly).
pub const STAGE_MAX_ATTEMPTS: u32 = 3;

/// Delay before re-running a stage after its `attempt`-th failure
/// (0-based): 2^attempt seconds.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1u64 << attempt)
}

/// Repeat a stage up to `STAGE_MAX_ATTEMPTS` times with exponential
/// backoff, re-raising the last error on exhaustion. Each attempt is a
/// fresh submission; there is no resume.
pub async fn retry_stage<T, F, Fut>(label: &str, mut operation: F) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < STAGE_MAX_ATTEMPTS => {
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    "{} failed on attempt {}/{}: {}. Retrying in {}s",
                    label,
                    attempt + 1,
                    STAGE_MAX_ATTEMPTS,
                    e,
                    delay.as_secs()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "{} failed after {} attempts: {}",
                    label,
                    STAGE_MAX_ATTEMPTS,
                    e
                );
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_backoff_delay_sequence() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stage_succeeds_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let started = Instant::now();

        let result = retry_stage("test stage", move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(PipelineError::Validation("transient".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Backoff delays between attempts: 1s then 2s.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stage_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), _> = retry_stage("test stage", move || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(PipelineError::Validation(format!("attempt {}", n)))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), STAGE_MAX_ATTEMPTS);
        match result {
            Err(PipelineError::Validation(msg)) => assert_eq!(msg, "attempt 2"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_policy_classifies_deadline_as_timeout() {
        let policy = RetryPolicy::new(Duration::from_secs(5));
        assert_eq!(policy.max_retries(), 0);

        let result: Result<(), _> = policy
            .run(Provider::Flux, async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        match result {
            Err(PipelineError::PollTimeout {
                provider,
                elapsed_secs,
            }) => {
                assert_eq!(provider, Provider::Flux);
                assert_eq!(elapsed_secs, 5);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_policy_reraises_inner_error() {
        let policy = RetryPolicy::default();
        let result: Result<(), _> = policy
            .run(Provider::GptImage, async {
                Err(PipelineError::Validation("bad prompt".into()))
            })
            .await;
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }
}

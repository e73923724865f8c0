//! Deadline and retry handling for external capability calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryPolicy;
use crate::error::{Capability, CapabilityError};
use crate::generator::{GenerationError, Generator};

/// How one capability is called: a deadline per attempt and a retry bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl CallPolicy {
    /// Single attempt with the given deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            retry: RetryPolicy {
                max_attempts: 1,
                ..RetryPolicy::default()
            },
        }
    }
}

/// Run `op` under `policy`.
///
/// Each attempt is bounded by `policy.timeout`. Transient failures are retried
/// up to `policy.retry.max_attempts` total attempts with exponential backoff;
/// anything else is returned immediately.
pub async fn call<T, E, F, Fut>(
    capability: Capability,
    policy: &CallPolicy,
    mut op: F,
) -> Result<T, CapabilityError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<CapabilityError>,
{
    let attempts = policy.retry.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        let error = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.into(),
            Err(_) => CapabilityError::Timeout {
                capability,
                after: policy.timeout,
            },
        };

        if attempt >= attempts || !error.is_transient() {
            return Err(error);
        }

        attempt += 1;
        let delay = policy.retry.backoff(attempt);
        warn!(%capability, attempt, ?delay, "retrying after transient error: {error}");
        tokio::time::sleep(delay).await;
    }
}

/// Ask `generator` for a completion, treating blank output as an error.
pub async fn generate_text(
    generator: &Arc<dyn Generator>,
    prompt: String,
    policy: &CallPolicy,
) -> Result<String, CapabilityError> {
    let text = call(Capability::Generator, policy, || {
        let generator = Arc::clone(generator);
        let prompt = prompt.clone();
        async move { generator.generate(&prompt).await }
    })
    .await?;

    let text = text.trim();
    if text.is_empty() {
        return Err(GenerationError::EmptyResponse.into());
    }
    debug!(generator = generator.name(), "generation returned {} chars", text.len());
    Ok(text.to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use pretty_assertions::assert_eq;

    fn policy(max_attempts: u32) -> CallPolicy {
        CallPolicy {
            timeout: Duration::from_millis(50),
            retry: RetryPolicy {
                max_attempts,
                initial_backoff_ms: 1,
            },
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let err = call(Capability::Generator, &policy(1), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, GenerationError>("late")
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            CapabilityError::Timeout {
                capability: Capability::Generator,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_within_bound() {
        let calls = AtomicU32::new(0);
        let result = call(Capability::Generator, &policy(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(GenerationError::RateLimited)
                } else {
                    Ok("ok")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_stop_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = call(Capability::Generator, &policy(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(GenerationError::RateLimited) }
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            CapabilityError::Generation(GenerationError::RateLimited)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let _ = call(Capability::Generator, &policy(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(GenerationError::Api {
                    code: 400,
                    message: "bad request".into(),
                })
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    struct Blank;

    #[async_trait]
    impl Generator for Blank {
        fn name(&self) -> &str {
            "blank"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            Ok("  \n ".to_string())
        }
    }

    #[tokio::test]
    async fn test_blank_generation_is_an_error() {
        let generator: Arc<dyn Generator> = Arc::new(Blank);
        let err = generate_text(&generator, "p".into(), &policy(1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CapabilityError::Generation(GenerationError::EmptyResponse)
        ));
    }
}

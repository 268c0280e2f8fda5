use crate::backend::{LlmBackend, ModelRequest, ModelResponse};
use async_trait::async_trait;
use crewgraph_core::{CrewError, CrewResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(u64) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send + Sync,
>;

/// Configures retry behaviour for failover across model backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retries per backend before moving to the next one.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
        }
    }
}

/// Determines whether an error is transient and worth retrying.
///
/// Rate limits (429), server errors (5xx), timeouts and dropped connections
/// are retried. A 400 never is. Cancellation is never retried.
pub fn is_retryable(err: &CrewError) -> bool {
    if err.is_cancelled() {
        return false;
    }
    let lower = err.to_string().to_lowercase();

    if lower.contains("400") {
        return false;
    }

    lower.contains("429")
        || lower.contains("5xx")
        || lower.contains("500")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("504")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("temporarily")
}

/// Exponential backoff for `attempt`, capped at `backoff_max_ms`.
fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

/// An `LlmBackend` that wraps several backends and fails over between them.
///
/// Backends are tried in order. Transient errors are retried on the same
/// backend up to `max_retries` times with backoff; a non-retryable error or
/// exhausted retries moves on to the next backend. If every backend fails the
/// last error is returned.
pub struct FailoverBackend {
    backends: Vec<Arc<dyn LlmBackend>>,
    policy: RetryPolicy,
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl FailoverBackend {
    pub fn new(backends: Vec<Arc<dyn LlmBackend>>, policy: RetryPolicy) -> CrewResult<Self> {
        if backends.is_empty() {
            return Err(CrewError::Config(
                "FailoverBackend requires at least one backend".into(),
            ));
        }
        Ok(Self {
            backends,
            policy,
            #[cfg(test)]
            sleep_fn: None,
        })
    }

    async fn do_sleep(&self, ms: u64) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(ms).await;
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

#[async_trait]
impl LlmBackend for FailoverBackend {
    async fn invoke(&self, request: &ModelRequest) -> CrewResult<ModelResponse> {
        let mut last_err: Option<CrewError> = None;

        for (backend_idx, backend) in self.backends.iter().enumerate() {
            for attempt in 0..=self.policy.max_retries {
                match backend.invoke(request).await {
                    Ok(resp) => return Ok(resp),
                    Err(e) => {
                        if e.is_cancelled() {
                            return Err(e);
                        }
                        if !is_retryable(&e) {
                            warn!(
                                node = %request.node,
                                backend = backend.name(),
                                backend_idx,
                                attempt,
                                error = %e,
                                "Non-retryable error, moving to next backend"
                            );
                            last_err = Some(e);
                            break;
                        }

                        if attempt < self.policy.max_retries {
                            let delay = compute_backoff(&self.policy, attempt);
                            info!(
                                node = %request.node,
                                backend = backend.name(),
                                backend_idx,
                                attempt,
                                delay_ms = delay,
                                error = %e,
                                "Retryable error, backing off"
                            );
                            self.do_sleep(delay).await;
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| CrewError::Backend("All failover backends exhausted".into())))
    }

    fn name(&self) -> &str {
        "failover"
    }
}

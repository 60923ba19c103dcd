// src/job_client.rs - Uniform submit/poll contract over the generation
// providers, plus the generic poll-to-completion driver.
use crate::error::PipelineError;
use crate::types::{JobHandle, JobStatus, Provider};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::time::Instant;

/// Fixed polling interval. Remote job latency, not congestion, dominates,
/// so the loop does not back off.
pub const POLL_INTERVAL_SECS: u64 = 10;

/// One generation request: a prompt, reference image URLs, and caller
/// overrides layered over the provider's defaults (caller key wins when
/// present and valid).
#[derive(Debug, Clone, Default)]
pub struct JobRequest {
    pub prompt: String,
    pub image_urls: Vec<String>,
    pub overrides: Map<String, Value>,
}

impl JobRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            image_urls: Vec::new(),
            overrides: Map::new(),
        }
    }

    pub fn with_image_urls(mut self, urls: Vec<String>) -> Self {
        self.image_urls = urls;
        self
    }

    pub fn with_override(mut self, key: &str, value: Value) -> Self {
        self.overrides.insert(key.to_string(), value);
        self
    }
}

/// Capability contract for one remote generation provider.
#[async_trait]
pub trait JobClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Whether submit alone returns a terminal result inline.
    fn is_sync(&self) -> bool {
        false
    }

    /// Provider SLA for polling, in seconds. Not tunable by callers.
    fn max_poll_secs(&self) -> u64;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(POLL_INTERVAL_SECS)
    }

    /// Validate and submit the request, returning a handle. Synchronous
    /// providers return an already-terminal handle.
    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, PipelineError>;

    /// Advance the handle's status by one remote status check.
    async fn poll(&self, handle: &JobHandle) -> Result<JobHandle, PipelineError>;
}

/// Drive a submitted job to a terminal state: sleep the fixed interval,
/// check status, repeat until success, error, or the provider's poll
/// budget is exhausted.
pub async fn poll_to_completion(
    client: &dyn JobClient,
    handle: JobHandle,
) -> Result<JobHandle, PipelineError> {
    let provider = client.provider();
    let budget = Duration::from_secs(client.max_poll_secs());
    let started = Instant::now();
    let mut current = handle;

    loop {
        if started.elapsed() > budget {
            tracing::error!("Polling timeout for {} job {}", provider, current.id);
            return Err(PipelineError::PollTimeout {
                provider,
                elapsed_secs: started.elapsed().as_secs(),
            });
        }

        tokio::time::sleep(client.poll_interval()).await;
        current = client.poll(&current).await?;
        tracing::info!("{} job {} status: {:?}", provider, current.id, current.status);

        match current.status {
            JobStatus::Succeeded => {
                if current.result_ref.as_deref().unwrap_or("").is_empty() {
                    return Err(PipelineError::ProviderJob {
                        provider,
                        message: format!("job {} completed with empty result", current.id),
                    });
                }
                return Ok(current);
            }
            JobStatus::Failed | JobStatus::TimedOut => {
                return Err(PipelineError::ProviderJob {
                    provider,
                    message: current
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "Unknown error".to_string()),
                });
            }
            JobStatus::Pending => continue,
        }
    }
}

/// Submit and drive to completion, returning the result reference. For
/// synchronous providers the submit response already carries it.
pub async fn generate(
    client: &dyn JobClient,
    request: &JobRequest,
) -> Result<String, PipelineError> {
    let handle = client.submit(request).await?;

    let terminal = if handle.status.is_terminal() {
        handle
    } else {
        poll_to_completion(client, handle).await?
    };

    terminal
        .result_ref
        .filter(|r| !r.is_empty())
        .ok_or_else(|| PipelineError::ProviderJob {
            provider: client.provider(),
            message: "terminal job carries no result reference".to_string(),
        })
}

// src/error.rs - Error taxonomy for the generation pipeline
use crate::types::Provider;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Bad input, detected before any network call.
    #[error("validation error: {0}")]
    Validation(String),

    /// Non-200 response or a well-formed 200 missing a required field.
    #[error("{provider} request failed ({status}): {message}")]
    ProviderRequest {
        provider: Provider,
        status: u16,
        message: String,
    },

    /// The remote job reached a terminal failure state.
    #[error("{provider} job failed: {message}")]
    ProviderJob { provider: Provider, message: String },

    /// The polling budget for a job was exhausted before a terminal status.
    #[error("polling timeout for {provider} after {elapsed_secs}s")]
    PollTimeout {
        provider: Provider,
        elapsed_secs: u64,
    },

    /// An artifact fetch failed or produced empty content.
    #[error("download failed: {0}")]
    Download(String),

    /// Fewer than two usable frames survived to video assembly.
    #[error("insufficient frames for video assembly: found {found}, need at least 2")]
    InsufficientFrames { found: usize },

    /// Token acquisition or parsing failed.
    #[error("auth error: {0}")]
    Auth(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// ProviderRequest for a 200 response that is missing a required field.
    pub fn malformed(provider: Provider, message: impl Into<String>) -> Self {
        PipelineError::ProviderRequest {
            provider,
            status: 200,
            message: message.into(),
        }
    }
}

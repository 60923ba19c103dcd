// lib.rs - Main library file that exports all modules
pub mod artifacts;
pub mod error;
pub mod flux_client;
pub mod gen_api;
pub mod gpt_image_client;
pub mod job_client;
pub mod kling_client;
pub mod pika_client;
pub mod pipeline;
pub mod plan;
pub mod retry;
pub mod types;

// Re-export commonly used types for convenience
pub use artifacts::{ArtifactStore, HttpFetcher, RemoteFetcher};
pub use error::PipelineError;
pub use flux_client::{FluxClient, FluxParams};
pub use gpt_image_client::{GptImageClient, GptImageParams};
pub use job_client::{generate, JobClient, JobRequest};
pub use kling_client::{KlingClient, KlingParams};
pub use pika_client::{PikaClient, StaticTokenSession, VideoAssembler, VideoAssemblyRequest};
pub use pipeline::PipelineOrchestrator;
pub use plan::{FallbackPlanner, PipelinePlan, ScenePlanner};
pub use retry::{retry_stage, RetryPolicy};
pub use types::*;

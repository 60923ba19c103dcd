// main.rs - CLI entrypoint: wires the providers together and drives one
// pipeline run.
use std::sync::Arc;

mod artifacts;
mod error;
mod flux_client;
mod gen_api;
mod gpt_image_client;
mod job_client;
mod kling_client;
mod pika_client;
mod pipeline;
mod plan;
mod retry;
mod types;

use artifacts::{ArtifactStore, HttpFetcher};
use flux_client::FluxClient;
use gpt_image_client::GptImageClient;
use pika_client::{PikaClient, StaticTokenSession};
use pipeline::PipelineOrchestrator;
use plan::FallbackPlanner;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_logging().expect("Failed to initialize logging");

    let mut args = std::env::args().skip(1);
    let (run_id, query) = match (args.next(), args.next()) {
        (Some(run_id), Some(query)) => (run_id, query),
        _ => {
            eprintln!("Usage: photoreel <run_id> <query> [photo_url...]");
            std::process::exit(2);
        }
    };
    let photo_urls: Vec<String> = args.collect();

    let api_key = match std::env::var("GENAPI_API_KEY") {
        Ok(key) if !key.is_empty() => key,
        _ => {
            tracing::error!("GENAPI_API_KEY is not set");
            std::process::exit(2);
        }
    };
    let pika_token = std::env::var("PIKA_SESSION_TOKEN").unwrap_or_default();
    let artifact_dir = std::env::var("ARTIFACT_DIR").unwrap_or_else(|_| "temp".to_string());

    let store = match ArtifactStore::new(&artifact_dir).await {
        Ok(store) => {
            tracing::info!("Artifact directory ready: {}", artifact_dir);
            store
        }
        Err(e) => {
            tracing::error!("Failed to create artifact directory {}: {}", artifact_dir, e);
            std::process::exit(1);
        }
    };

    let orchestrator = PipelineOrchestrator::new(
        Arc::new(FallbackPlanner),
        Arc::new(GptImageClient::new(api_key.clone())),
        Arc::new(FluxClient::new(api_key)),
        Arc::new(PikaClient::new(Box::new(StaticTokenSession::new(
            pika_token,
        )))),
        Arc::new(HttpFetcher::new()),
        store,
    );

    tracing::info!("Starting pipeline run {} for query: {}", run_id, query);
    match orchestrator.run(&run_id, &query, &photo_urls).await {
        Ok(run) => {
            let video = run
                .video_ref
                .map(|v| v.file_name())
                .unwrap_or_else(|| "<none>".to_string());
            tracing::info!("Run {} completed, video: {}", run.run_id, video);
        }
        Err(e) => {
            tracing::error!("Run {} failed: {}", run_id, e);
            std::process::exit(1);
        }
    }
}

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Get log level from environment or default to INFO for production
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug,photoreel=trace,reqwest=info,hyper=info".to_string()
        } else {
            "info,photoreel=info,reqwest=warn,hyper=warn".to_string()
        }
    });

    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    // Configure structured logging for production
    let fmt_layer = if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        // JSON logging for production (easier for log aggregation)
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    } else {
        // Human-readable logging for development
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_file(true)
            .with_line_number(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();

    tracing::info!("Logging initialized");
    Ok(())
}

// src/pika_client.rs - Pika frame-transition video assembly. The API is
// driven synchronously (blocking reqwest) and callers run it on a
// blocking thread.
use crate::error::PipelineError;
use crate::types::Provider;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

const GENERATE_URL: &str = "https://api.pika.art/generate/v2";
const LIBRARY_URL: &str = "https://pika.art/library";
/// Server-action id the library page expects for status lookups.
const LIBRARY_NEXT_ACTION: &str = "a4f7d00566d7755f69cb53e2b2bbaf32236f107e";

const MAX_POLL_ATTEMPTS: u32 = 30;
const POLL_INTERVAL_SECS: u64 = 10;
/// Consecutive empty library responses tolerated before assuming the
/// session expired and re-acquiring the token.
const EMPTY_POLLS_BEFORE_REAUTH: u32 = 2;

/// Source of the `sb-login-auth-token` session cookie.
pub trait AuthSession: Send + Sync {
    fn acquire_token(&self) -> Result<String, PipelineError>;
}

/// Session backed by a pre-obtained cookie value (e.g. from the
/// environment).
pub struct StaticTokenSession {
    token: String,
}

impl StaticTokenSession {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

impl AuthSession for StaticTokenSession {
    fn acquire_token(&self) -> Result<String, PipelineError> {
        if self.token.is_empty() {
            return Err(PipelineError::Auth("session token is empty".to_string()));
        }
        Ok(self.token.clone())
    }
}

/// One assembly job: ordered frames, per-transition durations and
/// prompts, and where to put the finished video.
#[derive(Debug, Clone)]
pub struct VideoAssemblyRequest {
    pub frame_paths: Vec<PathBuf>,
    pub frame_durations: Vec<u32>,
    pub transition_prompts: Vec<String>,
    pub output_path: PathBuf,
    pub loop_video: bool,
}

/// Blocking seam for the final assembly stage.
pub trait VideoAssembler: Send + Sync {
    fn assemble(&self, request: &VideoAssemblyRequest) -> Result<PathBuf, PipelineError>;
}

pub struct PikaClient {
    session: Box<dyn AuthSession>,
    options: Value,
    library_url: String,
}

impl PikaClient {
    pub fn new(session: Box<dyn AuthSession>) -> Self {
        Self {
            session,
            options: default_options(),
            library_url: LIBRARY_URL.to_string(),
        }
    }

    /// Extract (access_token, user_id) from the session cookie. The
    /// cookie's first dot-separated segment is base64-encoded JSON.
    pub fn parse_token(cookie: &str) -> Result<(String, String), PipelineError> {
        if cookie.is_empty() {
            return Err(PipelineError::Auth("cookie is empty".to_string()));
        }
        let stripped = cookie.strip_prefix("base64-").unwrap_or(cookie);
        let segment = stripped.split('.').next().unwrap_or("");
        let raw = STANDARD_NO_PAD
            .decode(segment.trim_end_matches('='))
            .map_err(|e| PipelineError::Auth(format!("failed to decode session cookie: {}", e)))?;
        let decoded: Value = serde_json::from_slice(&raw)
            .map_err(|e| PipelineError::Auth(format!("malformed session cookie: {}", e)))?;

        let access_token = decoded
            .get("access_token")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let user_id = decoded
            .pointer("/user/id")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if access_token.is_empty() || user_id.is_empty() {
            return Err(PipelineError::Auth(
                "session cookie carries no access token or user id".to_string(),
            ));
        }
        Ok((access_token, user_id))
    }

    /// Submit the multipart generation request, returning the video id.
    fn generate_video(
        &self,
        http: &Client,
        access_token: &str,
        user_id: &str,
        request: &VideoAssemblyRequest,
    ) -> Result<String, PipelineError> {
        let mut form = Form::new()
            .text(
                "frameDurations",
                serde_json::to_string(&request.frame_durations)?,
            )
            .text(
                "transitionPrompts",
                serde_json::to_string(&request.transition_prompts)?,
            )
            .text("resolution", "1080p")
            .text("contentType", "i2v")
            .text("loop", if request.loop_video { "true" } else { "false" })
            .text("model", "2.2")
            .text("options", serde_json::to_string(&self.options)?)
            .text("userId", user_id.to_string());

        for (i, path) in request.frame_paths.iter().enumerate() {
            form = form.part(format!("frame-{}", i + 1), image_part(path)?);
        }
        // The first frame doubles as the request's cover image.
        if let Some(first) = request.frame_paths.first() {
            form = form.part("image", image_part(first)?);
        }

        let response = http
            .post(GENERATE_URL)
            .header("Authorization", format!("Bearer {}", access_token))
            .multipart(form)
            .send()?;
        let data: Value = response.json()?;

        if !data.get("success").and_then(Value::as_bool).unwrap_or(false) {
            tracing::error!("Failed to generate video: {}", data);
            return Err(PipelineError::ProviderJob {
                provider: Provider::Pika,
                message: format!("generation rejected: {}", data),
            });
        }
        data.pointer("/data/id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::malformed(Provider::Pika, "no video id in response"))
    }

    /// One library status lookup. Transport or parse failures come back
    /// as None so the poll loop can count them and re-authenticate.
    fn get_video(&self, http: &Client, token: &str, video_id: &str) -> Option<Value> {
        let body = match serde_json::to_string(&json!([{"ids": [video_id]}])) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("Failed to encode library lookup for {}: {}", video_id, e);
                return None;
            }
        };
        let response = match http
            .post(&self.library_url)
            .header("Cookie", format!("sb-login-auth-token={}", token))
            .header("Next-Action", LIBRARY_NEXT_ACTION)
            .body(body)
            .send()
        {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Failed to get video status for {}: {}", video_id, e);
                return None;
            }
        };

        let status = response.status();
        let text = match response.text() {
            Ok(text) => text,
            Err(e) => {
                tracing::error!("Failed to read video status response for {}: {}", video_id, e);
                return None;
            }
        };
        if !status.is_success() {
            tracing::error!("Failed to get video status: HTTP {}", status);
            return None;
        }
        match parse_library_response(&text) {
            Some(video) => Some(video),
            None => {
                tracing::error!("Error parsing video response, raw response: {}", text);
                None
            }
        }
    }

    fn download_video(
        &self,
        http: &Client,
        video_url: &str,
        output_path: &Path,
    ) -> Result<(), PipelineError> {
        if video_url.is_empty() {
            return Err(PipelineError::Download(
                "video URL is empty or invalid".to_string(),
            ));
        }
        let response = http.get(video_url).send()?;
        if !response.status().is_success() {
            return Err(PipelineError::Download(format!(
                "failed to download video: {}",
                response.status()
            )));
        }
        let bytes = response.bytes()?;
        if bytes.is_empty() {
            return Err(PipelineError::Download(format!(
                "downloaded video is empty: {}",
                video_url
            )));
        }
        std::fs::write(output_path, &bytes)?;
        Ok(())
    }

    /// Poll the library until the video finishes, then download it.
    fn poll_and_download(
        &self,
        http: &Client,
        mut token: String,
        video_id: &str,
        output_path: &Path,
    ) -> Result<(), PipelineError> {
        let mut consecutive_empty: u32 = 0;

        for attempt in 0..MAX_POLL_ATTEMPTS {
            let video = self.get_video(http, &token, video_id);
            let status = video
                .as_ref()
                .and_then(|v| v.get("status"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            tracing::info!(
                "Polling video_id={}, attempt={}/{}, status={}",
                video_id,
                attempt + 1,
                MAX_POLL_ATTEMPTS,
                status
            );

            match video {
                None => {
                    consecutive_empty += 1;
                    if consecutive_empty >= EMPTY_POLLS_BEFORE_REAUTH {
                        tracing::warn!("Empty video response, refreshing session token");
                        token = self.session.acquire_token()?;
                        consecutive_empty = 0;
                    }
                }
                Some(video) => {
                    consecutive_empty = 0;
                    match status.as_str() {
                        "finished" => {
                            let url = video
                                .get("sharingUrl")
                                .and_then(Value::as_str)
                                .unwrap_or("");
                            self.download_video(http, url, output_path)?;
                            tracing::info!("Video downloaded to {}", output_path.display());
                            return Ok(());
                        }
                        "failed" | "error" => {
                            return Err(PipelineError::ProviderJob {
                                provider: Provider::Pika,
                                message: format!(
                                    "video generation failed with status: {}",
                                    status
                                ),
                            });
                        }
                        _ => {}
                    }
                }
            }

            std::thread::sleep(Duration::from_secs(POLL_INTERVAL_SECS));
        }

        Err(PipelineError::PollTimeout {
            provider: Provider::Pika,
            elapsed_secs: u64::from(MAX_POLL_ATTEMPTS) * POLL_INTERVAL_SECS,
        })
    }
}

impl VideoAssembler for PikaClient {
    fn assemble(&self, request: &VideoAssemblyRequest) -> Result<PathBuf, PipelineError> {
        if request.frame_paths.is_empty() {
            return Err(PipelineError::Validation(
                "at least one frame is required".to_string(),
            ));
        }

        // Built here so the client and its internal runtime live entirely
        // on the blocking thread that drives this stage.
        let http = Client::new();
        let token = self.session.acquire_token()?;
        let (access_token, user_id) = Self::parse_token(&token)?;

        let video_id = self.generate_video(&http, &access_token, &user_id, request)?;
        tracing::info!("Video generation started, video_id={}", video_id);

        self.poll_and_download(&http, token, &video_id, &request.output_path)?;
        Ok(request.output_path.clone())
    }
}

fn image_part(path: &Path) -> Result<Part, PipelineError> {
    let content = std::fs::read(path)?;
    if content.is_empty() {
        return Err(PipelineError::Validation(format!(
            "image file is empty: {}",
            path.display()
        )));
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame.png".to_string());
    Ok(Part::bytes(content)
        .file_name(file_name)
        .mime_str("image/png")?)
}

/// The library endpoint answers with a multi-line server-action stream;
/// the payload is the second line minus its "1:" prefix.
pub(crate) fn parse_library_response(text: &str) -> Option<Value> {
    let mut lines = text.split('\n');
    lines.next()?;
    let payload = lines.next()?.get(2..)?;
    let data: Value = serde_json::from_str(payload).ok()?;
    data.pointer("/data/results/0/videos/0").cloned()
}

fn default_options() -> Value {
    json!({
        "aspectRatio": 0.5625,
        "frameRate": 24,
        "camera": {},
        "parameters": {
            "guidanceScale": 12,
            "motion": 1,
            "negativePrompt": ""
        }
    })
}

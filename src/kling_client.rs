// src/kling_client.rs - Kling Elements frame-interpolation video assembly
// (gen-api.ru)
use crate::error::PipelineError;
use crate::gen_api::{advance_from_status, layer_overrides, GenApiHttp};
use crate::gpt_image_client::request_id_as_string;
use crate::job_client::{JobClient, JobRequest};
use crate::types::{JobHandle, Provider};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;

const NETWORK: &str = "kling-elements";
/// Video generation runs far longer than still images.
const MAX_POLL_SECS: u64 = 6000;
const URL_CHECK_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct KlingParams {
    pub model: String,
    pub duration: u32,
    pub aspect_ratio: String,
    pub negative_prompt: String,
    pub translate_input: bool,
    pub callback_url: Option<String>,
}

impl Default for KlingParams {
    fn default() -> Self {
        Self {
            model: "pro".to_string(),
            duration: 5,
            aspect_ratio: "9:16".to_string(),
            negative_prompt: "blur, distort, and low quality".to_string(),
            translate_input: true,
            callback_url: None,
        }
    }
}

pub struct KlingClient {
    api: GenApiHttp,
    params: KlingParams,
}

impl KlingClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api: GenApiHttp::new(api_key),
            params: KlingParams::default(),
        }
    }

    pub fn with_params(api_key: String, params: KlingParams) -> Self {
        Self {
            api: GenApiHttp::new(api_key),
            params,
        }
    }

    /// HEAD each reference image before submitting. Kling rejects jobs
    /// whose inputs it cannot fetch, so unreachable URLs fail fast here.
    async fn validate_image_urls(&self, image_urls: &[String]) -> Result<(), PipelineError> {
        for url in image_urls {
            let check = self
                .api
                .client()
                .head(url)
                .timeout(Duration::from_secs(URL_CHECK_TIMEOUT_SECS))
                .send()
                .await;
            match check {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    tracing::warn!(
                        "Image URL inaccessible: {} (status: {})",
                        url,
                        response.status()
                    );
                    return Err(PipelineError::Validation(
                        "Invalid or inaccessible image URLs".to_string(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Failed to validate image URL {}: {}", url, e);
                    return Err(PipelineError::Validation(
                        "Invalid or inaccessible image URLs".to_string(),
                    ));
                }
            }
        }
        Ok(())
    }

    fn build_payload(&self, request: &JobRequest) -> Result<Value, PipelineError> {
        if request.prompt.is_empty() {
            tracing::error!("Prompt is required for {}", NETWORK);
            return Err(PipelineError::Validation(format!(
                "Prompt is required for {}",
                NETWORK
            )));
        }

        let mut payload = json!({
            "prompt": request.prompt,
            "model": self.params.model,
            "duration": self.params.duration,
            "aspect_ratio": self.params.aspect_ratio,
            "negative_prompt": self.params.negative_prompt,
            "translate_input": self.params.translate_input,
        });
        let map = payload
            .as_object_mut()
            .expect("payload literal is an object");

        if !request.image_urls.is_empty() {
            map.insert("input_image_urls".to_string(), json!(request.image_urls));
        }

        layer_overrides(
            map,
            &request.overrides,
            &[
                "model",
                "duration",
                "aspect_ratio",
                "negative_prompt",
                "translate_input",
            ],
        );

        if let Some(callback_url) = request
            .overrides
            .get("callback_url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.params.callback_url.clone())
        {
            map.insert("callback_url".to_string(), json!(callback_url));
        }

        Ok(payload)
    }
}

#[async_trait]
impl JobClient for KlingClient {
    fn provider(&self) -> Provider {
        Provider::Kling
    }

    fn max_poll_secs(&self) -> u64 {
        MAX_POLL_SECS
    }

    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, PipelineError> {
        let payload = self.build_payload(request)?;
        if !request.image_urls.is_empty() {
            self.validate_image_urls(&request.image_urls).await?;
        }

        let data = self
            .api
            .submit_network(self.provider(), NETWORK, &payload)
            .await?;

        let request_id = data
            .get("request_id")
            .and_then(request_id_as_string)
            .ok_or_else(|| {
                tracing::error!("No request_id in {} response", NETWORK);
                PipelineError::malformed(self.provider(), "no request_id in response")
            })?;
        tracing::info!("{} task created: {}", NETWORK, request_id);
        Ok(JobHandle::pending(request_id, self.provider()))
    }

    async fn poll(&self, handle: &JobHandle) -> Result<JobHandle, PipelineError> {
        let data = self.api.fetch_status(self.provider(), &handle.id).await?;
        Ok(advance_from_status(handle, &data))
    }
}

// src/gpt_image_client.rs - gpt-image-1 still image synthesis (gen-api.ru)
use crate::error::PipelineError;
use crate::gen_api::{advance_from_status, extract_result_ref, layer_overrides, GenApiHttp};
use crate::job_client::{JobClient, JobRequest};
use crate::types::{JobHandle, Provider};
use async_trait::async_trait;
use serde_json::{json, Value};

const NETWORK: &str = "gpt-image-1";
const MAX_POLL_SECS: u64 = 600;
const VALID_MODERATION: [&str; 3] = ["auto", "low", "high"];

/// Provider defaults, overridable per call.
#[derive(Debug, Clone)]
pub struct GptImageParams {
    pub model: String,
    pub moderation: String,
    pub n: u32,
    pub output_format: String,
    pub quality: String,
    pub size: String,
    pub is_sync: bool,
    pub callback_url: Option<String>,
}

impl Default for GptImageParams {
    fn default() -> Self {
        Self {
            model: "gpt-image-1".to_string(),
            moderation: "auto".to_string(),
            n: 1,
            output_format: "png".to_string(),
            quality: "high".to_string(),
            size: "1024x1536".to_string(),
            is_sync: false,
            callback_url: None,
        }
    }
}

pub struct GptImageClient {
    api: GenApiHttp,
    params: GptImageParams,
}

impl GptImageClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api: GenApiHttp::new(api_key),
            params: GptImageParams::default(),
        }
    }

    pub fn with_params(api_key: String, params: GptImageParams) -> Self {
        Self {
            api: GenApiHttp::new(api_key),
            params,
        }
    }

    /// Assemble the submit payload: caller overrides layered over defaults.
    /// An invalid `moderation` override falls back to the default.
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
            "moderation": self.params.moderation,
            "n": self.params.n,
            "output_format": self.params.output_format,
            "quality": self.params.quality,
            "size": self.params.size,
            "is_sync": self.params.is_sync,
            "image": request.image_urls,
        });
        let map = payload
            .as_object_mut()
            .expect("payload literal is an object");

        layer_overrides(
            map,
            &request.overrides,
            &[
                "model",
                "moderation",
                "n",
                "output_format",
                "quality",
                "size",
                "is_sync",
            ],
        );

        if let Some(moderation) = map.get("moderation").and_then(Value::as_str) {
            if !VALID_MODERATION.contains(&moderation) {
                tracing::warn!(
                    "Invalid moderation value: {}. Using default: {}",
                    moderation,
                    self.params.moderation
                );
                map.insert("moderation".to_string(), json!(self.params.moderation));
            }
        }

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
impl JobClient for GptImageClient {
    fn provider(&self) -> Provider {
        Provider::GptImage
    }

    fn is_sync(&self) -> bool {
        self.params.is_sync
    }

    fn max_poll_secs(&self) -> u64 {
        MAX_POLL_SECS
    }

    async fn submit(&self, request: &JobRequest) -> Result<JobHandle, PipelineError> {
        let payload = self.build_payload(request)?;
        let is_sync = payload
            .get("is_sync")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let data = self
            .api
            .submit_network(self.provider(), NETWORK, &payload)
            .await?;

        if is_sync {
            let result_ref = extract_result_ref(&data).ok_or_else(|| {
                tracing::error!("No image URL in synchronous {} response: {}", NETWORK, data);
                PipelineError::malformed(self.provider(), "no result in synchronous response")
            })?;
            return Ok(JobHandle::pending("sync", self.provider()).succeeded(result_ref));
        }

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

/// gen-api returns request ids either as strings or bare integers.
pub(crate) fn request_id_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// src/flux_client.rs - Flux realism enhancement (gen-api.ru)
use crate::error::PipelineError;
use crate::gen_api::{advance_from_status, extract_result_ref, layer_overrides, GenApiHttp};
use crate::gpt_image_client::request_id_as_string;
use crate::job_client::{JobClient, JobRequest};
use crate::types::{JobHandle, Provider};
use async_trait::async_trait;
use serde_json::{json, Value};

const NETWORK: &str = "flux";
const MAX_POLL_SECS: u64 = 600;

#[derive(Debug, Clone)]
pub struct FluxParams {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f64,
    pub num_images: u32,
    pub enable_safety_checker: bool,
    /// Image-to-image denoising strength; lower preserves more of the input.
    pub strength: f64,
    pub translate_input: bool,
    pub is_sync: bool,
    pub seed: Option<i64>,
    pub callback_url: Option<String>,
}

impl Default for FluxParams {
    fn default() -> Self {
        Self {
            model: "ultra".to_string(),
            width: 1024,
            height: 1536,
            num_inference_steps: 36,
            guidance_scale: 7.5,
            num_images: 1,
            enable_safety_checker: false,
            strength: 0.45,
            translate_input: true,
            is_sync: false,
            seed: None,
            callback_url: None,
        }
    }
}

pub struct FluxClient {
    api: GenApiHttp,
    params: FluxParams,
}

impl FluxClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api: GenApiHttp::new(api_key),
            params: FluxParams::default(),
        }
    }

    pub fn with_params(api_key: String, params: FluxParams) -> Self {
        Self {
            api: GenApiHttp::new(api_key),
            params,
        }
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
            "width": self.params.width,
            "height": self.params.height,
            "num_inference_steps": self.params.num_inference_steps,
            "guidance_scale": self.params.guidance_scale,
            "strength": self.params.strength,
            "translate_input": self.params.translate_input,
            "is_sync": self.params.is_sync,
        });
        let map = payload
            .as_object_mut()
            .expect("payload literal is an object");

        // Flux enhances a single source image.
        if let Some(image_url) = request.image_urls.first() {
            map.insert("image".to_string(), json!(image_url));
        }

        layer_overrides(
            map,
            &request.overrides,
            &[
                "model",
                "width",
                "height",
                "num_inference_steps",
                "guidance_scale",
                "strength",
                "translate_input",
                "is_sync",
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
        if let Some(seed) = request
            .overrides
            .get("seed")
            .and_then(Value::as_i64)
            .or(self.params.seed)
        {
            map.insert("seed".to_string(), json!(seed));
        }

        Ok(payload)
    }
}

#[async_trait]
impl JobClient for FluxClient {
    fn provider(&self) -> Provider {
        Provider::Flux
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

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> FluxClient {
        FluxClient::new("test-key".to_string())
    }

    #[test]
    fn test_payload_defaults_and_single_image() {
        let request = JobRequest::new("enhance realism")
            .with_image_urls(vec!["https://x/gen.png".into(), "https://x/ignored.png".into()]);
        let payload = client().build_payload(&request).unwrap();

        assert_eq!(payload["model"], json!("ultra"));
        assert_eq!(payload["strength"], json!(0.45));
        assert_eq!(payload["num_inference_steps"], json!(36));
        assert_eq!(payload["image"], json!("https://x/gen.png"));
        assert!(payload.get("seed").is_none());
        assert!(payload.get("callback_url").is_none());
    }

    #[test]
    fn test_strength_override_wins() {
        let request = JobRequest::new("enhance realism").with_override("strength", json!(0.3));
        let payload = client().build_payload(&request).unwrap();
        assert_eq!(payload["strength"], json!(0.3));
    }

    #[test]
    fn test_seed_included_only_when_configured() {
        let mut params = FluxParams::default();
        params.seed = Some(7);
        let flux = FluxClient::with_params("test-key".to_string(), params);
        let payload = flux.build_payload(&JobRequest::new("p")).unwrap();
        assert_eq!(payload["seed"], json!(7));

        let request = JobRequest::new("p").with_override("seed", json!(11));
        let payload = client().build_payload(&request).unwrap();
        assert_eq!(payload["seed"], json!(11));
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let err = client().build_payload(&JobRequest::new("")).unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}

// src/gen_api.rs - Shared HTTP plumbing for the gen-api.ru providers
use crate::error::PipelineError;
use crate::types::Provider;
use reqwest::Client;
use serde_json::Value;

pub const GEN_API_BASE_URL: &str = "https://api.gen-api.ru/api/v1";

/// Bearer-authenticated transport shared by the gpt-image, Flux and Kling
/// clients. They all submit to `networks/{slug}` and poll the common
/// `request/get/{id}` status endpoint.
#[derive(Clone)]
pub struct GenApiHttp {
    client: Client,
    api_key: String,
    base_url: String,
}

impl GenApiHttp {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url: GEN_API_BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            base_url,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.api_key)
    }

    /// POST a job payload to a provider network. Any non-200 status is a
    /// ProviderRequest error carrying the status code and body.
    pub async fn submit_network(
        &self,
        provider: Provider,
        network: &str,
        payload: &Value,
    ) -> Result<Value, PipelineError> {
        let url = format!("{}/networks/{}", self.base_url, network);
        tracing::debug!("Submitting payload to {}: {}", provider, payload);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("Authorization", self.bearer())
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("{} request failed: {} - {}", provider, status, body);
            return Err(PipelineError::ProviderRequest {
                provider,
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(response.json().await?)
    }

    /// GET the status document for a previously submitted job.
    pub async fn fetch_status(
        &self,
        provider: Provider,
        job_id: &str,
    ) -> Result<Value, PipelineError> {
        let url = format!("{}/request/get/{}", self.base_url, job_id);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .header("Authorization", self.bearer())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!(
                "Failed to check {} job {} status: {} - {}",
                provider,
                job_id,
                status,
                body
            );
            return Err(PipelineError::ProviderRequest {
                provider,
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(response.json().await?)
    }
}

/// Layer caller overrides onto a default payload. Only keys the provider
/// recognizes are taken; the caller's value wins when present.
pub fn layer_overrides(
    payload: &mut serde_json::Map<String, Value>,
    overrides: &serde_json::Map<String, Value>,
    keys: &[&str],
) {
    for key in keys {
        if let Some(value) = overrides.get(*key) {
            payload.insert((*key).to_string(), value.clone());
        }
    }
}

/// Advance a job handle from a gen-api status document. Anything other
/// than "success" or "error" leaves the handle pending.
pub fn advance_from_status(handle: &crate::types::JobHandle, data: &Value) -> crate::types::JobHandle {
    use crate::types::JobStatus;

    let mut next = handle.clone();
    match data.get("status").and_then(Value::as_str) {
        Some("success") => {
            next.status = JobStatus::Succeeded;
            next.result_ref = extract_result_ref(data);
        }
        Some("error") => {
            next.status = JobStatus::Failed;
            next.error_message = Some(
                data.get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error")
                    .to_string(),
            );
        }
        _ => {}
    }
    next
}

/// Extract the result reference from a gen-api response, which carries it
/// either as a non-empty `result` list or a scalar `output` field.
pub fn extract_result_ref(data: &Value) -> Option<String> {
    if let Some(items) = data.get("result").and_then(Value::as_array) {
        if let Some(first) = items.first().and_then(Value::as_str) {
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    data.get("output")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

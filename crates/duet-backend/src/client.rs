use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use duet_types::{BackendRole, OrchestrationError, Result};

use crate::config::{BackendConfig, EndpointConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const CHAT_TEMPERATURE: f64 = 0.7;

/// Health of the local inference host, from a cheap catalogue probe.
#[derive(Debug, Clone)]
pub struct LocalBackendStatus {
    pub available: bool,
    pub endpoint: String,
    pub detail: Option<String>,
}

/// The seam between orchestration and model inference. Implementations are
/// opaque remote services; one `query` call resolves a role to its endpoint,
/// shapes the payload, and returns the completion text.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn query(&self, role: BackendRole, prompt: &str) -> Result<String> {
        self.query_with_system(role, prompt, None).await
    }

    async fn query_with_system(
        &self,
        role: BackendRole,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<String>;

    fn model_for(&self, role: BackendRole) -> Option<String>;

    async fn availability(&self) -> LocalBackendStatus;
}

pub struct HttpBackend {
    config: BackendConfig,
    client: Client,
}

impl HttpBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    fn endpoint(&self, role: BackendRole) -> Result<&EndpointConfig> {
        self.config
            .endpoint(role)
            .ok_or(OrchestrationError::RoleNotConfigured(role))
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    async fn query_with_system(
        &self,
        role: BackendRole,
        prompt: &str,
        system: Option<&str>,
    ) -> Result<String> {
        let endpoint = self.endpoint(role)?;
        let payload = build_payload(&endpoint.endpoint, &endpoint.model, prompt, system);

        let mut req = self
            .client
            .post(&endpoint.endpoint)
            .timeout(REQUEST_TIMEOUT)
            .json(&payload);
        if let Some(api_key) = &endpoint.api_key {
            req = req.bearer_auth(api_key);
        }

        let response = req.send().await.map_err(|err| {
            OrchestrationError::Backend(format!("{} request error: {}", role, err))
        })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            OrchestrationError::Backend(format!("{} response read error: {}", role, err))
        })?;

        if !status.is_success() {
            return Err(OrchestrationError::Backend(format!(
                "{} returned status {}: {}",
                role,
                status,
                truncate_for_error(&body, 500)
            )));
        }

        let value: Value = serde_json::from_str(&body).map_err(|err| {
            OrchestrationError::Backend(format!("{} returned invalid JSON: {}", role, err))
        })?;
        extract_completion(&endpoint.endpoint, &value).ok_or_else(|| {
            OrchestrationError::Backend(format!(
                "{} returned no completion content for model `{}` (response: {})",
                role,
                endpoint.model,
                truncate_for_error(&body, 500)
            ))
        })
    }

    fn model_for(&self, role: BackendRole) -> Option<String> {
        self.config.endpoint(role).map(|e| e.model.clone())
    }

    async fn availability(&self) -> LocalBackendStatus {
        let endpoint = match self.endpoint(BackendRole::Implementer) {
            Ok(endpoint) => endpoint.endpoint.clone(),
            Err(err) => {
                return LocalBackendStatus {
                    available: false,
                    endpoint: String::new(),
                    detail: Some(err.to_string()),
                }
            }
        };
        let probe_url = catalogue_url(&endpoint);

        match self
            .client
            .get(&probe_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => LocalBackendStatus {
                available: true,
                endpoint,
                detail: None,
            },
            Ok(response) => LocalBackendStatus {
                available: false,
                endpoint,
                detail: Some(format!("probe returned status {}", response.status())),
            },
            Err(err) => LocalBackendStatus {
                available: false,
                endpoint,
                detail: Some(format!(
                    "local inference host not reachable at {}: {}",
                    probe_url, err
                )),
            },
        }
    }
}

/// Two wire shapes, distinguished by endpoint substring: single-prompt
/// "generate" endpoints take `{model, prompt, stream, system?}`; everything
/// else gets the chat `{model, messages, temperature}` form.
pub(crate) fn build_payload(
    endpoint: &str,
    model: &str,
    prompt: &str,
    system: Option<&str>,
) -> Value {
    if is_generate_endpoint(endpoint) {
        let mut payload = json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
        });
        if let Some(system) = system {
            payload["system"] = Value::String(system.to_string());
        }
        payload
    } else {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": prompt}));
        json!({
            "model": model,
            "messages": messages,
            "temperature": CHAT_TEMPERATURE,
        })
    }
}

pub(crate) fn extract_completion(endpoint: &str, value: &Value) -> Option<String> {
    if is_generate_endpoint(endpoint) {
        value
            .get("response")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    } else {
        value
            .get("choices")
            .and_then(|v| v.get(0))
            .and_then(|v| v.get("message"))
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

fn is_generate_endpoint(endpoint: &str) -> bool {
    endpoint.contains("generate")
}

/// Derive the model-catalogue endpoint from a generate/chat URL for the
/// availability probe.
fn catalogue_url(endpoint: &str) -> String {
    let base = endpoint
        .split_once("/api/")
        .map(|(base, _)| base)
        .or_else(|| endpoint.split_once("/v1/").map(|(base, _)| base))
        .unwrap_or(endpoint);
    format!("{}/api/tags", base.trim_end_matches('/'))
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

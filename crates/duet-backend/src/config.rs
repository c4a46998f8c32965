use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use duet_types::BackendRole;

pub const DEFAULT_LOCAL_ENDPOINT: &str = "http://localhost:11434/api/generate";

const DEFAULT_PLANNER_MODEL: &str = "llama3.1:70b";
const DEFAULT_IMPLEMENTER_MODEL: &str = "deepseek-coder-v2:latest";
const DEFAULT_REVIEWER_MODEL: &str = "qwq:latest";
const DEFAULT_DOCS_MODEL: &str = "llama3.2:latest";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub model: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl EndpointConfig {
    pub fn new(model: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            endpoint: endpoint.into(),
            api_key: None,
        }
    }
}

/// Per-role backend endpoints. Construction is explicit — this crate does not
/// own a config file; hosts hand a finished config in, typically from
/// [`BackendConfig::from_env`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub endpoints: HashMap<BackendRole, EndpointConfig>,
}

impl BackendConfig {
    /// Defaults for a single local inference host, with per-role model
    /// overrides from the environment. `DUET_LOCAL_MODEL` is the fallback
    /// for the three specialized local roles when no role-specific variable
    /// is set.
    pub fn from_env() -> Self {
        let base = std::env::var("DUET_LOCAL_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOCAL_ENDPOINT.to_string());

        let mut endpoints = HashMap::new();
        for role in BackendRole::ALL {
            let model = model_for_role_from_env(role);
            endpoints.insert(role, EndpointConfig::new(model, base.clone()));
        }
        Self { endpoints }
    }

    pub fn with_endpoint(mut self, role: BackendRole, endpoint: EndpointConfig) -> Self {
        self.endpoints.insert(role, endpoint);
        self
    }

    pub fn endpoint(&self, role: BackendRole) -> Option<&EndpointConfig> {
        self.endpoints.get(&role)
    }
}

fn model_for_role_from_env(role: BackendRole) -> String {
    let role_var = match role {
        BackendRole::Planner => "DUET_PLANNER_MODEL",
        BackendRole::Implementer => "DUET_IMPLEMENTER_MODEL",
        BackendRole::Reviewer => "DUET_REVIEWER_MODEL",
        BackendRole::Docs => "DUET_DOCS_MODEL",
    };
    if let Ok(model) = std::env::var(role_var) {
        if !model.trim().is_empty() {
            return model;
        }
    }
    // The planner never falls back to the shared local model; it has its own
    // default.
    if role != BackendRole::Planner {
        if let Ok(model) = std::env::var("DUET_LOCAL_MODEL") {
            if !model.trim().is_empty() {
                return model;
            }
        }
    }
    match role {
        BackendRole::Planner => DEFAULT_PLANNER_MODEL.to_string(),
        BackendRole::Implementer => DEFAULT_IMPLEMENTER_MODEL.to_string(),
        BackendRole::Reviewer => DEFAULT_REVIEWER_MODEL.to_string(),
        BackendRole::Docs => DEFAULT_DOCS_MODEL.to_string(),
    }
}

//! Default model resolution and HTTP settings for conversation adapters.

use crate::{Error, ErrorContext, Result};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

pub const DEFAULT_MISTRAL_MODEL: &str = "open-mistral-7b";

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

/// Default model per provider.
///
/// Built-in defaults can be overridden with `CONVERSATION_DEFAULT_MODEL_<PROVIDER>`
/// (e.g. `CONVERSATION_DEFAULT_MODEL_MISTRAL=mistral-small-latest`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDefaults {
    models: HashMap<String, String>,
}

impl ModelDefaults {
    pub fn builtin() -> Self {
        Self {
            models: HashMap::from([("mistral".to_string(), DEFAULT_MISTRAL_MODEL.to_string())]),
        }
    }

    pub fn from_env() -> Self {
        let mut defaults = Self::builtin();
        let providers: Vec<String> = defaults.models.keys().cloned().collect();
        for provider in providers {
            let var = format!("CONVERSATION_DEFAULT_MODEL_{}", provider.to_uppercase());
            if let Ok(model) = env::var(&var) {
                if !model.trim().is_empty() {
                    defaults.models.insert(provider, model.trim().to_string());
                }
            }
        }
        defaults
    }

    pub fn with_default(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.models.insert(provider.into(), model.into());
        self
    }

    pub fn default_for(&self, provider: &str) -> Option<&str> {
        self.models.get(provider).map(String::as_str)
    }

    /// A non-blank configured model wins; otherwise the provider default.
    pub fn resolve(&self, provider: &str, configured: Option<&str>) -> Result<String> {
        if let Some(model) = configured.map(str::trim).filter(|m| !m.is_empty()) {
            return Ok(model.to_string());
        }
        self.default_for(provider)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::configuration_with_context(
                    format!("no model configured and no default for provider {}", provider),
                    ErrorContext::new()
                        .with_field_path("model")
                        .with_source(provider.to_string()),
                )
            })
    }
}

impl Default for ModelDefaults {
    fn default() -> Self {
        Self::builtin()
    }
}

/// HTTP request timeout for model clients, from `CONTRIB_HTTP_TIMEOUT_SECS` (default 60s).
pub fn http_timeout_from_env() -> Duration {
    let secs = env::var("CONTRIB_HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .filter(|s| *s > 0)
        .unwrap_or(DEFAULT_HTTP_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

//! Mistral conversation adapter and chat-completions client.

use super::config::{http_timeout_from_env, ModelDefaults};
use super::{
    CachedModel, ChatCompletion, ChatRequest, Conversation, ConversationRequest,
    ConversationResponse, LanguageModel, LlmConversation,
};
use crate::cache::{model_cache, ModelCache, ModelCacheKey};
use crate::metadata::{decode_metadata, metadata_info_from_type, parse_duration, MetadataMap, Properties};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const PROVIDER: &str = "mistral";
pub const DEFAULT_ENDPOINT: &str = "https://api.mistral.ai";

const COMPLETIONS_PATH: &str = "v1/chat/completions";

/// Recognised metadata for LLM conversation components.
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct ConversationMetadata {
    /// API key for the provider.
    pub key: String,
    /// Model to use. Defaults to the provider's default model.
    #[serde(default)]
    pub model: Option<String>,
    /// Keep the model client (and identical responses) cached for this long, e.g. `10m`.
    /// Empty or `0` disables caching.
    #[serde(default, rename = "cacheTTL")]
    pub cache_ttl: Option<String>,
    /// Base URL of the provider API.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Everything needed to build one model client.
#[derive(Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub api_key: String,
    pub model: String,
    pub endpoint: Url,
    pub timeout: Duration,
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSettings")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint.as_str())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Builds model clients. Swapped out in tests to observe construction.
#[async_trait]
pub trait ModelFactory: Send + Sync {
    async fn build(&self, settings: &ClientSettings) -> Result<Arc<dyn LanguageModel>>;
}

/// Factory producing [`MistralClient`]s.
#[derive(Debug, Default, Clone)]
pub struct HttpModelFactory;

#[async_trait]
impl ModelFactory for HttpModelFactory {
    async fn build(&self, settings: &ClientSettings) -> Result<Arc<dyn LanguageModel>> {
        Ok(Arc::new(MistralClient::new(settings)?))
    }
}

fn config_error(field: &str, message: impl Into<String>, details: Option<String>) -> Error {
    let mut context = ErrorContext::new()
        .with_field_path(field)
        .with_source(PROVIDER);
    if let Some(details) = details {
        context = context.with_details(details);
    }
    Error::configuration_with_context(message, context)
}

fn as_construction_error(e: Error) -> Error {
    match e {
        e @ Error::ClientConstruction { .. } => e,
        other => Error::client_construction_with_context(
            other.to_string(),
            ErrorContext::new().with_source(PROVIDER),
        ),
    }
}

async fn build_cached(
    factory: Arc<dyn ModelFactory>,
    settings: ClientSettings,
    ttl: Duration,
) -> Result<Arc<dyn LanguageModel>> {
    let client = factory.build(&settings).await.map_err(as_construction_error)?;
    debug!(model = %settings.model, ttl = ?ttl, "built cached model client");
    Ok(Arc::new(CachedModel::new(client, ttl)))
}

/// `None` when caching is disabled.
fn parse_cache_ttl(raw: Option<&str>) -> Result<Option<Duration>> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let ttl = parse_duration(raw).map_err(|e| {
        config_error(
            "cacheTTL",
            format!("invalid cacheTTL \"{}\"", raw),
            Some(e.to_string()),
        )
    })?;
    Ok((!ttl.is_zero()).then_some(ttl))
}

fn parse_endpoint(raw: Option<&str>) -> Result<Url> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_ENDPOINT);
    let url = Url::parse(raw).map_err(|e| {
        config_error("endpoint", format!("invalid endpoint \"{}\"", raw), Some(e.to_string()))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(config_error(
            "endpoint",
            format!("invalid endpoint \"{}\"", raw),
            Some("scheme must be http or https".to_string()),
        ));
    }
    Ok(url)
}

/// Where a cached client lives, so each call can go back to the cache for it.
struct CacheBinding {
    key: ModelCacheKey,
    ttl: Duration,
    settings: ClientSettings,
}

/// Conversation adapter for Mistral models.
///
/// With `cacheTTL` set, every `converse` looks the client up in the instance cache again, so
/// an expired client is rebuilt instead of being kept alive by this adapter.
pub struct Mistral {
    llm: LlmConversation,
    cached: Option<CacheBinding>,
    factory: Arc<dyn ModelFactory>,
    cache: Arc<ModelCache>,
    defaults: ModelDefaults,
}

impl Mistral {
    pub fn new() -> Self {
        Self {
            llm: LlmConversation::default(),
            cached: None,
            factory: Arc::new(HttpModelFactory),
            cache: model_cache(),
            defaults: ModelDefaults::from_env(),
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn ModelFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ModelCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_defaults(mut self, defaults: ModelDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// The model handle installed by the last `init`, if any.
    pub fn model(&self) -> Option<Arc<dyn LanguageModel>> {
        self.llm.model().cloned()
    }

    async fn cached_client(&self, cached: &CacheBinding) -> Result<Arc<dyn LanguageModel>> {
        let factory = self.factory.clone();
        let settings = cached.settings.clone();
        let ttl = cached.ttl;
        self.cache
            .get_or_create(cached.key.clone(), ttl, move || {
                build_cached(factory, settings, ttl)
            })
            .await
    }
}

impl Default for Mistral {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Conversation for Mistral {
    async fn init(&mut self, properties: &Properties) -> Result<()> {
        let md: ConversationMetadata = decode_metadata(properties)?;

        let api_key = md.key.trim().to_string();
        if api_key.is_empty() {
            return Err(config_error("key", "key is required", None));
        }
        // Validated before anything is built.
        let cache_ttl = parse_cache_ttl(md.cache_ttl.as_deref())?;
        let endpoint = parse_endpoint(md.endpoint.as_deref())?;
        let model = self.defaults.resolve(PROVIDER, md.model.as_deref())?;

        let settings = ClientSettings {
            api_key,
            model,
            endpoint,
            timeout: http_timeout_from_env(),
        };

        let (client, cached) = match cache_ttl {
            None => {
                let client = self
                    .factory
                    .build(&settings)
                    .await
                    .map_err(as_construction_error)?;
                (client, None)
            }
            Some(ttl) => {
                let key = ModelCacheKey::new(PROVIDER, settings.model.clone(), ttl).with_settings([
                    ("key", settings.api_key.as_str()),
                    ("endpoint", settings.endpoint.as_str()),
                ]);
                let cached = CacheBinding {
                    key,
                    ttl,
                    settings: settings.clone(),
                };
                (self.cached_client(&cached).await?, Some(cached))
            }
        };

        info!(
            model = %settings.model,
            endpoint = %settings.endpoint,
            cache_ttl = ?cache_ttl,
            "mistral conversation initialized"
        );
        self.llm.set_model(client);
        self.cached = cached;
        Ok(())
    }

    async fn converse(&self, request: ConversationRequest) -> Result<ConversationResponse> {
        match &self.cached {
            Some(cached) => {
                let client = self.cached_client(cached).await?;
                LlmConversation::with_model(client).converse(request).await
            }
            None => self.llm.converse(request).await,
        }
    }

    fn component_metadata(&self) -> MetadataMap {
        metadata_info_from_type::<ConversationMetadata>()
    }

    async fn close(&mut self) -> Result<()> {
        self.llm.clear();
        self.cached = None;
        Ok(())
    }
}

/// Client for the Mistral chat-completions API.
pub struct MistralClient {
    http_client: reqwest::Client,
    completions_url: Url,
    api_key: String,
    model: String,
}

impl MistralClient {
    pub fn new(settings: &ClientSettings) -> Result<Self> {
        let mut base = settings.endpoint.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let completions_url = base.join(COMPLETIONS_PATH).map_err(|e| {
            Error::client_construction_with_context(
                format!("invalid endpoint: {}", e),
                ErrorContext::new()
                    .with_field_path("endpoint")
                    .with_source(PROVIDER),
            )
        })?;

        let http_client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| {
                Error::client_construction_with_context(
                    format!("failed to create HTTP client: {}", e),
                    ErrorContext::new().with_source(PROVIDER),
                )
            })?;

        Ok(Self {
            http_client,
            completions_url,
            api_key: settings.api_key.clone(),
            model: settings.model.clone(),
        })
    }

    pub fn completions_url(&self) -> &Url {
        &self.completions_url
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.pointer("/error/message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

#[async_trait]
impl LanguageModel for MistralClient {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        let mut body = json!({
            "model": self.model,
            "messages": request.messages,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }

        let response = self
            .http_client
            .post(self.completions_url.clone())
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(Error::Remote {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }

        let json: Value = serde_json::from_str(&text)?;
        let choice = json.pointer("/choices/0").ok_or_else(|| {
            Error::runtime_with_context(
                "invalid chat completion: no choices",
                ErrorContext::new().with_source(PROVIDER),
            )
        })?;
        let content = choice
            .pointer("/message/content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish_reason = choice
            .get("finish_reason")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(ChatCompletion {
            content,
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_ttl_parsing() {
        assert_eq!(parse_cache_ttl(None).unwrap(), None);
        assert_eq!(parse_cache_ttl(Some(" ")).unwrap(), None);
        assert_eq!(parse_cache_ttl(Some("0")).unwrap(), None);
        assert_eq!(
            parse_cache_ttl(Some("10m")).unwrap(),
            Some(Duration::from_secs(600))
        );

        let err = parse_cache_ttl(Some("notaduration")).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("cacheTTL")
        );
        assert!(parse_cache_ttl(Some("-5s")).unwrap_err().is_configuration());
    }

    #[test]
    fn test_endpoint_parsing() {
        assert_eq!(parse_endpoint(None).unwrap().as_str(), "https://api.mistral.ai/");
        assert!(parse_endpoint(Some("not a url")).is_err());
        assert!(parse_endpoint(Some("ftp://example.com")).is_err());
    }

    #[test]
    fn test_completions_url_keeps_base_path() {
        let settings = |endpoint: &str| ClientSettings {
            api_key: "k".into(),
            model: "m".into(),
            endpoint: Url::parse(endpoint).unwrap(),
            timeout: Duration::from_secs(5),
        };
        let client = MistralClient::new(&settings("https://api.mistral.ai")).unwrap();
        assert_eq!(
            client.completions_url().as_str(),
            "https://api.mistral.ai/v1/chat/completions"
        );
        let client = MistralClient::new(&settings("http://proxy.local/mistral")).unwrap();
        assert_eq!(
            client.completions_url().as_str(),
            "http://proxy.local/mistral/v1/chat/completions"
        );
        assert!(!format!("{:?}", settings("http://x")).contains("\"k\""));
    }

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(r#"{"message":"Unauthorized"}"#), "Unauthorized");
        assert_eq!(
            error_message(r#"{"error":{"message":"rate limited"}}"#),
            "rate limited"
        );
        assert_eq!(error_message("plain"), "plain");
    }

    #[test]
    fn test_component_metadata() {
        let md = Mistral::new().component_metadata();
        assert!(md["key"].required);
        assert!(!md["model"].required);
        assert!(md.contains_key("cacheTTL"));
        assert!(md.contains_key("endpoint"));
    }
}

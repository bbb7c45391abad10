//! Mistral adapter configuration, instance caching and HTTP client behaviour.

use async_trait::async_trait;
use component_contrib::cache::{InstanceCache, ModelCache};
use component_contrib::conversation::mistral::{ClientSettings, Mistral, ModelFactory};
use component_contrib::conversation::{
    ChatCompletion, ChatRequest, Conversation, ConversationInput, ConversationRequest,
    LanguageModel, ModelDefaults,
};
use component_contrib::metadata::Properties;
use component_contrib::{Error, Result};
use mockito::Matcher;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

struct EchoModel {
    model: String,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl LanguageModel for EchoModel {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let last = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(ChatCompletion {
            content: format!("{}:{}:{}", self.model, last, n),
            finish_reason: Some("stop".into()),
        })
    }
}

#[derive(Default)]
struct CountingFactory {
    builds: AtomicUsize,
    generate_calls: Arc<AtomicUsize>,
    last_settings: Mutex<Option<ClientSettings>>,
    fail: bool,
}

impl CountingFactory {
    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }

    fn last_model(&self) -> Option<String> {
        self.last_settings
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.model.clone())
    }
}

#[async_trait]
impl ModelFactory for CountingFactory {
    async fn build(&self, settings: &ClientSettings) -> Result<Arc<dyn LanguageModel>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        *self.last_settings.lock().unwrap() = Some(settings.clone());
        if self.fail {
            return Err(Error::runtime("credentials rejected"));
        }
        Ok(Arc::new(EchoModel {
            model: settings.model.clone(),
            calls: self.generate_calls.clone(),
        }))
    }
}

fn props(pairs: &[(&str, &str)]) -> Properties {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn adapter(factory: &Arc<CountingFactory>, cache: &Arc<ModelCache>) -> Mistral {
    Mistral::new()
        .with_factory(factory.clone())
        .with_cache(cache.clone())
        .with_defaults(ModelDefaults::builtin())
}

fn hello() -> ConversationRequest {
    ConversationRequest::new([ConversationInput::new("hello")])
}

#[tokio::test]
async fn test_malformed_cache_ttl_fails_before_construction() {
    let factory = Arc::new(CountingFactory::default());
    let cache: Arc<ModelCache> = Arc::new(InstanceCache::new());
    let mut mistral = adapter(&factory, &cache);

    let err = mistral
        .init(&props(&[("key", "k"), ("cacheTTL", "notaduration")]))
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert_eq!(
        err.context().and_then(|c| c.field_path.as_deref()),
        Some("cacheTTL")
    );
    assert_eq!(factory.builds(), 0);
    assert!(cache.is_empty());
    assert!(mistral.model().is_none());
}

#[tokio::test]
async fn test_out_of_range_cache_ttl_is_a_configuration_error() {
    let factory = Arc::new(CountingFactory::default());
    let cache: Arc<ModelCache> = Arc::new(InstanceCache::new());

    for ttl in ["10000000000000000000s", "2562047h47m16.854775808s"] {
        let mut mistral = adapter(&factory, &cache);
        let err = mistral
            .init(&props(&[("key", "k"), ("cacheTTL", ttl)]))
            .await
            .unwrap_err();
        assert!(err.is_configuration(), "unexpected error: {}", err);
        assert!(err.to_string().contains("out of range"), "{}", err);
    }
    assert_eq!(factory.builds(), 0);
    assert!(cache.is_empty());

    // The same credentials still initialise with a sane TTL.
    adapter(&factory, &cache)
        .init(&props(&[("key", "k"), ("cacheTTL", "1m")]))
        .await
        .unwrap();
    assert_eq!(factory.builds(), 1);
}

#[tokio::test]
async fn test_missing_or_empty_key_is_rejected() {
    let factory = Arc::new(CountingFactory::default());
    let cache: Arc<ModelCache> = Arc::new(InstanceCache::new());

    for p in [props(&[("model", "m")]), props(&[("key", "  ")])] {
        let mut mistral = adapter(&factory, &cache);
        let err = mistral.init(&p).await.unwrap_err();
        assert!(err.is_configuration(), "unexpected error: {}", err);
        mistral.close().await.unwrap();
    }
    assert_eq!(factory.builds(), 0);
}

#[tokio::test]
async fn test_model_resolution() {
    let factory = Arc::new(CountingFactory::default());
    let cache: Arc<ModelCache> = Arc::new(InstanceCache::new());

    adapter(&factory, &cache)
        .init(&props(&[("key", "k")]))
        .await
        .unwrap();
    assert_eq!(factory.last_model().as_deref(), Some("open-mistral-7b"));

    adapter(&factory, &cache)
        .init(&props(&[("key", "k"), ("MODEL", "mistral-large-latest")]))
        .await
        .unwrap();
    assert_eq!(factory.last_model().as_deref(), Some("mistral-large-latest"));

    adapter(&factory, &cache)
        .with_defaults(ModelDefaults::builtin().with_default("mistral", "injected-default"))
        .init(&props(&[("key", "k")]))
        .await
        .unwrap();
    assert_eq!(factory.last_model().as_deref(), Some("injected-default"));
}

#[tokio::test]
async fn test_cached_client_is_shared_between_adapters() {
    let factory = Arc::new(CountingFactory::default());
    let cache: Arc<ModelCache> = Arc::new(InstanceCache::new());
    let p = props(&[("key", "k"), ("cacheTTL", "1m")]);

    let mut first = adapter(&factory, &cache);
    let mut second = adapter(&factory, &cache);
    first.init(&p).await.unwrap();
    second.init(&p).await.unwrap();

    assert_eq!(factory.builds(), 1);
    assert!(Arc::ptr_eq(
        &first.model().unwrap(),
        &second.model().unwrap()
    ));

    // A different credential is a different cache entry.
    let mut third = adapter(&factory, &cache);
    third
        .init(&props(&[("key", "other"), ("cacheTTL", "1m")]))
        .await
        .unwrap();
    assert_eq!(factory.builds(), 2);
    assert_eq!(cache.len(), 2);

    // Closing one adapter leaves the shared client usable by the other.
    first.close().await.unwrap();
    assert!(first.converse(hello()).await.is_err());
    assert!(second.converse(hello()).await.is_ok());
}

#[tokio::test]
async fn test_uncached_init_builds_every_time() {
    let factory = Arc::new(CountingFactory::default());
    let cache: Arc<ModelCache> = Arc::new(InstanceCache::new());

    for ttl in ["", "0"] {
        let mut mistral = adapter(&factory, &cache);
        mistral
            .init(&props(&[("key", "k"), ("cacheTTL", ttl)]))
            .await
            .unwrap();
    }
    assert_eq!(factory.builds(), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_cached_model_memoises_identical_prompts() {
    let factory = Arc::new(CountingFactory::default());
    let cache: Arc<ModelCache> = Arc::new(InstanceCache::new());
    let mut mistral = adapter(&factory, &cache);
    mistral
        .init(&props(&[("key", "k"), ("cacheTTL", "5m")]))
        .await
        .unwrap();

    let a = mistral.converse(hello()).await.unwrap();
    let b = mistral.converse(hello()).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a.outputs[0].result, "open-mistral-7b:hello:0");
    assert_eq!(factory.generate_calls.load(Ordering::SeqCst), 1);

    let c = mistral
        .converse(ConversationRequest::new([ConversationInput::new("bye")]))
        .await
        .unwrap();
    assert_eq!(c.outputs[0].result, "open-mistral-7b:bye:1");
}

#[tokio::test(start_paused = true)]
async fn test_expired_client_is_rebuilt_on_converse() {
    let factory = Arc::new(CountingFactory::default());
    let cache: Arc<ModelCache> = Arc::new(InstanceCache::new());
    let mut mistral = adapter(&factory, &cache);
    mistral
        .init(&props(&[("key", "k"), ("cacheTTL", "1m")]))
        .await
        .unwrap();

    mistral.converse(hello()).await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;
    mistral.converse(hello()).await.unwrap();
    assert_eq!(factory.builds(), 1);
    // Second call was answered from the memoised response.
    assert_eq!(factory.generate_calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    mistral.converse(hello()).await.unwrap();
    assert_eq!(factory.builds(), 2);
    assert_eq!(factory.generate_calls.load(Ordering::SeqCst), 2);
    assert_eq!(cache.stats().evictions, 1);
}

#[tokio::test]
async fn test_factory_failure_surfaces_as_construction_error() {
    let factory = Arc::new(CountingFactory {
        fail: true,
        ..Default::default()
    });
    let cache: Arc<ModelCache> = Arc::new(InstanceCache::new());

    let err = adapter(&factory, &cache)
        .init(&props(&[("key", "k")]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ClientConstruction { .. }));

    let err = adapter(&factory, &cache)
        .init(&props(&[("key", "k"), ("cacheTTL", "1m")]))
        .await
        .unwrap_err();
    match err {
        Error::CacheConstruction { source, .. } => {
            assert!(matches!(*source, Error::ClientConstruction { .. }))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(cache.is_empty());
}

#[tokio::test]
async fn test_http_client_against_mock_server() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/chat/completions")
        .match_header("authorization", "Bearer test-key")
        .match_body(Matcher::PartialJson(json!({
            "model": "open-mistral-7b",
            "messages": [{"role": "user", "content": "hello"}],
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "id": "cmpl-1",
                "model": "open-mistral-7b",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hi there!"},
                    "finish_reason": "stop"
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let url = server.url();
    let mut mistral = Mistral::new()
        .with_cache(Arc::new(InstanceCache::new()))
        .with_defaults(ModelDefaults::builtin());
    mistral
        .init(&props(&[("key", "test-key"), ("endpoint", url.as_str())]))
        .await
        .unwrap();

    let response = mistral
        .converse(hello().with_context_id("conv-7"))
        .await
        .unwrap();
    assert_eq!(response.outputs[0].result, "Hi there!");
    assert_eq!(response.context_id.as_deref(), Some("conv-7"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_error_status_is_reported() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/v1/chat/completions")
        .with_status(401)
        .with_header("content-type", "application/json")
        .with_body(r#"{"message":"Unauthorized","request_id":"r1"}"#)
        .create_async()
        .await;

    let url = server.url();
    let mut mistral = Mistral::new()
        .with_cache(Arc::new(InstanceCache::new()))
        .with_defaults(ModelDefaults::builtin());
    mistral
        .init(&props(&[("key", "wrong"), ("endpoint", url.as_str())]))
        .await
        .unwrap();

    match mistral.converse(hello()).await.unwrap_err() {
        Error::Remote { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "Unauthorized");
        }
        other => panic!("unexpected error: {other}"),
    }
}

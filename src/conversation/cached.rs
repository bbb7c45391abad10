//! Model wrapper that memoises identical requests for a TTL.

use super::{ChatCompletion, ChatRequest, LanguageModel};
use crate::cache::ResponseCache;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct CachedModel {
    inner: Arc<dyn LanguageModel>,
    responses: ResponseCache<ChatCompletion>,
}

impl CachedModel {
    pub fn new(inner: Arc<dyn LanguageModel>, ttl: Duration) -> Self {
        Self {
            inner,
            responses: ResponseCache::new(ttl),
        }
    }

    pub fn cached_responses(&self) -> usize {
        self.responses.len()
    }
}

#[async_trait]
impl LanguageModel for CachedModel {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn generate(&self, request: &ChatRequest) -> Result<ChatCompletion> {
        let key = ResponseCache::<ChatCompletion>::key_for(self.inner.model(), request);
        if let Some(hit) = self.responses.get(&key) {
            debug!(model = %self.inner.model(), "response cache hit");
            return Ok(hit);
        }
        let completion = self.inner.generate(request).await?;
        self.responses.insert(key, completion.clone());
        Ok(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ChatMessage;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl LanguageModel for Counting {
        fn model(&self) -> &str {
            "counting"
        }

        async fn generate(&self, request: &ChatRequest) -> Result<ChatCompletion> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::runtime("upstream unavailable"));
            }
            Ok(ChatCompletion {
                content: format!("{}#{}", request.messages[0].content, n),
                finish_reason: None,
            })
        }
    }

    fn request(text: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![ChatMessage::user(text)],
            temperature: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_requests_hit_until_expiry() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let model = CachedModel::new(inner.clone(), Duration::from_secs(30));

        let a = model.generate(&request("hi")).await.unwrap();
        let b = model.generate(&request("hi")).await.unwrap();
        let c = model.generate(&request("other")).await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(model.cached_responses(), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        let d = model.generate(&request("hi")).await.unwrap();
        assert_ne!(a, d);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail: true,
        });
        let model = CachedModel::new(inner.clone(), Duration::from_secs(30));
        assert!(model.generate(&request("hi")).await.is_err());
        assert!(model.generate(&request("hi")).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(model.model(), "counting");
    }
}

//! 实例缓存模块：按键缓存昂贵的资源句柄（如模型客户端），支持 TTL 过期与单次构建。
//!
//! # Instance Caching Module
//!
//! Constructing a model client is expensive (TLS setup, connection pools, credential checks).
//! Components that are initialised repeatedly with the same configuration share one client
//! through this module instead of building a new one each time.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`InstanceCache`] | Keyed store with TTL expiry and single-flight construction |
//! | [`ModelCacheKey`] | Structured key: provider, model, TTL and a settings fingerprint |
//! | [`ResponseCache`] | LRU memo of generated responses with a TTL |
//! | [`model_cache`] | Process-wide cache of model clients used by conversation adapters |
//!
//! ## Example
//!
//! ```rust
//! use component_contrib::cache::InstanceCache;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> component_contrib::Result<()> {
//! let cache: InstanceCache<String, Arc<String>> = InstanceCache::new();
//! let handle = cache
//!     .get_or_create("model-x".to_string(), Duration::from_secs(60), || async {
//!         Ok(Arc::new("expensive client".to_string()))
//!     })
//!     .await?;
//! assert_eq!(handle.as_str(), "expensive client");
//! # Ok(())
//! # }
//! ```

mod instance;
mod key;
mod response;

pub use instance::{InstanceCache, InstanceCacheStats};
pub use key::ModelCacheKey;
pub use response::ResponseCache;

use crate::conversation::LanguageModel;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Cache of shared model clients, keyed by model identity.
pub type ModelCache = InstanceCache<ModelCacheKey, Arc<dyn LanguageModel>>;

static MODEL_CACHE: Lazy<Arc<ModelCache>> = Lazy::new(|| Arc::new(InstanceCache::new()));

/// Process-wide model cache. Adapters use it unless another cache is injected.
pub fn model_cache() -> Arc<ModelCache> {
    MODEL_CACHE.clone()
}

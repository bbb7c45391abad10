//! # component-contrib
//!
//! 集成组件库：数据库变更订阅输入绑定，以及带共享实例缓存的大语言模型对话适配器。
//!
//! Integration components for a pluggable application runtime: an input binding that streams a
//! database change feed, and a conversation adapter that fronts a hosted language model and can
//! share its client through a TTL-bounded instance cache.
//!
//! ## Overview
//!
//! Every component follows the same three phases: configure from a flat metadata map, acquire
//! the external resource, then operate until cancelled or closed.
//!
//! - **Change-feed binding**: [`bindings::statechange::StateChangeBinding`] owns one live
//!   database session and pushes each change to an [`bindings::EventSink`] in stream order
//! - **Conversation adapter**: [`conversation::mistral::Mistral`] configures a model client,
//!   optionally through [`cache::InstanceCache`], and exposes it via [`conversation::Conversation`]
//! - **Instance cache**: keyed, TTL-bounded store with single-flight construction per key
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use component_contrib::conversation::mistral::Mistral;
//! use component_contrib::conversation::{Conversation, ConversationInput, ConversationRequest};
//! use std::collections::HashMap;
//!
//! #[tokio::main]
//! async fn main() -> component_contrib::Result<()> {
//!     let mut props = HashMap::new();
//!     props.insert("key".to_string(), "your-api-key".to_string());
//!     props.insert("cacheTTL".to_string(), "10m".to_string());
//!
//!     let mut mistral = Mistral::new();
//!     mistral.init(&props).await?;
//!
//!     let response = mistral
//!         .converse(ConversationRequest::new([ConversationInput::new("Hello!")]))
//!         .await?;
//!     println!("{}", response.outputs[0].result);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`bindings`] | Input binding contract and the change-feed binding |
//! | [`conversation`] | Conversation contract and the Mistral adapter |
//! | [`cache`] | Instance cache, cache keys and response memoisation |
//! | [`metadata`] | Typed metadata decoding, durations and component manifests |

pub mod bindings;
pub mod cache;
pub mod conversation;
pub mod metadata;

pub use bindings::{EventSink, InputBinding, ReadResponse, StopReason, Subscription};
pub use cache::{InstanceCache, ModelCacheKey};
pub use conversation::{Conversation, LanguageModel};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};

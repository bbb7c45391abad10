//! 对话组件模块：将托管的大语言模型客户端封装为统一的对话接口，可选地复用缓存的模型实例。
//!
//! # Conversation Module
//!
//! A conversation component turns a list of chat inputs into model outputs. Adapters own only
//! configuration; the model client itself is a [`LanguageModel`] handle that may be shared
//! between adapters through the [`crate::cache::InstanceCache`].
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Conversation`] | Init / Converse / Close contract for adapters |
//! | [`LanguageModel`] | A chat-completion capable model client |
//! | [`LlmConversation`] | Shared converse logic on top of a `LanguageModel` |
//! | [`ModelDefaults`] | Default model per provider, overridable from the environment |
//! | [`mistral`] | Mistral adapter and HTTP client |

pub mod cached;
pub mod config;
pub mod mistral;

pub use cached::CachedModel;
pub use config::ModelDefaults;

use crate::metadata::{MetadataMap, Properties};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
}

/// One message passed to a model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Model-level request. Its JSON form is also the response-cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// A configured model client.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier sent to the provider.
    fn model(&self) -> &str;

    async fn generate(&self, request: &ChatRequest) -> Result<ChatCompletion>;
}

/// One input of a conversation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationInput {
    pub message: String,
    #[serde(default)]
    pub role: Role,
}

impl ConversationInput {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            role: Role::User,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationRequest {
    pub inputs: Vec<ConversationInput>,
    /// Opaque identifier echoed back in the response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl ConversationRequest {
    pub fn new(inputs: impl IntoIterator<Item = ConversationInput>) -> Self {
        Self {
            inputs: inputs.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_context_id(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationResult {
    pub result: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationResponse {
    pub outputs: Vec<ConversationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

/// Init / Converse / Close contract shared by conversation adapters.
#[async_trait]
pub trait Conversation: Send + Sync {
    async fn init(&mut self, properties: &Properties) -> Result<()>;

    async fn converse(&self, request: ConversationRequest) -> Result<ConversationResponse>;

    fn component_metadata(&self) -> MetadataMap;

    /// Drop this adapter's model reference. A shared cached client stays alive for others.
    async fn close(&mut self) -> Result<()>;
}

/// Converse logic over whichever [`LanguageModel`] an adapter installed.
#[derive(Default)]
pub struct LlmConversation {
    model: Option<Arc<dyn LanguageModel>>,
}

impl LlmConversation {
    pub fn with_model(model: Arc<dyn LanguageModel>) -> Self {
        Self { model: Some(model) }
    }

    pub fn set_model(&mut self, model: Arc<dyn LanguageModel>) {
        self.model = Some(model);
    }

    pub fn model(&self) -> Option<&Arc<dyn LanguageModel>> {
        self.model.as_ref()
    }

    pub fn clear(&mut self) {
        self.model = None;
    }

    pub async fn converse(&self, request: ConversationRequest) -> Result<ConversationResponse> {
        let model = self.model.as_ref().ok_or_else(|| {
            Error::runtime_with_context(
                "conversation is not initialized",
                ErrorContext::new().with_source("conversation"),
            )
        })?;
        if request.inputs.is_empty() {
            return Err(Error::runtime_with_context(
                "conversation request has no inputs",
                ErrorContext::new()
                    .with_field_path("inputs")
                    .with_source("conversation"),
            ));
        }

        let chat = ChatRequest {
            messages: request
                .inputs
                .into_iter()
                .map(|input| ChatMessage::new(input.role, input.message))
                .collect(),
            temperature: request.temperature,
        };
        let completion = model.generate(&chat).await?;
        Ok(ConversationResponse {
            outputs: vec![ConversationResult {
                result: completion.content,
            }],
            context_id: request.context_id,
        })
    }
}

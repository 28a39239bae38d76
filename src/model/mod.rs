//! Model invocation seam.
//!
//! The wire protocol lives behind `ModelClient`; the core only sees normalized
//! stream events on a channel. A client implementation stops producing when
//! the receiver is dropped, which is how cancellation reaches it.

pub mod abort;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ChatError;
use crate::store::{GeneratedImage, Role};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelPart {
    Text(String),
    /// Base64 payload with its mime type, e.g. an attachment made inline.
    InlineData { mime_type: String, data: String },
}

#[derive(Debug, Clone)]
pub struct ModelTurn {
    pub role: Role,
    pub parts: Vec<ModelPart>,
}

impl ModelTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            parts: vec![ModelPart::Text(text.into())],
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            parts: vec![ModelPart::Text(text.into())],
        }
    }
}

/// Everything a provider needs for one generation.
#[derive(Debug, Clone)]
pub struct ModelContext {
    pub system_instruction: String,
    pub turns: Vec<ModelTurn>,
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub model: String,
    pub api_key: String,
    pub thinking_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    /// Content-policy block with the provider's stated reason.
    Blocked(String),
    /// Transport or provider failure.
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Text(String),
    Thinking(String),
    Image(GeneratedImage),
    Grounding(String),
    Finished(FinishReason),
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Stream one response into `events`, ending with exactly one
    /// `Finished`. Send errors mean the consumer hung up (abort); stop.
    async fn generate(
        &self,
        context: ModelContext,
        config: GenerationConfig,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ChatError>;
}

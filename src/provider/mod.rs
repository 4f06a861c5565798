//! Provider-agnostic model facade.
//!
//! The orchestration core talks to exactly one abstraction for text
//! generation, delta streaming and embeddings; concrete backends (currently
//! Ollama, plus a scripted double for tests) plug in behind [`ModelProvider`].

pub mod mock;
pub mod ollama;

use std::fmt::Debug;

use async_trait::async_trait;
use schemars::Schema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: PromptRole::System, content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: PromptRole::User, content: content.into() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: PromptRole::Assistant, content: content.into() }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self { role: PromptRole::Tool, content: content.into() }
    }
}

/// One generation request. `format` switches the provider into its
/// structured-output mode so the reply conforms to the given JSON schema.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: Option<String>,
    pub messages: Vec<PromptMessage>,
    pub format: Option<Schema>,
}

impl GenerateRequest {
    pub fn new(messages: Vec<PromptMessage>) -> Self {
        Self { model: None, messages, format: None }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_format(mut self, schema: Schema) -> Self {
        self.format = Some(schema);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct TextOutput {
    pub output: String,
    pub usage: Usage,
}

#[derive(Debug, Clone)]
pub struct EmbeddingOutput {
    pub vector: Vec<f32>,
    pub tokens_used: u32,
}

/// Receiver of streamed text deltas. Dropped by the consumer on disconnect;
/// the producing side must notice the cancellation token promptly.
pub type DeltaStream = mpsc::Receiver<String>;

#[async_trait]
pub trait ModelProvider: Send + Sync + Debug {
    async fn generate_text(&self, req: GenerateRequest) -> Result<TextOutput, ProviderError>;

    /// Streamed variant of [`generate_text`](ModelProvider::generate_text).
    /// Delta production must stop promptly once `cancel` fires.
    async fn generate_text_stream(
        &self,
        req: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, ProviderError>;

    async fn generate_embeddings(&self, text: &str) -> Result<EmbeddingOutput, ProviderError>;
}

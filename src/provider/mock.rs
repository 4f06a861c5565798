//! Scripted provider double used by unit and integration tests. Ships in
//! `src/` so host crates can drive the broker without a live model.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::provider::{
    DeltaStream, EmbeddingOutput, GenerateRequest, ModelProvider, TextOutput, Usage,
};

/// Replays queued replies in order and records every request it saw.
/// Embedding vectors are deterministic functions of the input text, so
/// byte-identical text always embeds to the same vector.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<GenerateRequest>>,
    preset_embeddings: DashMap<String, Vec<f32>>,
    embed_calls: AtomicUsize,
    fail_embeddings: AtomicBool,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the next text reply (also used for structured-output turns:
    /// script the JSON the model would have produced).
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.replies.lock().expect("replies poisoned").push_back(reply.into());
    }

    /// Fixes the embedding vector for a given text.
    pub fn preset_embedding(&self, text: impl Into<String>, vector: Vec<f32>) {
        self.preset_embeddings.insert(text.into(), vector);
    }

    /// Makes all subsequent embedding calls fail.
    pub fn fail_embeddings(&self, fail: bool) {
        self.fail_embeddings.store(fail, Ordering::SeqCst);
    }

    /// Number of embedding calls actually issued (cache-idempotence checks).
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Every generate request seen so far, in order.
    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().expect("requests poisoned").clone()
    }

    fn deterministic_vector(text: &str) -> Vec<f32> {
        // Cheap byte-fold; only determinism matters for tests, not geometry.
        let mut vector = vec![0f32; 8];
        for (i, byte) in text.bytes().enumerate() {
            vector[i % 8] += byte as f32 / 255.0;
        }
        vector
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn generate_text(&self, req: GenerateRequest) -> Result<TextOutput, ProviderError> {
        self.requests.lock().expect("requests poisoned").push(req);
        let reply = self
            .replies
            .lock()
            .expect("replies poisoned")
            .pop_front()
            .ok_or(ProviderError::EmptyOutput)?;
        Ok(TextOutput { output: reply, usage: Usage::default() })
    }

    async fn generate_text_stream(
        &self,
        req: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, ProviderError> {
        let text = self.generate_text(req).await?.output;
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for delta in crate::provider::ollama::split_deltas(&text) {
                if cancel.is_cancelled() {
                    break;
                }
                if tx.send(delta).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn generate_embeddings(&self, text: &str) -> Result<EmbeddingOutput, ProviderError> {
        if self.fail_embeddings.load(Ordering::SeqCst) {
            return Err(ProviderError::Request("scripted embedding failure".into()));
        }
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let vector = self
            .preset_embeddings
            .get(text)
            .map(|v| v.clone())
            .unwrap_or_else(|| Self::deterministic_vector(text));
        let tokens_used = (text.len() / 4).max(1) as u32;
        Ok(EmbeddingOutput { vector, tokens_used })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::PromptMessage;

    #[tokio::test]
    async fn test_replies_are_replayed_in_order() {
        let provider = ScriptedProvider::new();
        provider.push_reply("one");
        provider.push_reply("two");

        let req = || GenerateRequest::new(vec![PromptMessage::user("hi")]);
        assert_eq!(provider.generate_text(req()).await.unwrap().output, "one");
        assert_eq!(provider.generate_text(req()).await.unwrap().output, "two");
        assert!(provider.generate_text(req()).await.is_err());
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_embeddings_are_deterministic_and_counted() {
        let provider = ScriptedProvider::new();
        let a = provider.generate_embeddings("same text").await.unwrap();
        let b = provider.generate_embeddings("same text").await.unwrap();
        assert_eq!(a.vector, b.vector);
        assert_eq!(provider.embed_calls(), 2);

        provider.fail_embeddings(true);
        assert!(provider.generate_embeddings("same text").await.is_err());
        assert_eq!(provider.embed_calls(), 2);
    }

    #[tokio::test]
    async fn test_stream_delivers_all_deltas() {
        let provider = ScriptedProvider::new();
        provider.push_reply("streamed reply here");
        let req = GenerateRequest::new(vec![PromptMessage::user("hi")]);
        let mut rx = provider
            .generate_text_stream(req, CancellationToken::new())
            .await
            .unwrap();

        let mut out = String::new();
        while let Some(delta) = rx.recv().await {
            out.push_str(&delta);
        }
        assert_eq!(out, "streamed reply here");
    }
}

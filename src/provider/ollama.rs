use async_trait::async_trait;
use ollama_rs::Ollama;
use ollama_rs::generation::chat::{ChatMessage, request::ChatMessageRequest};
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};
use ollama_rs::generation::parameters::{FormatType, JsonStructure};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::error;
use url::Url;

use crate::error::ProviderError;
use crate::provider::{
    DeltaStream, EmbeddingOutput, GenerateRequest, ModelProvider, PromptRole, TextOutput, Usage,
};

/// `OllamaProvider` talks to a local or remote Ollama server via `ollama_rs`.
/// If `url` carries a port it is used directly; an `api_key` switches the
/// underlying reqwest client to bearer-token auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaProvider {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub model: String,
    pub embed_model: String,
}

impl Default for OllamaProvider {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            model: "llama3.2:1b".into(),
            embed_model: "nomic-embed-text".into(),
        }
    }
}

impl OllamaProvider {
    pub fn new(url: Option<Url>, api_key: Option<String>, model: String, embed_model: String) -> Self {
        Self { url, api_key, model, embed_model }
    }

    fn build_client(&self) -> Result<Ollama, ProviderError> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &self.api_key {
            let val = format!("Bearer {}", key);
            let hv = HeaderValue::from_str(&val)
                .map_err(|e| ProviderError::Request(format!("invalid api key header: {e}")))?;
            headers.insert(AUTHORIZATION, hv);
        }

        match &self.url {
            Some(url) => {
                // Many users pass e.g. http://host:11434 — without a port we
                // fall back to the default constructor.
                if let Some(port) = url.port() {
                    if headers.is_empty() {
                        Ok(Ollama::new(url.clone(), port))
                    } else {
                        let client = reqwest::Client::builder()
                            .default_headers(headers)
                            .timeout(std::time::Duration::from_secs(60))
                            .build()
                            .map_err(|e| ProviderError::Request(format!("reqwest client: {e}")))?;
                        Ok(Ollama::new_with_client(url.clone(), port, client))
                    }
                } else {
                    Ok(Ollama::default())
                }
            }
            None => Ok(Ollama::default()),
        }
    }

    fn chat_history(req: &GenerateRequest) -> Vec<ChatMessage> {
        req.messages
            .iter()
            .map(|m| match m.role {
                PromptRole::System => ChatMessage::system(m.content.clone()),
                PromptRole::User => ChatMessage::user(m.content.clone()),
                PromptRole::Assistant => ChatMessage::assistant(m.content.clone()),
                // Ollama has no first-class tool-result turn in plain chat
                // mode; tool output rides in a tagged user turn instead.
                PromptRole::Tool => ChatMessage::user(format!("[tool result] {}", m.content)),
            })
            .collect()
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    #[tracing::instrument(name = "ollama_generate_text", skip(self, req))]
    async fn generate_text(&self, req: GenerateRequest) -> Result<TextOutput, ProviderError> {
        let client = self.build_client()?;
        let model = req.model.clone().unwrap_or_else(|| self.model.clone());
        let history = Self::chat_history(&req);

        let mut chat_req = ChatMessageRequest::new(model, history);
        if let Some(schema) = &req.format {
            let format =
                FormatType::StructuredJson(Box::new(JsonStructure::new_for_schema(schema.clone())));
            chat_req = chat_req.format(format);
        }

        let resp = client
            .send_chat_messages_with_history(&mut vec![], chat_req)
            .await
            .map_err(|e| {
                error!("LLM gave error: {:?}", e);
                ProviderError::Request(format!("chat request failed: {e}"))
            })?;

        let output = resp.message.content;
        if output.is_empty() {
            return Err(ProviderError::EmptyOutput);
        }
        Ok(TextOutput { output, usage: Usage::default() })
    }

    async fn generate_text_stream(
        &self,
        req: GenerateRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream, ProviderError> {
        // ollama-rs is pinned without its `stream` feature, so deltas are
        // framed here: the completed reply is chunked word-by-word into the
        // channel. The facade contract (ordered deltas, prompt cancellation)
        // is what callers rely on.
        let text = self.generate_text(req).await?.output;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for word in split_deltas(&text) {
                if cancel.is_cancelled() {
                    break;
                }
                if tx.send(word).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    #[tracing::instrument(name = "ollama_generate_embeddings", skip(self, text))]
    async fn generate_embeddings(&self, text: &str) -> Result<EmbeddingOutput, ProviderError> {
        let client = self.build_client()?;
        let req = GenerateEmbeddingsRequest::new(
            self.embed_model.clone(),
            EmbeddingsInput::Single(text.to_string()),
        );
        let resp = client
            .generate_embeddings(req)
            .await
            .map_err(|e| ProviderError::Request(format!("embed request failed: {e}")))?;

        let vector = resp
            .embeddings
            .into_iter()
            .next()
            .ok_or(ProviderError::EmptyOutput)?;
        if vector.is_empty() {
            return Err(ProviderError::EmptyOutput);
        }

        // Ollama does not report embedding token usage; a ~4 chars/token
        // estimate keeps chunk cost accounting populated.
        let tokens_used = (text.len() / 4).max(1) as u32;
        Ok(EmbeddingOutput { vector, tokens_used })
    }
}

/// Splits a completed reply into whitespace-preserving chunks so the client
/// sees word-granular deltas.
pub(crate) fn split_deltas(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_deltas_reassembles_exactly() {
        let text = "hello  world,\nthis is streamed";
        let deltas = split_deltas(text);
        assert!(deltas.len() > 1);
        assert_eq!(deltas.concat(), text);
    }

    #[test]
    fn test_split_deltas_empty() {
        assert!(split_deltas("").is_empty());
    }

    #[tokio::test]
    async fn test_bad_endpoint_errors() {
        let provider = OllamaProvider {
            url: Some(Url::parse("http://127.0.0.1:1/").unwrap()),
            ..Default::default()
        };
        let req = GenerateRequest::new(vec![crate::provider::PromptMessage::user("hi")]);
        let err = provider.generate_text(req).await.unwrap_err();
        assert!(matches!(err, ProviderError::Request(_)));
    }
}

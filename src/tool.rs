//! Externally callable tools bound to a conversation.
//!
//! Two distinct callers share this module: the flow executor's tool node
//! (one invocation, branch on outcome) and the free-form chat loop (the
//! model may request tool calls recursively, bounded by `max_steps`).

use std::collections::HashMap;
use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attribute::AttributeStore;
use crate::error::ToolCallError;
use crate::events::EventSink;
use crate::provider::{GenerateRequest, ModelProvider, PromptMessage};

/// Placeholder grammar: `{name}`, `{name:type}`, `{name:type:fallback}`.
/// A placeholder with no bound value falls back to its fallback literal, or
/// fails validation if none is given.
static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([A-Za-z0-9_][A-Za-z0-9_ .\-]*?)(?::([a-z]+))?(?::([^{}]*))?\}")
        .expect("placeholder regex is valid")
});

/// An authored tool document. Unknown fields from the authoring UI are
/// ignored on deserialization, never treated as errors.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub allow_direct_use: bool,
    pub config: ToolConfig,
    #[serde(default)]
    pub response_schema: ResponseSchema,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ToolConfig {
    pub api_request: ApiRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub attributes_used: Vec<String>,
}

fn default_method() -> String {
    "GET".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ResponseSchema {
    #[serde(default)]
    pub properties: Vec<ResponseProperty>,
    #[serde(default)]
    pub arrays: Vec<ResponseArray>,
}

/// Maps a JSON response field to an optional conversation attribute.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResponseProperty {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribute: Option<String>,
}

/// Names a JSON array path usable by downstream dynamic-cards nodes.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ResponseArray {
    pub name: String,
    pub path: String,
}

impl Tool {
    pub fn array_path(&self, name: &str) -> Option<&str> {
        self.response_schema
            .arrays
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.path.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub success: bool,
    pub status: Option<u16>,
    pub response_body: Value,
    pub attribute_updates: Vec<(String, String)>,
}

/// Catalog of tools bound to the agent. The broker filters on
/// `active && allow_direct_use` for model-initiated calls.
#[async_trait]
pub trait ToolCatalog: Send + Sync + Debug {
    async fn get(&self, id: &str) -> Option<Tool>;
    async fn all(&self) -> Vec<Tool>;
}

#[derive(Debug, Default)]
pub struct InMemoryToolCatalog {
    tools: DashMap<String, Tool>,
}

impl InMemoryToolCatalog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, tool: Tool) {
        self.tools.insert(tool.id.clone(), tool);
    }
}

#[async_trait]
impl ToolCatalog for InMemoryToolCatalog {
    async fn get(&self, id: &str) -> Option<Tool> {
        self.tools.get(id).map(|t| t.clone())
    }

    async fn all(&self) -> Vec<Tool> {
        self.tools.iter().map(|t| t.clone()).collect()
    }
}

/// Substitutes every placeholder in `template` from `lookup`. Missing values
/// use the placeholder's fallback literal; a required placeholder with no
/// value and no fallback is an error.
pub fn substitute_placeholders(
    template: &str,
    lookup: &HashMap<String, String>,
) -> Result<String, ToolCallError> {
    let mut out = String::with_capacity(template.len());
    let mut last_end = 0;
    for caps in PLACEHOLDER_RE.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        out.push_str(&template[last_end..whole.start()]);
        let name = caps.get(1).expect("name group").as_str();
        match lookup.get(name) {
            Some(value) => out.push_str(value),
            None => match caps.get(3) {
                Some(fallback) => out.push_str(fallback.as_str()),
                None => return Err(ToolCallError::MissingAttribute(name.to_string())),
            },
        }
        last_end = whole.end();
    }
    out.push_str(&template[last_end..]);
    Ok(out)
}

/// Best-effort variant used for user-facing message text: an unbound
/// placeholder renders as its fallback literal, or as nothing.
pub fn substitute_placeholders_lenient(template: &str, lookup: &HashMap<String, String>) -> String {
    PLACEHOLDER_RE
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let name = caps.get(1).expect("name group").as_str();
            lookup
                .get(name)
                .cloned()
                .or_else(|| caps.get(3).map(|f| f.as_str().to_string()))
                .unwrap_or_default()
        })
        .into_owned()
}

/// Placeholder names referenced by `template`, in order of appearance.
pub fn placeholder_names(template: &str) -> Vec<String> {
    PLACEHOLDER_RE
        .captures_iter(template)
        .map(|c| c.get(1).expect("name group").as_str().to_string())
        .collect()
}

/// Resolves a dot-separated path (`order.items.0.sku`) into a JSON value.
pub fn json_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        if segment.is_empty() {
            continue;
        }
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn value_as_attribute_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Executes one HTTP tool call with placeholder substitution and
/// response-to-attribute mapping.
#[derive(Debug, Clone)]
pub struct ToolInvoker {
    http: reqwest::Client,
}

impl Default for ToolInvoker {
    fn default() -> Self {
        Self { http: reqwest::Client::new() }
    }
}

impl ToolInvoker {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }

    /// Invokes `tool` for `conversation_id`. `overrides` win over stored
    /// attributes during substitution (used for model-supplied arguments).
    ///
    /// Network and non-2xx failures come back as `Ok` with
    /// `success == false` so callers can branch; validation failures
    /// (missing required placeholder, bad URL/header) are errors.
    #[tracing::instrument(name = "tool_invoke", skip(self, tool, attributes, overrides), fields(tool_id = %tool.id))]
    pub async fn invoke(
        &self,
        tool: &Tool,
        conversation_id: &str,
        attributes: &Arc<dyn AttributeStore>,
        overrides: &HashMap<String, String>,
    ) -> Result<ToolResult, ToolCallError> {
        let request = &tool.config.api_request;
        let lookup = self
            .resolve_lookup(request, conversation_id, attributes, overrides)
            .await;

        let url = substitute_placeholders(&request.url, &lookup)?;
        let url = url::Url::parse(&url).map_err(|e| ToolCallError::InvalidUrl(e.to_string()))?;
        let method = reqwest::Method::from_str(&request.method.to_uppercase())
            .map_err(|_| ToolCallError::Http(format!("invalid method `{}`", request.method)))?;

        let mut headers = HeaderMap::new();
        for (key, value) in &request.headers {
            let value = substitute_placeholders(value, &lookup)?;
            let name = HeaderName::from_str(key)
                .map_err(|_| ToolCallError::InvalidHeader(key.clone()))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| ToolCallError::InvalidHeader(key.clone()))?;
            headers.insert(name, value);
        }

        let mut req = self.http.request(method, url).headers(headers);
        if let Some(body) = &request.body {
            let body = substitute_placeholders(body, &lookup)?;
            req = match serde_json::from_str::<Value>(&body) {
                Ok(json_body) => req.json(&json_body),
                Err(_) => req.body(body),
            };
        }

        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(tool_id = %tool.id, "tool request failed: {e}");
                return Ok(ToolResult {
                    success: false,
                    status: None,
                    response_body: json!({ "error": e.to_string() }),
                    attribute_updates: Vec::new(),
                });
            }
        };

        let status = resp.status();
        let raw = resp.text().await.unwrap_or_default();
        let response_body =
            serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| json!({ "text": raw }));

        if !status.is_success() {
            return Ok(ToolResult {
                success: false,
                status: Some(status.as_u16()),
                response_body,
                attribute_updates: Vec::new(),
            });
        }

        let mut attribute_updates = Vec::new();
        for prop in &tool.response_schema.properties {
            let Some(attr) = &prop.attribute else { continue };
            // Unknown paths in the response are skipped, not errors.
            let Some(value) = json_path(&response_body, &prop.path) else {
                debug!(path = %prop.path, "response path absent, mapping skipped");
                continue;
            };
            let value = value_as_attribute_string(value);
            attributes.set(conversation_id, attr, value.clone()).await;
            attribute_updates.push((attr.clone(), value));
        }

        Ok(ToolResult {
            success: true,
            status: Some(status.as_u16()),
            response_body,
            attribute_updates,
        })
    }

    async fn resolve_lookup(
        &self,
        request: &ApiRequest,
        conversation_id: &str,
        attributes: &Arc<dyn AttributeStore>,
        overrides: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut names: Vec<String> = placeholder_names(&request.url);
        for value in request.headers.values() {
            names.extend(placeholder_names(value));
        }
        if let Some(body) = &request.body {
            names.extend(placeholder_names(body));
        }
        names.extend(request.attributes_used.iter().cloned());

        let mut lookup = HashMap::new();
        for name in names {
            if lookup.contains_key(&name) {
                continue;
            }
            if let Some(value) = overrides.get(&name) {
                lookup.insert(name, value.clone());
            } else if let Some(value) = attributes.get(conversation_id, &name).await {
                lookup.insert(name, value);
            }
        }
        lookup
    }
}

/// Structured reply the model is forced into while tools are bound: either a
/// final answer or a request to call one tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentTurnReply {
    Say {
        text: String,
    },
    CallTool {
        tool_id: String,
        #[serde(default)]
        arguments: HashMap<String, String>,
    },
}

/// Borrowed per-turn context for the chat loop.
#[derive(Clone)]
pub struct ChatLoopContext<'a> {
    pub conversation_id: &'a str,
    pub tools: &'a [Tool],
    pub attributes: &'a Arc<dyn AttributeStore>,
    pub events: &'a Arc<dyn EventSink>,
    pub cancel: CancellationToken,
}

/// The recursive model-tool-call loop used during free-form chat. The step
/// counter is threaded by value through each recursive call so the bound is
/// independent of any shared state.
#[derive(Debug, Clone)]
pub struct ChatLoop {
    provider: Arc<dyn ModelProvider>,
    invoker: ToolInvoker,
    model: Option<String>,
    max_steps: usize,
}

impl ChatLoop {
    pub fn new(provider: Arc<dyn ModelProvider>, invoker: ToolInvoker, max_steps: usize) -> Self {
        Self { provider, invoker, model: None, max_steps }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Runs the loop to completion, streaming the final answer's deltas to
    /// the event sink, and returns the full answer text.
    pub async fn run(
        &self,
        ctx: ChatLoopContext<'_>,
        mut messages: Vec<PromptMessage>,
    ) -> Result<String, ToolCallError> {
        if !ctx.tools.is_empty() {
            messages.insert(0, PromptMessage::system(tool_instructions(ctx.tools)));
        }
        self.step(ctx, messages, 0, String::new()).await
    }

    fn step<'a>(
        &'a self,
        ctx: ChatLoopContext<'a>,
        messages: Vec<PromptMessage>,
        step: usize,
        last_text: String,
    ) -> BoxFuture<'a, Result<String, ToolCallError>> {
        Box::pin(async move {
            if ctx.cancel.is_cancelled() {
                return Ok(last_text);
            }
            // Bound reached: return the last textual output, no further calls.
            if step >= self.max_steps {
                debug!(step, "tool loop bound reached");
                return Ok(last_text);
            }

            if ctx.tools.is_empty() {
                return self.stream_final(ctx, messages).await;
            }

            let mut req = GenerateRequest::new(messages.clone())
                .with_format(schema_for!(AgentTurnReply));
            req.model = self.model.clone();
            let output = self.provider.generate_text(req).await?.output;
            let reply: AgentTurnReply = serde_json::from_str(&output)
                .map_err(|e| ToolCallError::MalformedReply(e.to_string()))?;

            match reply {
                AgentTurnReply::Say { text } => {
                    self.emit_deltas(&ctx, &text);
                    Ok(text)
                }
                AgentTurnReply::CallTool { tool_id, arguments } => {
                    let mut messages = messages;
                    messages.push(PromptMessage::assistant(
                        json!({ "action": "call_tool", "tool_id": tool_id }).to_string(),
                    ));
                    let result_json = self
                        .execute_requested_call(&ctx, &tool_id, &arguments)
                        .await;
                    ctx.events.debug("tool_call", &result_json);
                    messages.push(PromptMessage::tool(result_json.to_string()));
                    self.step(ctx, messages, step + 1, last_text).await
                }
            }
        })
    }

    /// A failed call is fed back to the model as an error-shaped result; the
    /// loop itself keeps going until the step cap.
    async fn execute_requested_call(
        &self,
        ctx: &ChatLoopContext<'_>,
        tool_id: &str,
        arguments: &HashMap<String, String>,
    ) -> Value {
        let Some(tool) = ctx.tools.iter().find(|t| t.id == tool_id) else {
            warn!(tool_id, "model requested unknown tool");
            return json!({ "tool_id": tool_id, "success": false, "error": "unknown tool" });
        };
        match self
            .invoker
            .invoke(tool, ctx.conversation_id, ctx.attributes, arguments)
            .await
        {
            Ok(result) => json!({
                "tool_id": tool_id,
                "success": result.success,
                "status": result.status,
                "response": result.response_body,
            }),
            Err(e) => json!({ "tool_id": tool_id, "success": false, "error": e.to_string() }),
        }
    }

    async fn stream_final(
        &self,
        ctx: ChatLoopContext<'_>,
        messages: Vec<PromptMessage>,
    ) -> Result<String, ToolCallError> {
        let mut req = GenerateRequest::new(messages);
        req.model = self.model.clone();
        let mut rx = self
            .provider
            .generate_text_stream(req, ctx.cancel.clone())
            .await?;

        let mut text = String::new();
        while let Some(delta) = rx.recv().await {
            if ctx.cancel.is_cancelled() {
                break;
            }
            ctx.events.response_delta(&delta);
            text.push_str(&delta);
        }
        ctx.events.end_delta_stream();
        Ok(text)
    }

    fn emit_deltas(&self, ctx: &ChatLoopContext<'_>, text: &str) {
        for delta in crate::provider::ollama::split_deltas(text) {
            if ctx.cancel.is_cancelled() {
                break;
            }
            ctx.events.response_delta(&delta);
        }
        ctx.events.end_delta_stream();
    }
}

fn tool_instructions(tools: &[Tool]) -> String {
    let mut out = String::from(
        "You can call external tools. Reply with JSON matching the given \
         schema: either {\"action\":\"say\",\"text\":...} to answer the \
         customer, or {\"action\":\"call_tool\",\"tool_id\":...,\"arguments\":{...}} \
         to call one of:\n",
    );
    for tool in tools {
        out.push_str(&format!(
            "- {} ({}): {}\n",
            tool.id,
            tool.name,
            tool.description.as_deref().unwrap_or("no description")
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::InMemoryAttributeStore;
    use crate::events::RecordingEventSink;
    use crate::provider::mock::ScriptedProvider;

    fn lookup(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_substitute_bound_value() {
        let out = substitute_placeholders(
            "https://api.test/orders/{order_id}",
            &lookup(&[("order_id", "81")]),
        )
        .unwrap();
        assert_eq!(out, "https://api.test/orders/81");
    }

    #[test]
    fn test_substitute_fallback_literal() {
        let out = substitute_placeholders("limit={limit:number:10}", &lookup(&[])).unwrap();
        assert_eq!(out, "limit=10");
    }

    #[test]
    fn test_lenient_substitution_never_fails() {
        let out = substitute_placeholders_lenient(
            "Hi {name}, order {order_id:number:unknown} is on its way",
            &lookup(&[("name", "Ada")]),
        );
        assert_eq!(out, "Hi Ada, order unknown is on its way");
        assert_eq!(substitute_placeholders_lenient("{gone}", &lookup(&[])), "");
    }

    #[test]
    fn test_substitute_typed_without_fallback_uses_value() {
        let out =
            substitute_placeholders("{count:number}", &lookup(&[("count", "3")])).unwrap();
        assert_eq!(out, "3");
    }

    #[test]
    fn test_missing_required_placeholder_fails_validation() {
        let err = substitute_placeholders("{order_id}", &lookup(&[])).unwrap_err();
        assert!(matches!(err, ToolCallError::MissingAttribute(name) if name == "order_id"));
    }

    #[test]
    fn test_placeholder_names() {
        let names = placeholder_names("{a} and {b:text:x} and {a}");
        assert_eq!(names, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_json_path() {
        let value = json!({ "order": { "items": [ { "sku": "A-1" } ] } });
        assert_eq!(json_path(&value, "order.items.0.sku"), Some(&json!("A-1")));
        assert_eq!(json_path(&value, "order.items.1.sku"), None);
        assert_eq!(json_path(&value, "missing"), None);
    }

    #[test]
    fn test_tool_document_ignores_unknown_fields() {
        let raw = json!({
            "id": "t1",
            "name": "orders",
            "config": { "apiRequest": { "url": "https://api.test" } },
            "responseSchema": { "properties": [], "arrays": [], "futureField": 1 },
            "someNewUiField": true,
        });
        let tool: Tool = serde_json::from_value(raw).unwrap();
        assert!(tool.active);
        assert!(!tool.allow_direct_use);
        assert_eq!(tool.config.api_request.method, "GET");
    }

    fn always_call_tool_provider(replies: usize) -> Arc<ScriptedProvider> {
        let provider = Arc::new(ScriptedProvider::new());
        for _ in 0..replies {
            provider.push_reply(
                r#"{"action":"call_tool","tool_id":"t-missing","arguments":{}}"#,
            );
        }
        provider
    }

    fn unreachable_tool() -> Tool {
        serde_json::from_value(json!({
            "id": "t-missing",
            "name": "nope",
            "config": { "apiRequest": { "url": "http://127.0.0.1:1/x" } },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_chat_loop_terminates_at_step_cap() {
        // The model asks for a tool on every step; the loop must stop after
        // exactly max_steps model calls and return the last available text.
        let provider = always_call_tool_provider(10);
        let attributes: Arc<dyn AttributeStore> = InMemoryAttributeStore::new();
        let events: Arc<dyn EventSink> = RecordingEventSink::new();
        let tools = vec![unreachable_tool()];

        let chat = ChatLoop::new(provider.clone(), ToolInvoker::default(), 3);
        let ctx = ChatLoopContext {
            conversation_id: "c1",
            tools: &tools,
            attributes: &attributes,
            events: &events,
            cancel: CancellationToken::new(),
        };
        let text = chat.run(ctx, vec![PromptMessage::user("hi")]).await.unwrap();

        assert_eq!(text, "");
        assert_eq!(provider.requests().len(), 3);
    }

    #[tokio::test]
    async fn test_chat_loop_say_streams_deltas() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_reply(r#"{"action":"say","text":"all sorted now"}"#);
        let attributes: Arc<dyn AttributeStore> = InMemoryAttributeStore::new();
        let sink = RecordingEventSink::new();
        let events: Arc<dyn EventSink> = sink.clone();
        let tools = vec![unreachable_tool()];

        let chat = ChatLoop::new(provider, ToolInvoker::default(), 5);
        let ctx = ChatLoopContext {
            conversation_id: "c1",
            tools: &tools,
            attributes: &attributes,
            events: &events,
            cancel: CancellationToken::new(),
        };
        let text = chat.run(ctx, vec![PromptMessage::user("hi")]).await.unwrap();

        assert_eq!(text, "all sorted now");
        assert_eq!(sink.streamed_text(), "all sorted now");
    }

    #[tokio::test]
    async fn test_chat_loop_without_tools_streams_directly() {
        let provider = Arc::new(ScriptedProvider::new());
        provider.push_reply("plain streamed answer");
        let attributes: Arc<dyn AttributeStore> = InMemoryAttributeStore::new();
        let sink = RecordingEventSink::new();
        let events: Arc<dyn EventSink> = sink.clone();

        let chat = ChatLoop::new(provider, ToolInvoker::default(), 5);
        let ctx = ChatLoopContext {
            conversation_id: "c1",
            tools: &[],
            attributes: &attributes,
            events: &events,
            cancel: CancellationToken::new(),
        };
        let text = chat.run(ctx, vec![PromptMessage::user("hi")]).await.unwrap();

        assert_eq!(text, "plain streamed answer");
        assert_eq!(sink.streamed_text(), "plain streamed answer");
    }

    #[tokio::test]
    async fn test_chat_loop_cancellation_stops_immediately() {
        let provider = always_call_tool_provider(10);
        let attributes: Arc<dyn AttributeStore> = InMemoryAttributeStore::new();
        let events: Arc<dyn EventSink> = RecordingEventSink::new();
        let tools = vec![unreachable_tool()];

        let cancel = CancellationToken::new();
        cancel.cancel();
        let chat = ChatLoop::new(provider.clone(), ToolInvoker::default(), 5);
        let ctx = ChatLoopContext {
            conversation_id: "c1",
            tools: &tools,
            attributes: &attributes,
            events: &events,
            cancel,
        };
        let text = chat.run(ctx, vec![PromptMessage::user("hi")]).await.unwrap();

        assert_eq!(text, "");
        assert!(provider.requests().is_empty());
    }

    #[tokio::test]
    async fn test_invoke_network_failure_is_a_failed_result_not_an_error() {
        let attributes: Arc<dyn AttributeStore> = InMemoryAttributeStore::new();
        let invoker = ToolInvoker::default();
        let result = invoker
            .invoke(&unreachable_tool(), "c1", &attributes, &HashMap::new())
            .await
            .unwrap();
        assert!(!result.success);
        assert!(result.status.is_none());
    }

    #[tokio::test]
    async fn test_invoke_missing_required_attribute_is_an_error() {
        let attributes: Arc<dyn AttributeStore> = InMemoryAttributeStore::new();
        let tool: Tool = serde_json::from_value(json!({
            "id": "t1",
            "name": "orders",
            "config": { "apiRequest": { "url": "http://127.0.0.1:1/orders/{order_id}" } },
        }))
        .unwrap();

        let err = ToolInvoker::default()
            .invoke(&tool, "c1", &attributes, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolCallError::MissingAttribute(_)));
    }

    #[tokio::test]
    async fn test_invoke_overrides_win_over_attributes() {
        let store = InMemoryAttributeStore::new();
        store.set("c1", "order_id", "stored".into()).await;
        let attributes: Arc<dyn AttributeStore> = store;

        // Unroutable host: we only check substitution happened, which shows
        // up in the missing-attribute error NOT firing and the URL parsing.
        let tool: Tool = serde_json::from_value(json!({
            "id": "t1",
            "name": "orders",
            "config": { "apiRequest": { "url": "http://127.0.0.1:1/orders/{order_id}" } },
        }))
        .unwrap();
        let overrides = lookup(&[("order_id", "81")]);
        let result = ToolInvoker::default()
            .invoke(&tool, "c1", &attributes, &overrides)
            .await
            .unwrap();
        assert!(!result.success);
    }
}

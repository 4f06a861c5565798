//! Top-level turn sequencing.
//!
//! One call per inbound user message runs the decision table: an active
//! flow session gets first claim on the turn; otherwise the classifier
//! routes the message to a new flow, a human handoff, or free-form
//! assistance over retrieved knowledge. Whatever goes wrong internally,
//! the customer gets a reply.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::attribute::AttributeStore;
use crate::classifier::{Classifier, ClassifierCode};
use crate::error::BrokerError;
use crate::events::EventSink;
use crate::flow::compiler::compile;
use crate::flow::{AgentSession, ExecContext, Flow, FlowExecutor, SessionStore};
use crate::message::{ConversationLog, Message, MessageAuthor, MessageKind, NewMessage};
use crate::provider::{GenerateRequest, ModelProvider, PromptMessage};
use crate::retrieval::ChunkStore;
use crate::tool::{ChatLoop, ChatLoopContext, Tool, ToolCatalog, ToolInvoker};

/// Read access to the authored flows, in a stable order: the classifier's
/// intent codes index into this ordering.
#[async_trait]
pub trait FlowCatalog: Send + Sync + Debug {
    async fn flows(&self) -> Vec<Flow>;
}

#[derive(Debug, Default)]
pub struct InMemoryFlowCatalog {
    flows: std::sync::Mutex<Vec<Flow>>,
}

impl InMemoryFlowCatalog {
    pub fn new(flows: Vec<Flow>) -> Arc<Self> {
        Arc::new(Self { flows: std::sync::Mutex::new(flows) })
    }
}

#[async_trait]
impl FlowCatalog for InMemoryFlowCatalog {
    async fn flows(&self) -> Vec<Flow> {
        self.flows.lock().expect("flow catalog poisoned").clone()
    }
}

/// Hands a conversation over to the surrounding ticketing system.
#[async_trait]
pub trait HumanHandoff: Send + Sync + Debug {
    /// Reassigns the conversation to the first available human agent.
    /// Returns the assignee, if any.
    async fn assign_first_available(&self, conversation_id: &str) -> Option<String>;
}

/// Records handoff requests without routing them anywhere. Default for
/// embedded hosts and tests.
#[derive(Debug, Default)]
pub struct RecordingHandoff {
    requests: std::sync::Mutex<Vec<String>>,
}

impl RecordingHandoff {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("handoff poisoned").clone()
    }
}

#[async_trait]
impl HumanHandoff for RecordingHandoff {
    async fn assign_first_available(&self, conversation_id: &str) -> Option<String> {
        self.requests
            .lock()
            .expect("handoff poisoned")
            .push(conversation_id.to_string());
        None
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How many trailing messages feed the classifier and chat prompts.
    pub history_limit: usize,
    /// How many knowledge chunks back a free-form answer.
    pub retrieval_limit: usize,
    /// Knowledge scope (tenant/agent identifier) searches are restricted to.
    pub knowledge_scope: String,
    /// Recursion cap for the model-tool-call loop.
    pub max_tool_steps: usize,
    pub apology_text: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            history_limit: 20,
            retrieval_limit: 5,
            knowledge_scope: "default".into(),
            max_tool_steps: 5,
            apology_text: "Sorry, something went wrong on our side. Would you like me to \
                           transfer you to a human agent?"
                .into(),
        }
    }
}

/// Collaborators the broker sequences. All shared, all thread-safe.
pub struct BrokerDeps {
    pub provider: Arc<dyn ModelProvider>,
    pub chunks: Arc<ChunkStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub flows: Arc<dyn FlowCatalog>,
    pub tools: Arc<dyn ToolCatalog>,
    pub log: Arc<dyn ConversationLog>,
    pub attributes: Arc<dyn AttributeStore>,
    pub events: Arc<dyn EventSink>,
    pub handoff: Arc<dyn HumanHandoff>,
}

pub struct Broker {
    deps: BrokerDeps,
    classifier: Classifier,
    executor: FlowExecutor,
    config: BrokerConfig,
}

impl Broker {
    pub fn new(deps: BrokerDeps, config: BrokerConfig) -> Self {
        let classifier = Classifier::new(deps.provider.clone());
        Self { deps, classifier, executor: FlowExecutor::new(ToolInvoker::default()), config }
    }

    /// Entry point: processes the newest user message of the conversation.
    /// Calling it with no new consumable message is a no-op.
    pub async fn handle_inbound_message(&self, conversation_id: &str) {
        self.handle_inbound_with_cancel(conversation_id, CancellationToken::new())
            .await;
    }

    /// Same as [`handle_inbound_message`](Self::handle_inbound_message) with
    /// an external cancellation handle for client disconnects.
    #[tracing::instrument(name = "handle_inbound", skip(self, cancel))]
    pub async fn handle_inbound_with_cancel(
        &self,
        conversation_id: &str,
        cancel: CancellationToken,
    ) {
        let history = self
            .deps
            .log
            .recent(conversation_id, self.config.history_limit)
            .await;
        let Some(newest) = history.last().filter(|m| m.is_consumable_input()).cloned() else {
            return;
        };

        self.deps.events.typing();
        if let Err(e) = self.process_turn(conversation_id, &history, &newest, cancel).await {
            // Whatever failed, the customer still gets a reply.
            warn!(conversation_id, "turn failed, sending apology: {e}");
            self.deps.events.error(&e.to_string());
            self.deps
                .log
                .append(conversation_id, NewMessage::bot_text(self.config.apology_text.clone()))
                .await;
        }
    }

    async fn process_turn(
        &self,
        conversation_id: &str,
        history: &[Message],
        newest: &Message,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        let flows = self.deps.flows.flows().await;

        // An active session gets first claim on the turn.
        if let Some(mut session) = self.deps.sessions.get(conversation_id).await {
            if session.is_active() {
                if let Some(flow) = flows.iter().find(|f| f.id == session.active_flow_id) {
                    let compiled = compile(flow)?;
                    let ctx = self.exec_ctx(conversation_id);
                    let outcome = self
                        .executor
                        .advance(&compiled, &mut session, newest, &ctx)
                        .await;
                    self.store_session(conversation_id, session).await;
                    if outcome.executed_any_nodes {
                        return Ok(());
                    }
                } else {
                    warn!(flow_id = %session.active_flow_id, "session flow vanished");
                    self.deps.sessions.remove(conversation_id).await;
                }
            }
        }

        // The flow did not consume the turn; only plain text gets routed.
        if newest.kind() != MessageKind::Text {
            return Ok(());
        }

        let classification = self.classifier.classify(history, &flows).await?;
        match classification.code {
            ClassifierCode::FlowIntent(index) => {
                let flow = flows.get(index).ok_or(BrokerError::UnknownFlowIndex(index))?;
                info!(flow_id = %flow.id, "starting flow session");
                let compiled = compile(flow)?;
                let mut session = AgentSession::new(flow.id.clone());
                let ctx = self.exec_ctx(conversation_id);
                self.executor.start(&compiled, &mut session, &ctx).await;
                self.store_session(conversation_id, session).await;
                Ok(())
            }
            ClassifierCode::TransferToHuman => {
                self.transfer_to_human(conversation_id, history).await
            }
            ClassifierCode::Assistance => {
                self.assist(
                    conversation_id,
                    history,
                    &classification.disambiguated_user_message,
                    cancel,
                )
                .await
            }
        }
    }

    async fn transfer_to_human(
        &self,
        conversation_id: &str,
        history: &[Message],
    ) -> Result<(), BrokerError> {
        let mut messages = vec![PromptMessage::system(
            "Compose one short, warm message telling the customer you are \
             transferring them to a human agent who will pick this up shortly.",
        )];
        messages.extend(history.iter().map(as_prompt));
        let reply = self
            .deps
            .provider
            .generate_text(GenerateRequest::new(messages))
            .await?
            .output;

        let assignee = self
            .deps
            .handoff
            .assign_first_available(conversation_id)
            .await;
        info!(conversation_id, ?assignee, "conversation handed to human");
        self.deps
            .log
            .append(conversation_id, NewMessage::bot_text(reply))
            .await;
        Ok(())
    }

    async fn assist(
        &self,
        conversation_id: &str,
        history: &[Message],
        disambiguated: &str,
        cancel: CancellationToken,
    ) -> Result<(), BrokerError> {
        // Retrieval failure degrades to an answer without knowledge rather
        // than failing the turn.
        let chunks = match self
            .deps
            .chunks
            .search(disambiguated, self.config.retrieval_limit, &self.config.knowledge_scope)
            .await
        {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(conversation_id, "retrieval failed, answering without knowledge: {e}");
                Vec::new()
            }
        };

        let mut system = String::from(
            "You are a customer support assistant. Answer helpfully and \
             concisely. Do not invent order details.\n",
        );
        if !chunks.is_empty() {
            system.push_str("Relevant knowledge:\n");
            for chunk in &chunks {
                system.push_str("- ");
                system.push_str(&chunk.content);
                system.push('\n');
            }
        }

        let mut messages = vec![PromptMessage::system(system)];
        // The disambiguated form replaces the raw latest turn so the model
        // sees a self-contained question.
        if history.len() > 1 {
            messages.extend(history[..history.len() - 1].iter().map(as_prompt));
        }
        messages.push(PromptMessage::user(disambiguated));

        let tools: Vec<Tool> = self
            .deps
            .tools
            .all()
            .await
            .into_iter()
            .filter(|t| t.active && t.allow_direct_use)
            .collect();

        let chat = ChatLoop::new(
            self.deps.provider.clone(),
            ToolInvoker::default(),
            self.config.max_tool_steps,
        );
        let ctx = ChatLoopContext {
            conversation_id,
            tools: &tools,
            attributes: &self.deps.attributes,
            events: &self.deps.events,
            cancel,
        };
        let reply = chat.run(ctx, messages).await?;
        if !reply.is_empty() {
            self.deps
                .log
                .append(conversation_id, NewMessage::bot_text(reply))
                .await;
        }
        Ok(())
    }

    fn exec_ctx<'a>(&'a self, conversation_id: &'a str) -> ExecContext<'a> {
        ExecContext {
            conversation_id,
            log: &self.deps.log,
            attributes: &self.deps.attributes,
            events: &self.deps.events,
            tools: &self.deps.tools,
        }
    }

    async fn store_session(&self, conversation_id: &str, session: AgentSession) {
        if session.is_active() {
            self.deps.sessions.put(conversation_id, session).await;
        } else {
            self.deps.sessions.remove(conversation_id).await;
        }
    }
}

fn as_prompt(msg: &Message) -> PromptMessage {
    match msg.author() {
        MessageAuthor::User => PromptMessage::user(msg.body()),
        MessageAuthor::Bot => PromptMessage::assistant(msg.body()),
        MessageAuthor::System => PromptMessage::system(msg.body()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::InMemoryAttributeStore;
    use crate::events::RecordingEventSink;
    use crate::flow::session::MokaSessionStore;
    use crate::flow::{NodeKind, ParentRef, StoredNode};
    use crate::message::InMemoryConversationLog;
    use crate::provider::mock::ScriptedProvider;
    use crate::retrieval::InMemoryChunkRepository;
    use crate::tool::InMemoryToolCatalog;
    use serde_json::json;

    struct World {
        provider: Arc<ScriptedProvider>,
        log: Arc<InMemoryConversationLog>,
        sink: Arc<RecordingEventSink>,
        handoff: Arc<RecordingHandoff>,
        broker: Broker,
    }

    fn world(flows: Vec<Flow>) -> World {
        let provider = Arc::new(ScriptedProvider::new());
        let log = InMemoryConversationLog::new();
        let sink = RecordingEventSink::new();
        let handoff = RecordingHandoff::new();
        let chunks = Arc::new(ChunkStore::new(
            provider.clone(),
            InMemoryChunkRepository::new(),
        ));
        let deps = BrokerDeps {
            provider: provider.clone(),
            chunks,
            sessions: Arc::new(MokaSessionStore::default()),
            flows: InMemoryFlowCatalog::new(flows),
            tools: InMemoryToolCatalog::new(),
            log: log.clone(),
            attributes: InMemoryAttributeStore::new(),
            events: sink.clone(),
            handoff: handoff.clone(),
        };
        World {
            provider,
            log,
            sink,
            handoff,
            broker: Broker::new(deps, BrokerConfig::default()),
        }
    }

    fn greeting_flow(id: &str, intent: &str) -> Flow {
        Flow {
            id: id.into(),
            intent: Some(intent.into()),
            nodes: vec![
                StoredNode::new("hello", ParentRef::Start, NodeKind::Message)
                    .with_data(json!({ "text": format!("Starting {intent}") })),
            ],
        }
    }

    #[tokio::test]
    async fn test_no_consumable_message_is_a_noop() {
        let w = world(vec![]);
        w.broker.handle_inbound_message("c1").await;
        assert!(w.log.all("c1").is_empty());
        assert!(w.sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_classifier_failure_still_produces_a_reply() {
        let w = world(vec![]);
        w.provider.push_reply("definitely not json");
        w.log.append("c1", NewMessage::user_text("hello?")).await;

        w.broker.handle_inbound_message("c1").await;

        let last = w.log.all("c1").last().cloned().unwrap();
        assert!(last.body().contains("Sorry"));
        assert!(w
            .sink
            .events()
            .iter()
            .any(|e| matches!(e, crate::events::EmittedEvent::Error(_))));
    }

    #[tokio::test]
    async fn test_transfer_to_human_reassigns_and_replies() {
        let w = world(vec![]);
        w.provider.push_reply(r#"{"code": 0, "user_message": "wants a person"}"#);
        w.provider.push_reply("Connecting you with a colleague now.");
        w.log.append("c1", NewMessage::user_text("give me a human")).await;

        w.broker.handle_inbound_message("c1").await;

        assert_eq!(w.handoff.requests(), vec!["c1"]);
        let last = w.log.all("c1").last().cloned().unwrap();
        assert_eq!(last.body(), "Connecting you with a colleague now.");
    }

    #[tokio::test]
    async fn test_assistance_survives_retrieval_failure() {
        let w = world(vec![]);
        w.provider.fail_embeddings(true);
        w.provider.push_reply(r#"{"code": 1, "user_message": "how do refunds work"}"#);
        w.provider.push_reply("Refunds take 3-5 business days.");
        w.log.append("c1", NewMessage::user_text("how do refunds work")).await;

        w.broker.handle_inbound_message("c1").await;

        let last = w.log.all("c1").last().cloned().unwrap();
        assert_eq!(last.body(), "Refunds take 3-5 business days.");
        assert_eq!(w.sink.streamed_text(), "Refunds take 3-5 business days.");
    }

    #[tokio::test]
    async fn test_flow_intent_starts_the_indexed_flow() {
        let w = world(vec![
            greeting_flow("track", "track an order"),
            greeting_flow("refund", "request a refund"),
        ]);
        // Code 2 is flows[0].
        w.provider.push_reply(r#"{"code": 2, "user_message": "where is my order"}"#);
        w.log.append("c1", NewMessage::user_text("where is my order")).await;

        w.broker.handle_inbound_message("c1").await;

        let bodies: Vec<_> = w.log.all("c1").iter().map(|m| m.body().to_string()).collect();
        assert!(bodies.contains(&"Starting track an order".to_string()));
        assert!(!bodies.iter().any(|b| b.contains("refund")));
    }

    #[tokio::test]
    async fn test_typing_indicator_precedes_work() {
        let w = world(vec![]);
        w.provider.push_reply(r#"{"code": 1, "user_message": "hi"}"#);
        w.provider.push_reply("Hello!");
        w.log.append("c1", NewMessage::user_text("hi")).await;

        w.broker.handle_inbound_message("c1").await;

        assert_eq!(w.sink.events().first(), Some(&crate::events::EmittedEvent::Typing));
    }
}

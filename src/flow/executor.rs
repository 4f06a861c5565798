//! Per-session flow state machine.
//!
//! One call per inbound message: either the newest message resolves what
//! the active node was waiting for, or the chain of auto-advancing nodes
//! runs until something waits, fails or terminates. Side effects (appended
//! messages, tool calls, attribute writes) happen in traversal order.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::attribute::AttributeStore;
use crate::error::{ExecutionError, ToolCallError};
use crate::events::EventSink;
use crate::flow::compiler::{CompiledFlow, CompiledNode};
use crate::flow::session::{AgentSession, SessionStatus};
use crate::flow::NodeKind;
use crate::message::{ConversationLog, Message, MessageAuthor, MessageKind, NewMessage};
use crate::tool::{
    ToolCatalog, ToolInvoker, json_path, placeholder_names, substitute_placeholders_lenient,
};

/// Collaborators a node side effect may touch, borrowed for one turn.
pub struct ExecContext<'a> {
    pub conversation_id: &'a str,
    pub log: &'a Arc<dyn ConversationLog>,
    pub attributes: &'a Arc<dyn AttributeStore>,
    pub events: &'a Arc<dyn EventSink>,
    pub tools: &'a Arc<dyn ToolCatalog>,
}

/// Reported back to the broker: did the flow consume this turn?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub executed_any_nodes: bool,
}

impl ExecutionOutcome {
    fn consumed(executed_any_nodes: bool) -> Self {
        Self { executed_any_nodes }
    }
}

/// Where the chain goes after a node's side effect succeeded.
enum StepNext {
    /// Follow the node's single child, wait, or terminate, per the default
    /// rules.
    Default,
    /// Jump to a specific child (tool success/failure branching).
    Goto(String),
    /// Terminate the session now.
    End,
}

#[derive(Debug, Default)]
pub struct FlowExecutor {
    invoker: ToolInvoker,
}

impl FlowExecutor {
    pub fn new(invoker: ToolInvoker) -> Self {
        Self { invoker }
    }

    /// Enters a freshly started session at the flow's first node and runs
    /// the auto-advance chain.
    pub async fn start(
        &self,
        flow: &CompiledFlow,
        session: &mut AgentSession,
        ctx: &ExecContext<'_>,
    ) -> ExecutionOutcome {
        match flow.first_node() {
            Some(first) => {
                let first = first.id.clone();
                self.run_chain(flow, session, ctx, first).await
            }
            None => {
                session.status = SessionStatus::Ended;
                ExecutionOutcome::consumed(false)
            }
        }
    }

    /// Advances the session against the newest inbound message.
    #[tracing::instrument(name = "flow_advance", skip_all, fields(flow_id = %flow.flow_id))]
    pub async fn advance(
        &self,
        flow: &CompiledFlow,
        session: &mut AgentSession,
        inbound: &Message,
        ctx: &ExecContext<'_>,
    ) -> ExecutionOutcome {
        if !session.is_active() {
            return ExecutionOutcome::consumed(false);
        }
        let Some(active_id) = session.active_node_id.clone() else {
            return self.start(flow, session, ctx).await;
        };
        let Some(node) = flow.node(&active_id) else {
            // The flow was edited out from under the session.
            warn!(node = %active_id, "active node no longer in flow, ending session");
            session.status = SessionStatus::Ended;
            return ExecutionOutcome::consumed(false);
        };

        if waits_for_event(flow, node) {
            match matching_child(flow, node, inbound) {
                Some(child) => {
                    let child = child.id.clone();
                    self.run_chain(flow, session, ctx, child).await
                }
                // Not one of this node's triggers: the flow stays put.
                None => ExecutionOutcome::consumed(false),
            }
        } else {
            // Resting on a non-waiting node means its side effect failed
            // last turn; retry it.
            self.run_chain(flow, session, ctx, active_id).await
        }
    }

    async fn run_chain(
        &self,
        flow: &CompiledFlow,
        session: &mut AgentSession,
        ctx: &ExecContext<'_>,
        mut current: String,
    ) -> ExecutionOutcome {
        let mut executed = false;
        loop {
            let Some(node) = flow.node(&current) else {
                warn!(node = %current, "chain reached unknown node, ending session");
                session.status = SessionStatus::Ended;
                break;
            };
            if node.is_placeholder() {
                session.status = SessionStatus::Ended;
                break;
            }
            session.active_node_id = Some(node.id.clone());

            let step = match self.execute_node(flow, session, ctx, node).await {
                Ok(step) => {
                    executed = true;
                    step
                }
                Err(e) => {
                    // Abort the rest of the chain; the active node is left
                    // in place so the same node is retried next turn.
                    warn!(node = %node.id, "node side effect failed: {e}");
                    ctx.events.error(&e.to_string());
                    break;
                }
            };

            match step {
                StepNext::End => {
                    session.status = SessionStatus::Ended;
                    break;
                }
                StepNext::Goto(next) => current = next,
                StepNext::Default => {
                    if waits_for_event(flow, node) {
                        break;
                    }
                    let children = flow.real_children(&node.id);
                    match children.first() {
                        None => {
                            session.status = SessionStatus::Ended;
                            break;
                        }
                        Some(only) if children.len() == 1 => current = only.id.clone(),
                        // Multiple branches without an awaited event cannot
                        // auto-resolve; wait here.
                        Some(_) => break,
                    }
                }
            }
        }
        ExecutionOutcome::consumed(executed)
    }

    async fn execute_node(
        &self,
        flow: &CompiledFlow,
        session: &mut AgentSession,
        ctx: &ExecContext<'_>,
        node: &CompiledNode,
    ) -> Result<StepNext, ExecutionError> {
        match &node.kind {
            NodeKind::Message | NodeKind::Buttons => {
                let body = self.render_text(ctx, node).await;
                let mut message = NewMessage {
                    author: MessageAuthor::Bot,
                    kind: MessageKind::Text,
                    body,
                    data: None,
                };
                if let Some(buttons) = node.data.get("buttons") {
                    message = message.with_data(json!({ "buttons": buttons }));
                }
                ctx.log.append(ctx.conversation_id, message).await;
                Ok(StepNext::Default)
            }
            NodeKind::CollectDetails => {
                let body = self.render_text(ctx, node).await;
                let mut message = NewMessage {
                    author: MessageAuthor::Bot,
                    kind: MessageKind::CollectDetailsForm,
                    body,
                    data: None,
                };
                if let Some(fields) = node.data.get("fields") {
                    message = message.with_data(json!({ "fields": fields }));
                }
                ctx.log.append(ctx.conversation_id, message).await;
                Ok(StepNext::Default)
            }
            NodeKind::Tool => self.execute_tool_node(flow, session, ctx, node).await,
            NodeKind::DynamicCards => {
                let response =
                    session.last_tool_response.as_ref().ok_or_else(|| {
                        ExecutionError::NoToolResponse(node.id.clone())
                    })?;
                let path = self.cards_array_path(session, ctx, node).await?;
                let items = json_path(response, &path)
                    .and_then(Value::as_array)
                    .ok_or_else(|| ExecutionError::MissingData {
                        node: node.id.clone(),
                        detail: format!("tool response has no array at `{path}`"),
                    })?;

                // One card per array element.
                let message = NewMessage {
                    author: MessageAuthor::Bot,
                    kind: MessageKind::Cards,
                    body: String::new(),
                    data: Some(json!({ "cards": items })),
                };
                ctx.log.append(ctx.conversation_id, message).await;
                Ok(StepNext::Default)
            }
            NodeKind::Placeholder => Ok(StepNext::End),
            NodeKind::Other(kind) => {
                // Forward compatibility: unknown authored types are valid
                // but carry no behavior here.
                debug!(node = %node.id, kind, "unknown node type executed as no-op");
                Ok(StepNext::Default)
            }
        }
    }

    async fn execute_tool_node(
        &self,
        flow: &CompiledFlow,
        session: &mut AgentSession,
        ctx: &ExecContext<'_>,
        node: &CompiledNode,
    ) -> Result<StepNext, ExecutionError> {
        let tool_id = node.data.get("tool_id").and_then(Value::as_str).ok_or_else(|| {
            ExecutionError::MissingData {
                node: node.id.clone(),
                detail: "tool node needs a `tool_id`".into(),
            }
        })?;

        let invocation = match ctx.tools.get(tool_id).await {
            Some(tool) => {
                self.invoker
                    .invoke(&tool, ctx.conversation_id, ctx.attributes, &HashMap::new())
                    .await
            }
            None => Err(ToolCallError::UnknownTool(tool_id.to_string())),
        };

        match invocation {
            Ok(result) if result.success => {
                session.last_tool_response = Some(result.response_body.clone());
                session.last_tool_id = Some(tool_id.to_string());
                ctx.log
                    .append(
                        ctx.conversation_id,
                        NewMessage {
                            author: MessageAuthor::System,
                            kind: MessageKind::ToolResult,
                            body: String::new(),
                            data: Some(result.response_body),
                        },
                    )
                    .await;
                match success_child(flow, node) {
                    Some(child) => Ok(StepNext::Goto(child)),
                    None => Ok(StepNext::End),
                }
            }
            Ok(result) => {
                ctx.events
                    .debug("tool_failed", &json!({ "tool_id": tool_id, "status": result.status }));
                self.failure_branch(flow, node, ToolCallError::Http(format!(
                    "tool `{tool_id}` failed with status {:?}",
                    result.status
                )))
            }
            Err(e) => {
                ctx.events.debug("tool_failed", &json!({ "tool_id": tool_id, "error": e.to_string() }));
                self.failure_branch(flow, node, e)
            }
        }
    }

    /// A failed tool call branches to the failure child when one is
    /// authored; otherwise the error propagates and the node is retried.
    fn failure_branch(
        &self,
        flow: &CompiledFlow,
        node: &CompiledNode,
        err: ToolCallError,
    ) -> Result<StepNext, ExecutionError> {
        match failure_child(flow, node) {
            Some(child) => Ok(StepNext::Goto(child)),
            None => Err(err.into()),
        }
    }

    /// A dynamic-cards node names the array it renders either by the array
    /// name the invoking tool declares in its response schema (`array`) or
    /// by a direct path into the response (`path`).
    async fn cards_array_path(
        &self,
        session: &AgentSession,
        ctx: &ExecContext<'_>,
        node: &CompiledNode,
    ) -> Result<String, ExecutionError> {
        if let Some(name) = node.data.get("array").and_then(Value::as_str) {
            let tool_id = session.last_tool_id.as_deref().ok_or_else(|| {
                ExecutionError::NoToolResponse(node.id.clone())
            })?;
            let tool = ctx.tools.get(tool_id).await.ok_or_else(|| {
                ExecutionError::Tool(ToolCallError::UnknownTool(tool_id.to_string()))
            })?;
            return tool
                .array_path(name)
                .map(str::to_string)
                .ok_or_else(|| ExecutionError::MissingData {
                    node: node.id.clone(),
                    detail: format!("tool `{tool_id}` declares no array named `{name}`"),
                });
        }
        node.data
            .get("path")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ExecutionError::MissingData {
                node: node.id.clone(),
                detail: "dynamic cards need an `array` name or a `path` into the tool response"
                    .into(),
            })
    }

    async fn render_text(&self, ctx: &ExecContext<'_>, node: &CompiledNode) -> String {
        let template = node.data.get("text").and_then(Value::as_str).unwrap_or_default();
        let mut lookup = HashMap::new();
        for name in placeholder_names(template) {
            if let Some(value) = ctx.attributes.get(ctx.conversation_id, &name).await {
                lookup.insert(name, value);
            }
        }
        substitute_placeholders_lenient(template, &lookup)
    }
}

/// Per-node-type "satisfies" predicate support: does this node sit and wait
/// for a specific inbound event?
fn waits_for_event(flow: &CompiledFlow, node: &CompiledNode) -> bool {
    match node.kind {
        NodeKind::Buttons | NodeKind::CollectDetails => true,
        NodeKind::Tool => false,
        _ => flow.real_children(&node.id).len() > 1,
    }
}

/// Which child, if any, the inbound message's event resolves to.
fn matching_child<'g>(
    flow: &'g CompiledFlow,
    node: &CompiledNode,
    inbound: &Message,
) -> Option<&'g CompiledNode> {
    if !inbound.is_consumable_input() {
        return None;
    }
    match node.kind {
        NodeKind::CollectDetails => {
            let submitted = inbound.kind() == MessageKind::CollectDetailsForm
                && inbound
                    .data()
                    .and_then(|d| d.get("submitted"))
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
            submitted.then(|| flow.real_children(&node.id).into_iter().next())?
        }
        // Buttons and multi-branch nodes resolve on value equality with the
        // selection event.
        _ => {
            let value = event_value(inbound)?;
            flow.real_children(&node.id)
                .into_iter()
                .find(|child| child.data.get("value").and_then(Value::as_str) == Some(value.as_str()))
        }
    }
}

fn event_value(inbound: &Message) -> Option<String> {
    if inbound.kind() != MessageKind::Event {
        return None;
    }
    match inbound.data().and_then(|d| d.get("value")) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
        None => (!inbound.body().is_empty()).then(|| inbound.body().to_string()),
    }
}

fn child_with_on<'g>(flow: &'g CompiledFlow, node: &CompiledNode, tag: &str) -> Option<String> {
    flow.real_children(&node.id)
        .into_iter()
        .find(|c| c.data.get("on").and_then(Value::as_str) == Some(tag))
        .map(|c| c.id.clone())
}

fn success_child(flow: &CompiledFlow, node: &CompiledNode) -> Option<String> {
    child_with_on(flow, node, "success").or_else(|| {
        flow.real_children(&node.id)
            .into_iter()
            .find(|c| c.data.get("on").and_then(Value::as_str) != Some("failure"))
            .map(|c| c.id.clone())
    })
}

fn failure_child(flow: &CompiledFlow, node: &CompiledNode) -> Option<String> {
    child_with_on(flow, node, "failure")
}

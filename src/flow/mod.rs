//! Authored conversation flows: the flat persisted form ([`StoredNode`]
//! list), the compiled executable graph, per-conversation session state and
//! the executor that advances it.

pub mod compiler;
pub mod executor;
pub mod session;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use compiler::{CompiledFlow, InsertNode, START_NODE_ID};
pub use executor::{ExecContext, ExecutionOutcome, FlowExecutor};
pub use session::{AgentSession, MokaSessionStore, SessionStatus, SessionStore};

/// Parent pointer of a stored node: either the synthetic start root or
/// another node's id. Serialized as a plain string (`"start"` or the id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParentRef {
    Start,
    Node(String),
}

impl From<String> for ParentRef {
    fn from(s: String) -> Self {
        if s == START_NODE_ID { ParentRef::Start } else { ParentRef::Node(s) }
    }
}

impl From<ParentRef> for String {
    fn from(p: ParentRef) -> Self {
        match p {
            ParentRef::Start => START_NODE_ID.to_string(),
            ParentRef::Node(id) => id,
        }
    }
}

/// Closed set of executable node behaviors. Unknown authored types land in
/// `Other` and execute as no-ops instead of failing the flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Message,
    Buttons,
    Tool,
    DynamicCards,
    CollectDetails,
    Placeholder,
    #[serde(untagged)]
    Other(String),
}

/// One tree edge in a flow's flat persisted node list: a node's parent is
/// the node executed immediately before it. Sibling order is list order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredNode {
    pub id: String,
    pub parent_id: ParentRef,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub data: Value,
}

impl StoredNode {
    pub fn new(id: impl Into<String>, parent_id: ParentRef, kind: NodeKind) -> Self {
        Self { id: id.into(), parent_id, kind, data: Value::Null }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Authored flow document. Immutable during execution (copy-on-read); edits
/// go through [`compiler::insert`] and friends, which preserve the forest
/// invariants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    /// Used only for classifier matching. A flow without an intent can only
    /// be entered by explicit trigger actions outside this crate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default)]
    pub nodes: Vec<StoredNode>,
}

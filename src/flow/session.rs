//! Per-conversation flow session state.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How long an idle session survives before it is considered abandoned.
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Ended,
}

/// State machine position of one conversation inside a flow. At most one
/// session exists per conversation; no concurrent flows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSession {
    pub active_flow_id: String,
    /// `None` until the first node executes.
    pub active_node_id: Option<String>,
    pub status: SessionStatus,
    /// Most recent tool node response, read by downstream dynamic-cards
    /// nodes. Not persisted beyond the session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tool_response: Option<Value>,
    /// Which tool produced `last_tool_response`; dynamic-cards nodes
    /// resolve declared array names through its response schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tool_id: Option<String>,
}

impl AgentSession {
    pub fn new(flow_id: impl Into<String>) -> Self {
        Self {
            active_flow_id: flow_id.into(),
            active_node_id: None,
            status: SessionStatus::Active,
            last_tool_response: None,
            last_tool_id: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }
}

#[async_trait]
pub trait SessionStore: Send + Sync + Debug {
    async fn get(&self, conversation_id: &str) -> Option<AgentSession>;
    async fn put(&self, conversation_id: &str, session: AgentSession);
    async fn remove(&self, conversation_id: &str);
}

/// TTL-evicting in-process session store. Expiry doubles as abandonment:
/// a conversation that goes quiet simply loses its session.
#[derive(Debug)]
pub struct MokaSessionStore {
    sessions: Cache<String, AgentSession>,
}

impl MokaSessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Cache::builder()
                .max_capacity(100_000)
                .time_to_idle(ttl)
                .build(),
        }
    }
}

impl Default for MokaSessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

#[async_trait]
impl SessionStore for MokaSessionStore {
    async fn get(&self, conversation_id: &str) -> Option<AgentSession> {
        self.sessions.get(conversation_id).await
    }

    async fn put(&self, conversation_id: &str, session: AgentSession) {
        self.sessions.insert(conversation_id.to_string(), session).await;
    }

    async fn remove(&self, conversation_id: &str) {
        self.sessions.invalidate(conversation_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = MokaSessionStore::default();
        assert!(store.get("c1").await.is_none());

        let mut session = AgentSession::new("f1");
        session.active_node_id = Some("n1".into());
        store.put("c1", session).await;

        let loaded = store.get("c1").await.unwrap();
        assert_eq!(loaded.active_flow_id, "f1");
        assert_eq!(loaded.active_node_id.as_deref(), Some("n1"));
        assert!(loaded.is_active());

        store.remove("c1").await;
        assert!(store.get("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_sessions_expire_after_ttl() {
        let store = MokaSessionStore::new(Duration::from_millis(50));
        store.put("c1", AgentSession::new("f1")).await;
        assert!(store.get("c1").await.is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        store.sessions.run_pending_tasks().await;
        assert!(store.get("c1").await.is_none());
    }
}

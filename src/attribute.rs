use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

/// Per-conversation key/value attributes, used for placeholder substitution
/// in messages and tool requests, and updated from tool responses.
///
/// Invalidation is explicit: hosts that mirror attributes from a database
/// call `invalidate` after external writes instead of relying on lazy reload.
#[async_trait]
pub trait AttributeStore: Send + Sync + Debug {
    async fn get(&self, conversation_id: &str, name: &str) -> Option<String>;
    async fn set(&self, conversation_id: &str, name: &str, value: String);
    async fn invalidate(&self, conversation_id: &str, name: &str);
}

#[derive(Debug, Default)]
pub struct InMemoryAttributeStore {
    attributes: DashMap<String, DashMap<String, String>>,
}

impl InMemoryAttributeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl AttributeStore for InMemoryAttributeStore {
    async fn get(&self, conversation_id: &str, name: &str) -> Option<String> {
        self.attributes
            .get(conversation_id)
            .and_then(|attrs| attrs.get(name).map(|v| v.clone()))
    }

    async fn set(&self, conversation_id: &str, name: &str, value: String) {
        self.attributes
            .entry(conversation_id.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    async fn invalidate(&self, conversation_id: &str, name: &str) {
        if let Some(attrs) = self.attributes.get(conversation_id) {
            attrs.remove(name);
        }
    }
}

//! Conversation orchestration core for an AI customer-support agent.
//!
//! One inbound user message at a time, the [`broker::Broker`] decides what
//! happens: an active authored flow advances, the classifier routes the
//! message to a new flow or a human, or a free-form answer is generated
//! over retrieved knowledge with tools bound. Surrounding concerns
//! (ticketing, channels, persistence) stay behind the trait seams in
//! [`message`], [`attribute`], [`events`] and [`provider`].

pub mod attribute;
pub mod broker;
pub mod classifier;
pub mod error;
pub mod events;
pub mod flow;
pub mod message;
pub mod provider;
pub mod retrieval;
pub mod tool;

pub use broker::{Broker, BrokerConfig, BrokerDeps, FlowCatalog, HumanHandoff};
pub use classifier::{Classifier, ClassifierCode, ClassifierResponse};
pub use error::BrokerError;
pub use flow::{AgentSession, CompiledFlow, Flow, FlowExecutor, NodeKind, ParentRef, StoredNode};
pub use message::{ConversationLog, Message, MessageAuthor, MessageKind, NewMessage};
pub use provider::{GenerateRequest, ModelProvider, PromptMessage};
pub use retrieval::{Chunk, ChunkRepository, ChunkStore};
pub use tool::{Tool, ToolCatalog, ToolInvoker};

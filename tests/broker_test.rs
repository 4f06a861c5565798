//! End-to-end broker scenarios over the public API, with a scripted model.

use std::sync::Arc;

use serde_json::json;

use deskflow::attribute::InMemoryAttributeStore;
use deskflow::broker::{Broker, BrokerConfig, BrokerDeps, InMemoryFlowCatalog, RecordingHandoff};
use deskflow::events::RecordingEventSink;
use deskflow::flow::session::{MokaSessionStore, SessionStore};
use deskflow::flow::{Flow, NodeKind, ParentRef, StoredNode};
use deskflow::message::{ConversationLog, InMemoryConversationLog, MessageAuthor, MessageKind, NewMessage};
use deskflow::provider::mock::ScriptedProvider;
use deskflow::provider::PromptRole;
use deskflow::retrieval::{ChunkStore, InMemoryChunkRepository};
use deskflow::tool::InMemoryToolCatalog;

struct World {
    provider: Arc<ScriptedProvider>,
    log: Arc<InMemoryConversationLog>,
    sessions: Arc<MokaSessionStore>,
    chunks: Arc<ChunkStore>,
    broker: Broker,
}

fn world(flows: Vec<Flow>) -> World {
    let provider = Arc::new(ScriptedProvider::new());
    let log = InMemoryConversationLog::new();
    let sessions = Arc::new(MokaSessionStore::default());
    let chunks = Arc::new(ChunkStore::new(provider.clone(), InMemoryChunkRepository::new()));
    let deps = BrokerDeps {
        provider: provider.clone(),
        chunks: chunks.clone(),
        sessions: sessions.clone(),
        flows: InMemoryFlowCatalog::new(flows),
        tools: InMemoryToolCatalog::new(),
        log: log.clone(),
        attributes: InMemoryAttributeStore::new(),
        events: RecordingEventSink::new(),
        handoff: RecordingHandoff::new(),
    };
    World {
        provider,
        log,
        sessions,
        chunks,
        broker: Broker::new(deps, BrokerConfig::default()),
    }
}

fn tracking_flow() -> Flow {
    Flow {
        id: "track-order".into(),
        intent: Some("track an order".into()),
        nodes: vec![
            StoredNode::new("ask", ParentRef::Start, NodeKind::Buttons).with_data(json!({
                "text": "Which shipment?",
                "buttons": ["latest", "older"],
            })),
            StoredNode::new("latest", ParentRef::Node("ask".into()), NodeKind::Message)
                .with_data(json!({ "text": "Your latest shipment is on its way.", "value": "latest" })),
            StoredNode::new("older", ParentRef::Node("ask".into()), NodeKind::Message)
                .with_data(json!({ "text": "Here are your older shipments.", "value": "older" })),
        ],
    }
}

fn refund_flow() -> Flow {
    Flow {
        id: "refund".into(),
        intent: Some("request a refund".into()),
        nodes: vec![
            StoredNode::new("intro", ParentRef::Start, NodeKind::Message)
                .with_data(json!({ "text": "Happy to help with a refund." })),
            StoredNode::new("policy", ParentRef::Node("intro".into()), NodeKind::Message)
                .with_data(json!({ "text": "Refunds land within 5 business days." })),
        ],
    }
}

fn intentless_flow() -> Flow {
    Flow { id: "hidden".into(), intent: None, nodes: vec![] }
}

fn bot_bodies(log: &InMemoryConversationLog, conversation: &str) -> Vec<String> {
    log.all(conversation)
        .iter()
        .filter(|m| m.author() == MessageAuthor::Bot)
        .map(|m| m.body().to_string())
        .collect()
}

#[tokio::test]
async fn classifier_routes_flow_intent_zero_to_first_flow() {
    let w = world(vec![tracking_flow(), intentless_flow(), refund_flow()]);
    // Code 2 = FlowIntent(0) = the tracking flow.
    w.provider.push_reply(r#"{"code": 2, "user_message": "where is my parcel"}"#);
    w.log.append("c1", NewMessage::user_text("where is my parcel")).await;

    w.broker.handle_inbound_message("c1").await;

    let session = w.sessions.get("c1").await.expect("session started");
    assert_eq!(session.active_flow_id, "track-order");
    // The active node is the flow's first real node, waiting on a button.
    assert_eq!(session.active_node_id.as_deref(), Some("ask"));
    assert!(session.is_active());
    assert_eq!(bot_bodies(&w.log, "c1"), vec!["Which shipment?"]);
}

#[tokio::test]
async fn refund_intent_runs_first_node_and_auto_advancing_child_in_one_call() {
    let w = world(vec![tracking_flow(), intentless_flow(), refund_flow()]);
    // Code 4 = FlowIntent(2) = the refund flow.
    w.provider.push_reply(r#"{"code": 4, "user_message": "I want a refund for order 81"}"#);
    w.log.append("c1", NewMessage::user_text("I want a refund")).await;

    w.broker.handle_inbound_message("c1").await;

    assert_eq!(
        bot_bodies(&w.log, "c1"),
        vec!["Happy to help with a refund.", "Refunds land within 5 business days."]
    );
    // The flow ran to its terminal node, so no session lingers.
    assert!(w.sessions.get("c1").await.is_none());
    // The classifier was consulted exactly once.
    assert_eq!(w.provider.requests().len(), 1);
}

#[tokio::test]
async fn active_session_consumes_the_turn_without_classification() {
    let w = world(vec![tracking_flow()]);
    w.provider.push_reply(r#"{"code": 2, "user_message": "track it"}"#);
    w.log.append("c1", NewMessage::user_text("track my order")).await;
    w.broker.handle_inbound_message("c1").await;
    assert!(w.sessions.get("c1").await.is_some());

    // Button click: the session advances and ends, no model call needed.
    w.log
        .append(
            "c1",
            NewMessage {
                author: MessageAuthor::User,
                kind: MessageKind::Event,
                body: String::new(),
                data: Some(json!({ "value": "latest" })),
            },
        )
        .await;
    w.broker.handle_inbound_message("c1").await;

    assert_eq!(
        bot_bodies(&w.log, "c1"),
        vec!["Which shipment?", "Your latest shipment is on its way."]
    );
    assert!(w.sessions.get("c1").await.is_none());
    assert_eq!(w.provider.requests().len(), 1);
}

#[tokio::test]
async fn unmatched_event_leaves_session_waiting_and_sends_no_reply() {
    let w = world(vec![tracking_flow()]);
    w.provider.push_reply(r#"{"code": 2, "user_message": "track it"}"#);
    w.log.append("c1", NewMessage::user_text("track my order")).await;
    w.broker.handle_inbound_message("c1").await;

    w.log
        .append(
            "c1",
            NewMessage {
                author: MessageAuthor::User,
                kind: MessageKind::Event,
                body: String::new(),
                data: Some(json!({ "value": "not-a-button" })),
            },
        )
        .await;
    w.broker.handle_inbound_message("c1").await;

    let session = w.sessions.get("c1").await.expect("still waiting");
    assert_eq!(session.active_node_id.as_deref(), Some("ask"));
    assert_eq!(bot_bodies(&w.log, "c1"), vec!["Which shipment?"]);
}

#[tokio::test]
async fn assistance_answers_with_retrieved_knowledge() {
    let w = world(vec![tracking_flow()]);
    w.chunks
        .index(
            "default",
            "article",
            "a1",
            "Returns are accepted within 30 days of delivery.",
        )
        .await
        .unwrap();
    w.provider.push_reply(r#"{"code": 1, "user_message": "what is the return window"}"#);
    w.provider.push_reply("You can return items within 30 days.");
    w.log.append("c1", NewMessage::user_text("returns?")).await;

    w.broker.handle_inbound_message("c1").await;

    assert_eq!(bot_bodies(&w.log, "c1"), vec!["You can return items within 30 days."]);

    // The seeded chunk rode into the answer's system prompt.
    let requests = w.provider.requests();
    assert_eq!(requests.len(), 2);
    let system = &requests[1].messages[0];
    assert_eq!(system.role, PromptRole::System);
    assert!(system.content.contains("Returns are accepted within 30 days of delivery."));
}

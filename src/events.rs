use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, error, info};

/// Push channel to the customer-facing client: typing indicators, streamed
/// response deltas and debug/error signals. Fire-and-forget from the core's
/// perspective; a slow or disconnected client must never block a turn.
pub trait EventSink: Send + Sync + Debug {
    fn typing(&self);
    fn response_delta(&self, text: &str);
    fn end_delta_stream(&self);
    fn debug(&self, tag: &str, payload: &Value);
    fn error(&self, message: &str);
}

/// Routes events into the tracing pipeline. Default sink for hosts that have
/// no live client channel wired up.
#[derive(Debug, Default, Clone)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn typing(&self) {
        debug!("typing indicator emitted");
    }

    fn response_delta(&self, text: &str) {
        debug!(len = text.len(), "response delta");
    }

    fn end_delta_stream(&self) {
        debug!("delta stream ended");
    }

    fn debug(&self, tag: &str, payload: &Value) {
        info!(tag, %payload, "debug event");
    }

    fn error(&self, message: &str) {
        error!(message, "client-visible error event");
    }
}

/// One captured event, used by the recording sink.
#[derive(Debug, Clone, PartialEq)]
pub enum EmittedEvent {
    Typing,
    ResponseDelta(String),
    EndDeltaStream,
    Debug { tag: String, payload: Value },
    Error(String),
}

/// Captures everything emitted during a turn. Test double.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<EmittedEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EmittedEvent> {
        self.events.lock().expect("event sink poisoned").clone()
    }

    /// Concatenation of all response deltas, in emission order.
    pub fn streamed_text(&self) -> String {
        self.events()
            .iter()
            .filter_map(|e| match e {
                EmittedEvent::ResponseDelta(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: EmittedEvent) {
        self.events.lock().expect("event sink poisoned").push(event);
    }
}

impl EventSink for RecordingEventSink {
    fn typing(&self) {
        self.push(EmittedEvent::Typing);
    }

    fn response_delta(&self, text: &str) {
        self.push(EmittedEvent::ResponseDelta(text.to_string()));
    }

    fn end_delta_stream(&self) {
        self.push(EmittedEvent::EndDeltaStream);
    }

    fn debug(&self, tag: &str, payload: &Value) {
        self.push(EmittedEvent::Debug {
            tag: tag.to_string(),
            payload: payload.clone(),
        });
    }

    fn error(&self, message: &str) {
        self.push(EmittedEvent::Error(message.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recording_sink_captures_in_order() {
        let sink = RecordingEventSink::new();
        sink.typing();
        sink.response_delta("hel");
        sink.response_delta("lo");
        sink.end_delta_stream();
        sink.debug("turn", &json!({"step": 1}));

        let events = sink.events();
        assert_eq!(events.len(), 5);
        assert_eq!(events[0], EmittedEvent::Typing);
        assert_eq!(sink.streamed_text(), "hello");
        assert_eq!(events[4], EmittedEvent::Debug { tag: "turn".into(), payload: json!({"step": 1}) });
    }
}

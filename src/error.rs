use thiserror::Error;

/// Failures surfaced by the model provider facade.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider returned no output")]
    EmptyOutput,
    #[error("generation cancelled")]
    Cancelled,
}

/// The classifier must fail loudly rather than guess: a reply that does not
/// deserialize, or whose code maps to no known intent, is fatal to the turn.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("classifier reply did not match the expected schema: {0}")]
    MalformedReply(String),
    #[error("classifier returned unknown code {code} ({candidates} candidate flows)")]
    UnknownCode { code: u32, candidates: usize },
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Embedding or search failure. Cloneable because the embed cache shares one
/// result between concurrent callers of the same content hash.
#[derive(Debug, Clone, Error)]
pub enum RetrievalError {
    #[error("embedding failed: {0}")]
    Embedding(String),
    #[error("embedding provider returned no vector")]
    EmptyEmbedding,
}

/// Failures during a single external tool invocation or the chat tool loop.
#[derive(Debug, Error)]
pub enum ToolCallError {
    #[error("no value bound for required placeholder `{0}` and no fallback given")]
    MissingAttribute(String),
    #[error("tool endpoint is not a valid url: {0}")]
    InvalidUrl(String),
    #[error("invalid request header `{0}`")]
    InvalidHeader(String),
    #[error("tool request failed: {0}")]
    Http(String),
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("model tool-call reply did not match the expected schema: {0}")]
    MalformedReply(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Graph-compiler invariant violations. These are rejected at edit/compile
/// time; the executor assumes a valid graph and never sees them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("node `{node}` points at missing parent `{parent}`")]
    MissingParent { node: String, parent: String },
    #[error("unknown node `{0}`")]
    UnknownNode(String),
    #[error("duplicate node id `{0}`")]
    DuplicateId(String),
    #[error("flow graph contains a cycle")]
    CycleDetected,
}

/// A node side effect failed mid-turn. The executor keeps the active node so
/// the same node is retried on the next inbound message.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("node `{node}` is missing required data: {detail}")]
    MissingData { node: String, detail: String },
    #[error("dynamic cards node `{0}` has no prior tool response to read from")]
    NoToolResponse(String),
    #[error(transparent)]
    Tool(#[from] ToolCallError),
}

/// Top-level aggregate caught by the broker, which always converts it into a
/// user-visible apology rather than a dropped turn.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("unknown flow intent index {0}")]
    UnknownFlowIndex(usize),
    #[error(transparent)]
    Classification(#[from] ClassificationError),
    #[error(transparent)]
    Retrieval(#[from] RetrievalError),
    #[error(transparent)]
    Tool(#[from] ToolCallError),
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ToolCallError::MissingAttribute("order_id".into());
        assert_eq!(
            format!("{}", err),
            "no value bound for required placeholder `order_id` and no fallback given"
        );

        let err = StructuralError::MissingParent {
            node: "n2".into(),
            parent: "n1".into(),
        };
        assert_eq!(format!("{}", err), "node `n2` points at missing parent `n1`");
    }

    #[test]
    fn test_broker_error_from_conversions() {
        let err: BrokerError = ClassificationError::UnknownCode { code: 9, candidates: 2 }.into();
        assert!(matches!(err, BrokerError::Classification(_)));

        let err: BrokerError = StructuralError::CycleDetected.into();
        assert!(matches!(err, BrokerError::Structural(_)));
    }
}

//! Turn routing: one structured-output model call that decides whether the
//! latest user message starts a flow, needs a human, or gets free-form
//! assistance. Runs before any expensive work.

use std::sync::Arc;

use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ClassificationError;
use crate::flow::Flow;
use crate::message::{Message, history_as_prompt};
use crate::provider::{GenerateRequest, ModelProvider, PromptMessage};

/// Wire codes are fixed so adding flows never renumbers them: 0 = needs a
/// human, 1 = general assistance, 2 + i = the flow at index i.
pub const CODE_TRANSFER_TO_HUMAN: u32 = 0;
pub const CODE_ASSISTANCE: u32 = 1;
pub const FLOW_INTENT_BASE: u32 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifierCode {
    Assistance,
    TransferToHuman,
    FlowIntent(usize),
}

/// Transient classification result; never persisted.
#[derive(Debug, Clone)]
pub struct ClassifierResponse {
    pub code: ClassifierCode,
    /// Coreference-resolved form of the latest turn, so downstream retrieval
    /// and tool calls operate on a self-contained query string.
    pub disambiguated_user_message: String,
}

/// Shape the model is forced into via structured-output mode.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
struct ClassifierReply {
    code: u32,
    user_message: String,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    provider: Arc<dyn ModelProvider>,
    model: Option<String>,
}

impl Classifier {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider, model: None }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    #[tracing::instrument(name = "classify_turn", skip(self, history, candidate_flows))]
    pub async fn classify(
        &self,
        history: &[Message],
        candidate_flows: &[Flow],
    ) -> Result<ClassifierResponse, ClassificationError> {
        let system = build_system_prompt(candidate_flows);
        let user = format!(
            "Conversation so far:\n{}\nClassify the latest customer message.",
            history_as_prompt(history)
        );

        let mut req = GenerateRequest::new(vec![
            PromptMessage::system(system),
            PromptMessage::user(user),
        ])
        .with_format(schema_for!(ClassifierReply));
        req.model = self.model.clone();

        let resp = self.provider.generate_text(req).await?;
        let reply: ClassifierReply = serde_json::from_str(&resp.output)
            .map_err(|e| ClassificationError::MalformedReply(e.to_string()))?;

        let code = decode(reply.code, candidate_flows)?;
        info!(code = reply.code, "classifier routed turn");
        Ok(ClassifierResponse {
            code,
            disambiguated_user_message: reply.user_message,
        })
    }
}

fn build_system_prompt(candidate_flows: &[Flow]) -> String {
    let mut prompt = String::from(
        "You route customer-support conversations. Read the conversation and \
         classify the latest customer message into exactly one code.\n\
         Also rewrite that message so it is understandable without the rest of \
         the conversation (resolve \"it\", \"that\", names, etc.) and return the \
         rewritten form as `user_message`.\n\nCodes:\n",
    );
    prompt.push_str(&format!(
        "- {CODE_TRANSFER_TO_HUMAN}: the customer explicitly needs a human agent\n"
    ));
    prompt.push_str(&format!(
        "- {CODE_ASSISTANCE}: general assistance, answered from knowledge\n"
    ));
    for (i, flow) in candidate_flows.iter().enumerate() {
        if let Some(intent) = &flow.intent {
            prompt.push_str(&format!("- {}: the customer wants: {}\n", FLOW_INTENT_BASE + i as u32, intent));
        }
    }
    prompt.push_str("\nRespond with JSON matching the given schema: {\"code\": <number>, \"user_message\": <string>}.");
    prompt
}

/// The schema constrains the shape but not the range; an out-of-range code is
/// a hard error, never a guess.
fn decode(code: u32, candidate_flows: &[Flow]) -> Result<ClassifierCode, ClassificationError> {
    match code {
        CODE_TRANSFER_TO_HUMAN => Ok(ClassifierCode::TransferToHuman),
        CODE_ASSISTANCE => Ok(ClassifierCode::Assistance),
        c => {
            let index = (c - FLOW_INTENT_BASE) as usize;
            match candidate_flows.get(index) {
                Some(flow) if flow.intent.is_some() => Ok(ClassifierCode::FlowIntent(index)),
                _ => Err(ClassificationError::UnknownCode {
                    code: c,
                    candidates: candidate_flows.len(),
                }),
            }
        }
    }
}

//! SSE event shapes emitted by the agent loop, and the streaming token
//! events an [`hub_providers`] provider yields mid-inference.

use futures_core::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// One incremental unit of a provider's streamed chat completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderStreamEvent {
    Token { text: String },
    ToolCallDelta { call_id: String, delta: String },
    Done { usage: Option<Usage> },
    Error { message: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Events emitted by the agent loop over SSE. The wire `type` field and
/// field names are the public contract — clients parse these directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    ToolCallStarted {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
    },
    ToolCallResult {
        tool_call_id: String,
        tool_name: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        cached: bool,
    },
    AssistantMessage {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    Error {
        error: String,
    },
    Done,
}

impl TurnEvent {
    /// The SSE `event:` line name. The spec's frames are tagged `type` in
    /// the JSON body but axum's `Event::event()` also wants a name.
    pub fn event_name(&self) -> &'static str {
        match self {
            TurnEvent::ToolCallStarted { .. } => "tool_call_started",
            TurnEvent::ToolCallResult { .. } => "tool_call_result",
            TurnEvent::AssistantMessage { .. } => "assistant_message",
            TurnEvent::Error { .. } => "error",
            TurnEvent::Done => "done",
        }
    }
}

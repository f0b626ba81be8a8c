//! Structured domain events, emitted as single-line JSON via `tracing` so
//! log aggregation can filter on `event` without regex-parsing prose.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    DeviceRegistered {
        device_id: String,
        display_name: String,
    },
    DeviceOnline {
        device_id: String,
    },
    DeviceOffline {
        device_id: String,
    },
    SkillsRegistered {
        device_id: String,
        count: usize,
    },
    SkillSearch {
        user_id: String,
        query: String,
        hits: usize,
    },
    ToolDispatch {
        tool_name: String,
        device_id: Option<String>,
        duration_ms: u64,
        success: bool,
        cached: bool,
    },
    LlmRequest {
        provider: String,
        model: String,
        duration_ms: u64,
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
    },
    LlmFallback {
        from_provider: String,
        to_provider: String,
        reason: String,
    },
    SessionCreated {
        session_id: String,
        device_id: String,
    },
    TurnCompleted {
        session_id: String,
        iterations: u32,
        reason: String,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => tracing::info!(trace_event = %json, "hub_event"),
            Err(e) => tracing::warn!(error = %e, "failed to serialize trace event"),
        }
    }
}

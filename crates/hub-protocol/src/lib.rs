//! Wire protocol for the Spoke channel.
//!
//! Every frame on the wire is a flat JSON envelope:
//! `{"type": "...", "correlation_id": "...", "payload": {...}}`. The
//! envelope is deliberately untyped in its `payload` so unknown frame
//! types round-trip without failing to parse — the Hub logs and ignores
//! them instead of closing the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const FRAME_REGISTER: &str = "register";
pub const FRAME_HEARTBEAT: &str = "heartbeat";
pub const FRAME_SKILL_CALL_REQUEST: &str = "skill_call_request";
pub const FRAME_SKILL_CALL_RESPONSE: &str = "skill_call_response";
pub const FRAME_SKILL_CALL_CANCEL: &str = "skill_call_cancel";
pub const FRAME_ERROR: &str = "error";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Frame {
    pub fn new(frame_type: impl Into<String>, payload: Value) -> Self {
        Self {
            frame_type: frame_type.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// One skill advertised by a `register` frame's payload (a `{"skills": [...]}` object).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillInfo {
    pub class_name: String,
    pub method_name: String,
    pub signature: String,
    #[serde(default)]
    pub docstring: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub skills: Vec<SkillInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillCallRequestPayload {
    pub tool_name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillCallResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_json() {
        let frame = Frame::new(
            FRAME_SKILL_CALL_REQUEST,
            serde_json::to_value(SkillCallRequestPayload {
                tool_name: "python_exec".to_string(),
                arguments: serde_json::json!({"code": "device.MusicSkill.set_volume(volume=80)"}),
            })
            .unwrap(),
        )
        .with_correlation("abc-123");

        let json = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.frame_type, FRAME_SKILL_CALL_REQUEST);
        assert_eq!(back.correlation_id.as_deref(), Some("abc-123"));
    }

    #[test]
    fn unknown_frame_type_still_parses() {
        let json = r#"{"type":"something_new","payload":{"foo":1}}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.frame_type, "something_new");
        assert!(frame.correlation_id.is_none());
    }
}

//! Wire protocol for client-server communication.
//!
//! Outbound frames carry a turn: `{"content": ..., "context": {...}}`.
//! Inbound frames are discriminated by `type`: `step_update`, `error`
//! or `status`. Anything else is rejected so protocol drift is reported
//! instead of silently ignored.

use agent_session_core::{StepRecord, ToolCall, Turn, TurnContext};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Detail used when the server sends an `error` frame without one.
pub const UNKNOWN_ERROR_DETAIL: &str = "Unknown error occurred";

/// Message from server to client, decoded once at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// One agent step for the in-flight turn.
    StepUpdate(StepRecord),
    /// Terminal error for the in-flight turn.
    Error(String),
    /// Informational status ping.
    Status(String),
}

impl InboundMessage {
    /// Wire discriminator of this message.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StepUpdate(_) => "step_update",
            Self::Error(_) => "error",
            Self::Status(_) => "status",
        }
    }

    /// Serialize as a server frame.
    ///
    /// # Errors
    /// Returns error if the step cannot be serialized (non-finite timestamps).
    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        let frame = match self {
            Self::StepUpdate(step) => ServerFrame::StepUpdate { step },
            Self::Error(detail) => ServerFrame::Error { detail },
            Self::Status(detail) => ServerFrame::Status { detail },
        };
        serde_json::to_string(&frame)
    }
}

/// Decode error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid frame: {0}")]
    InvalidJson(String),
    #[error("Frame has no type discriminator")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Malformed step: {0}")]
    MalformedStep(String),
    #[error("Malformed turn: {0}")]
    MalformedTurn(String),
}

/// Encode error.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Turn has neither content nor context")]
    EmptyTurn,
    #[error("Serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    StepUpdate { step: &'a StepRecord },
    Error { detail: &'a str },
    Status { detail: &'a str },
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    content: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a TurnContext>,
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<Value>,
    step: Option<Value>,
    detail: Option<Value>,
}

#[derive(Deserialize)]
struct WireStep {
    step_number: u64,
    start_time: f64,
    end_time: f64,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(default)]
    observations: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    action_output: Option<String>,
    #[serde(default)]
    model_output: Option<String>,
}

impl From<WireStep> for StepRecord {
    fn from(w: WireStep) -> Self {
        let mut step = Self::new(w.step_number, w.start_time, w.end_time);
        if let Some(duration) = w.duration {
            step.duration = duration;
        }
        step.tool_calls = w.tool_calls.unwrap_or_default();
        step.observations = w.observations;
        step.error = w.error;
        step.action_output = w.action_output;
        step.model_output = w.model_output;
        step
    }
}

#[derive(Deserialize)]
struct InboundTurn {
    #[serde(default)]
    content: String,
    #[serde(default)]
    context: Option<TurnContext>,
}

/// Decode one inbound server frame.
///
/// # Errors
/// Returns error if the frame is not a JSON object, has no or an unknown
/// `type`, or carries a step missing required fields.
pub fn decode(raw: &str) -> Result<InboundMessage, DecodeError> {
    let frame: RawFrame =
        serde_json::from_str(raw).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    let kind = match frame.kind {
        Some(Value::String(kind)) => kind,
        Some(other) => return Err(DecodeError::UnknownType(other.to_string())),
        None => return Err(DecodeError::MissingType),
    };

    let detail = frame
        .detail
        .and_then(|d| d.as_str().map(str::to_owned));

    match kind.as_str() {
        "step_update" => {
            let step = frame
                .step
                .ok_or_else(|| DecodeError::MalformedStep("missing `step` object".into()))?;
            let wire: WireStep = serde_json::from_value(step)
                .map_err(|e| DecodeError::MalformedStep(e.to_string()))?;
            Ok(InboundMessage::StepUpdate(wire.into()))
        }
        "error" => Ok(InboundMessage::Error(
            detail.unwrap_or_else(|| UNKNOWN_ERROR_DETAIL.to_string()),
        )),
        "status" => Ok(InboundMessage::Status(detail.unwrap_or_default())),
        _ => Err(DecodeError::UnknownType(kind)),
    }
}

/// Encode a turn as an outbound frame.
///
/// # Errors
/// Returns `EncodeError::EmptyTurn` if the turn has neither content nor context.
pub fn encode(turn: &Turn) -> Result<String, EncodeError> {
    if turn.is_empty() {
        return Err(EncodeError::EmptyTurn);
    }
    let frame = OutboundFrame {
        content: &turn.content,
        context: turn.context.as_ref().filter(|c| !c.is_empty()),
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Decode a client frame back into a turn. Used by server-side code.
///
/// # Errors
/// Returns error if the frame is not a JSON object of the outbound shape.
pub fn decode_turn(raw: &str) -> Result<Turn, DecodeError> {
    let frame: InboundTurn =
        serde_json::from_str(raw).map_err(|e| DecodeError::MalformedTurn(e.to_string()))?;
    Ok(Turn {
        content: frame.content,
        context: frame.context,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_step_update() {
        let raw = r#"{"type":"step_update","step":{
            "step_number":2,"start_time":100.0,"end_time":101.5,"duration":1.5,
            "tool_calls":[{"name":"search","arguments":{"q":"rust"},"id":"call_1"}],
            "observations":"found 3 results","action_output":"Summary: ..."}}"#;

        let InboundMessage::StepUpdate(step) = decode(raw).unwrap() else {
            panic!("Wrong message type");
        };
        assert_eq!(step.step_number, 2);
        assert_eq!(step.tool_calls.len(), 1);
        assert_eq!(step.tool_calls[0].name, "search");
        assert_eq!(step.tool_calls[0].arguments["q"], "rust");
        assert_eq!(step.observations.as_deref(), Some("found 3 results"));
        assert_eq!(step.final_output(), Some("Summary: ..."));
    }

    #[test]
    fn test_decode_derives_missing_duration() {
        let raw = r#"{"type":"step_update","step":{"step_number":1,"start_time":3.0,"end_time":5.0,"tool_calls":null}}"#;
        let InboundMessage::StepUpdate(step) = decode(raw).unwrap() else {
            panic!("Wrong message type");
        };
        assert!((step.duration - 2.0).abs() < f64::EPSILON);
        assert!(step.tool_calls.is_empty());
    }

    #[test]
    fn test_decode_error_and_status() {
        assert_eq!(
            decode(r#"{"type":"error","detail":"model quota exceeded"}"#).unwrap(),
            InboundMessage::Error("model quota exceeded".into())
        );
        assert_eq!(
            decode(r#"{"type":"error"}"#).unwrap(),
            InboundMessage::Error(UNKNOWN_ERROR_DETAIL.into())
        );
        assert_eq!(
            decode(r#"{"type":"status","detail":"planning"}"#).unwrap(),
            InboundMessage::Status("planning".into())
        );
    }

    #[test]
    fn test_decode_unknown_type() {
        assert_eq!(
            decode(r#"{"type":"bogus"}"#),
            Err(DecodeError::UnknownType("bogus".into()))
        );
        assert!(matches!(
            decode(r#"{"type":7}"#),
            Err(DecodeError::UnknownType(_))
        ));
    }

    #[test]
    fn test_decode_missing_type() {
        assert_eq!(decode(r#"{"detail":"x"}"#), Err(DecodeError::MissingType));
    }

    #[test]
    fn test_decode_malformed_step() {
        assert!(matches!(
            decode(r#"{"type":"step_update","step":{}}"#),
            Err(DecodeError::MalformedStep(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"step_update"}"#),
            Err(DecodeError::MalformedStep(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"step_update","step":{"step_number":1,"start_time":0.0}}"#),
            Err(DecodeError::MalformedStep(_))
        ));
    }

    #[test]
    fn test_decode_invalid_json() {
        assert!(matches!(decode("not json"), Err(DecodeError::InvalidJson(_))));
        assert!(matches!(decode("42"), Err(DecodeError::InvalidJson(_))));
    }

    #[test]
    fn test_encode_turn() {
        let json = encode(&Turn::new("summarize doc")).unwrap();
        assert_eq!(json, r#"{"content":"summarize doc"}"#);

        let turn = Turn::new("analyze").with_context(TurnContext::new().with("doc_id", "inv-7"));
        let value: Value = serde_json::from_str(&encode(&turn).unwrap()).unwrap();
        assert_eq!(value["context"]["doc_id"], "inv-7");
    }

    #[test]
    fn test_encode_rejects_empty_turn() {
        assert!(matches!(encode(&Turn::new("")), Err(EncodeError::EmptyTurn)));
        let turn = Turn::new(" ").with_context(TurnContext::new());
        assert!(matches!(encode(&turn), Err(EncodeError::EmptyTurn)));
    }

    #[test]
    fn test_server_frame_is_decodable() {
        let step = StepRecord::new(1, 0.0, 0.25).with_observations("looked it up");
        let frame = InboundMessage::StepUpdate(step.clone()).to_frame().unwrap();
        assert!(frame.contains("\"type\":\"step_update\""));
        assert_eq!(decode(&frame).unwrap(), InboundMessage::StepUpdate(step));
    }

    #[test]
    fn test_decode_turn() {
        let turn = decode_turn(r#"{"content":"hi","context":{"doc_id":"a"}}"#).unwrap();
        assert_eq!(turn.content, "hi");
        assert_eq!(turn.context.unwrap().get("doc_id"), Some(&Value::from("a")));
    }
}

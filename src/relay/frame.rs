//! CDP wire frame shapes (§4.3.1). A frame is always a single JSON object;
//! which of `method`/`result`/`error` is present (plus whether `id` is set)
//! distinguishes a request, a response, and an event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// CDP error codes placed into outgoing `error.code` fields. These are wire
/// values, not [`crate::error::GatewayError`] variants — a single Rust error
/// can surface as different codes depending on which pending request it
/// belongs to.
pub mod codes {
    pub const NO_TARGET: i64 = -32000;
    pub const UNKNOWN_SESSION: i64 = -32001;
    pub const TIMEOUT: i64 = -32002;
    pub const DEVICE_DISCONNECTED: i64 = -32003;
    pub const TARGET_DETACHED: i64 = -32004;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdpError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CdpError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        CdpError {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// The raw shape as it travels the wire, before it's classified into a
/// [`Frame`]. Kept separate from `Frame` because an unparseable/malformed
/// frame (e.g. `id` present with neither `method` nor `result`/`error`)
/// still needs to be rejected with a specific diagnostic rather than a
/// generic deserialize failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFrame {
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CdpError>,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        params: Option<Value>,
        session_id: Option<String>,
    },
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<CdpError>,
        session_id: Option<String>,
    },
    Event {
        method: String,
        params: Option<Value>,
        session_id: Option<String>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has an id but neither method nor result/error")]
    Ambiguous,
}

impl Frame {
    pub fn parse(text: &str) -> Result<Frame, FrameError> {
        let raw: RawFrame = serde_json::from_str(text)?;
        raw.classify()
    }
}

impl RawFrame {
    pub fn classify(self) -> Result<Frame, FrameError> {
        match (self.id, self.method) {
            (Some(id), Some(method)) => Ok(Frame::Request {
                id,
                method,
                params: self.params,
                session_id: self.session_id,
            }),
            (Some(id), None) => Ok(Frame::Response {
                id,
                result: self.result,
                error: self.error,
                session_id: self.session_id,
            }),
            (None, Some(method)) => Ok(Frame::Event {
                method,
                params: self.params,
                session_id: self.session_id,
            }),
            (None, None) => Err(FrameError::Ambiguous),
        }
    }
}

pub fn response_ok(id: u64, result: Value, session_id: Option<String>) -> Value {
    serde_json::to_value(RawFrame {
        id: Some(id),
        method: None,
        params: None,
        result: Some(result),
        error: None,
        session_id,
    })
    .expect("RawFrame always serializes")
}

pub fn response_err(id: u64, error: CdpError, session_id: Option<String>) -> Value {
    serde_json::to_value(RawFrame {
        id: Some(id),
        method: None,
        params: None,
        result: None,
        error: Some(error),
        session_id,
    })
    .expect("RawFrame always serializes")
}

pub fn event(method: &str, params: Value, session_id: Option<String>) -> Value {
    serde_json::to_value(RawFrame {
        id: None,
        method: Some(method.to_string()),
        params: Some(params),
        result: None,
        error: None,
        session_id,
    })
    .expect("RawFrame always serializes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_request() {
        let frame = Frame::parse(r#"{"id":1,"method":"Page.navigate","params":{"url":"x"}}"#).unwrap();
        assert!(matches!(frame, Frame::Request { id: 1, .. }));
    }

    #[test]
    fn classifies_response_with_session() {
        let frame =
            Frame::parse(r#"{"id":7,"result":{"ok":true},"sessionId":"abc"}"#).unwrap();
        match frame {
            Frame::Response { id, session_id, .. } => {
                assert_eq!(id, 7);
                assert_eq!(session_id.as_deref(), Some("abc"));
            }
            _ => panic!("expected response"),
        }
    }

    #[test]
    fn classifies_event() {
        let frame = Frame::parse(r#"{"method":"Target.targetCreated","params":{}}"#).unwrap();
        assert!(matches!(frame, Frame::Event { .. }));
    }

    #[test]
    fn rejects_ambiguous_frame() {
        let err = Frame::parse(r#"{"foo":"bar"}"#).unwrap_err();
        assert!(matches!(err, FrameError::Ambiguous));
    }

    #[test]
    fn response_err_serializes_without_result_field() {
        let value = response_err(3, CdpError::new(codes::NO_TARGET, "no target"), None);
        assert!(value.get("result").is_none());
        assert_eq!(value["error"]["code"], -32000);
    }
}

//! OCPP-J message framing
//!
//! Every frame is a JSON array whose first element is the message type:
//! - CALL: `[2, messageId, action, payload]`
//! - CALLRESULT: `[3, messageId, payload]`
//! - CALLERROR: `[4, messageId, errorCode, errorDescription, errorDetails]`
//!
//! Encoding and decoding are pure; correlation lives in the session.

use serde_json::{json, Map, Value};
use thiserror::Error;

use super::error::{ErrorCode, RpcError};

/// OCPP Message Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            2 => Some(Self::Call),
            3 => Some(Self::CallResult),
            4 => Some(Self::CallError),
            _ => None,
        }
    }
}

/// OCPP Call message
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    pub method: String,
    pub params: Value,
}

/// OCPP CallResult message
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

/// OCPP CallError message
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn from_rpc(message_id: impl Into<String>, error: RpcError) -> Self {
        Self {
            message_id: message_id.into(),
            error_code: error.code,
            error_description: error.description,
            error_details: error.details,
        }
    }

    pub fn into_rpc(self) -> RpcError {
        RpcError {
            code: self.error_code,
            description: self.error_description,
            details: self.error_details,
        }
    }
}

/// Any OCPP-J frame
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Envelope {
    pub fn message_id(&self) -> &str {
        match self {
            Self::Call(c) => &c.message_id,
            Self::CallResult(r) => &r.message_id,
            Self::CallError(e) => &e.message_id,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Call(_) => MessageType::Call,
            Self::CallResult(_) => MessageType::CallResult,
            Self::CallError(_) => MessageType::CallError,
        }
    }
}

/// Why a frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingReason {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload is not a JSON array")]
    NotAnArray,
    #[error("message type is missing or not an integer")]
    InvalidTypeTag,
    #[error("unsupported message type {0}")]
    UnknownMessageType(i64),
    #[error("message type {tag} expects {expected} elements, got {found}")]
    Arity {
        tag: i64,
        expected: &'static str,
        found: usize,
    },
    #[error("`{0}` has the wrong type")]
    InvalidField(&'static str),
}

/// A frame that could not be decoded.
///
/// `message_id` is set when the frame looked like a request and its id could be
/// recovered, so the peer can still be answered with a CALLERROR.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct FramingError {
    pub reason: FramingReason,
    pub message_id: Option<String>,
}

impl FramingError {
    fn new(reason: FramingReason) -> Self {
        Self {
            reason,
            message_id: None,
        }
    }

    fn answerable(reason: FramingReason, message_id: Option<String>) -> Self {
        Self { reason, message_id }
    }

    /// The CALLERROR payload to answer this frame with, for a negotiated subprotocol.
    pub fn to_rpc_error(&self, protocol: &str) -> RpcError {
        let code = match self.reason {
            FramingReason::UnknownMessageType(_) => ErrorCode::message_type_not_supported(protocol),
            _ => ErrorCode::format_violation(protocol),
        };
        RpcError::new(code).with_description(self.reason.to_string())
    }
}

/// Serialize an envelope to its wire text.
pub fn encode(envelope: &Envelope) -> String {
    let array = match envelope {
        Envelope::Call(c) => json!([MessageType::Call as i32, c.message_id, c.method, c.params]),
        Envelope::CallResult(r) => json!([MessageType::CallResult as i32, r.message_id, r.payload]),
        Envelope::CallError(e) => json!([
            MessageType::CallError as i32,
            e.message_id,
            e.error_code.to_string(),
            e.error_description,
            e.error_details
        ]),
    };
    array.to_string()
}

/// Parse wire text into an envelope.
pub fn decode(text: &str) -> Result<Envelope, FramingError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| FramingError::new(FramingReason::InvalidJson(e.to_string())))?;
    let Value::Array(mut array) = value else {
        return Err(FramingError::new(FramingReason::NotAnArray));
    };

    let tag = array
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| FramingError::new(FramingReason::InvalidTypeTag))?;
    let salvaged_id = array.get(1).and_then(Value::as_str).map(str::to_string);

    let Some(message_type) = MessageType::from_tag(tag) else {
        return Err(FramingError::answerable(
            FramingReason::UnknownMessageType(tag),
            salvaged_id,
        ));
    };

    // Only requests are answered; a broken response has no one to report to.
    let reply_to = |reason| match message_type {
        MessageType::Call => FramingError::answerable(reason, salvaged_id.clone()),
        _ => FramingError::new(reason),
    };

    let expected: &'static str = match message_type {
        MessageType::Call => "4",
        MessageType::CallResult => "3",
        MessageType::CallError => "4 or 5",
    };
    let arity_ok = match message_type {
        MessageType::Call => array.len() == 4,
        MessageType::CallResult => array.len() == 3,
        MessageType::CallError => array.len() == 4 || array.len() == 5,
    };
    if !arity_ok {
        return Err(reply_to(FramingReason::Arity {
            tag,
            expected,
            found: array.len(),
        }));
    }

    let Some(message_id) = salvaged_id.clone() else {
        return Err(reply_to(FramingReason::InvalidField("messageId")));
    };

    match message_type {
        MessageType::Call => {
            let params = array.pop().unwrap_or(Value::Null);
            let method = array[2]
                .as_str()
                .ok_or_else(|| reply_to(FramingReason::InvalidField("action")))?
                .to_string();
            Ok(Envelope::Call(Call {
                message_id,
                method,
                params,
            }))
        }
        MessageType::CallResult => {
            let payload = array.pop().unwrap_or(Value::Null);
            Ok(Envelope::CallResult(CallResult {
                message_id,
                payload,
            }))
        }
        MessageType::CallError => {
            let error_details = if array.len() == 5 {
                array.pop().unwrap_or(Value::Null)
            } else {
                Value::Object(Map::new())
            };
            let error_code = array[2]
                .as_str()
                .map(ErrorCode::from_wire)
                .ok_or_else(|| reply_to(FramingReason::InvalidField("errorCode")))?;
            let error_description = array[3]
                .as_str()
                .ok_or_else(|| reply_to(FramingReason::InvalidField("errorDescription")))?
                .to_string();
            Ok(Envelope::CallError(CallError {
                message_id,
                error_code,
                error_description,
                error_details,
            }))
        }
    }
}

//! Error taxonomy for the RPC layer.
//!
//! [`RpcError`] is what travels on the wire inside a CALLERROR frame (and what
//! a handler returns to signal a protocol-level failure). [`OcppError`] is the
//! local error type surfaced to code that drives server-initiated calls.

use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;

use super::codec::FramingError;
use super::schema::ValidationError;

/// Protocol revision whose error vocabulary differs from later OCPP-J versions.
pub const OCPP16: &str = "ocpp1.6";

/// OCPP Error Codes
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    strum::EnumIter,
)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    FormatViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    /// OCPP 1.6 spelling of [`ErrorCode::OccurrenceConstraintViolation`].
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    MessageTypeNotSupported,
    RpcFrameworkError,
    GenericError,
}

impl ErrorCode {
    /// Parse a wire error code, degrading unknown codes to `GenericError`.
    pub fn from_wire(code: &str) -> Self {
        code.parse().unwrap_or(Self::GenericError)
    }

    /// The "payload is syntactically wrong" code for a negotiated subprotocol.
    pub fn format_violation(protocol: &str) -> Self {
        if protocol == OCPP16 {
            Self::FormationViolation
        } else {
            Self::FormatViolation
        }
    }

    /// The occurrence-constraint code for a negotiated subprotocol.
    pub fn occurrence_violation(protocol: &str) -> Self {
        if protocol == OCPP16 {
            Self::OccurenceConstraintViolation
        } else {
            Self::OccurrenceConstraintViolation
        }
    }

    /// The "unknown message type" code for a negotiated subprotocol.
    pub fn message_type_not_supported(protocol: &str) -> Self {
        if protocol == OCPP16 {
            Self::NotSupported
        } else {
            Self::MessageTypeNotSupported
        }
    }

    /// Default human readable description, taken from the OCPP-J error table.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotImplemented => "Requested Action is not known by receiver",
            Self::NotSupported => "Requested Action is recognized but not supported by the receiver",
            Self::InternalError => "An internal error occurred and the receiver was not able to process the requested Action successfully",
            Self::ProtocolError => "Payload for Action is incomplete",
            Self::SecurityError => "During the processing of Action a security issue occurred preventing receiver from completing the Action successfully",
            Self::FormationViolation | Self::FormatViolation => "Payload for Action is syntactically incorrect or not conform the PDU structure for Action",
            Self::PropertyConstraintViolation => "Payload is syntactically correct but at least one field contains an invalid value",
            Self::OccurrenceConstraintViolation | Self::OccurenceConstraintViolation => "Payload for Action is syntactically correct but at least one of the fields violates occurrence constraints",
            Self::TypeConstraintViolation => "Payload for Action is syntactically correct but at least one of the fields violates data type constraints",
            Self::MessageTypeNotSupported => "A message with an Message Type Number received that is not supported by this implementation",
            Self::RpcFrameworkError => "Content of the call is not a valid RPC Request",
            Self::GenericError => "Any other error not covered by the previous ones",
        }
    }
}

/// A protocol-level error that is sent to the peer as a CALLERROR.
///
/// Handlers return it (wrapped in `anyhow::Error`) to answer a call with a
/// specific error code instead of a result.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{code}: {description}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub description: String,
    pub details: Value,
}

impl RpcError {
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            description: code.description().to_string(),
            details: Value::Object(Map::new()),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn not_implemented() -> Self {
        Self::new(ErrorCode::NotImplemented)
    }

    pub fn internal() -> Self {
        Self::new(ErrorCode::InternalError)
    }
}

/// Local failures of the RPC layer.
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("malformed frame: {0}")]
    Framing(#[from] FramingError),

    #[error("schema validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("peer answered with an error: {0}")]
    Remote(RpcError),

    #[error("call {method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("connection closed")]
    ConnectionClosed,
}

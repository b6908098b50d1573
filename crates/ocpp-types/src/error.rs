//! Error types for OCPP operations

use thiserror::Error;

/// Error type for type-level and codec-level OCPP failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OcppError {
    /// Invalid message type identifier
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    /// JSON serialization/deserialization error
    #[error("JSON error: {message}")]
    Json { message: String },

    /// Frame does not have the OCPP-J array shape
    #[error("Malformed frame: {message}")]
    MalformedFrame { message: String },

    /// Action name not known to this implementation
    #[error("Unknown action: {action}")]
    UnknownAction { action: String },

    /// Error code not defined by OCPP-J
    #[error("Unknown call error code: {code}")]
    UnknownErrorCode { code: String },

    /// Transport error
    #[error("Transport error: {message}")]
    Transport { message: String },
}

impl From<serde_json::Error> for OcppError {
    fn from(err: serde_json::Error) -> Self {
        OcppError::Json {
            message: err.to_string(),
        }
    }
}

/// OCPP-J CALLERROR codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CallErrorCode {
    /// Requested Action is not known by receiver
    NotImplemented,

    /// Requested Action is recognized but not supported by the receiver
    NotSupported,

    /// An internal error occurred and the receiver was not able to process the requested Action successfully
    InternalError,

    /// Payload for Action is incomplete
    ProtocolError,

    /// During the processing of Action a security issue occurred preventing receiver from completing the Action successfully
    SecurityError,

    /// Payload for Action is syntactically incorrect or not conform the PDU structure for Action
    FormationViolation,

    /// Payload is syntactically correct but at least one field contains an invalid value
    PropertyConstraintViolation,

    /// Payload for Action is syntactically correct but at least one of the fields violates occurrence constraints.
    /// OCPP 1.6J spells it with a single `r` on the wire.
    #[serde(rename = "OccurenceConstraintViolation", alias = "OccurrenceConstraintViolation")]
    OccurrenceConstraintViolation,

    /// Payload for Action is syntactically correct but at least one of the fields violates data type constraints (e.g. "somestring": 12)
    TypeConstraintViolation,

    /// Any other error not covered by the above
    GenericError,
}

impl std::fmt::Display for CallErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallErrorCode {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NotImplemented" => Ok(CallErrorCode::NotImplemented),
            "NotSupported" => Ok(CallErrorCode::NotSupported),
            "InternalError" => Ok(CallErrorCode::InternalError),
            "ProtocolError" => Ok(CallErrorCode::ProtocolError),
            "SecurityError" => Ok(CallErrorCode::SecurityError),
            "FormationViolation" => Ok(CallErrorCode::FormationViolation),
            "PropertyConstraintViolation" => Ok(CallErrorCode::PropertyConstraintViolation),
            "OccurenceConstraintViolation" | "OccurrenceConstraintViolation" => {
                Ok(CallErrorCode::OccurrenceConstraintViolation)
            }
            "TypeConstraintViolation" => Ok(CallErrorCode::TypeConstraintViolation),
            "GenericError" => Ok(CallErrorCode::GenericError),
            other => Err(OcppError::UnknownErrorCode {
                code: other.to_string(),
            }),
        }
    }
}

impl CallErrorCode {
    /// Error code as it appears on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            CallErrorCode::NotImplemented => "NotImplemented",
            CallErrorCode::NotSupported => "NotSupported",
            CallErrorCode::InternalError => "InternalError",
            CallErrorCode::ProtocolError => "ProtocolError",
            CallErrorCode::SecurityError => "SecurityError",
            CallErrorCode::FormationViolation => "FormationViolation",
            CallErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            CallErrorCode::OccurrenceConstraintViolation => "OccurenceConstraintViolation",
            CallErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            CallErrorCode::GenericError => "GenericError",
        }
    }

    /// The receiver rejected the shape of the payload. Resending the same
    /// payload would fail the same way.
    pub fn is_schema_violation(&self) -> bool {
        matches!(
            self,
            CallErrorCode::ProtocolError
                | CallErrorCode::FormationViolation
                | CallErrorCode::PropertyConstraintViolation
                | CallErrorCode::OccurrenceConstraintViolation
                | CallErrorCode::TypeConstraintViolation
        )
    }

    /// The receiver failed for reasons unrelated to the payload itself
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallErrorCode::InternalError | CallErrorCode::GenericError
        )
    }
}

/// Result type alias for OCPP operations
pub type OcppResult<T> = Result<T, OcppError>;

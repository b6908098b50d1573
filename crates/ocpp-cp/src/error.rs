//! # Charge Point Error Handling
//!
//! Error types for the charge point engine. Every terminal outcome of an
//! outbound call is one of these variants, delivered to the caller's handle.

use ocpp_types::{CallErrorCode, OcppError};
use thiserror::Error;

/// Charge point error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChargePointError {
    /// Malformed outbound or inbound payload
    #[error("Parsing error: {0}")]
    ParsingError(String),

    /// Remote side rejected the payload shape
    #[error("Schema validation error: {0}")]
    SchemaValidationError(String),

    /// Local processing of a response failed
    #[error("Handler exception: {0}")]
    HandlerException(String),

    /// Retries exhausted without a response
    #[error("Call {unique_id} timed out after {attempts} retries")]
    CmdTimeout { unique_id: String, attempts: u32 },

    /// Queue torn down while the call was pending
    #[error("Message queue shut down")]
    Shutdown,

    /// Transport not connected
    #[error("Transport not ready")]
    NotReady,

    /// Queue paused while offline; the call was not accepted
    #[error("Message queue is offline")]
    Offline,

    /// Discarded to keep the queue below its size threshold
    #[error("Call {0} dropped from the queue")]
    Dropped(String),

    /// Remote CALLERROR that is neither a schema failure nor retried further
    #[error("Call error {code}: {description}")]
    CallError {
        code: CallErrorCode,
        description: String,
    },

    /// Unique id already pending
    #[error("Duplicate unique id: {0}")]
    DuplicateUniqueId(String),

    /// Connector id outside of 0..=N
    #[error("Invalid connector {connector_id}: {message}")]
    InvalidConnector { connector_id: u32, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Transaction message store failure
    #[error("Persistence error: {0}")]
    PersistenceError(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

impl ChargePointError {
    /// Create a parsing error
    pub fn parsing(message: impl Into<String>) -> Self {
        Self::ParsingError(message.into())
    }

    /// Create a schema validation error
    pub fn schema_validation(message: impl Into<String>) -> Self {
        Self::SchemaValidationError(message.into())
    }

    /// Create a handler exception
    pub fn handler(message: impl Into<String>) -> Self {
        Self::HandlerException(message.into())
    }

    /// Create a timeout error
    pub fn timeout(unique_id: impl Into<String>, attempts: u32) -> Self {
        Self::CmdTimeout {
            unique_id: unique_id.into(),
            attempts,
        }
    }

    /// Create a remote call error
    pub fn call_error(code: CallErrorCode, description: impl Into<String>) -> Self {
        Self::CallError {
            code,
            description: description.into(),
        }
    }

    /// Create an invalid connector error
    pub fn invalid_connector(connector_id: u32, message: impl Into<String>) -> Self {
        Self::InvalidConnector {
            connector_id,
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::ConfigurationError(message.into())
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::PersistenceError(message.into())
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportError(message.into())
    }

    /// Classify a remote CALLERROR into the terminal error delivered to the caller
    pub fn from_call_error(code: CallErrorCode, description: impl Into<String>) -> Self {
        let description = description.into();
        if code.is_schema_violation() {
            Self::SchemaValidationError(format!("{}: {}", code, description))
        } else {
            Self::call_error(code, description)
        }
    }

    /// Whether this error ends the life of a call. `NotReady` only defers.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotReady)
    }

    /// Get error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ParsingError(_) | Self::SchemaValidationError(_) | Self::CallError { .. } => {
                ErrorCategory::Protocol
            }
            Self::HandlerException(_) => ErrorCategory::Logic,
            Self::CmdTimeout { .. } => ErrorCategory::Performance,
            Self::Shutdown => ErrorCategory::System,
            Self::NotReady | Self::Offline | Self::TransportError(_) => ErrorCategory::Network,
            Self::Dropped(_) => ErrorCategory::Resource,
            Self::DuplicateUniqueId(_) | Self::InvalidConnector { .. } => ErrorCategory::Logic,
            Self::ConfigurationError(_) => ErrorCategory::Configuration,
            Self::PersistenceError(_) => ErrorCategory::Resource,
        }
    }
}

impl From<OcppError> for ChargePointError {
    fn from(err: OcppError) -> Self {
        match err {
            OcppError::Transport { message } => Self::TransportError(message),
            other => Self::ParsingError(other.to_string()),
        }
    }
}

/// Error categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network/connection related errors
    Network,
    /// Protocol/message format errors
    Protocol,
    /// Configuration errors
    Configuration,
    /// Performance/timeout errors
    Performance,
    /// Resource availability errors
    Resource,
    /// Lifecycle of the engine itself
    System,
    /// Logic/programming errors
    Logic,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "Network"),
            ErrorCategory::Protocol => write!(f, "Protocol"),
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Performance => write!(f, "Performance"),
            ErrorCategory::Resource => write!(f, "Resource"),
            ErrorCategory::System => write!(f, "System"),
            ErrorCategory::Logic => write!(f, "Logic"),
        }
    }
}

/// Result type for charge point operations
pub type ChargePointResult<T> = Result<T, ChargePointError>;

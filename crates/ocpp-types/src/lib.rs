//! # OCPP Types
//!
//! Foundational types shared by the charge point engine: outbound calls and
//! their message kinds, inbound response frames, status and error code enums,
//! and the error type for codec-level failures.

pub mod error;
pub mod message;
pub mod v16j;

pub use error::*;
pub use message::*;

/// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
pub use uuid::Uuid;

/// Message type identifier, the first element of every OCPP-J frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = OcppError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(MessageType::Call),
            3 => Ok(MessageType::CallResult),
            4 => Ok(MessageType::CallError),
            _ => Err(OcppError::InvalidMessageType(value)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(msg_type: MessageType) -> Self {
        msg_type as u8
    }
}

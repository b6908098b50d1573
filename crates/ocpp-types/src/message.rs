//! Outbound call and inbound response types for the OCPP-J protocol

use crate::{CallErrorCode, MessageType, OcppError, OcppResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Actions a charge point originates towards the central system.
///
/// The engine only needs to know whether a call is transaction-related and
/// whether it opens the session, so the payload shape is not part of the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Authorize,
    BootNotification,
    DataTransfer,
    DiagnosticsStatusNotification,
    FirmwareStatusNotification,
    Heartbeat,
    LogStatusNotification,
    MeterValues,
    SecurityEventNotification,
    SignedFirmwareStatusNotification,
    StartTransaction,
    StatusNotification,
    StopTransaction,
}

impl MessageKind {
    /// Action name as it appears on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Authorize => "Authorize",
            MessageKind::BootNotification => "BootNotification",
            MessageKind::DataTransfer => "DataTransfer",
            MessageKind::DiagnosticsStatusNotification => "DiagnosticsStatusNotification",
            MessageKind::FirmwareStatusNotification => "FirmwareStatusNotification",
            MessageKind::Heartbeat => "Heartbeat",
            MessageKind::LogStatusNotification => "LogStatusNotification",
            MessageKind::MeterValues => "MeterValues",
            MessageKind::SecurityEventNotification => "SecurityEventNotification",
            MessageKind::SignedFirmwareStatusNotification => "SignedFirmwareStatusNotification",
            MessageKind::StartTransaction => "StartTransaction",
            MessageKind::StatusNotification => "StatusNotification",
            MessageKind::StopTransaction => "StopTransaction",
        }
    }

    /// Part of the ordered record of a charging session
    pub fn is_transaction_related(&self) -> bool {
        matches!(
            self,
            MessageKind::StartTransaction
                | MessageKind::StopTransaction
                | MessageKind::MeterValues
                | MessageKind::SecurityEventNotification
        )
    }

    /// No other traffic may precede the acceptance of this call
    pub fn is_session_opening(&self) -> bool {
        matches!(self, MessageKind::BootNotification)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s {
            "Authorize" => MessageKind::Authorize,
            "BootNotification" => MessageKind::BootNotification,
            "DataTransfer" => MessageKind::DataTransfer,
            "DiagnosticsStatusNotification" => MessageKind::DiagnosticsStatusNotification,
            "FirmwareStatusNotification" => MessageKind::FirmwareStatusNotification,
            "Heartbeat" => MessageKind::Heartbeat,
            "LogStatusNotification" => MessageKind::LogStatusNotification,
            "MeterValues" => MessageKind::MeterValues,
            "SecurityEventNotification" => MessageKind::SecurityEventNotification,
            "SignedFirmwareStatusNotification" => MessageKind::SignedFirmwareStatusNotification,
            "StartTransaction" => MessageKind::StartTransaction,
            "StatusNotification" => MessageKind::StatusNotification,
            "StopTransaction" => MessageKind::StopTransaction,
            other => {
                return Err(OcppError::UnknownAction {
                    action: other.to_string(),
                })
            }
        };
        Ok(kind)
    }
}

/// One outbound request awaiting a correlated response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Unique message identifier, echoed back by the response
    pub unique_id: String,
    /// Action of this call
    pub kind: MessageKind,
    /// Request payload, opaque to the engine
    pub payload: Value,
    /// When the call was created
    pub created_at: DateTime<Utc>,
}

impl Call {
    /// Create a new call with a fresh unique id
    pub fn new<T>(kind: MessageKind, payload: T) -> OcppResult<Self>
    where
        T: Serialize,
    {
        Self::with_unique_id(Uuid::new_v4().to_string(), kind, payload)
    }

    /// Create a call with a caller supplied unique id
    pub fn with_unique_id<T>(unique_id: impl Into<String>, kind: MessageKind, payload: T) -> OcppResult<Self>
    where
        T: Serialize,
    {
        Ok(Call {
            unique_id: unique_id.into(),
            kind,
            payload: serde_json::to_value(payload)?,
            created_at: Utc::now(),
        })
    }

    /// Encode as `[2, "unique_id", "action", payload]`
    pub fn to_frame(&self) -> Value {
        json!([
            u8::from(MessageType::Call),
            self.unique_id,
            self.kind.as_str(),
            self.payload
        ])
    }

    /// Extract the payload as a specific type
    pub fn payload_as<T>(&self) -> OcppResult<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CallResult message (successful response)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallResultMessage {
    /// Unique message identifier (same as corresponding Call)
    pub unique_id: String,
    /// Response payload
    pub payload: Value,
}

/// OCPP CallError message (error response)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallErrorMessage {
    /// Unique message identifier (same as corresponding Call)
    pub unique_id: String,
    /// Error code
    pub error_code: CallErrorCode,
    /// Human-readable error description
    pub error_description: String,
    /// Additional error details
    pub error_details: Value,
}

impl CallErrorMessage {
    pub fn new(
        unique_id: String,
        error_code: CallErrorCode,
        error_description: String,
        error_details: Option<Value>,
    ) -> Self {
        CallErrorMessage {
            unique_id,
            error_code,
            error_description,
            error_details: error_details.unwrap_or(Value::Object(Default::default())),
        }
    }
}

/// A response frame correlated to an earlier call by its unique id
#[derive(Debug, Clone, PartialEq)]
pub enum CallResponse {
    /// `[3, "unique_id", payload]`
    Result(CallResultMessage),
    /// `[4, "unique_id", "error_code", "error_description", error_details]`
    Error(CallErrorMessage),
}

impl CallResponse {
    pub fn unique_id(&self) -> &str {
        match self {
            CallResponse::Result(msg) => &msg.unique_id,
            CallResponse::Error(msg) => &msg.unique_id,
        }
    }

    /// Parse a response from its textual wire form
    pub fn parse(text: &str) -> OcppResult<Self> {
        let frame: Value = serde_json::from_str(text)?;
        Self::from_frame(&frame)
    }

    /// Decode a response from its JSON array wire form
    pub fn from_frame(frame: &Value) -> OcppResult<Self> {
        let items = frame.as_array().ok_or_else(|| OcppError::MalformedFrame {
            message: "frame is not a JSON array".to_string(),
        })?;

        let type_id = items
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| OcppError::MalformedFrame {
                message: "missing message type id".to_string(),
            })?;
        let message_type = u8::try_from(type_id)
            .map_err(|_| OcppError::MalformedFrame {
                message: format!("message type id out of range: {}", type_id),
            })
            .and_then(MessageType::try_from)?;

        let unique_id = items
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| OcppError::MalformedFrame {
                message: "missing unique id".to_string(),
            })?
            .to_string();

        match message_type {
            MessageType::CallResult => {
                let payload = items.get(2).cloned().ok_or_else(|| OcppError::MalformedFrame {
                    message: format!("CALLRESULT {} has no payload", unique_id),
                })?;
                Ok(CallResponse::Result(CallResultMessage { unique_id, payload }))
            }
            MessageType::CallError => {
                let raw_code = items
                    .get(2)
                    .and_then(Value::as_str)
                    .ok_or_else(|| OcppError::MalformedFrame {
                        message: format!("CALLERROR {} has no error code", unique_id),
                    })?;
                let description = items.get(3).and_then(Value::as_str).unwrap_or_default();
                // Unknown codes still resolve the call; the raw code is kept in the description
                let (error_code, error_description) = match raw_code.parse::<CallErrorCode>() {
                    Ok(code) => (code, description.to_string()),
                    Err(_) => (
                        CallErrorCode::GenericError,
                        format!("{}: {}", raw_code, description),
                    ),
                };
                let error_details = items.get(4).cloned();
                Ok(CallResponse::Error(CallErrorMessage::new(
                    unique_id,
                    error_code,
                    error_description,
                    error_details,
                )))
            }
            MessageType::Call => Err(OcppError::InvalidMessageType(type_id as u8)),
        }
    }
}

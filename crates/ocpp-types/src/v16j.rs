//! OCPP 1.6J specific types and enums

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Charge point status as reported in StatusNotification.req
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ChargePointStatus {
    /// Available for new transaction
    Available,
    /// Preparing for transaction
    Preparing,
    /// Charging in progress
    Charging,
    /// SuspendedEV - charging suspended by EV
    #[serde(rename = "SuspendedEV")]
    SuspendedEV,
    /// SuspendedEVSE - charging suspended by EVSE
    #[serde(rename = "SuspendedEVSE")]
    SuspendedEVSE,
    /// Transaction finished, user action still required
    Finishing,
    /// Reserved for specific user
    Reserved,
    /// Unavailable due to local action or ChangeAvailability
    Unavailable,
    /// Out of order
    Faulted,
}

impl std::fmt::Display for ChargePointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChargePointStatus::Available => "Available",
            ChargePointStatus::Preparing => "Preparing",
            ChargePointStatus::Charging => "Charging",
            ChargePointStatus::SuspendedEV => "SuspendedEV",
            ChargePointStatus::SuspendedEVSE => "SuspendedEVSE",
            ChargePointStatus::Finishing => "Finishing",
            ChargePointStatus::Reserved => "Reserved",
            ChargePointStatus::Unavailable => "Unavailable",
            ChargePointStatus::Faulted => "Faulted",
        };
        f.write_str(name)
    }
}

/// Error code enumeration for OCPP 1.6J
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ChargePointErrorCode {
    /// Connector lock failure
    ConnectorLockFailure,
    /// EV communication failure
    #[serde(rename = "EVCommunicationError")]
    EVCommunicationError,
    /// Ground failure
    GroundFailure,
    /// High temperature
    HighTemperature,
    /// Internal error
    InternalError,
    /// Local list conflict
    LocalListConflict,
    /// No error
    NoError,
    /// Other error
    OtherError,
    /// Over current failure
    OverCurrentFailure,
    /// Over voltage
    OverVoltage,
    /// Power meter failure
    PowerMeterFailure,
    /// Power switch failure
    PowerSwitchFailure,
    /// Reader failure
    ReaderFailure,
    /// Reset failure
    ResetFailure,
    /// Under voltage
    UnderVoltage,
    /// Weak signal
    WeakSignal,
}

impl std::fmt::Display for ChargePointErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChargePointErrorCode::ConnectorLockFailure => write!(f, "ConnectorLockFailure"),
            ChargePointErrorCode::EVCommunicationError => write!(f, "EVCommunicationError"),
            ChargePointErrorCode::GroundFailure => write!(f, "GroundFailure"),
            ChargePointErrorCode::HighTemperature => write!(f, "HighTemperature"),
            ChargePointErrorCode::InternalError => write!(f, "InternalError"),
            ChargePointErrorCode::LocalListConflict => write!(f, "LocalListConflict"),
            ChargePointErrorCode::NoError => write!(f, "NoError"),
            ChargePointErrorCode::OtherError => write!(f, "OtherError"),
            ChargePointErrorCode::OverCurrentFailure => write!(f, "OverCurrentFailure"),
            ChargePointErrorCode::OverVoltage => write!(f, "OverVoltage"),
            ChargePointErrorCode::PowerMeterFailure => write!(f, "PowerMeterFailure"),
            ChargePointErrorCode::PowerSwitchFailure => write!(f, "PowerSwitchFailure"),
            ChargePointErrorCode::ReaderFailure => write!(f, "ReaderFailure"),
            ChargePointErrorCode::ResetFailure => write!(f, "ResetFailure"),
            ChargePointErrorCode::UnderVoltage => write!(f, "UnderVoltage"),
            ChargePointErrorCode::WeakSignal => write!(f, "WeakSignal"),
        }
    }
}

/// Availability of a connector as set by ChangeAvailability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum AvailabilityType {
    Inoperative,
    Operative,
}

/// StatusNotification request message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNotificationRequest {
    /// Connector ID, 0 for the charge point itself
    #[serde(rename = "connectorId")]
    pub connector_id: u32,
    /// Error code, `NoError` when not faulted
    #[serde(rename = "errorCode")]
    pub error_code: ChargePointErrorCode,
    /// Additional information about the error (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<String>,
    /// Current status
    pub status: ChargePointStatus,
    /// Timestamp of status change (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Vendor-specific error code (optional)
    #[serde(rename = "vendorErrorCode", skip_serializing_if = "Option::is_none")]
    pub vendor_error_code: Option<String>,
}

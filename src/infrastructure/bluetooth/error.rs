//! Session Error Classification
//!
//! Maps transport failures onto the errors surfaced by the DRO session.

use crate::infrastructure::bluetooth::connection::SessionState;
use crate::infrastructure::bluetooth::protocol::DroCharacteristic;
use crate::infrastructure::bluetooth::transport::{GattStatus, TransportError};
use std::fmt;
use thiserror::Error;

/// HRESULTs the session distinguishes
pub const E_BLUETOOTH_ATT_WRITE_NOT_PERMITTED: u32 = 0x8065_0003;
pub const E_BLUETOOTH_ATT_INVALID_PDU: u32 = 0x8065_0004;
pub const E_ACCESSDENIED: u32 = 0x8007_0005;
/// HRESULT_FROM_WIN32(ERROR_DEVICE_NOT_AVAILABLE)
pub const E_DEVICE_NOT_AVAILABLE: u32 = 0x8007_10DF;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DroError {
    #[error("Bluetooth radio is not on")]
    DeviceUnavailable,

    #[error("failed to connect to device")]
    ConnectionFailed,

    #[error("DRO service not found on device")]
    ServiceNotFound,

    #[error("{0} services match the DRO service UUID")]
    MultipleServicesAmbiguous(usize),

    #[error("{0} characteristic not found")]
    CharacteristicNotFound(DroCharacteristic),

    #[error("{count} {which} characteristics found")]
    MultipleCharacteristicsAmbiguous {
        which: DroCharacteristic,
        count: usize,
    },

    #[error("position characteristic supports neither indicate nor notify")]
    NoNotificationSupport,

    #[error("subscription rejected: {0}")]
    SubscriptionRejected(GattStatus),

    /// Device advertises indicate/notify but refuses the CCCD write
    #[error("{0}")]
    UnauthorizedSubscription(String),

    #[error("malformed payload: expected 4 bytes, got {len}")]
    MalformedPayload { len: usize },

    #[error("value {0} is out of range")]
    OutOfRange(f64),

    #[error("{0}")]
    InvalidInput(InvalidInput),

    #[error("write rejected ({reason}): {message}")]
    WriteRejected {
        reason: WriteRejection,
        message: String,
    },

    #[error("{status}{}", protocol_detail(.detail))]
    ProtocolError {
        status: GattStatus,
        detail: Option<u8>,
    },

    #[error("session is busy ({0:?})")]
    SessionBusy(SessionState),

    #[error("already subscribed for value changes")]
    AlreadySubscribed,

    #[error("not connected")]
    NotConnected,

    #[error("operation superseded by disconnect")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),
}

fn protocol_detail(detail: &Option<u8>) -> String {
    detail
        .map(|code| format!(" (ATT error {:#04X})", code))
        .unwrap_or_default()
}

/// Why user input was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidInput {
    Empty,
    NotANumber,
}

impl fmt::Display for InvalidInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("No data to set position"),
            Self::NotANumber => f.write_str("Set position has to be a valid number"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRejection {
    /// ATT invalid PDU
    Malformed,
    /// Characteristic advertises write but the device refuses it
    Unauthorized,
}

impl fmt::Display for WriteRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => f.write_str("malformed"),
            Self::Unauthorized => f.write_str("unauthorized"),
        }
    }
}

/// Which session step raised a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorContext {
    Open,
    Discovery,
    Subscribe,
    Write,
}

/// Map a transport failure onto the session error taxonomy
pub fn classify(error: &TransportError, context: ErrorContext) -> DroError {
    match error {
        TransportError::Platform { code, message } => match (*code, context) {
            (E_DEVICE_NOT_AVAILABLE, _) => DroError::DeviceUnavailable,
            (E_ACCESSDENIED | E_BLUETOOTH_ATT_WRITE_NOT_PERMITTED, ErrorContext::Subscribe) => {
                DroError::UnauthorizedSubscription(message.clone())
            }
            (E_ACCESSDENIED | E_BLUETOOTH_ATT_WRITE_NOT_PERMITTED, ErrorContext::Write) => {
                DroError::WriteRejected {
                    reason: WriteRejection::Unauthorized,
                    message: message.clone(),
                }
            }
            (E_BLUETOOTH_ATT_INVALID_PDU, ErrorContext::Write) => DroError::WriteRejected {
                reason: WriteRejection::Malformed,
                message: message.clone(),
            },
            _ => DroError::Transport(error.to_string()),
        },
        TransportError::Status(status) => classify_status(*status, None),
        TransportError::Other(message) => DroError::Transport(message.clone()),
    }
}

/// Map a non-success GATT status onto a protocol error
pub fn classify_status(status: GattStatus, detail: Option<u8>) -> DroError {
    DroError::ProtocolError { status, detail }
}

use serde::{Deserialize, Serialize};

/// Events flowing from the Bluetooth side to the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// A decoded position reading from the DRO
    PositionSample(f64),
    ConnectionStatus(ConnectionStatus),
    LogMessage(StatusMessage),
}

/// Commands from the presentation layer to the Bluetooth side
#[derive(Debug, Clone, PartialEq)]
pub enum BluetoothCommand {
    SelectDevice(SelectedDevice),
    Connect,
    SetPosition(String),
    Disconnect,
}

/// Device picked by the discovery layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedDevice {
    /// Platform device identifier
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

impl StatusMessage {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Info,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            severity: MessageSeverity::Error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Error,
}

/// What to do when a UUID lookup returns more than one match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Take the first match and record the ambiguity
    #[default]
    FirstMatch,
    /// Fail discovery
    Reject,
}

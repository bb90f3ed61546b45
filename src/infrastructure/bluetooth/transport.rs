//! GATT Transport Seam
//!
//! The narrow set of platform GATT operations the session core drives. The
//! Windows build implements it on top of WinRT; tests use a scripted backend.

use async_trait::async_trait;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Characteristic property bits as advertised by the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProperties(u32);

impl CharacteristicProperties {
    pub const READ: Self = Self(0x02);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Client Characteristic Configuration Descriptor value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CccdValue {
    None,
    Notify,
    Indicate,
}

impl CccdValue {
    /// Pick the delivery mode for a characteristic, preferring indications
    pub fn preferred_for(properties: CharacteristicProperties) -> Self {
        if properties.contains(CharacteristicProperties::INDICATE) {
            Self::Indicate
        } else if properties.contains(CharacteristicProperties::NOTIFY) {
            Self::Notify
        } else {
            Self::None
        }
    }
}

/// GATT communication status reported for a completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    Unreachable,
    ProtocolError,
    AccessDenied,
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "Success",
            Self::Unreachable => "Unreachable",
            Self::ProtocolError => "ProtocolError",
            Self::AccessDenied => "AccessDenied",
        };
        f.write_str(name)
    }
}

/// Result of a write with response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub status: GattStatus,
    /// ATT error code, when the peer sent one
    pub protocol_error: Option<u8>,
}

impl WriteOutcome {
    pub fn success() -> Self {
        Self {
            status: GattStatus::Success,
            protocol_error: None,
        }
    }
}

/// Failure raised by the platform transport
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Platform exception carrying an HRESULT
    #[error("{message} (HRESULT {code:#010X})")]
    Platform { code: u32, message: String },

    /// A request completed with a non-success status
    #[error("GATT request failed: {0}")]
    Status(GattStatus),

    #[error("{0}")]
    Other(String),
}

/// Registration returned when attaching a value-changed handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerToken(pub i64);

/// Callback invoked with the raw bytes of each value change
pub type ValueChangedHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Platform GATT client operations
#[async_trait]
pub trait GattBackend: Send + Sync + 'static {
    type Device: Send + Sync + 'static;
    type Service: Send + Sync + 'static;
    type Characteristic: Clone + Send + Sync + 'static;

    /// Open a device by platform id; `Ok(None)` when the platform returns no device
    async fn open_device(&self, device_id: &str) -> Result<Option<Self::Device>, TransportError>;

    async fn services_for_uuid(
        &self,
        device: &Self::Device,
        uuid: Uuid,
    ) -> Result<Vec<Self::Service>, TransportError>;

    async fn characteristics_for_uuid(
        &self,
        service: &Self::Service,
        uuid: Uuid,
    ) -> Result<Vec<Self::Characteristic>, TransportError>;

    fn properties(
        &self,
        characteristic: &Self::Characteristic,
    ) -> Result<CharacteristicProperties, TransportError>;

    async fn write_cccd(
        &self,
        characteristic: &Self::Characteristic,
        value: CccdValue,
    ) -> Result<GattStatus, TransportError>;

    fn add_value_changed(
        &self,
        characteristic: &Self::Characteristic,
        handler: ValueChangedHandler,
    ) -> Result<HandlerToken, TransportError>;

    fn remove_value_changed(
        &self,
        characteristic: &Self::Characteristic,
        token: HandlerToken,
    ) -> Result<(), TransportError>;

    async fn write_value_with_result(
        &self,
        characteristic: &Self::Characteristic,
        payload: &[u8],
    ) -> Result<WriteOutcome, TransportError>;

    /// Release the device; further requests on it fail
    fn close_device(&self, device: &Self::Device) -> Result<(), TransportError>;
}

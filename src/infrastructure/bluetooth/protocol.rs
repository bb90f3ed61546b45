//! BlueDRO Protocol
//!
//! GATT identifiers of the DRO service and the fixed-point wire format used
//! by its position characteristics.

use crate::infrastructure::bluetooth::error::DroError;
use std::fmt;
use uuid::Uuid;

/// BlueDRO GATT Service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0xd7578caf_686d_4216_ba8e_a3703f1590fc);

/// Current position, delivered by indicate or notify
pub const POSITION_CHAR_UUID: Uuid = Uuid::from_u128(0xd757fcb0_686d_4216_ba8e_a3703f1590fc);

/// Scale numerator (read-only metadata)
pub const NUMERATOR_CHAR_UUID: Uuid = Uuid::from_u128(0xd757fcb1_686d_4216_ba8e_a3703f1590fc);

/// Scale denominator (read-only metadata)
pub const DENOMINATOR_CHAR_UUID: Uuid = Uuid::from_u128(0xd757fcb2_686d_4216_ba8e_a3703f1590fc);

/// Axis direction (read-only metadata)
pub const REVERSE_CHAR_UUID: Uuid = Uuid::from_u128(0xd757fcb3_686d_4216_ba8e_a3703f1590fc);

/// Position preset, written with response
pub const SET_POSITION_CHAR_UUID: Uuid = Uuid::from_u128(0xd757fcb4_686d_4216_ba8e_a3703f1590fc);

/// Payload size of every numeric characteristic
pub const PAYLOAD_LEN: usize = 4;

/// Wire values are thousandths of the device unit
pub const SCALE: f64 = 1000.0;

/// The five characteristics of the DRO service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DroCharacteristic {
    Position,
    Numerator,
    Denominator,
    Reverse,
    SetPosition,
}

impl DroCharacteristic {
    /// Resolution order used during discovery
    pub const ALL: [DroCharacteristic; 5] = [
        Self::Position,
        Self::Numerator,
        Self::Denominator,
        Self::Reverse,
        Self::SetPosition,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Position => POSITION_CHAR_UUID,
            Self::Numerator => NUMERATOR_CHAR_UUID,
            Self::Denominator => DENOMINATOR_CHAR_UUID,
            Self::Reverse => REVERSE_CHAR_UUID,
            Self::SetPosition => SET_POSITION_CHAR_UUID,
        }
    }
}

impl fmt::Display for DroCharacteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Position => "position",
            Self::Numerator => "numerator",
            Self::Denominator => "denominator",
            Self::Reverse => "reverse",
            Self::SetPosition => "set-position",
        };
        f.write_str(name)
    }
}

/// Decode a position payload
///
/// # Payload Structure (4 bytes)
///
/// ```text
/// [0-3] : Position (i32 little-endian, thousandths of the device unit)
/// ```
pub fn decode_position(bytes: &[u8]) -> Result<f64, DroError> {
    let raw: [u8; PAYLOAD_LEN] = bytes
        .try_into()
        .map_err(|_| DroError::MalformedPayload { len: bytes.len() })?;

    Ok(i32::from_le_bytes(raw) as f64 / SCALE)
}

/// Encode a physical value for the set-position characteristic
///
/// Halfway cases round to even, matching how the device firmware's host
/// tooling converts doubles to integers.
pub fn encode_set_position(value: f64) -> Result<[u8; PAYLOAD_LEN], DroError> {
    let scaled = (value * SCALE).round_ties_even();

    if !scaled.is_finite() || scaled < i32::MIN as f64 || scaled > i32::MAX as f64 {
        return Err(DroError::OutOfRange(value));
    }

    Ok((scaled as i32).to_le_bytes())
}

//! Set-position write pipeline

use crate::infrastructure::bluetooth::error::{
    classify, classify_status, DroError, ErrorContext, InvalidInput,
};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{GattBackend, GattStatus};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parse the text a user typed as a position
pub fn parse_position_input(raw_text: &str) -> Result<f64, DroError> {
    let text = raw_text.trim();
    if text.is_empty() {
        return Err(DroError::InvalidInput(InvalidInput::Empty));
    }

    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(DroError::InvalidInput(InvalidInput::NotANumber)),
    }
}

pub struct WritePipeline<B: GattBackend> {
    backend: Arc<B>,
}

impl<B: GattBackend> WritePipeline<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    /// Encode `value` and write it to the set-position characteristic with response
    pub async fn write_position(
        &self,
        characteristic: &B::Characteristic,
        value: f64,
    ) -> Result<(), DroError> {
        let payload = protocol::encode_set_position(value)?;
        debug!("Writing set-position payload: {:02X?}", payload);

        let outcome = self
            .backend
            .write_value_with_result(characteristic, &payload)
            .await
            .map_err(|e| {
                warn!("Set position write failed: {}", e);
                classify(&e, ErrorContext::Write)
            })?;

        if outcome.status != GattStatus::Success {
            warn!(
                "Set position returned status {} (protocol error {:?})",
                outcome.status, outcome.protocol_error
            );
            return Err(classify_status(outcome.status, outcome.protocol_error));
        }

        info!("Position set to {:.3}", value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::error::{
        WriteRejection, E_ACCESSDENIED, E_BLUETOOTH_ATT_INVALID_PDU,
        E_BLUETOOTH_ATT_WRITE_NOT_PERMITTED,
    };
    use crate::infrastructure::bluetooth::mock::{MockBackend, MockCharacteristic};
    use crate::infrastructure::bluetooth::protocol::SET_POSITION_CHAR_UUID;
    use crate::infrastructure::bluetooth::transport::{TransportError, WriteOutcome};

    fn set_position() -> MockCharacteristic {
        MockCharacteristic {
            uuid: SET_POSITION_CHAR_UUID,
            index: 0,
        }
    }

    #[test]
    fn test_parse_position_input() {
        assert_eq!(parse_position_input("12.345").unwrap(), 12.345);
        assert_eq!(parse_position_input("  -3 ").unwrap(), -3.0);
        assert_eq!(parse_position_input("1e-3").unwrap(), 0.001);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            parse_position_input(""),
            Err(DroError::InvalidInput(InvalidInput::Empty))
        );
        assert_eq!(
            parse_position_input("   "),
            Err(DroError::InvalidInput(InvalidInput::Empty))
        );
        for text in ["abc", "1,5", "NaN", "inf"] {
            assert_eq!(
                parse_position_input(text),
                Err(DroError::InvalidInput(InvalidInput::NotANumber)),
                "{}",
                text
            );
        }
    }

    #[tokio::test]
    async fn test_write_encodes_payload() {
        let backend = Arc::new(MockBackend::new());
        let pipeline = WritePipeline::new(backend.clone());

        pipeline.write_position(&set_position(), 12.345).await.unwrap();
        assert_eq!(
            backend.state().value_writes,
            vec![12345i32.to_le_bytes().to_vec()]
        );
    }

    #[tokio::test]
    async fn test_out_of_range_is_not_written() {
        let backend = Arc::new(MockBackend::new());
        let pipeline = WritePipeline::new(backend.clone());

        assert_eq!(
            pipeline.write_position(&set_position(), 1e12).await,
            Err(DroError::OutOfRange(1e12))
        );
        assert!(backend.state().value_writes.is_empty());
    }

    #[tokio::test]
    async fn test_non_success_status() {
        let backend = Arc::new(MockBackend::new());
        backend.state().write_result = Ok(WriteOutcome {
            status: GattStatus::ProtocolError,
            protocol_error: Some(0x03),
        });
        let pipeline = WritePipeline::new(backend);

        assert_eq!(
            pipeline.write_position(&set_position(), 1.0).await,
            Err(DroError::ProtocolError {
                status: GattStatus::ProtocolError,
                detail: Some(0x03)
            })
        );
    }

    #[tokio::test]
    async fn test_platform_rejections() {
        let cases = [
            (E_BLUETOOTH_ATT_INVALID_PDU, WriteRejection::Malformed),
            (E_BLUETOOTH_ATT_WRITE_NOT_PERMITTED, WriteRejection::Unauthorized),
            (E_ACCESSDENIED, WriteRejection::Unauthorized),
        ];

        for (code, reason) in cases {
            let backend = Arc::new(MockBackend::new());
            backend.state().write_result = Err(TransportError::Platform {
                code,
                message: "nope".to_string(),
            });
            let pipeline = WritePipeline::new(backend);

            assert_eq!(
                pipeline.write_position(&set_position(), 1.0).await,
                Err(DroError::WriteRejected {
                    reason,
                    message: "nope".to_string()
                })
            );
        }
    }
}

//! WinRT GATT Backend
//!
//! Implements the transport seam with `Windows.Devices.Bluetooth`.

use crate::infrastructure::bluetooth::transport::{
    CccdValue, CharacteristicProperties, GattBackend, GattStatus, HandlerToken,
    TransportError, ValueChangedHandler, WriteOutcome,
};
use async_trait::async_trait;
use tracing::{debug, trace};
use uuid::Uuid;
use windows::core::{GUID, HSTRING};
use windows::Devices::Bluetooth::BluetoothLEDevice;
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCharacteristic, GattClientCharacteristicConfigurationDescriptorValue,
    GattCommunicationStatus, GattDeviceService, GattValueChangedEventArgs,
};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

impl From<windows::core::Error> for TransportError {
    fn from(e: windows::core::Error) -> Self {
        TransportError::Platform {
            code: e.code().0 as u32,
            message: e.message().to_string(),
        }
    }
}

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn to_status(status: GattCommunicationStatus) -> GattStatus {
    if status == GattCommunicationStatus::Success {
        GattStatus::Success
    } else if status == GattCommunicationStatus::AccessDenied {
        GattStatus::AccessDenied
    } else if status == GattCommunicationStatus::ProtocolError {
        GattStatus::ProtocolError
    } else {
        GattStatus::Unreachable
    }
}

fn to_cccd(value: CccdValue) -> GattClientCharacteristicConfigurationDescriptorValue {
    match value {
        CccdValue::None => GattClientCharacteristicConfigurationDescriptorValue::None,
        CccdValue::Notify => GattClientCharacteristicConfigurationDescriptorValue::Notify,
        CccdValue::Indicate => GattClientCharacteristicConfigurationDescriptorValue::Indicate,
    }
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

/// GATT client backed by the Windows Bluetooth LE stack
#[derive(Debug, Default)]
pub struct WinRtBackend;

impl WinRtBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl GattBackend for WinRtBackend {
    type Device = BluetoothLEDevice;
    type Service = GattDeviceService;
    type Characteristic = GattCharacteristic;

    async fn open_device(
        &self,
        device_id: &str,
    ) -> Result<Option<BluetoothLEDevice>, TransportError> {
        // FromIdAsync may prompt for consent the first time a device is used
        match BluetoothLEDevice::FromIdAsync(&HSTRING::from(device_id))?.await {
            Ok(device) => {
                debug!("Opened {:?}", device.Name().unwrap_or_default());
                Ok(Some(device))
            }
            // a null device comes back as an error without a failure code
            Err(e) if e.code().is_ok() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn services_for_uuid(
        &self,
        device: &BluetoothLEDevice,
        uuid: Uuid,
    ) -> Result<Vec<GattDeviceService>, TransportError> {
        // GetGattServicesForUuidAsync also works for unpaired devices, unlike GattServices
        let result = device.GetGattServicesForUuidAsync(to_guid(uuid))?.await?;
        let status = result.Status()?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Status(to_status(status)));
        }

        let services = result.Services()?;
        let mut found = Vec::with_capacity(services.Size()? as usize);
        for i in 0..services.Size()? {
            found.push(services.GetAt(i)?);
        }
        Ok(found)
    }

    async fn characteristics_for_uuid(
        &self,
        service: &GattDeviceService,
        uuid: Uuid,
    ) -> Result<Vec<GattCharacteristic>, TransportError> {
        let result = service.GetCharacteristicsForUuidAsync(to_guid(uuid))?.await?;
        let status = result.Status()?;
        if status != GattCommunicationStatus::Success {
            return Err(TransportError::Status(to_status(status)));
        }

        let characteristics = result.Characteristics()?;
        let mut found = Vec::with_capacity(characteristics.Size()? as usize);
        for i in 0..characteristics.Size()? {
            found.push(characteristics.GetAt(i)?);
        }
        Ok(found)
    }

    fn properties(
        &self,
        characteristic: &GattCharacteristic,
    ) -> Result<CharacteristicProperties, TransportError> {
        let properties = characteristic.CharacteristicProperties()?;
        Ok(CharacteristicProperties::from_bits(properties.0))
    }

    async fn write_cccd(
        &self,
        characteristic: &GattCharacteristic,
        value: CccdValue,
    ) -> Result<GattStatus, TransportError> {
        let status = characteristic
            .WriteClientCharacteristicConfigurationDescriptorAsync(to_cccd(value))?
            .await?;
        Ok(to_status(status))
    }

    fn add_value_changed(
        &self,
        characteristic: &GattCharacteristic,
        handler: ValueChangedHandler,
    ) -> Result<HandlerToken, TransportError> {
        let event_handler = TypedEventHandler::new(
            move |_: windows::core::Ref<GattCharacteristic>,
                  args: windows::core::Ref<GattValueChangedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    let bytes = read_buffer(&args.CharacteristicValue()?)?;
                    trace!("Value changed: {:02X?}", bytes);
                    handler(&bytes);
                }
                Ok(())
            },
        );
        let token = characteristic.ValueChanged(&event_handler)?;
        Ok(HandlerToken(token))
    }

    fn remove_value_changed(
        &self,
        characteristic: &GattCharacteristic,
        token: HandlerToken,
    ) -> Result<(), TransportError> {
        characteristic.RemoveValueChanged(token.0)?;
        Ok(())
    }

    async fn write_value_with_result(
        &self,
        characteristic: &GattCharacteristic,
        payload: &[u8],
    ) -> Result<WriteOutcome, TransportError> {
        let writer = DataWriter::new()?;
        writer.WriteBytes(payload)?;
        let buffer = writer.DetachBuffer()?;

        let result = characteristic.WriteValueWithResultAsync(&buffer)?.await?;
        Ok(WriteOutcome {
            status: to_status(result.Status()?),
            protocol_error: result.ProtocolError().and_then(|e| e.Value()).ok(),
        })
    }

    fn close_device(&self, device: &BluetoothLEDevice) -> Result<(), TransportError> {
        device.Close()?;
        Ok(())
    }
}

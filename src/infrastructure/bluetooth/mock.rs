//! Scripted in-memory GATT backend used by the session tests.

use crate::infrastructure::bluetooth::protocol::{DroCharacteristic, SERVICE_UUID};
use crate::infrastructure::bluetooth::transport::{
    CccdValue, CharacteristicProperties, GattBackend, GattStatus, HandlerToken,
    TransportError, ValueChangedHandler, WriteOutcome,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDevice {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockService {
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCharacteristic {
    pub uuid: Uuid,
    pub index: usize,
}

/// What `open_device` answers
#[derive(Debug, Clone)]
pub enum OpenBehavior {
    Present,
    Absent,
    Fail(TransportError),
}

#[derive(Debug, Clone)]
pub struct MockState {
    pub open_behavior: OpenBehavior,
    pub service_count: usize,
    pub services_error: Option<TransportError>,
    pub characteristic_counts: HashMap<Uuid, usize>,
    pub position_properties: CharacteristicProperties,
    pub cccd_result: Result<GattStatus, TransportError>,
    pub clear_cccd_result: Result<GattStatus, TransportError>,
    pub write_result: Result<WriteOutcome, TransportError>,

    // Recorded traffic
    pub opens: usize,
    pub closes: usize,
    pub cccd_writes: Vec<CccdValue>,
    pub value_writes: Vec<Vec<u8>>,
    pub removed_handlers: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            open_behavior: OpenBehavior::Present,
            service_count: 1,
            services_error: None,
            characteristic_counts: DroCharacteristic::ALL
                .iter()
                .map(|c| (c.uuid(), 1))
                .collect(),
            position_properties: CharacteristicProperties::READ
                | CharacteristicProperties::INDICATE,
            cccd_result: Ok(GattStatus::Success),
            clear_cccd_result: Ok(GattStatus::Success),
            write_result: Ok(WriteOutcome::success()),
            opens: 0,
            closes: 0,
            cccd_writes: Vec::new(),
            value_writes: Vec::new(),
            removed_handlers: 0,
        }
    }
}

#[derive(Default)]
pub struct MockBackend {
    state: Mutex<MockState>,
    handlers: Mutex<HashMap<i64, ValueChangedHandler>>,
    next_token: Mutex<i64>,
    /// When set, `open_device` parks until the gate is notified
    open_gate: Mutex<Option<Arc<Notify>>>,
    /// When set, CCCD writes of the given value park until the gate is notified
    cccd_gate: Mutex<Option<(CccdValue, Arc<Notify>)>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `open_device` calls wait for `gate`
    pub fn hold_open(&self, gate: Arc<Notify>) {
        *self.open_gate.lock().unwrap() = Some(gate);
    }

    /// Make CCCD writes of `value` wait for `gate` (after being recorded)
    pub fn hold_cccd(&self, value: CccdValue, gate: Arc<Notify>) {
        *self.cccd_gate.lock().unwrap() = Some((value, gate));
    }

    /// Deliver a raw value change to every registered handler
    pub fn emit(&self, payload: &[u8]) {
        let handlers: Vec<ValueChangedHandler> =
            self.handlers.lock().unwrap().values().cloned().collect();
        for handler in handlers {
            handler(payload);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().unwrap().len()
    }
}

#[async_trait]
impl GattBackend for MockBackend {
    type Device = MockDevice;
    type Service = MockService;
    type Characteristic = MockCharacteristic;

    async fn open_device(&self, device_id: &str) -> Result<Option<MockDevice>, TransportError> {
        let behavior = {
            let mut state = self.state();
            state.opens += 1;
            state.open_behavior.clone()
        };

        let gate = self.open_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        match behavior {
            OpenBehavior::Present => Ok(Some(MockDevice {
                id: device_id.to_string(),
            })),
            OpenBehavior::Absent => Ok(None),
            OpenBehavior::Fail(e) => Err(e),
        }
    }

    async fn services_for_uuid(
        &self,
        _device: &MockDevice,
        uuid: Uuid,
    ) -> Result<Vec<MockService>, TransportError> {
        let state = self.state();
        if let Some(e) = &state.services_error {
            return Err(e.clone());
        }
        if uuid != SERVICE_UUID {
            return Ok(Vec::new());
        }
        Ok((0..state.service_count)
            .map(|index| MockService { index })
            .collect())
    }

    async fn characteristics_for_uuid(
        &self,
        _service: &MockService,
        uuid: Uuid,
    ) -> Result<Vec<MockCharacteristic>, TransportError> {
        let count = self
            .state()
            .characteristic_counts
            .get(&uuid)
            .copied()
            .unwrap_or(0);
        Ok((0..count)
            .map(|index| MockCharacteristic { uuid, index })
            .collect())
    }

    fn properties(
        &self,
        characteristic: &MockCharacteristic,
    ) -> Result<CharacteristicProperties, TransportError> {
        if characteristic.uuid == DroCharacteristic::Position.uuid() {
            Ok(self.state().position_properties)
        } else {
            Ok(CharacteristicProperties::READ | CharacteristicProperties::WRITE)
        }
    }

    async fn write_cccd(
        &self,
        _characteristic: &MockCharacteristic,
        value: CccdValue,
    ) -> Result<GattStatus, TransportError> {
        let result = {
            let mut state = self.state();
            state.cccd_writes.push(value);
            if value == CccdValue::None {
                state.clear_cccd_result.clone()
            } else {
                state.cccd_result.clone()
            }
        };

        let gate = self.cccd_gate.lock().unwrap().clone();
        if let Some((held, gate)) = gate {
            if held == value {
                gate.notified().await;
            }
        }

        result
    }

    fn add_value_changed(
        &self,
        _characteristic: &MockCharacteristic,
        handler: ValueChangedHandler,
    ) -> Result<HandlerToken, TransportError> {
        let mut next = self.next_token.lock().unwrap();
        *next += 1;
        self.handlers.lock().unwrap().insert(*next, handler);
        Ok(HandlerToken(*next))
    }

    fn remove_value_changed(
        &self,
        _characteristic: &MockCharacteristic,
        token: HandlerToken,
    ) -> Result<(), TransportError> {
        self.handlers.lock().unwrap().remove(&token.0);
        self.state().removed_handlers += 1;
        Ok(())
    }

    async fn write_value_with_result(
        &self,
        _characteristic: &MockCharacteristic,
        payload: &[u8],
    ) -> Result<WriteOutcome, TransportError> {
        let mut state = self.state();
        state.value_writes.push(payload.to_vec());
        state.write_result.clone()
    }

    fn close_device(&self, _device: &MockDevice) -> Result<(), TransportError> {
        self.state().closes += 1;
        Ok(())
    }
}

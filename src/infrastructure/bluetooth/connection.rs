//! BLE Connection Module
//!
//! Owns the connection to one DRO: opens the device, resolves the DRO service
//! and its characteristics, and tears everything down again.

use crate::domain::models::{AppEvent, DuplicatePolicy};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::error::{classify, DroError, ErrorContext};
use crate::infrastructure::bluetooth::protocol::{self, DroCharacteristic};
use crate::infrastructure::bluetooth::subscription::{SubscriptionManager, SubscriptionState};
use crate::infrastructure::bluetooth::transport::{CccdValue, GattBackend};
use crate::infrastructure::bluetooth::writer::{self, WritePipeline};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Configuration for session behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Policy when a UUID resolves to more than one attribute
    pub duplicate_policy: DuplicatePolicy,
    /// Reset the position CCCD on the device when disconnecting
    pub clear_cccd_on_disconnect: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::FirstMatch,
            clear_cccd_on_disconnect: true,
        }
    }
}

impl From<&Settings> for ConnectionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            duplicate_policy: settings.duplicate_policy,
            clear_cccd_on_disconnect: settings.clear_cccd_on_disconnect,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    ServiceDiscovery,
    Ready,
}

/// The resolved characteristics of the DRO service
#[derive(Debug, Clone)]
pub struct CharacteristicSet<C> {
    pub position: C,
    pub numerator: C,
    pub denominator: C,
    pub reverse: C,
    pub set_position: C,
}

/// Lookups that matched more than once and were resolved by taking the first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Number of matching services, when more than one
    pub duplicate_services: Option<usize>,
    pub duplicate_characteristics: Vec<(DroCharacteristic, usize)>,
}

impl DiscoveryReport {
    pub fn is_ambiguous(&self) -> bool {
        self.duplicate_services.is_some() || !self.duplicate_characteristics.is_empty()
    }
}

struct SessionInner<B: GattBackend> {
    state: SessionState,
    /// Bumped by every connect attempt and every disconnect
    epoch: u64,
    device_id: Option<String>,
    device: Option<Arc<B::Device>>,
    service: Option<Arc<B::Service>>,
    characteristics: Option<CharacteristicSet<B::Characteristic>>,
    report: DiscoveryReport,
}

impl<B: GattBackend> SessionInner<B> {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            epoch: 0,
            device_id: None,
            device: None,
            service: None,
            characteristics: None,
            report: DiscoveryReport::default(),
        }
    }

    /// Drop every handle and return to `Disconnected`, handing back the device to close
    fn reset(&mut self) -> Option<Arc<B::Device>> {
        self.state = SessionState::Disconnected;
        self.device_id = None;
        self.service = None;
        self.characteristics = None;
        self.report = DiscoveryReport::default();
        self.device.take()
    }
}

/// GATT session with a single DRO device
pub struct GattSession<B: GattBackend> {
    backend: Arc<B>,
    config: ConnectionConfig,
    inner: Mutex<SessionInner<B>>,
    subscription: SubscriptionManager<B>,
    writer: WritePipeline<B>,
}

impl<B: GattBackend> GattSession<B> {
    pub fn new(backend: Arc<B>, config: ConnectionConfig) -> Self {
        Self {
            subscription: SubscriptionManager::new(backend.clone()),
            writer: WritePipeline::new(backend.clone()),
            backend,
            config,
            inner: Mutex::new(SessionInner::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionInner<B>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn subscription_state(&self) -> SubscriptionState {
        self.subscription.state()
    }

    pub fn device_id(&self) -> Option<String> {
        self.lock().device_id.clone()
    }

    pub fn discovery_report(&self) -> DiscoveryReport {
        self.lock().report.clone()
    }

    pub fn characteristics(&self) -> Option<CharacteristicSet<B::Characteristic>> {
        self.lock().characteristics.clone()
    }

    /// Connect to a device and resolve the DRO service
    ///
    /// Only allowed from `Disconnected`; tear the session down first otherwise.
    pub async fn connect(&self, device_id: &str) -> Result<DiscoveryReport, DroError> {
        let epoch = {
            let mut inner = self.lock();
            if inner.state != SessionState::Disconnected || inner.device.is_some() {
                warn!(
                    "Connect to {} rejected, session is {:?}",
                    device_id, inner.state
                );
                return Err(DroError::SessionBusy(inner.state));
            }
            inner.epoch += 1;
            inner.state = SessionState::Connecting;
            inner.device_id = Some(device_id.to_string());
            inner.epoch
        };

        info!("Connecting to Bluetooth device: {}", device_id);
        match self.open_and_discover(device_id, epoch).await {
            Ok(report) => Ok(report),
            Err(DroError::Cancelled) => {
                info!("Connect to {} superseded by disconnect", device_id);
                Err(DroError::Cancelled)
            }
            Err(e) => {
                error!("Connect to {} failed: {}", device_id, e);
                self.abort(epoch);
                Err(e)
            }
        }
    }

    async fn open_and_discover(
        &self,
        device_id: &str,
        epoch: u64,
    ) -> Result<DiscoveryReport, DroError> {
        // Step 1: Open the device
        let device = match self.backend.open_device(device_id).await {
            Ok(Some(device)) => Arc::new(device),
            Ok(None) => return Err(DroError::ConnectionFailed),
            Err(e) => return Err(classify(&e, ErrorContext::Open)),
        };

        {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                drop(inner);
                self.close(&device);
                return Err(DroError::Cancelled);
            }
            inner.device = Some(device.clone());
            inner.state = SessionState::ServiceDiscovery;
        }
        debug!("Device opened, discovering DRO service");

        // Step 2: Resolve the service
        let mut report = DiscoveryReport::default();
        let services = self
            .backend
            .services_for_uuid(&device, protocol::SERVICE_UUID)
            .await
            .map_err(|e| classify(&e, ErrorContext::Discovery))?;
        self.ensure_current(epoch)?;

        let service_count = services.len();
        let service = Arc::new(self.pick_first(
            services,
            DroError::ServiceNotFound,
            DroError::MultipleServicesAmbiguous(service_count),
        )?);
        if service_count > 1 {
            warn!(
                "{} services match {}, using the first",
                service_count,
                protocol::SERVICE_UUID
            );
            report.duplicate_services = Some(service_count);
        }
        info!("Found DRO service");

        // Step 3: Resolve the characteristics
        let position = self
            .resolve(&service, DroCharacteristic::Position, &mut report, epoch)
            .await?;
        let numerator = self
            .resolve(&service, DroCharacteristic::Numerator, &mut report, epoch)
            .await?;
        let denominator = self
            .resolve(&service, DroCharacteristic::Denominator, &mut report, epoch)
            .await?;
        let reverse = self
            .resolve(&service, DroCharacteristic::Reverse, &mut report, epoch)
            .await?;
        let set_position = self
            .resolve(&service, DroCharacteristic::SetPosition, &mut report, epoch)
            .await?;

        let mut inner = self.lock();
        if inner.epoch != epoch {
            return Err(DroError::Cancelled);
        }
        inner.service = Some(service);
        inner.characteristics = Some(CharacteristicSet {
            position,
            numerator,
            denominator,
            reverse,
            set_position,
        });
        inner.report = report.clone();
        inner.state = SessionState::Ready;
        info!("Session ready");

        Ok(report)
    }

    async fn resolve(
        &self,
        service: &B::Service,
        which: DroCharacteristic,
        report: &mut DiscoveryReport,
        epoch: u64,
    ) -> Result<B::Characteristic, DroError> {
        let found = self
            .backend
            .characteristics_for_uuid(service, which.uuid())
            .await
            .map_err(|e| classify(&e, ErrorContext::Discovery))?;
        self.ensure_current(epoch)?;

        let count = found.len();
        let characteristic = self.pick_first(
            found,
            DroError::CharacteristicNotFound(which),
            DroError::MultipleCharacteristicsAmbiguous { which, count },
        )?;
        if count > 1 {
            warn!("{} {} characteristics found, using the first", count, which);
            report.duplicate_characteristics.push((which, count));
        }
        debug!("Found {} characteristic", which);

        Ok(characteristic)
    }

    fn pick_first<T>(
        &self,
        found: Vec<T>,
        missing: DroError,
        ambiguous: DroError,
    ) -> Result<T, DroError> {
        if found.len() > 1 && self.config.duplicate_policy == DuplicatePolicy::Reject {
            return Err(ambiguous);
        }
        found.into_iter().next().ok_or(missing)
    }

    fn ensure_current(&self, epoch: u64) -> Result<(), DroError> {
        if self.lock().epoch == epoch {
            Ok(())
        } else {
            Err(DroError::Cancelled)
        }
    }

    /// Roll back a failed connect attempt, unless a disconnect already did
    fn abort(&self, epoch: u64) {
        let device = {
            let mut inner = self.lock();
            if inner.epoch != epoch {
                return;
            }
            inner.reset()
        };
        if let Some(device) = device {
            self.close(&device);
        }
    }

    fn close(&self, device: &B::Device) -> bool {
        match self.backend.close_device(device) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to close device: {}", e);
                false
            }
        }
    }

    /// Start forwarding position samples to `sink`
    pub async fn subscribe_position(
        &self,
        sink: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<CccdValue, DroError> {
        let (position, epoch) = {
            let inner = self.lock();
            match (&inner.state, &inner.characteristics) {
                (SessionState::Ready, Some(set)) => (set.position.clone(), inner.epoch),
                _ => return Err(DroError::NotConnected),
            }
        };
        let mode = self.subscription.subscribe(position, sink).await?;

        // The session this subscription belongs to may have been torn down meanwhile
        if let Err(e) = self.ensure_current(epoch) {
            self.subscription
                .unsubscribe(self.config.clear_cccd_on_disconnect)
                .await;
            return Err(e);
        }
        Ok(mode)
    }

    /// Validate, encode and write a position typed by the user
    pub async fn set_position(&self, raw_text: &str) -> Result<f64, DroError> {
        let value = writer::parse_position_input(raw_text)?;
        let characteristic = {
            let inner = self.lock();
            match (&inner.state, &inner.characteristics) {
                (SessionState::Ready, Some(set)) => set.set_position.clone(),
                _ => return Err(DroError::NotConnected),
            }
        };
        self.writer.write_position(&characteristic, value).await?;
        Ok(value)
    }

    /// Tear the session down. Safe to call in any state.
    ///
    /// Returns `false` if some resource could not be released cleanly; the
    /// session is `Disconnected` either way.
    pub async fn disconnect(&self) -> bool {
        // Leave `Ready` before the first await so nothing new starts on this session
        let device = {
            let mut inner = self.lock();
            inner.epoch += 1;
            inner.reset()
        };

        let mut success = self
            .subscription
            .unsubscribe(self.config.clear_cccd_on_disconnect)
            .await;

        if let Some(device) = device {
            success &= self.close(&device);
            info!("Disconnected from device");
        }

        success
    }
}

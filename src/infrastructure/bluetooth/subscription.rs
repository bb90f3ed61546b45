//! Notification Subscription Module
//!
//! Negotiates the CCCD of the position characteristic and forwards decoded
//! samples to the registered event sink.

use crate::domain::models::{AppEvent, StatusMessage};
use crate::infrastructure::bluetooth::error::{classify, DroError, ErrorContext};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::transport::{
    CccdValue, GattBackend, GattStatus, HandlerToken, ValueChangedHandler,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed,
}

/// Sink shared with one value-changed registration
///
/// Each subscription gets its own dispatcher, so a handler left over from an
/// earlier registration can never reach a later sink.
struct SampleDispatcher {
    sink: Mutex<Option<mpsc::UnboundedSender<AppEvent>>>,
}

impl SampleDispatcher {
    fn new(sink: mpsc::UnboundedSender<AppEvent>) -> Self {
        Self {
            sink: Mutex::new(Some(sink)),
        }
    }

    fn dispatch(&self, payload: &[u8]) {
        let sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sink) = sink.as_ref() else {
            trace!("Dropping value change received after teardown");
            return;
        };

        match protocol::decode_position(payload) {
            Ok(value) => {
                trace!("Position sample: {:.3}", value);
                let _ = sink.send(AppEvent::PositionSample(value));
            }
            Err(e) => {
                warn!("Discarding position update: {}", e);
                let _ = sink.send(AppEvent::LogMessage(StatusMessage::error(format!(
                    "Discarded position update: {}",
                    e
                ))));
            }
        }
    }

    fn detach(&self) {
        self.sink
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

struct Slot<C> {
    state: SubscriptionState,
    /// Bumped on every unsubscribe so an in-flight subscribe can tell it lost
    epoch: u64,
    /// Whether the last teardown asked for the remote CCCD to be cleared
    clear_remote: bool,
    characteristic: Option<C>,
    token: Option<HandlerToken>,
    dispatcher: Option<Arc<SampleDispatcher>>,
}

/// Owns the value-changed registration of the position characteristic
pub struct SubscriptionManager<B: GattBackend> {
    backend: Arc<B>,
    slot: Mutex<Slot<B::Characteristic>>,
}

impl<B: GattBackend> SubscriptionManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            slot: Mutex::new(Slot {
                state: SubscriptionState::Unsubscribed,
                epoch: 0,
                clear_remote: false,
                characteristic: None,
                token: None,
                dispatcher: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<B::Characteristic>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SubscriptionState {
        self.lock().state
    }

    /// Enable indications (or notifications) and start forwarding samples to `sink`
    ///
    /// Returns the CCCD mode that was written.
    pub async fn subscribe(
        &self,
        characteristic: B::Characteristic,
        sink: mpsc::UnboundedSender<AppEvent>,
    ) -> Result<CccdValue, DroError> {
        let epoch = {
            let mut slot = self.lock();
            if slot.state != SubscriptionState::Unsubscribed {
                return Err(DroError::AlreadySubscribed);
            }
            slot.state = SubscriptionState::Subscribing;
            slot.epoch
        };

        match self.establish(characteristic, sink, epoch).await {
            Ok(mode) => Ok(mode),
            Err(e) => {
                let mut slot = self.lock();
                if slot.epoch == epoch {
                    slot.state = SubscriptionState::Unsubscribed;
                }
                Err(e)
            }
        }
    }

    async fn establish(
        &self,
        characteristic: B::Characteristic,
        sink: mpsc::UnboundedSender<AppEvent>,
        epoch: u64,
    ) -> Result<CccdValue, DroError> {
        let properties = self
            .backend
            .properties(&characteristic)
            .map_err(|e| classify(&e, ErrorContext::Subscribe))?;

        let mode = CccdValue::preferred_for(properties);
        if mode == CccdValue::None {
            warn!(
                "Position characteristic advertises neither indicate nor notify (properties {:#04X})",
                properties.bits()
            );
            return Err(DroError::NoNotificationSupport);
        }

        debug!("Writing CCCD: {:?}", mode);
        let status = self
            .backend
            .write_cccd(&characteristic, mode)
            .await
            .map_err(|e| {
                warn!("CCCD write failed: {}", e);
                classify(&e, ErrorContext::Subscribe)
            })?;

        if status != GattStatus::Success {
            warn!("CCCD write returned status: {}", status);
            return Err(DroError::SubscriptionRejected(status));
        }

        if let Some(clear_remote) = self.superseded(epoch) {
            return Err(self.discard_stale(&characteristic, None, clear_remote).await);
        }

        let dispatcher = Arc::new(SampleDispatcher::new(sink));
        let handler: ValueChangedHandler = {
            let dispatcher = dispatcher.clone();
            Arc::new(move |payload: &[u8]| dispatcher.dispatch(payload))
        };
        let token = self
            .backend
            .add_value_changed(&characteristic, handler)
            .map_err(|e| classify(&e, ErrorContext::Subscribe))?;

        let stale = {
            let mut slot = self.lock();
            if slot.epoch == epoch {
                slot.state = SubscriptionState::Subscribed;
                slot.characteristic = Some(characteristic.clone());
                slot.token = Some(token);
                slot.dispatcher = Some(dispatcher.clone());
                None
            } else {
                Some(slot.clear_remote)
            }
        };

        if let Some(clear_remote) = stale {
            dispatcher.detach();
            return Err(self
                .discard_stale(&characteristic, Some(token), clear_remote)
                .await);
        }

        info!("Subscribed for position value changes ({:?})", mode);
        Ok(mode)
    }

    /// `Some(clear_remote)` of the teardown that ran since `epoch` was taken
    fn superseded(&self, epoch: u64) -> Option<bool> {
        let slot = self.lock();
        (slot.epoch != epoch).then_some(slot.clear_remote)
    }

    /// Undo a subscription that finished after it was torn down
    async fn discard_stale(
        &self,
        characteristic: &B::Characteristic,
        token: Option<HandlerToken>,
        clear_remote: bool,
    ) -> DroError {
        if let Some(token) = token {
            if let Err(e) = self.backend.remove_value_changed(characteristic, token) {
                warn!("Failed to remove stale value-changed handler: {}", e);
            }
        }
        if clear_remote {
            match self.backend.write_cccd(characteristic, CccdValue::None).await {
                Ok(GattStatus::Success) => debug!("Stale CCCD cleared"),
                Ok(status) => warn!("Clearing stale CCCD returned status: {}", status),
                Err(e) => warn!("Clearing stale CCCD failed: {}", e),
            }
        }
        info!("Subscription completed after teardown, discarded");
        DroError::Cancelled
    }

    /// Stop delivering samples. Safe to call with no active subscription.
    ///
    /// The local registration is always removed. When `clear_remote` is set
    /// the CCCD is also reset on the device; that write never blocks the local
    /// teardown. Returns `false` if the handler could not be unregistered or
    /// the remote clear failed.
    pub async fn unsubscribe(&self, clear_remote: bool) -> bool {
        let (characteristic, token, dispatcher) = {
            let mut slot = self.lock();
            slot.epoch += 1;
            slot.clear_remote = clear_remote;
            slot.state = SubscriptionState::Unsubscribed;
            (
                slot.characteristic.take(),
                slot.token.take(),
                slot.dispatcher.take(),
            )
        };

        if let Some(dispatcher) = dispatcher {
            dispatcher.detach();
        }

        let Some(characteristic) = characteristic else {
            return true;
        };

        let mut success = true;
        if let Some(token) = token {
            if let Err(e) = self.backend.remove_value_changed(&characteristic, token) {
                warn!("Failed to remove value-changed handler: {}", e);
                success = false;
            }
        }

        if clear_remote {
            match self
                .backend
                .write_cccd(&characteristic, CccdValue::None)
                .await
            {
                Ok(GattStatus::Success) => debug!("CCCD cleared"),
                Ok(status) => {
                    warn!("Clearing CCCD returned status: {}", status);
                    success = false;
                }
                Err(e) => {
                    warn!("Clearing CCCD failed: {}", e);
                    success = false;
                }
            }
        }

        info!("Unsubscribed from position value changes");
        success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::error::E_ACCESSDENIED;
    use crate::infrastructure::bluetooth::mock::{MockBackend, MockCharacteristic};
    use crate::infrastructure::bluetooth::protocol::POSITION_CHAR_UUID;
    use crate::infrastructure::bluetooth::transport::{CharacteristicProperties, TransportError};
    use tokio::sync::Notify;

    fn position() -> MockCharacteristic {
        MockCharacteristic {
            uuid: POSITION_CHAR_UUID,
            index: 0,
        }
    }

    fn manager() -> (Arc<MockBackend>, SubscriptionManager<MockBackend>) {
        let backend = Arc::new(MockBackend::new());
        (backend.clone(), SubscriptionManager::new(backend))
    }

    #[tokio::test]
    async fn test_prefers_indicate() {
        let (backend, manager) = manager();
        backend.state().position_properties =
            CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE;
        let (tx, _rx) = mpsc::unbounded_channel();

        let mode = manager.subscribe(position(), tx).await.unwrap();
        assert_eq!(mode, CccdValue::Indicate);
        assert_eq!(manager.state(), SubscriptionState::Subscribed);
        assert_eq!(backend.state().cccd_writes, vec![CccdValue::Indicate]);
    }

    #[tokio::test]
    async fn test_falls_back_to_notify() {
        let (backend, manager) = manager();
        backend.state().position_properties = CharacteristicProperties::NOTIFY;
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(
            manager.subscribe(position(), tx).await.unwrap(),
            CccdValue::Notify
        );
    }

    #[tokio::test]
    async fn test_no_notification_support_skips_remote_write() {
        let (backend, manager) = manager();
        backend.state().position_properties = CharacteristicProperties::READ;
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(
            manager.subscribe(position(), tx).await,
            Err(DroError::NoNotificationSupport)
        );
        assert!(backend.state().cccd_writes.is_empty());
        assert_eq!(manager.state(), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_rejected_status() {
        let (backend, manager) = manager();
        backend.state().cccd_result = Ok(GattStatus::Unreachable);
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(
            manager.subscribe(position(), tx).await,
            Err(DroError::SubscriptionRejected(GattStatus::Unreachable))
        );
        assert_eq!(backend.handler_count(), 0);
        assert_eq!(manager.state(), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_unauthorized_descriptor_write() {
        let (backend, manager) = manager();
        backend.state().cccd_result = Err(TransportError::Platform {
            code: E_ACCESSDENIED,
            message: "Access is denied.".to_string(),
        });
        let (tx, _rx) = mpsc::unbounded_channel();

        assert_eq!(
            manager.subscribe(position(), tx).await,
            Err(DroError::UnauthorizedSubscription("Access is denied.".to_string()))
        );
        assert_eq!(manager.state(), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_second_subscribe_rejected() {
        let (backend, manager) = manager();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.subscribe(position(), tx.clone()).await.unwrap();

        assert_eq!(
            manager.subscribe(position(), tx).await,
            Err(DroError::AlreadySubscribed)
        );
        assert_eq!(backend.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_samples_and_decode_errors_are_delivered() {
        let (backend, manager) = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe(position(), tx).await.unwrap();

        backend.emit(&12345i32.to_le_bytes());
        backend.emit(&[0x01, 0x02]);
        backend.emit(&(-500i32).to_le_bytes());

        assert_eq!(rx.try_recv().unwrap(), AppEvent::PositionSample(12.345));
        match rx.try_recv().unwrap() {
            AppEvent::LogMessage(msg) => {
                assert_eq!(msg.severity, crate::domain::models::MessageSeverity::Error)
            }
            other => panic!("unexpected event: {:?}", other),
        }
        // a bad payload does not end the subscription
        assert_eq!(rx.try_recv().unwrap(), AppEvent::PositionSample(-0.5));
        assert_eq!(manager.state(), SubscriptionState::Subscribed);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_and_clears_cccd() {
        let (backend, manager) = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe(position(), tx).await.unwrap();

        assert!(manager.unsubscribe(true).await);
        backend.emit(&1000i32.to_le_bytes());

        assert!(rx.try_recv().is_err());
        assert_eq!(backend.handler_count(), 0);
        assert_eq!(
            backend.state().cccd_writes,
            vec![CccdValue::Indicate, CccdValue::None]
        );
    }

    #[tokio::test]
    async fn test_failed_remote_clear_still_detaches() {
        let (backend, manager) = manager();
        backend.state().clear_cccd_result = Ok(GattStatus::Unreachable);
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.subscribe(position(), tx).await.unwrap();

        // reported, but the local side is torn down anyway
        assert!(!manager.unsubscribe(true).await);
        assert_eq!(backend.handler_count(), 0);
        backend.emit(&1000i32.to_le_bytes());
        assert!(rx.try_recv().is_err());
        assert_eq!(manager.state(), SubscriptionState::Unsubscribed);
    }

    #[tokio::test]
    async fn test_unsubscribe_without_subscription() {
        let (backend, manager) = manager();
        assert!(manager.unsubscribe(true).await);
        assert!(manager.unsubscribe(false).await);
        assert!(backend.state().cccd_writes.is_empty());
    }

    #[tokio::test]
    async fn test_teardown_while_cccd_write_pending_cancels() {
        let (backend, manager) = manager();
        let gate = Arc::new(Notify::new());
        backend.hold_cccd(CccdValue::Indicate, gate.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let (result, _) = tokio::join!(manager.subscribe(position(), tx), async {
            assert_eq!(manager.state(), SubscriptionState::Subscribing);
            assert!(manager.unsubscribe(true).await);
            gate.notify_one();
        });

        assert_eq!(result, Err(DroError::Cancelled));
        assert_eq!(manager.state(), SubscriptionState::Unsubscribed);
        assert_eq!(backend.handler_count(), 0);
        assert_eq!(
            backend.state().cccd_writes,
            vec![CccdValue::Indicate, CccdValue::None]
        );

        backend.emit(&4000i32.to_le_bytes());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_late_subscription_keeps_remote_untouched_without_clear() {
        let (backend, manager) = manager();
        let gate = Arc::new(Notify::new());
        backend.hold_cccd(CccdValue::Indicate, gate.clone());
        let (tx, _rx) = mpsc::unbounded_channel();

        let (result, _) = tokio::join!(manager.subscribe(position(), tx), async {
            assert!(manager.unsubscribe(false).await);
            gate.notify_one();
        });

        assert_eq!(result, Err(DroError::Cancelled));
        assert_eq!(backend.handler_count(), 0);
        assert_eq!(backend.state().cccd_writes, vec![CccdValue::Indicate]);
    }

    #[test]
    fn test_detached_dispatcher_drops_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = SampleDispatcher::new(tx);
        dispatcher.detach();
        dispatcher.dispatch(&1i32.to_le_bytes());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_resubscribe_delivers_once_to_new_sink() {
        let (backend, manager) = manager();
        let (old_tx, mut old_rx) = mpsc::unbounded_channel();
        manager.subscribe(position(), old_tx).await.unwrap();
        assert!(manager.unsubscribe(false).await);

        let (new_tx, mut new_rx) = mpsc::unbounded_channel();
        manager.subscribe(position(), new_tx).await.unwrap();
        backend.emit(&7i32.to_le_bytes());

        assert_eq!(new_rx.try_recv().unwrap(), AppEvent::PositionSample(0.007));
        assert!(new_rx.try_recv().is_err());
        assert!(old_rx.try_recv().is_err());
        assert_eq!(backend.handler_count(), 1);
    }
}

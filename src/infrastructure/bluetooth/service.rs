//! Bluetooth Service Module
//!
//! Main service that coordinates connection, subscription and writes for the
//! DRO and reports progress to the presentation layer.

use crate::domain::models::{AppEvent, ConnectionStatus, SelectedDevice, StatusMessage};
use crate::infrastructure::bluetooth::connection::{ConnectionConfig, GattSession, SessionState};
use crate::infrastructure::bluetooth::error::DroError;
use crate::infrastructure::bluetooth::transport::GattBackend;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Main Bluetooth service coordinating all DRO operations
pub struct DroService<B: GattBackend> {
    session: GattSession<B>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
    selected: Mutex<Option<SelectedDevice>>,
    connecting: AtomicBool,
}

impl<B: GattBackend> DroService<B> {
    /// Create a new DRO service
    pub fn new(
        backend: Arc<B>,
        config: ConnectionConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> Self {
        Self {
            session: GattSession::new(backend, config),
            event_sender,
            selected: Mutex::new(None),
            connecting: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &GattSession<B> {
        &self.session
    }

    pub fn selected_device(&self) -> Option<SelectedDevice> {
        self.selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remember the device the discovery layer picked
    pub fn select_device(&self, device_id: &str, display_name: &str) {
        info!("Selected device {} ({})", display_name, device_id);
        *self.selected.lock().unwrap_or_else(PoisonError::into_inner) = Some(SelectedDevice {
            id: device_id.to_string(),
            name: display_name.to_string(),
        });
    }

    /// Whether a connect request would be accepted right now
    pub fn is_connect_enabled(&self) -> bool {
        self.selected_device().is_some()
            && !self.connecting.load(Ordering::SeqCst)
            && self.session.state() == SessionState::Disconnected
    }

    /// Connect to the selected device and subscribe for position updates
    ///
    /// A subscription failure is reported but leaves the connection in place,
    /// so positions can still be set.
    pub async fn request_connect(&self) -> Result<(), DroError> {
        let Some(device) = self.selected_device() else {
            self.send_log(StatusMessage::error("No device selected"));
            return Err(DroError::NotConnected);
        };

        if self.connecting.swap(true, Ordering::SeqCst) {
            warn!("Connect already in progress");
            return Err(DroError::SessionBusy(SessionState::Connecting));
        }

        let _connecting = ConnectingGuard(&self.connecting);
        self.connect_selected(&device).await
    }

    async fn connect_selected(&self, device: &SelectedDevice) -> Result<(), DroError> {
        if !self.session.disconnect().await {
            self.send_log(StatusMessage::error(
                "Error: Unable to reset state, try again.",
            ));
        }

        self.send_status(ConnectionStatus::Connecting);
        if let Err(e) = self.session.connect(&device.id).await {
            if e != DroError::Cancelled {
                self.send_log(StatusMessage::error(connect_failure_message(&e)));
            }
            self.send_status(ConnectionStatus::Disconnected);
            return Err(e);
        }

        info!("Connected to {}", device.name);
        self.send_status(ConnectionStatus::Connected);

        match self.session.subscribe_position(self.event_sender.clone()).await {
            Ok(_) => {
                self.send_log(StatusMessage::info(
                    "Successfully subscribed for value changes",
                ));
                Ok(())
            }
            Err(e) => {
                let message = match &e {
                    DroError::SubscriptionRejected(status) => {
                        format!("Error registering for value changes: {}", status)
                    }
                    other => other.to_string(),
                };
                self.send_log(StatusMessage::error(message));
                Err(e)
            }
        }
    }

    /// Write a new position typed by the user
    pub async fn request_set_position(&self, text: &str) -> Result<f64, DroError> {
        match self.session.set_position(text).await {
            Ok(value) => {
                self.send_log(StatusMessage::info("Successfully set position"));
                Ok(value)
            }
            Err(e) => {
                let message = match &e {
                    DroError::ProtocolError { .. } => format!("Set position failed: {}", e),
                    other => other.to_string(),
                };
                self.send_log(StatusMessage::error(message));
                Err(e)
            }
        }
    }

    /// Tear down the session, e.g. when the user navigates away
    pub async fn request_disconnect(&self) -> bool {
        let success = self.session.disconnect().await;
        if !success {
            self.send_log(StatusMessage::error("Error: Unable to reset app state"));
        }
        self.send_status(ConnectionStatus::Disconnected);
        success
    }

    fn send_status(&self, status: ConnectionStatus) {
        let _ = self.event_sender.send(AppEvent::ConnectionStatus(status));
    }

    /// Send a log message
    fn send_log(&self, message: StatusMessage) {
        let _ = self.event_sender.send(AppEvent::LogMessage(message));
    }
}

/// Clears the in-flight connect flag however the request ends, including
/// when its future is dropped
struct ConnectingGuard<'a>(&'a AtomicBool);

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn connect_failure_message(error: &DroError) -> String {
    match error {
        DroError::DeviceUnavailable => "Bluetooth radio is not on.".to_string(),
        DroError::ConnectionFailed => "Failed to connect to device.".to_string(),
        DroError::ProtocolError { .. } => "Device unreachable".to_string(),
        other => format!("Connection failed: {}", other),
    }
}

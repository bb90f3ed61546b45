//! Bluetooth Module
//!
//! Provides the GATT session with a BlueDRO digital readout.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       DroService                          │
//! │   (Main coordinator - public API for the presentation)    │
//! └─────────────────────────┬────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                       GattSession                         │
//! │   - device handle, service + characteristic discovery     │
//! └──────┬──────────────────┬───────────────────┬────────────┘
//!        │                  │                   │
//!        ▼                  ▼                   ▼
//! ┌─────────────┐  ┌─────────────────┐  ┌───────────────┐
//! │ Subscription│  │  WritePipeline  │  │   Protocol    │
//! │ - CCCD      │  │ - input parsing │  │ - UUIDs       │
//! │ - samples   │  │ - confirmed     │  │ - fixed-point │
//! │             │  │   writes        │  │   codec       │
//! └──────┬──────┘  └────────┬────────┘  └───────────────┘
//!        └─────────┬────────┘
//!                  ▼
//!        ┌───────────────────┐
//!        │   GattBackend     │  WinRT on Windows
//!        └───────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - DRO UUIDs and the position wire format
//! - [`transport`] - Platform GATT operations the session drives
//! - [`error`] - Session errors and transport error classification
//! - [`connection`] - Device connection and GATT discovery
//! - [`subscription`] - Position notifications
//! - [`writer`] - Set-position writes
//! - [`service`] - Main service coordinator

pub mod connection;
pub mod error;
pub mod protocol;
pub mod service;
pub mod subscription;
pub mod transport;
pub mod writer;

#[cfg(windows)]
pub mod winrt;

#[cfg(test)]
pub(crate) mod mock;

// Re-export main service for convenience
pub use service::DroService;

//! BlueDRO client: GATT session core for a Bluetooth LE digital readout.

pub mod domain;
pub mod infrastructure;
pub mod presentation;

//! Bluetooth layer of the radio service.
//!
//! This module provides the platform seam, adapter monitoring, scanning,
//! GATT session management and the BlueZ back-end.

pub mod adapter;
pub mod bluez;
pub mod manager;
pub mod platform;
pub mod scanner;

#[cfg(test)]
pub(crate) mod mock;

//! Error types for the radio service.
//!
//! Only synchronous failures live here. Scan failures and connection
//! failures are reported as events on the bus, never returned.

use thiserror::Error;

use crate::device::DeviceAddress;

/// Main error type for the radio service.
#[derive(Error, Debug)]
pub enum RadioError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Platform setup failed: {0}")]
   SetupFailure(String),

   #[error("Unknown device: {0}")]
   UnknownDevice(DeviceAddress),

   #[error("Already connected to device: {0}")]
   AlreadyConnected(DeviceAddress),

   #[error("Device not connected: {0}")]
   NotConnected(DeviceAddress),

   #[error("Invalid device address: {0}")]
   InvalidAddress(String),

   #[error("Transport error: {0}")]
   Transport(String),

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `RadioError`.
pub type Result<T> = std::result::Result<T, RadioError>;

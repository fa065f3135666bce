//! Seam between the core and the host radio stack.
//!
//! A back-end implements [`RadioPlatform`] and reports everything that
//! happens on its side through the callback sinks defined here. Sinks never
//! block: each callback becomes an immutable message on an unbounded channel
//! owned by the component that registered the sink.

use std::{fmt, sync::Arc};

use log::debug;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{device::DeviceAddress, error::Result};

/// Client characteristic configuration descriptor.
pub const CCCD_UUID: Uuid = Uuid::from_u128(0x0000_2902_0000_1000_8000_0080_5f9b_34fb);

/// Power state of the host adapter, keyed by its native code.
#[repr(i32)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::IntoStaticStr,
)]
pub enum AdapterState {
   #[strum(serialize = "off")]
   Off = 10,
   #[strum(serialize = "turning_on")]
   TurningOn = 11,
   #[strum(serialize = "on")]
   On = 12,
   #[strum(serialize = "turning_off")]
   TurningOff = 13,
}

impl AdapterState {
   /// Translates a native state code. Unrecognized codes yield `None`.
   pub fn from_native(code: i32) -> Option<Self> {
      Self::from_repr(code)
   }

   pub const fn native(self) -> i32 {
      self as i32
   }

   pub const fn is_on(self) -> bool {
      matches!(self, Self::On)
   }
}

/// Scan duty cycle requested from the platform.
#[derive(
   Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScanMode {
   Opportunistic,
   LowPower,
   Balanced,
   #[default]
   LowLatency,
}

/// Which advertisement reports the platform should deliver.
#[derive(
   Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CallbackType {
   #[default]
   AllMatches,
   FirstMatch,
   MatchLost,
}

/// Scan configuration. No address or service filters are ever applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSettings {
   pub mode: ScanMode,
   pub callback_type: CallbackType,
}

/// One advertisement report as delivered by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementReport {
   pub address: DeviceAddress,
   pub name: Option<SmolStr>,
   pub rssi: i16,
}

/// Symbolic reason for a failed scan start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanFailure {
   AlreadyStarted,
   RegistrationFailed,
   InternalError,
   FeatureUnsupported,
   Unknown(i32),
}

impl ScanFailure {
   pub const ALREADY_STARTED: i32 = 1;
   pub const REGISTRATION_FAILED: i32 = 2;
   pub const INTERNAL_ERROR: i32 = 3;
   pub const FEATURE_UNSUPPORTED: i32 = 4;

   pub const fn from_code(code: i32) -> Self {
      match code {
         Self::ALREADY_STARTED => Self::AlreadyStarted,
         Self::REGISTRATION_FAILED => Self::RegistrationFailed,
         Self::INTERNAL_ERROR => Self::InternalError,
         Self::FEATURE_UNSUPPORTED => Self::FeatureUnsupported,
         other => Self::Unknown(other),
      }
   }

   pub const fn code(self) -> i32 {
      match self {
         Self::AlreadyStarted => Self::ALREADY_STARTED,
         Self::RegistrationFailed => Self::REGISTRATION_FAILED,
         Self::InternalError => Self::INTERNAL_ERROR,
         Self::FeatureUnsupported => Self::FEATURE_UNSUPPORTED,
         Self::Unknown(code) => code,
      }
   }
}

impl fmt::Display for ScanFailure {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::AlreadyStarted => f.write_str("already_started"),
         Self::RegistrationFailed => f.write_str("registration_failed"),
         Self::InternalError => f.write_str("internal_error"),
         Self::FeatureUnsupported => f.write_str("feature_unsupported"),
         Self::Unknown(code) => write!(f, "unknown({code})"),
      }
   }
}

/// Status attached to GATT callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GattStatus {
   Success,
   ReadNotPermitted,
   WriteNotPermitted,
   InsufficientAuthentication,
   RequestNotSupported,
   InvalidOffset,
   InvalidAttributeLength,
   InsufficientEncryption,
   ConnectionCongested,
   Failure,
   Other(i32),
}

impl GattStatus {
   pub const fn from_code(code: i32) -> Self {
      match code {
         0x00 => Self::Success,
         0x02 => Self::ReadNotPermitted,
         0x03 => Self::WriteNotPermitted,
         0x05 => Self::InsufficientAuthentication,
         0x06 => Self::RequestNotSupported,
         0x07 => Self::InvalidOffset,
         0x0d => Self::InvalidAttributeLength,
         0x0f => Self::InsufficientEncryption,
         0x8f => Self::ConnectionCongested,
         0x101 => Self::Failure,
         other => Self::Other(other),
      }
   }

   pub const fn code(self) -> i32 {
      match self {
         Self::Success => 0x00,
         Self::ReadNotPermitted => 0x02,
         Self::WriteNotPermitted => 0x03,
         Self::InsufficientAuthentication => 0x05,
         Self::RequestNotSupported => 0x06,
         Self::InvalidOffset => 0x07,
         Self::InvalidAttributeLength => 0x0d,
         Self::InsufficientEncryption => 0x0f,
         Self::ConnectionCongested => 0x8f,
         Self::Failure => 0x101,
         Self::Other(code) => code,
      }
   }

   pub const fn is_success(self) -> bool {
      matches!(self, Self::Success)
   }
}

impl fmt::Display for GattStatus {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      let name = match self {
         Self::Success => "success",
         Self::ReadNotPermitted => "read_not_permitted",
         Self::WriteNotPermitted => "write_not_permitted",
         Self::InsufficientAuthentication => "insufficient_authentication",
         Self::RequestNotSupported => "request_not_supported",
         Self::InvalidOffset => "invalid_offset",
         Self::InvalidAttributeLength => "invalid_attribute_length",
         Self::InsufficientEncryption => "insufficient_encryption",
         Self::ConnectionCongested => "connection_congested",
         Self::Failure => "failure",
         Self::Other(code) => return write!(f, "unknown({code})"),
      };
      f.write_str(name)
   }
}

/// Link state reported by connection-state callbacks.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum ProfileState {
   Disconnected = 0,
   Connecting = 1,
   Connected = 2,
   Disconnecting = 3,
}

/// Raw scan callbacks, as raised by the platform.
#[derive(Debug, Clone)]
pub enum ScanCallback {
   Result(AdvertisementReport),
   BatchResults(Vec<AdvertisementReport>),
   Failed(i32),
}

/// Raw GATT callbacks, as raised by the platform.
#[derive(Debug, Clone)]
pub enum GattCallback {
   ConnectionStateChanged { status: i32, new_state: i32 },
   ServicesDiscovered { status: i32 },
   CharacteristicRead { characteristic: Uuid, value: Vec<u8>, status: i32 },
   CharacteristicWrite { characteristic: Uuid, status: i32 },
   CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
   DescriptorWrite { descriptor: Uuid, status: i32 },
   RemoteRssi { rssi: i16, status: i32 },
}

/// Receives adapter power notifications.
#[derive(Debug, Clone)]
pub struct PowerSink {
   tx: mpsc::UnboundedSender<i32>,
}

impl PowerSink {
   pub(crate) const fn new(tx: mpsc::UnboundedSender<i32>) -> Self {
      Self { tx }
   }

   pub fn on_state_changed(&self, native: i32) {
      if self.tx.send(native).is_err() {
         debug!("Adapter monitor gone, dropping state {native}");
      }
   }
}

/// Receives scan callbacks.
#[derive(Debug, Clone)]
pub struct ScanSink {
   tx: mpsc::UnboundedSender<ScanCallback>,
}

impl ScanSink {
   pub(crate) const fn new(tx: mpsc::UnboundedSender<ScanCallback>) -> Self {
      Self { tx }
   }

   fn deliver(&self, callback: ScanCallback) {
      if self.tx.send(callback).is_err() {
         debug!("Scan worker gone, dropping scan callback");
      }
   }

   pub fn on_scan_result(&self, report: AdvertisementReport) {
      self.deliver(ScanCallback::Result(report));
   }

   pub fn on_batch_scan_results(&self, reports: Vec<AdvertisementReport>) {
      self.deliver(ScanCallback::BatchResults(reports));
   }

   pub fn on_scan_failed(&self, code: i32) {
      self.deliver(ScanCallback::Failed(code));
   }
}

/// A GATT callback tagged with the session it belongs to.
#[derive(Debug)]
pub(crate) struct GattMessage {
   pub address: DeviceAddress,
   pub generation: u64,
   pub callback: GattCallback,
}

/// Receives GATT callbacks for one session.
#[derive(Debug, Clone)]
pub struct GattSink {
   address: DeviceAddress,
   generation: u64,
   tx: mpsc::UnboundedSender<GattMessage>,
}

impl GattSink {
   pub(crate) const fn new(
      address: DeviceAddress,
      generation: u64,
      tx: mpsc::UnboundedSender<GattMessage>,
   ) -> Self {
      Self {
         address,
         generation,
         tx,
      }
   }

   pub const fn address(&self) -> &DeviceAddress {
      &self.address
   }

   fn deliver(&self, callback: GattCallback) {
      let msg = GattMessage {
         address: self.address.clone(),
         generation: self.generation,
         callback,
      };
      if self.tx.send(msg).is_err() {
         debug!("Session manager gone, dropping callback for {}", self.address);
      }
   }

   pub fn on_connection_state_change(&self, status: i32, new_state: i32) {
      self.deliver(GattCallback::ConnectionStateChanged { status, new_state });
   }

   pub fn on_services_discovered(&self, status: i32) {
      self.deliver(GattCallback::ServicesDiscovered { status });
   }

   pub fn on_characteristic_read(&self, characteristic: Uuid, value: Vec<u8>, status: i32) {
      self.deliver(GattCallback::CharacteristicRead {
         characteristic,
         value,
         status,
      });
   }

   pub fn on_characteristic_write(&self, characteristic: Uuid, status: i32) {
      self.deliver(GattCallback::CharacteristicWrite {
         characteristic,
         status,
      });
   }

   pub fn on_characteristic_changed(&self, characteristic: Uuid, value: Vec<u8>) {
      self.deliver(GattCallback::CharacteristicChanged {
         characteristic,
         value,
      });
   }

   pub fn on_descriptor_write(&self, descriptor: Uuid, status: i32) {
      self.deliver(GattCallback::DescriptorWrite { descriptor, status });
   }

   pub fn on_read_remote_rssi(&self, rssi: i16, status: i32) {
      self.deliver(GattCallback::RemoteRssi { rssi, status });
   }
}

/// An open low-energy link to one peripheral.
///
/// Every method only issues the request; outcomes arrive on the session's
/// [`GattSink`].
pub trait Transport: Send {
   fn discover_services(&self) -> Result<()>;
   fn disconnect(&self) -> Result<()>;
   fn read_characteristic(&self, characteristic: Uuid) -> Result<()>;
   fn write_characteristic(&self, characteristic: Uuid, value: &[u8]) -> Result<()>;
   fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<()>;
   fn read_rssi(&self) -> Result<()>;
}

/// The host radio stack.
pub trait RadioPlatform: Send + Sync {
   /// Native code of the current adapter power state.
   fn power_state(&self) -> i32;

   /// Registers the one power listener. Failure is fatal for setup.
   fn register_power_listener(&self, sink: PowerSink) -> Result<()>;

   fn start_scan(&self, settings: &ScanSettings, sink: ScanSink) -> Result<()>;

   fn stop_scan(&self) -> Result<()>;

   /// Opens a low-energy link. The sink is live before the attempt begins.
   fn connect(&self, address: &DeviceAddress, sink: GattSink) -> Result<Box<dyn Transport>>;
}

/// Type alias for a shared platform handle.
pub type PlatformRef = Arc<dyn RadioPlatform>;

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_adapter_state_translation() {
      assert_eq!(AdapterState::from_native(10), Some(AdapterState::Off));
      assert_eq!(AdapterState::from_native(11), Some(AdapterState::TurningOn));
      assert_eq!(AdapterState::from_native(12), Some(AdapterState::On));
      assert_eq!(AdapterState::from_native(13), Some(AdapterState::TurningOff));
      assert_eq!(AdapterState::from_native(-1), None);
      assert_eq!(AdapterState::from_native(14), None);
      assert_eq!(AdapterState::On.to_string(), "on");
   }

   #[test]
   fn test_scan_failure_codes() {
      assert_eq!(ScanFailure::from_code(1), ScanFailure::AlreadyStarted);
      assert_eq!(ScanFailure::from_code(2), ScanFailure::RegistrationFailed);
      assert_eq!(ScanFailure::from_code(3), ScanFailure::InternalError);
      assert_eq!(ScanFailure::from_code(4), ScanFailure::FeatureUnsupported);
      assert_eq!(ScanFailure::from_code(42), ScanFailure::Unknown(42));
      assert_eq!(ScanFailure::Unknown(42).to_string(), "unknown(42)");
      assert_eq!(ScanFailure::AlreadyStarted.code(), 1);
   }

   #[test]
   fn test_gatt_status_codes() {
      assert!(GattStatus::from_code(0).is_success());
      assert_eq!(GattStatus::from_code(0x101), GattStatus::Failure);
      assert_eq!(GattStatus::from_code(0x85), GattStatus::Other(0x85));
      assert_eq!(GattStatus::Failure.code(), 0x101);
      assert_eq!(GattStatus::InsufficientEncryption.to_string(), "insufficient_encryption");
   }

   #[test]
   fn test_profile_state_translation() {
      assert_eq!(ProfileState::from_repr(2), Some(ProfileState::Connected));
      assert_eq!(ProfileState::from_repr(7), None);
   }
}

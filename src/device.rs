//! Discovered peripherals and the address registry.
//!
//! The registry is written only by the scan worker and read by the session
//! manager when a connection is requested.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use smol_str::SmolStr;

/// Opaque hardware identifier of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(SmolStr);

impl DeviceAddress {
   pub fn new(address: impl Into<SmolStr>) -> Self {
      Self(address.into())
   }

   pub fn as_str(&self) -> &str {
      &self.0
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }
}

impl fmt::Display for DeviceAddress {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.write_str(&self.0)
   }
}

impl From<&str> for DeviceAddress {
   fn from(address: &str) -> Self {
      Self::new(address)
   }
}

impl From<String> for DeviceAddress {
   fn from(address: String) -> Self {
      Self::new(address)
   }
}

/// A peripheral seen by the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
   pub address: DeviceAddress,
   pub display_name: Option<SmolStr>,
   pub rssi: i16,
}

impl DiscoveredDevice {
   pub fn to_json(&self) -> serde_json::Value {
      json!({
         "address": self.address.as_str(),
         "name": self.display_name.as_deref(),
         "rssi": self.rssi,
      })
   }
}

/// Outcome of recording a sighting in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sighting {
   /// First sighting of this address.
   Inserted,
   /// Known address whose name or RSSI changed (refresh enabled only).
   Refreshed,
   /// Known address, nothing recorded.
   Unchanged,
}

/// Address keyed registry of discovered devices.
///
/// This type is cheaply cloneable; clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry(Arc<RwLock<HashMap<DeviceAddress, DiscoveredDevice>>>);

impl DeviceRegistry {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn contains(&self, address: &DeviceAddress) -> bool {
      self.0.read().contains_key(address)
   }

   pub fn get(&self, address: &DeviceAddress) -> Option<DiscoveredDevice> {
      self.0.read().get(address).cloned()
   }

   pub fn len(&self) -> usize {
      self.0.read().len()
   }

   pub fn is_empty(&self) -> bool {
      self.0.read().is_empty()
   }

   /// Returns all devices ordered by address.
   pub fn snapshot(&self) -> Vec<DiscoveredDevice> {
      let mut devices: Vec<_> = self.0.read().values().cloned().collect();
      devices.sort_by(|a, b| a.address.cmp(&b.address));
      devices
   }

   /// Records a sighting. Existing entries are only overwritten when
   /// `refresh` is set.
   pub(crate) fn record(&self, device: DiscoveredDevice, refresh: bool) -> Sighting {
      let mut devices = self.0.write();
      match devices.get_mut(&device.address) {
         None => {
            devices.insert(device.address.clone(), device);
            Sighting::Inserted
         },
         Some(existing) if refresh && *existing != device => {
            *existing = device;
            Sighting::Refreshed
         },
         Some(_) => Sighting::Unchanged,
      }
   }
}

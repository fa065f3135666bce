//! Event bus shared by the scanner and the session manager.
//!
//! Producers never wait on consumers: the bus is a bounded broadcast
//! channel and a subscriber that falls behind loses its oldest events.

use std::sync::Arc;

use log::{trace, warn};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use uuid::Uuid;

use crate::{
   bluetooth::platform::{GattStatus, ScanFailure},
   device::{DeviceAddress, DiscoveredDevice},
};

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Discovery events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
   DeviceFound(DiscoveredDevice),
   /// Only emitted when registry refresh is enabled.
   DeviceUpdated(DiscoveredDevice),
   ScanFailed(ScanFailure),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
   Disconnected,
   Connecting,
   Connected,
   Disconnecting,
}

/// What happened on a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEventKind {
   StateChanged { state: SessionState, status: GattStatus },
   ServicesDiscovering,
   ServicesReady { status: GattStatus },
   CharacteristicRead { characteristic: Uuid, value: Vec<u8>, status: GattStatus },
   CharacteristicWrite { characteristic: Uuid, status: GattStatus },
   CharacteristicChanged { characteristic: Uuid, value: Vec<u8> },
   DescriptorWrite { descriptor: Uuid, status: GattStatus },
   RssiRead { rssi: i16, status: GattStatus },
}

impl SessionEventKind {
   pub fn to_json(&self) -> serde_json::Value {
      match self {
         Self::StateChanged { state, status } => json!({
            "type": "state_changed",
            "state": state.to_string(),
            "status": status.to_string(),
         }),
         Self::ServicesDiscovering => json!({ "type": "services_discovering" }),
         Self::ServicesReady { status } => json!({
            "type": "services_ready",
            "status": status.to_string(),
         }),
         Self::CharacteristicRead {
            characteristic,
            value,
            status,
         } => json!({
            "type": "characteristic_read",
            "characteristic": characteristic.to_string(),
            "value": hex::encode(value),
            "status": status.to_string(),
         }),
         Self::CharacteristicWrite {
            characteristic,
            status,
         } => json!({
            "type": "characteristic_write",
            "characteristic": characteristic.to_string(),
            "status": status.to_string(),
         }),
         Self::CharacteristicChanged {
            characteristic,
            value,
         } => json!({
            "type": "characteristic_changed",
            "characteristic": characteristic.to_string(),
            "value": hex::encode(value),
         }),
         Self::DescriptorWrite { descriptor, status } => json!({
            "type": "descriptor_write",
            "descriptor": descriptor.to_string(),
            "status": status.to_string(),
         }),
         Self::RssiRead { rssi, status } => json!({
            "type": "rssi_read",
            "rssi": rssi,
            "status": status.to_string(),
         }),
      }
   }
}

/// An event on one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
   pub address: DeviceAddress,
   pub kind: SessionEventKind,
}

/// Everything published on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
   Scan(ScanEvent),
   Session(SessionEvent),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all current subscribers without blocking.
   fn emit(&self, event: RadioEvent);

   /// Opens a new subscription that sees events emitted from now on.
   fn subscribe(&self) -> Subscription;
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

/// Broadcast-channel backed [`EventBus`].
#[derive(Debug)]
pub struct BroadcastBus {
   tx: broadcast::Sender<RadioEvent>,
}

impl BroadcastBus {
   pub fn new(capacity: usize) -> Arc<Self> {
      let (tx, _) = broadcast::channel(capacity.max(1));
      Arc::new(Self { tx })
   }
}

impl EventBus for BroadcastBus {
   fn emit(&self, event: RadioEvent) {
      if self.tx.send(event).is_err() {
         trace!("No subscribers, event dropped");
      }
   }

   fn subscribe(&self) -> Subscription {
      Subscription {
         rx: self.tx.subscribe(),
      }
   }
}

/// A consumer's view of the bus.
#[derive(Debug)]
pub struct Subscription {
   rx: broadcast::Receiver<RadioEvent>,
}

impl Subscription {
   /// Waits for the next event. Returns `None` once the bus is gone.
   pub async fn recv(&mut self) -> Option<RadioEvent> {
      loop {
         match self.rx.recv().await {
            Ok(event) => return Some(event),
            Err(RecvError::Lagged(skipped)) => {
               warn!("Event subscriber lagged, {skipped} events dropped");
            },
            Err(RecvError::Closed) => return None,
         }
      }
   }

   /// Returns an already queued event, if any.
   pub fn try_recv(&mut self) -> Option<RadioEvent> {
      loop {
         match self.rx.try_recv() {
            Ok(event) => return Some(event),
            Err(TryRecvError::Lagged(skipped)) => {
               warn!("Event subscriber lagged, {skipped} events dropped");
            },
            Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
         }
      }
   }

   pub fn scan_events(self) -> ScanEvents {
      ScanEvents { inner: self }
   }

   pub fn session_events(self, address: DeviceAddress) -> SessionEvents {
      SessionEvents {
         inner: self,
         address,
      }
   }
}

/// Subscription filtered to discovery events.
#[derive(Debug)]
pub struct ScanEvents {
   inner: Subscription,
}

impl ScanEvents {
   pub async fn recv(&mut self) -> Option<ScanEvent> {
      loop {
         if let RadioEvent::Scan(event) = self.inner.recv().await? {
            return Some(event);
         }
      }
   }

   pub fn try_recv(&mut self) -> Option<ScanEvent> {
      loop {
         if let RadioEvent::Scan(event) = self.inner.try_recv()? {
            return Some(event);
         }
      }
   }
}

/// Subscription filtered to one session.
#[derive(Debug)]
pub struct SessionEvents {
   inner: Subscription,
   address: DeviceAddress,
}

impl SessionEvents {
   pub const fn address(&self) -> &DeviceAddress {
      &self.address
   }

   pub async fn recv(&mut self) -> Option<SessionEventKind> {
      loop {
         if let RadioEvent::Session(event) = self.inner.recv().await?
            && event.address == self.address
         {
            return Some(event.kind);
         }
      }
   }

   pub fn try_recv(&mut self) -> Option<SessionEventKind> {
      loop {
         if let RadioEvent::Session(event) = self.inner.try_recv()?
            && event.address == self.address
         {
            return Some(event.kind);
         }
      }
   }
}

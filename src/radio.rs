//! Caller-facing facade over the radio core.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::{
   bluetooth::{
      adapter::AdapterMonitor,
      manager::SessionManager,
      platform::{AdapterState, PlatformRef},
      scanner::ScanController,
   },
   config::Config,
   device::{DeviceAddress, DeviceRegistry, DiscoveredDevice},
   error::Result,
   event::{BroadcastBus, EventSender, ScanEvents, SessionEvents, SessionState, Subscription},
};

/// Scanning and sessions on one host adapter.
///
/// This type is cheaply cloneable; clones share the same components.
#[derive(Clone)]
pub struct Radio {
   monitor: AdapterMonitor,
   scanner: ScanController,
   sessions: SessionManager,
   event_tx: EventSender,
}

impl Radio {
   /// Wires the components on top of `platform`.
   ///
   /// Fails with `SetupFailure` if the adapter listener cannot be registered.
   pub fn new(platform: PlatformRef, config: &Config) -> Result<Self> {
      let event_tx: EventSender = BroadcastBus::new(config.event_capacity);
      let registry = DeviceRegistry::new();

      let monitor = AdapterMonitor::new(&*platform)?;
      let scanner = ScanController::new(
         platform.clone(),
         monitor.clone(),
         registry.clone(),
         event_tx.clone(),
         config.scan.settings(),
         config.scan.refresh_registry,
      );
      let sessions = SessionManager::new(
         platform,
         registry,
         event_tx.clone(),
         config.teardown_policy,
      );

      info!(
         "Radio ready (scan {}, teardown {:?})",
         config.scan.mode, config.teardown_policy
      );
      Ok(Self {
         monitor,
         scanner,
         sessions,
         event_tx,
      })
   }

   /// Scans whenever the adapter is on, until the returned future is dropped.
   pub async fn start_scan(&self) -> Result<()> {
      self.scanner.start_scan().await
   }

   pub async fn stop_scan(&self) -> Result<()> {
      self.scanner.stop_scan().await
   }

   pub async fn connect(&self, address: DeviceAddress) -> Result<()> {
      self.sessions.connect(address).await
   }

   pub async fn disconnect(&self, address: DeviceAddress) -> Result<()> {
      self.sessions.disconnect(address).await
   }

   pub async fn disconnect_all(&self) -> Result<usize> {
      self.sessions.disconnect_all().await
   }

   pub async fn read_characteristic(
      &self,
      address: DeviceAddress,
      characteristic: Uuid,
   ) -> Result<()> {
      self
         .sessions
         .read_characteristic(address, characteristic)
         .await
   }

   pub async fn write_characteristic(
      &self,
      address: DeviceAddress,
      characteristic: Uuid,
      value: Vec<u8>,
   ) -> Result<()> {
      self
         .sessions
         .write_characteristic(address, characteristic, value)
         .await
   }

   pub async fn set_notify(
      &self,
      address: DeviceAddress,
      characteristic: Uuid,
      enabled: bool,
   ) -> Result<()> {
      self
         .sessions
         .set_notify(address, characteristic, enabled)
         .await
   }

   pub async fn read_rssi(&self, address: DeviceAddress) -> Result<()> {
      self.sessions.read_rssi(address).await
   }

   /// Devices seen so far, ordered by address.
   pub fn devices(&self) -> Vec<DiscoveredDevice> {
      self.scanner.registry().snapshot()
   }

   pub async fn session_state(&self, address: DeviceAddress) -> Option<SessionState> {
      self.sessions.state(address).await
   }

   pub async fn sessions(&self) -> Vec<(DeviceAddress, SessionState)> {
      self.sessions.sessions().await
   }

   pub fn adapter_state(&self) -> Option<AdapterState> {
      self.monitor.current()
   }

   pub fn scan_events(&self) -> ScanEvents {
      self.event_tx.subscribe().scan_events()
   }

   pub fn session_events(&self, address: DeviceAddress) -> SessionEvents {
      self.sessions.events(address)
   }

   /// Every event on the bus, scan and session alike.
   pub fn subscribe(&self) -> Subscription {
      self.event_tx.subscribe()
   }
}

/// Runs [`Radio::start_scan`] in one background task.
///
/// Replacing or cancelling the task waits for it to finish, so no adapter
/// reaction of the old scan can reach the scanner after that point.
#[derive(Clone)]
pub struct ScanSupervisor {
   radio: Radio,
   task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ScanSupervisor {
   pub fn new(radio: Radio) -> Self {
      Self {
         radio,
         task: Arc::new(Mutex::new(None)),
      }
   }

   async fn join(task: JoinHandle<()>) {
      task.abort();
      let _ = task.await;
   }

   /// Starts the scan task, replacing any previous one.
   pub async fn start(&self) {
      let previous = self.task.lock().take();
      if let Some(previous) = previous {
         debug!("Replacing running scan task");
         Self::join(previous).await;
      }

      let radio = self.radio.clone();
      let task = tokio::spawn(async move {
         if let Err(e) = radio.start_scan().await {
            warn!("Scan ended with error: {e}");
         }
      });
      let raced = self.task.lock().replace(task);
      if let Some(raced) = raced {
         Self::join(raced).await;
      }
   }

   /// Cancels the scan task, then issues an explicit stop. Returns whether
   /// a task was running.
   pub async fn stop(&self) -> Result<bool> {
      let task = self.task.lock().take();
      let was_running = task.is_some();
      if let Some(task) = task {
         Self::join(task).await;
      }
      self.radio.stop_scan().await?;
      Ok(was_running)
   }

   pub fn is_running(&self) -> bool {
      self
         .task
         .lock()
         .as_ref()
         .is_some_and(|task| !task.is_finished())
   }
}

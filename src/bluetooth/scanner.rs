//! Discovery scan control.
//!
//! All scan side effects run on one worker task: adapter state reactions
//! forwarded by [`ScanController::start_scan`], explicit stops, and the
//! platform's scan callbacks. Serializing them there means a concurrent
//! start and stop can never interleave their platform calls.

use std::sync::{
   Arc,
   atomic::{AtomicU64, Ordering},
};

use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
};

use crate::{
   bluetooth::{
      adapter::AdapterMonitor,
      platform::{
         AdapterState, AdvertisementReport, PlatformRef, ScanCallback, ScanFailure, ScanSettings,
         ScanSink,
      },
   },
   device::{DeviceRegistry, DiscoveredDevice, Sighting},
   error::{RadioError, Result},
   event::{EventSender, RadioEvent, ScanEvent},
};

#[derive(Debug)]
enum ScanCommand {
   Attach(u64),
   Adapter(u64, AdapterState),
   Detach(u64),
   Stop(oneshot::Sender<Result<()>>),
}

/// Starts and stops discovery and publishes what it finds.
///
/// This type is cheaply cloneable; clones drive the same worker.
#[derive(Clone)]
pub struct ScanController {
   inbox: mpsc::UnboundedSender<ScanCommand>,
   monitor: AdapterMonitor,
   registry: DeviceRegistry,
   next_session: Arc<AtomicU64>,
}

impl ScanController {
   pub fn new(
      platform: PlatformRef,
      monitor: AdapterMonitor,
      registry: DeviceRegistry,
      event_tx: EventSender,
      settings: ScanSettings,
      refresh_registry: bool,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::unbounded_channel();
      let (callback_tx, callback_rx) = mpsc::unbounded_channel();

      let worker = ScanWorker {
         platform,
         event_tx,
         registry: registry.clone(),
         settings,
         refresh_registry,
         sink: ScanSink::new(callback_tx),
         active_session: None,
         last_on: None,
      };
      tokio::spawn(worker.run(command_rx, callback_rx));

      Self {
         inbox: command_tx,
         monitor,
         registry,
         next_session: Arc::new(AtomicU64::new(1)),
      }
   }

   pub const fn registry(&self) -> &DeviceRegistry {
      &self.registry
   }

   /// Reacts to adapter state changes until cancelled.
   ///
   /// Every entry into `On` issues a scan start and every entry into a
   /// non-`On` state issues a scan stop. The future only completes if the
   /// adapter monitor goes away. Dropping it stops the reactions but does
   /// not stop an ongoing scan; use [`Self::stop_scan`] for that.
   pub async fn start_scan(&self) -> Result<()> {
      let session = self.next_session.fetch_add(1, Ordering::Relaxed);
      let mut states = self.monitor.observe();

      self
         .inbox
         .send(ScanCommand::Attach(session))
         .map_err(|_| RadioError::ManagerShutdown)?;
      let _detach = DetachOnDrop {
         inbox: self.inbox.clone(),
         session,
      };

      while let Some(state) = states.next().await {
         self
            .inbox
            .send(ScanCommand::Adapter(session, state))
            .map_err(|_| RadioError::ManagerShutdown)?;
      }

      debug!("Adapter state stream ended for scan session {session}");
      Ok(())
   }

   /// Issues a single scan stop against the current adapter.
   pub async fn stop_scan(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ScanCommand::Stop(tx))
         .map_err(|_| RadioError::ManagerShutdown)?;
      rx.await.map_err(|_| RadioError::ManagerShutdown)?
   }
}

struct DetachOnDrop {
   inbox: mpsc::UnboundedSender<ScanCommand>,
   session: u64,
}

impl Drop for DetachOnDrop {
   fn drop(&mut self) {
      let _ = self.inbox.send(ScanCommand::Detach(self.session));
   }
}

struct ScanWorker {
   platform: PlatformRef,
   event_tx: EventSender,
   registry: DeviceRegistry,
   settings: ScanSettings,
   refresh_registry: bool,
   sink: ScanSink,

   // Scan session whose adapter states are acted on
   active_session: Option<u64>,
   // Whether the last reaction of that session was for `On`
   last_on: Option<bool>,
}

impl ScanWorker {
   async fn run(
      mut self,
      mut command_rx: mpsc::UnboundedReceiver<ScanCommand>,
      mut callback_rx: mpsc::UnboundedReceiver<ScanCallback>,
   ) {
      loop {
         select! {
            cmd = command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Scan worker shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(callback) = callback_rx.recv() => {
               self.handle_callback(callback);
            }
         }
      }
   }

   fn handle_command(&mut self, cmd: ScanCommand) {
      match cmd {
         ScanCommand::Attach(session) => {
            if let Some(previous) = self.active_session {
               debug!("Scan session {session} supersedes {previous}");
            }
            self.active_session = Some(session);
            self.last_on = None;
         },
         ScanCommand::Adapter(session, state) => {
            self.handle_adapter_state(session, state);
         },
         ScanCommand::Detach(session) => {
            if self.active_session == Some(session) {
               debug!("Scan session {session} cancelled");
               self.active_session = None;
               self.last_on = None;
            }
         },
         ScanCommand::Stop(reply) => {
            info!("Stopping scan");
            let result = self.platform.stop_scan();
            if let Err(e) = &result {
               warn!("Failed to stop scan: {e}");
            }
            if self.active_session.is_some() {
               self.last_on = Some(false);
            }
            let _ = reply.send(result);
         },
      }
   }

   fn handle_adapter_state(&mut self, session: u64, state: AdapterState) {
      if self.active_session != Some(session) {
         debug!("Ignoring adapter state {state} from stale scan session {session}");
         return;
      }

      let on = state.is_on();
      if self.last_on == Some(on) {
         return;
      }
      self.last_on = Some(on);

      if on {
         info!(
            "Adapter on, starting scan (mode={}, callback_type={})",
            self.settings.mode, self.settings.callback_type
         );
         if let Err(e) = self.platform.start_scan(&self.settings, self.sink.clone()) {
            warn!("Failed to start scan: {e}");
            self.publish(ScanEvent::ScanFailed(ScanFailure::InternalError));
         }
      } else {
         info!("Adapter {state}, stopping scan");
         if let Err(e) = self.platform.stop_scan() {
            warn!("Failed to stop scan: {e}");
         }
      }
   }

   fn handle_callback(&mut self, callback: ScanCallback) {
      match callback {
         ScanCallback::Result(report) => self.handle_report(report),
         ScanCallback::BatchResults(reports) => {
            debug!("Batch scan results: {} reports", reports.len());
         },
         ScanCallback::Failed(code) => {
            let reason = ScanFailure::from_code(code);
            warn!("Scan failed: code={code}, reason={reason}");
            self.publish(ScanEvent::ScanFailed(reason));
         },
      }
   }

   fn handle_report(&mut self, report: AdvertisementReport) {
      debug!(
         "Scan result: address={}, name={:?}, rssi={}",
         report.address, report.name, report.rssi
      );

      let Some(name) = report.name.filter(|name| !name.is_empty()) else {
         return;
      };
      if report.address.is_empty() {
         return;
      }

      let device = DiscoveredDevice {
         address: report.address,
         display_name: Some(name),
         rssi: report.rssi,
      };
      match self.registry.record(device.clone(), self.refresh_registry) {
         Sighting::Inserted => {
            info!(
               "Discovered {} ({})",
               device.display_name.as_deref().unwrap_or_default(),
               device.address
            );
            self.publish(ScanEvent::DeviceFound(device));
         },
         Sighting::Refreshed => self.publish(ScanEvent::DeviceUpdated(device)),
         Sighting::Unchanged => {},
      }
   }

   fn publish(&self, event: ScanEvent) {
      self.event_tx.emit(RadioEvent::Scan(event));
   }
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use tokio::{task::JoinHandle, time};

   use super::*;
   use crate::{
      bluetooth::mock::{Call, MockRadio, eventually},
      event::{BroadcastBus, EventBus, ScanEvents},
   };

   struct Fixture {
      radio: Arc<MockRadio>,
      scanner: ScanController,
      events: ScanEvents,
   }

   fn fixture(refresh_registry: bool) -> Fixture {
      let radio = MockRadio::new();
      let bus = BroadcastBus::new(64);
      let events = bus.subscribe().scan_events();
      let monitor = AdapterMonitor::new(&*radio).expect("monitor");
      let scanner = ScanController::new(
         radio.clone(),
         monitor,
         DeviceRegistry::new(),
         bus,
         ScanSettings::default(),
         refresh_registry,
      );
      Fixture {
         radio,
         scanner,
         events,
      }
   }

   fn spawn_scan(scanner: &ScanController) -> JoinHandle<Result<()>> {
      let scanner = scanner.clone();
      tokio::spawn(async move { scanner.start_scan().await })
   }

   async fn power_on(radio: &MockRadio, scanner: &ScanController) {
      radio.set_power(AdapterState::On);
      eventually(|| scanner.monitor.current() == Some(AdapterState::On)).await;
   }

   fn starts(radio: &MockRadio) -> usize {
      radio.count(|c| matches!(c, Call::StartScan(_)))
   }

   fn stops(radio: &MockRadio) -> usize {
      radio.count(|c| matches!(c, Call::StopScan))
   }

   async fn next(events: &mut ScanEvents) -> ScanEvent {
      time::timeout(Duration::from_secs(2), events.recv())
         .await
         .expect("no scan event in time")
         .expect("bus closed")
   }

   #[tokio::test]
   async fn test_one_start_per_on_entry_and_one_stop_per_off_entry() {
      let Fixture { radio, scanner, .. } = fixture(false);
      let _scan = spawn_scan(&scanner);

      // Initial state is Off
      eventually(|| stops(&radio) == 1).await;

      radio.set_power(AdapterState::TurningOn);
      radio.set_power(AdapterState::On);
      eventually(|| starts(&radio) == 1).await;

      radio.set_power(AdapterState::On);
      radio.set_power(AdapterState::TurningOff);
      radio.set_power(AdapterState::Off);
      radio.set_power(AdapterState::TurningOn);
      radio.set_power(AdapterState::On);
      eventually(|| starts(&radio) == 2).await;

      assert_eq!(radio.calls(), vec![
         Call::StopScan,
         Call::StartScan(ScanSettings::default()),
         Call::StopScan,
         Call::StartScan(ScanSettings::default()),
      ]);
   }

   #[tokio::test]
   async fn test_cancelled_scan_stops_reacting_without_stopping() {
      let Fixture { radio, scanner, .. } = fixture(false);
      power_on(&radio, &scanner).await;
      let scan = spawn_scan(&scanner);
      eventually(|| starts(&radio) == 1).await;

      scan.abort();
      let _ = scan.await;
      // The worker has processed the detach once stop_scan replies.
      scanner.stop_scan().await.expect("stop");
      assert_eq!(stops(&radio), 1);

      radio.set_power(AdapterState::Off);
      radio.set_power(AdapterState::On);
      time::sleep(Duration::from_millis(50)).await;
      assert_eq!(starts(&radio), 1);
      assert_eq!(stops(&radio), 1);
   }

   #[tokio::test]
   async fn test_explicit_stop_then_power_cycle_restarts() {
      let Fixture { radio, scanner, .. } = fixture(false);
      power_on(&radio, &scanner).await;
      let _scan = spawn_scan(&scanner);
      eventually(|| starts(&radio) == 1).await;

      scanner.stop_scan().await.expect("stop");
      radio.set_power(AdapterState::Off);
      radio.set_power(AdapterState::On);
      eventually(|| starts(&radio) == 2).await;

      // Off after an explicit stop does not stop again.
      assert_eq!(stops(&radio), 1);
   }

   #[tokio::test]
   async fn test_new_scan_session_supersedes_old() {
      let Fixture { radio, scanner, .. } = fixture(false);
      power_on(&radio, &scanner).await;
      let first = spawn_scan(&scanner);
      eventually(|| starts(&radio) == 1).await;

      let _second = spawn_scan(&scanner);
      eventually(|| starts(&radio) == 2).await;

      first.abort();
      let _ = first.await;
      radio.set_power(AdapterState::Off);
      eventually(|| stops(&radio) == 1).await;
   }

   #[tokio::test]
   async fn test_platform_start_error_is_reported_as_internal_error() {
      let Fixture {
         radio,
         scanner,
         mut events,
      } = fixture(false);
      radio.set_fail_start_scan(true);
      power_on(&radio, &scanner).await;
      let _scan = spawn_scan(&scanner);

      assert_eq!(
         next(&mut events).await,
         ScanEvent::ScanFailed(ScanFailure::InternalError)
      );
      assert_eq!(starts(&radio), 1);

      // The next power cycle tries again.
      radio.set_fail_start_scan(false);
      radio.set_power(AdapterState::Off);
      radio.set_power(AdapterState::On);
      eventually(|| starts(&radio) == 2).await;
      assert!(events.try_recv().is_none());
   }

   #[tokio::test]
   async fn test_named_reports_are_found_once() {
      let Fixture {
         radio,
         scanner,
         mut events,
      } = fixture(false);
      power_on(&radio, &scanner).await;
      let _scan = spawn_scan(&scanner);
      eventually(|| starts(&radio) == 1).await;

      radio.advertise("11:22", None, -80);
      radio.advertise("33:44", Some(""), -80);
      radio.advertise("AA:BB", Some("Sensor"), -60);
      radio.advertise("AA:BB", Some("Sensor"), -55);
      radio.advertise("CC:DD", Some("Band"), -70);

      assert_eq!(
         next(&mut events).await,
         ScanEvent::DeviceFound(DiscoveredDevice {
            address: "AA:BB".into(),
            display_name: Some("Sensor".into()),
            rssi: -60,
         })
      );
      assert!(matches!(
         next(&mut events).await,
         ScanEvent::DeviceFound(DiscoveredDevice { ref address, .. }) if address.as_str() == "CC:DD"
      ));
      assert!(events.try_recv().is_none());

      let registry = scanner.registry();
      assert_eq!(registry.len(), 2);
      assert!(!registry.contains(&"11:22".into()));
      assert_eq!(registry.get(&"AA:BB".into()).map(|d| d.rssi), Some(-60));
   }

   #[tokio::test]
   async fn test_refresh_emits_updates_not_duplicates() {
      let Fixture {
         radio,
         scanner,
         mut events,
      } = fixture(true);
      power_on(&radio, &scanner).await;
      let _scan = spawn_scan(&scanner);
      eventually(|| starts(&radio) == 1).await;

      radio.advertise("AA:BB", Some("Sensor"), -60);
      radio.advertise("AA:BB", Some("Sensor"), -45);

      assert!(matches!(next(&mut events).await, ScanEvent::DeviceFound(_)));
      assert!(matches!(
         next(&mut events).await,
         ScanEvent::DeviceUpdated(DiscoveredDevice { rssi: -45, .. })
      ));
   }

   #[tokio::test]
   async fn test_scan_failure_is_reported_once() {
      let Fixture {
         radio,
         scanner,
         mut events,
      } = fixture(false);
      power_on(&radio, &scanner).await;
      let _scan = spawn_scan(&scanner);
      eventually(|| starts(&radio) == 1).await;

      radio.advertise("AA:BB", Some("Sensor"), -60);
      radio.scan_failed(ScanFailure::ALREADY_STARTED);
      radio.advertise("CC:DD", Some("Band"), -70);

      assert!(matches!(next(&mut events).await, ScanEvent::DeviceFound(_)));
      assert_eq!(
         next(&mut events).await,
         ScanEvent::ScanFailed(ScanFailure::AlreadyStarted)
      );
      assert!(matches!(next(&mut events).await, ScanEvent::DeviceFound(_)));
      assert!(events.try_recv().is_none());

      // Reported, never retried.
      assert_eq!(starts(&radio), 1);
   }

   #[tokio::test]
   async fn test_batch_results_are_not_translated() {
      let Fixture {
         radio,
         scanner,
         mut events,
      } = fixture(false);
      power_on(&radio, &scanner).await;
      let _scan = spawn_scan(&scanner);
      eventually(|| starts(&radio) == 1).await;

      radio.batch(vec![AdvertisementReport {
         address: "AA:BB".into(),
         name: Some("Sensor".into()),
         rssi: -60,
      }]);
      radio.scan_failed(99);

      assert_eq!(
         next(&mut events).await,
         ScanEvent::ScanFailed(ScanFailure::Unknown(99))
      );
      assert!(scanner.registry().is_empty());
   }
}

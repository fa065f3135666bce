//! Adapter power state tracking.
//!
//! The monitor registers exactly one power listener with the platform and
//! republishes translated states to every observer. It is the only writer
//! of the adapter state.

use std::sync::Arc;

use crossbeam::atomic::AtomicCell;
use log::{debug, info};
use tokio::{select, sync::mpsc};

use crate::{
   bluetooth::platform::{AdapterState, PowerSink, RadioPlatform},
   error::{RadioError, Result},
};

/// Observes the adapter power state.
///
/// This type is cheaply cloneable; clones share the same monitor task.
#[derive(Clone)]
pub struct AdapterMonitor {
   subscribe_tx: mpsc::UnboundedSender<mpsc::UnboundedSender<AdapterState>>,
   current: Arc<AtomicCell<Option<AdapterState>>>,
}

impl AdapterMonitor {
   /// Registers the platform listener and starts the monitor task.
   ///
   /// A failed registration is a fatal setup error and is not retried.
   pub fn new(platform: &dyn RadioPlatform) -> Result<Self> {
      let (native_tx, native_rx) = mpsc::unbounded_channel();
      let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();

      let initial = platform.power_state();
      let current = Arc::new(AtomicCell::new(AdapterState::from_native(initial)));

      platform
         .register_power_listener(PowerSink::new(native_tx))
         .map_err(|e| match e {
            RadioError::SetupFailure(reason) => RadioError::SetupFailure(reason),
            other => RadioError::SetupFailure(other.to_string()),
         })?;
      info!(
         "Adapter listener registered, initial state {}",
         current
            .load()
            .map_or("unknown", <&'static str>::from)
      );

      tokio::spawn(run_monitor(native_rx, subscribe_rx, current.clone()));
      Ok(Self {
         subscribe_tx,
         current,
      })
   }

   /// Last translated adapter state, if any has been seen.
   pub fn current(&self) -> Option<AdapterState> {
      self.current.load()
   }

   /// Subscribes to state changes. The stream starts with the current
   /// state, when one is known.
   pub fn observe(&self) -> AdapterStates {
      let (tx, rx) = mpsc::unbounded_channel();
      if self.subscribe_tx.send(tx).is_err() {
         debug!("Adapter monitor stopped, observer will see no states");
      }
      AdapterStates { rx }
   }
}

/// Stream of adapter states handed out by [`AdapterMonitor::observe`].
#[derive(Debug)]
pub struct AdapterStates {
   rx: mpsc::UnboundedReceiver<AdapterState>,
}

impl AdapterStates {
   pub async fn next(&mut self) -> Option<AdapterState> {
      self.rx.recv().await
   }
}

async fn run_monitor(
   mut native_rx: mpsc::UnboundedReceiver<i32>,
   mut subscribe_rx: mpsc::UnboundedReceiver<mpsc::UnboundedSender<AdapterState>>,
   current: Arc<AtomicCell<Option<AdapterState>>>,
) {
   let mut observers: Vec<mpsc::UnboundedSender<AdapterState>> = Vec::new();

   loop {
      select! {
         biased;
         Some(observer) = subscribe_rx.recv() => {
            if let Some(state) = current.load()
               && observer.send(state).is_err()
            {
               continue;
            }
            observers.push(observer);
         }
         Some(code) = native_rx.recv() => {
            let Some(state) = AdapterState::from_native(code) else {
               debug!("Dropping unrecognized adapter state code {code}");
               continue;
            };
            if current.load() == Some(state) {
               continue;
            }
            info!("Adapter state changed to {state}");
            current.store(Some(state));
            observers.retain(|observer| observer.send(state).is_ok());
         }
         else => break,
      }
   }

   debug!("Adapter monitor stopped");
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use tokio::time;

   use super::*;
   use crate::bluetooth::mock::MockRadio;

   async fn next(states: &mut AdapterStates) -> Option<AdapterState> {
      time::timeout(Duration::from_secs(2), states.next())
         .await
         .expect("no adapter state in time")
   }

   #[tokio::test]
   async fn test_observer_starts_with_current_state() {
      let radio = MockRadio::new();
      let monitor = AdapterMonitor::new(&*radio).expect("monitor");
      assert_eq!(monitor.current(), Some(AdapterState::Off));

      let mut states = monitor.observe();
      assert_eq!(next(&mut states).await, Some(AdapterState::Off));

      radio.set_power(AdapterState::TurningOn);
      radio.set_power(AdapterState::On);
      assert_eq!(next(&mut states).await, Some(AdapterState::TurningOn));
      assert_eq!(next(&mut states).await, Some(AdapterState::On));
      assert_eq!(monitor.current(), Some(AdapterState::On));
   }

   #[tokio::test]
   async fn test_unrecognized_and_repeated_codes_are_dropped() {
      let radio = MockRadio::new();
      let monitor = AdapterMonitor::new(&*radio).expect("monitor");
      let mut states = monitor.observe();
      assert_eq!(next(&mut states).await, Some(AdapterState::Off));

      radio.fire_power(99);
      radio.set_power(AdapterState::Off);
      radio.fire_power(-1);
      radio.set_power(AdapterState::On);
      radio.set_power(AdapterState::On);
      radio.set_power(AdapterState::TurningOff);

      assert_eq!(next(&mut states).await, Some(AdapterState::On));
      assert_eq!(next(&mut states).await, Some(AdapterState::TurningOff));
      assert!(states.rx.try_recv().is_err());
   }

   #[tokio::test]
   async fn test_every_observer_sees_changes() {
      let radio = MockRadio::new();
      let monitor = AdapterMonitor::new(&*radio).expect("monitor");
      let mut first = monitor.observe();
      let mut second = monitor.clone().observe();
      assert_eq!(next(&mut first).await, Some(AdapterState::Off));
      assert_eq!(next(&mut second).await, Some(AdapterState::Off));

      radio.set_power(AdapterState::On);
      assert_eq!(next(&mut first).await, Some(AdapterState::On));
      assert_eq!(next(&mut second).await, Some(AdapterState::On));
   }

   #[tokio::test]
   async fn test_registration_failure_is_setup_failure() {
      let radio = MockRadio::failing_registration();
      let result = AdapterMonitor::new(&*radio);
      assert!(matches!(result, Err(RadioError::SetupFailure(_))));
   }
}

//! Scripted in-memory platform for tests.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::time;
use uuid::Uuid;

use crate::{
   bluetooth::platform::{
      AdapterState, AdvertisementReport, GattSink, PowerSink, RadioPlatform, ScanSettings,
      ScanSink, Transport,
   },
   device::DeviceAddress,
   error::{RadioError, Result},
};

/// Outbound calls recorded by [`MockRadio`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
   StartScan(ScanSettings),
   StopScan,
   Connect(DeviceAddress),
   DiscoverServices(DeviceAddress),
   Disconnect(DeviceAddress),
   Read(DeviceAddress, Uuid),
   Write(DeviceAddress, Uuid, Vec<u8>),
   Notify(DeviceAddress, Uuid, bool),
   ReadRssi(DeviceAddress),
}

struct State {
   power: i32,
   power_sink: Option<PowerSink>,
   scan_sink: Option<ScanSink>,
   gatt: HashMap<DeviceAddress, GattSink>,
   calls: Vec<Call>,
   fail_registration: bool,
   fail_start_scan: bool,
   fail_connect: bool,
}

pub struct MockRadio(Arc<Mutex<State>>);

impl MockRadio {
   pub fn new() -> Arc<Self> {
      Arc::new(Self(Arc::new(Mutex::new(State {
         power: AdapterState::Off.native(),
         power_sink: None,
         scan_sink: None,
         gatt: HashMap::new(),
         calls: Vec::new(),
         fail_registration: false,
         fail_start_scan: false,
         fail_connect: false,
      }))))
   }

   pub fn failing_registration() -> Arc<Self> {
      let radio = Self::new();
      radio.0.lock().fail_registration = true;
      radio
   }

   pub fn set_fail_start_scan(&self, fail: bool) {
      self.0.lock().fail_start_scan = fail;
   }

   pub fn set_fail_connect(&self, fail: bool) {
      self.0.lock().fail_connect = fail;
   }

   /// Changes the adapter state and notifies the listener.
   pub fn set_power(&self, state: AdapterState) {
      self.fire_power(state.native());
   }

   pub fn fire_power(&self, code: i32) {
      let sink = {
         let mut state = self.0.lock();
         if AdapterState::from_native(code).is_some() {
            state.power = code;
         }
         state.power_sink.clone()
      };
      if let Some(sink) = sink {
         sink.on_state_changed(code);
      }
   }

   fn scan_sink(&self) -> ScanSink {
      self
         .0
         .lock()
         .scan_sink
         .clone()
         .expect("scan was never started")
   }

   pub fn advertise(&self, address: &str, name: Option<&str>, rssi: i16) {
      self.scan_sink().on_scan_result(AdvertisementReport {
         address: address.into(),
         name: name.map(Into::into),
         rssi,
      });
   }

   pub fn batch(&self, reports: Vec<AdvertisementReport>) {
      self.scan_sink().on_batch_scan_results(reports);
   }

   pub fn scan_failed(&self, code: i32) {
      self.scan_sink().on_scan_failed(code);
   }

   /// Sink registered by the most recent connect to `address`.
   pub fn gatt(&self, address: &str) -> GattSink {
      self
         .0
         .lock()
         .gatt
         .get(&DeviceAddress::from(address))
         .cloned()
         .expect("no connection to address")
   }

   pub fn calls(&self) -> Vec<Call> {
      self.0.lock().calls.clone()
   }

   pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
      self.0.lock().calls.iter().filter(|c| pred(c)).count()
   }
}

impl RadioPlatform for MockRadio {
   fn power_state(&self) -> i32 {
      self.0.lock().power
   }

   fn register_power_listener(&self, sink: PowerSink) -> Result<()> {
      let mut state = self.0.lock();
      if state.fail_registration {
         return Err(RadioError::SetupFailure("receiver rejected".into()));
      }
      state.power_sink = Some(sink);
      Ok(())
   }

   fn start_scan(&self, settings: &ScanSettings, sink: ScanSink) -> Result<()> {
      let mut state = self.0.lock();
      state.calls.push(Call::StartScan(*settings));
      if state.fail_start_scan {
         return Err(RadioError::Transport("scanner unavailable".into()));
      }
      state.scan_sink = Some(sink);
      Ok(())
   }

   fn stop_scan(&self) -> Result<()> {
      self.0.lock().calls.push(Call::StopScan);
      Ok(())
   }

   fn connect(&self, address: &DeviceAddress, sink: GattSink) -> Result<Box<dyn Transport>> {
      let mut state = self.0.lock();
      state.calls.push(Call::Connect(address.clone()));
      if state.fail_connect {
         return Err(RadioError::Transport("connect refused".into()));
      }
      state.gatt.insert(address.clone(), sink);
      Ok(Box::new(MockTransport {
         address: address.clone(),
         state: self.0.clone(),
      }))
   }
}

struct MockTransport {
   address: DeviceAddress,
   state: Arc<Mutex<State>>,
}

impl MockTransport {
   fn record(&self, call: Call) -> Result<()> {
      self.state.lock().calls.push(call);
      Ok(())
   }
}

impl Transport for MockTransport {
   fn discover_services(&self) -> Result<()> {
      self.record(Call::DiscoverServices(self.address.clone()))
   }

   fn disconnect(&self) -> Result<()> {
      self.record(Call::Disconnect(self.address.clone()))
   }

   fn read_characteristic(&self, characteristic: Uuid) -> Result<()> {
      self.record(Call::Read(self.address.clone(), characteristic))
   }

   fn write_characteristic(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
      self.record(Call::Write(
         self.address.clone(),
         characteristic,
         value.to_vec(),
      ))
   }

   fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<()> {
      self.record(Call::Notify(self.address.clone(), characteristic, enabled))
   }

   fn read_rssi(&self) -> Result<()> {
      self.record(Call::ReadRssi(self.address.clone()))
   }
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
   let waited = time::timeout(Duration::from_secs(2), async {
      while !check() {
         time::sleep(Duration::from_millis(5)).await;
      }
   })
   .await;
   assert!(waited.is_ok(), "condition not reached in time");
}

//! BlueZ back-end built on `bluer`.
//!
//! Every platform call returns immediately. The async work happens on
//! spawned tasks that report back through the sinks, the same way a native
//! radio stack raises callbacks on its own threads.

use std::{collections::HashMap, sync::Arc};

use bluer::{
   Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
   DiscoveryFilter, DiscoveryTransport, ErrorKind, Session, gatt::remote::Characteristic,
};
use crossbeam::atomic::AtomicCell;
use futures::{
   pin_mut,
   stream::{BoxStream, SelectAll, StreamExt},
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{select, sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::{
   bluetooth::platform::{
      AdapterState, AdvertisementReport, CCCD_UUID, CallbackType, GattSink, GattStatus,
      PowerSink, ProfileState, RadioPlatform, ScanFailure, ScanSettings, ScanSink, Transport,
   },
   device::DeviceAddress,
   error::{RadioError, Result},
};

const SUCCESS: i32 = 0;

const fn power_code(powered: bool) -> i32 {
   if powered {
      AdapterState::On.native()
   } else {
      AdapterState::Off.native()
   }
}

/// Radio platform backed by a BlueZ adapter.
pub struct BluezRadio {
   _session: Session,
   adapter: Adapter,
   powered: Arc<AtomicCell<i32>>,
   adapter_events: Mutex<Option<BoxStream<'static, AdapterEvent>>>,
   scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluezRadio {
   /// Opens the named adapter, or the default one when `name` is `None`.
   pub async fn new(name: Option<&str>) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match name {
         Some(name) => session.adapter(name)?,
         None => session.default_adapter().await?,
      };

      let powered = adapter.is_powered().await?;
      // Subscribed up front so no power change is missed before the
      // listener is registered.
      let events = adapter.events().await?.boxed();
      info!(
         "Using adapter {} ({})",
         adapter.name(),
         if powered { "powered" } else { "unpowered" }
      );

      Ok(Self {
         _session: session,
         adapter,
         powered: Arc::new(AtomicCell::new(power_code(powered))),
         adapter_events: Mutex::new(Some(events)),
         scan_task: Mutex::new(None),
      })
   }

   pub fn adapter_name(&self) -> &str {
      self.adapter.name()
   }
}

impl RadioPlatform for BluezRadio {
   fn power_state(&self) -> i32 {
      self.powered.load()
   }

   fn register_power_listener(&self, sink: PowerSink) -> Result<()> {
      let Some(mut events) = self.adapter_events.lock().take() else {
         return Err(RadioError::SetupFailure(
            "power listener already registered".to_string(),
         ));
      };
      let powered = self.powered.clone();
      let name = self.adapter.name().to_string();

      tokio::spawn(async move {
         while let Some(event) = events.next().await {
            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) = event {
               debug!("Adapter {name} powered: {on}");
               let code = power_code(on);
               powered.store(code);
               sink.on_state_changed(code);
            }
         }
         warn!("Adapter {name} event stream ended");
      });
      Ok(())
   }

   fn start_scan(&self, settings: &ScanSettings, sink: ScanSink) -> Result<()> {
      let mut scan_task = self.scan_task.lock();
      if scan_task.as_ref().is_some_and(|task| !task.is_finished()) {
         sink.on_scan_failed(ScanFailure::ALREADY_STARTED);
         return Ok(());
      }

      debug!(
         "Starting discovery on {} (mode {}, {})",
         self.adapter.name(),
         settings.mode,
         settings.callback_type
      );
      let filter = DiscoveryFilter {
         transport: DiscoveryTransport::Le,
         duplicate_data: settings.callback_type == CallbackType::AllMatches,
         ..Default::default()
      };
      *scan_task = Some(tokio::spawn(run_discovery(
         self.adapter.clone(),
         filter,
         sink,
      )));
      Ok(())
   }

   fn stop_scan(&self) -> Result<()> {
      if let Some(task) = self.scan_task.lock().take() {
         debug!("Stopping discovery on {}", self.adapter.name());
         // Dropping the discovery stream ends the discovery session.
         task.abort();
      }
      Ok(())
   }

   fn connect(&self, address: &DeviceAddress, sink: GattSink) -> Result<Box<dyn Transport>> {
      let addr: Address = address
         .as_str()
         .parse()
         .map_err(|_| RadioError::InvalidAddress(address.to_string()))?;
      let device = self.adapter.device(addr)?;

      let (tx, rx) = mpsc::unbounded_channel();
      tokio::spawn(run_link(device, sink, rx));
      Ok(Box::new(BluezTransport { tx }))
   }
}

/// Last known advertisement data per device during one discovery.
#[derive(Debug, Default)]
struct Sightings {
   all_matches: bool,
   devices: HashMap<Address, (Option<String>, Option<i16>)>,
}

impl Sightings {
   fn new(all_matches: bool) -> Self {
      Self {
         all_matches,
         devices: HashMap::new(),
      }
   }

   fn added(
      &mut self,
      addr: Address,
      name: Option<String>,
      rssi: Option<i16>,
   ) -> Option<AdvertisementReport> {
      self.devices.insert(addr, (name, rssi));
      self.report(addr)
   }

   fn removed(&mut self, addr: Address) {
      self.devices.remove(&addr);
   }

   /// A name change is always reported; RSSI-only changes only for
   /// `all_matches`.
   fn changed(&mut self, addr: Address, property: DeviceProperty) -> Option<AdvertisementReport> {
      let (name, rssi) = self.devices.get_mut(&addr)?;
      match property {
         DeviceProperty::Name(new) => *name = Some(new),
         DeviceProperty::Rssi(new) => {
            *rssi = Some(new);
            if !self.all_matches {
               return None;
            }
         },
         _ => return None,
      }
      self.report(addr)
   }

   fn report(&self, addr: Address) -> Option<AdvertisementReport> {
      let (name, rssi) = self.devices.get(&addr)?;
      Some(AdvertisementReport {
         address: DeviceAddress::new(addr.to_string()),
         name: name.as_deref().map(Into::into),
         rssi: (*rssi)?,
      })
   }
}

async fn run_discovery(adapter: Adapter, filter: DiscoveryFilter, sink: ScanSink) {
   let all_matches = filter.duplicate_data;
   if let Err(e) = adapter.set_discovery_filter(filter).await {
      warn!("Failed to set discovery filter: {e}");
      sink.on_scan_failed(ScanFailure::REGISTRATION_FAILED);
      return;
   }

   let events = match adapter.discover_devices().await {
      Ok(events) => events,
      Err(e) => {
         warn!("Failed to start discovery: {e}");
         sink.on_scan_failed(ScanFailure::INTERNAL_ERROR);
         return;
      },
   };
   pin_mut!(events);

   let mut sightings = Sightings::new(all_matches);
   // Property changes of every device added during this discovery
   let mut watched: SelectAll<BoxStream<'static, (Address, DeviceEvent)>> = SelectAll::new();

   loop {
      let report = select! {
         event = events.next() => match event {
            Some(AdapterEvent::DeviceAdded(addr)) => {
               let Ok(device) = adapter.device(addr) else {
                  continue;
               };
               match device.events().await {
                  Ok(changes) => watched.push(changes.map(move |e| (addr, e)).boxed()),
                  Err(e) => debug!("Not watching {addr} for updates: {e}"),
               }
               let name = device.name().await.ok().flatten();
               let rssi = device.rssi().await.ok().flatten();
               sightings.added(addr, name, rssi)
            },
            Some(AdapterEvent::DeviceRemoved(addr)) => {
               sightings.removed(addr);
               None
            },
            Some(_) => None,
            None => break,
         },
         Some((addr, DeviceEvent::PropertyChanged(property))) = watched.next() => {
            sightings.changed(addr, property)
         },
      };
      if let Some(report) = report {
         sink.on_scan_result(report);
      }
   }
   debug!("Discovery stream ended");
}

// === Links ===

#[derive(Debug)]
enum LinkCommand {
   DiscoverServices,
   Disconnect,
   Read(Uuid),
   Write(Uuid, Vec<u8>),
   Notify(Uuid, bool),
   ReadRssi,
}

/// Handle to a link task.
struct BluezTransport {
   tx: mpsc::UnboundedSender<LinkCommand>,
}

impl BluezTransport {
   fn send(&self, cmd: LinkCommand) -> Result<()> {
      self
         .tx
         .send(cmd)
         .map_err(|_| RadioError::Transport("link closed".to_string()))
   }
}

impl Transport for BluezTransport {
   fn discover_services(&self) -> Result<()> {
      self.send(LinkCommand::DiscoverServices)
   }

   fn disconnect(&self) -> Result<()> {
      self.send(LinkCommand::Disconnect)
   }

   fn read_characteristic(&self, characteristic: Uuid) -> Result<()> {
      self.send(LinkCommand::Read(characteristic))
   }

   fn write_characteristic(&self, characteristic: Uuid, value: &[u8]) -> Result<()> {
      self.send(LinkCommand::Write(characteristic, value.to_vec()))
   }

   fn set_notify(&self, characteristic: Uuid, enabled: bool) -> Result<()> {
      self.send(LinkCommand::Notify(characteristic, enabled))
   }

   fn read_rssi(&self) -> Result<()> {
      self.send(LinkCommand::ReadRssi)
   }
}

/// Maps a BlueZ error to the GATT status reported for it.
fn gatt_status(err: &bluer::Error, denied: GattStatus) -> GattStatus {
   match err.kind {
      ErrorKind::NotPermitted => denied,
      ErrorKind::NotAuthorized => GattStatus::InsufficientAuthentication,
      ErrorKind::NotSupported => GattStatus::RequestNotSupported,
      _ => GattStatus::Failure,
   }
}

struct Link {
   device: Device,
   sink: GattSink,
   characteristics: HashMap<Uuid, Characteristic>,
   notifications: HashMap<Uuid, JoinHandle<()>>,
   discovery_pending: bool,
}

async fn run_link(
   device: Device,
   sink: GattSink,
   mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
   let addr = device.address();
   if let Err(e) = device.connect().await {
      warn!("Connection to {addr} failed: {e}");
      sink.on_connection_state_change(
         gatt_status(&e, GattStatus::Failure).code(),
         ProfileState::Disconnected as i32,
      );
      return;
   }
   let events = match device.events().await {
      Ok(events) => events,
      Err(e) => {
         warn!("Failed to watch {addr}: {e}");
         let _ = device.disconnect().await;
         sink.on_connection_state_change(
            GattStatus::Failure.code(),
            ProfileState::Disconnected as i32,
         );
         return;
      },
   };
   pin_mut!(events);
   sink.on_connection_state_change(SUCCESS, ProfileState::Connected as i32);

   let mut link = Link {
      device,
      sink,
      characteristics: HashMap::new(),
      notifications: HashMap::new(),
      discovery_pending: false,
   };

   loop {
      select! {
         cmd = commands.recv() => {
            let Some(cmd) = cmd else {
               debug!("Transport for {addr} dropped, closing link");
               let _ = link.device.disconnect().await;
               break;
            };
            if !link.handle_command(cmd).await {
               break;
            }
         }
         event = events.next() => match event {
            Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) | None => {
               info!("Link to {addr} lost");
               link.sink.on_connection_state_change(SUCCESS, ProfileState::Disconnected as i32);
               break;
            },
            Some(DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true)))
               if link.discovery_pending =>
            {
               link.resolve_services().await;
            },
            Some(_) => {},
         },
      }
   }

   for (_, task) in link.notifications.drain() {
      task.abort();
   }
}

impl Link {
   /// Returns `false` once the link is closed.
   async fn handle_command(&mut self, cmd: LinkCommand) -> bool {
      match cmd {
         LinkCommand::DiscoverServices => {
            if self.device.is_services_resolved().await.unwrap_or(false) {
               self.resolve_services().await;
            } else {
               self.discovery_pending = true;
            }
         },
         LinkCommand::Disconnect => {
            let status = match self.device.disconnect().await {
               Ok(()) => GattStatus::Success,
               Err(e) => {
                  warn!("Disconnect from {} failed: {e}", self.device.address());
                  gatt_status(&e, GattStatus::Failure)
               },
            };
            self
               .sink
               .on_connection_state_change(status.code(), ProfileState::Disconnected as i32);
            return false;
         },
         LinkCommand::Read(uuid) => {
            let (value, status) = match self.characteristics.get(&uuid) {
               Some(c) => match c.read().await {
                  Ok(value) => (value, GattStatus::Success),
                  Err(e) => (vec![], gatt_status(&e, GattStatus::ReadNotPermitted)),
               },
               None => (vec![], GattStatus::Failure),
            };
            self.sink.on_characteristic_read(uuid, value, status.code());
         },
         LinkCommand::Write(uuid, value) => {
            let status = match self.characteristics.get(&uuid) {
               Some(c) => match c.write(&value).await {
                  Ok(()) => GattStatus::Success,
                  Err(e) => gatt_status(&e, GattStatus::WriteNotPermitted),
               },
               None => GattStatus::Failure,
            };
            self.sink.on_characteristic_write(uuid, status.code());
         },
         LinkCommand::Notify(uuid, enabled) => self.set_notify(uuid, enabled),
         LinkCommand::ReadRssi => {
            let (rssi, status) = match self.device.rssi().await {
               Ok(Some(rssi)) => (rssi, GattStatus::Success),
               Ok(None) => (0, GattStatus::Failure),
               Err(e) => (0, gatt_status(&e, GattStatus::Failure)),
            };
            self.sink.on_read_remote_rssi(rssi, status.code());
         },
      }
      true
   }

   async fn resolve_services(&mut self) {
      self.discovery_pending = false;
      let status = match collect_characteristics(&self.device).await {
         Ok(map) => {
            debug!(
               "Resolved {} characteristics on {}",
               map.len(),
               self.device.address()
            );
            self.characteristics = map;
            GattStatus::Success
         },
         Err(e) => {
            warn!("Service discovery on {} failed: {e}", self.device.address());
            gatt_status(&e, GattStatus::Failure)
         },
      };
      self.sink.on_services_discovered(status.code());
   }

   /// Notification state is reported as a write to the CCCD.
   fn set_notify(&mut self, uuid: Uuid, enabled: bool) {
      if let Some(task) = self.notifications.remove(&uuid) {
         task.abort();
      }
      if !enabled {
         self.sink.on_descriptor_write(CCCD_UUID, SUCCESS);
         return;
      }
      let Some(characteristic) = self.characteristics.get(&uuid).cloned() else {
         self
            .sink
            .on_descriptor_write(CCCD_UUID, GattStatus::Failure.code());
         return;
      };

      let sink = self.sink.clone();
      let task = tokio::spawn(async move {
         let values = match characteristic.notify().await {
            Ok(values) => values,
            Err(e) => {
               let status = gatt_status(&e, GattStatus::WriteNotPermitted);
               sink.on_descriptor_write(CCCD_UUID, status.code());
               return;
            },
         };
         sink.on_descriptor_write(CCCD_UUID, SUCCESS);
         pin_mut!(values);
         while let Some(value) = values.next().await {
            sink.on_characteristic_changed(uuid, value);
         }
      });
      self.notifications.insert(uuid, task);
   }
}

async fn collect_characteristics(
   device: &Device,
) -> bluer::Result<HashMap<Uuid, Characteristic>> {
   let mut map = HashMap::new();
   for service in device.services().await? {
      for characteristic in service.characteristics().await? {
         let uuid = characteristic.uuid().await?;
         map.insert(uuid, characteristic);
      }
   }
   Ok(map)
}

#[cfg(test)]
mod tests {
   use super::*;

   fn error(kind: ErrorKind) -> bluer::Error {
      bluer::Error {
         kind,
         message: String::new(),
      }
   }

   const SENSOR: Address = Address::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

   #[test]
   fn test_late_name_is_reported() {
      let mut sightings = Sightings::new(false);
      let first = sightings.added(SENSOR, None, Some(-70)).expect("report");
      assert_eq!(first.name, None);
      assert_eq!(first.address.as_str(), "AA:BB:CC:DD:EE:FF");

      let named = sightings
         .changed(SENSOR, DeviceProperty::Name("Sensor".to_string()))
         .expect("report");
      assert_eq!(named.name.as_deref(), Some("Sensor"));
      assert_eq!(named.rssi, -70);
   }

   #[test]
   fn test_rssi_updates_follow_callback_type() {
      let mut first_match = Sightings::new(false);
      first_match.added(SENSOR, Some("Sensor".to_string()), Some(-70));
      assert!(first_match.changed(SENSOR, DeviceProperty::Rssi(-50)).is_none());

      let mut all_matches = Sightings::new(true);
      all_matches.added(SENSOR, Some("Sensor".to_string()), Some(-70));
      let update = all_matches
         .changed(SENSOR, DeviceProperty::Rssi(-50))
         .expect("report");
      assert_eq!(update.rssi, -50);
   }

   #[test]
   fn test_sightings_without_rssi_are_held_back() {
      let mut sightings = Sightings::new(true);
      assert!(sightings.added(SENSOR, Some("Sensor".to_string()), None).is_none());
      assert!(sightings
         .changed(SENSOR, DeviceProperty::Name("Renamed".to_string()))
         .is_none());
      let report = sightings
         .changed(SENSOR, DeviceProperty::Rssi(-64))
         .expect("report");
      assert_eq!(report.name.as_deref(), Some("Renamed"));
   }

   #[test]
   fn test_removed_devices_are_forgotten() {
      let mut sightings = Sightings::new(true);
      sightings.added(SENSOR, Some("Sensor".to_string()), Some(-70));
      sightings.removed(SENSOR);
      assert!(sightings.changed(SENSOR, DeviceProperty::Rssi(-50)).is_none());
   }

   #[test]
   fn test_power_codes() {
      assert_eq!(AdapterState::from_native(power_code(true)), Some(AdapterState::On));
      assert_eq!(AdapterState::from_native(power_code(false)), Some(AdapterState::Off));
   }

   #[test]
   fn test_bluez_errors_map_to_gatt_status() {
      assert_eq!(
         gatt_status(&error(ErrorKind::NotPermitted), GattStatus::ReadNotPermitted),
         GattStatus::ReadNotPermitted
      );
      assert_eq!(
         gatt_status(&error(ErrorKind::NotAuthorized), GattStatus::Failure),
         GattStatus::InsufficientAuthentication
      );
      assert_eq!(
         gatt_status(&error(ErrorKind::NotSupported), GattStatus::Failure),
         GattStatus::RequestNotSupported
      );
      assert_eq!(
         gatt_status(&error(ErrorKind::Failed), GattStatus::WriteNotPermitted),
         GattStatus::Failure
      );
   }
}

use std::str::FromStr;

use bluer::Address;
use log::info;
use uuid::Uuid;
use zbus::{interface, object_server::SignalEmitter};

use blelink::{
   device::DeviceAddress,
   radio::{Radio, ScanSupervisor},
};

pub const BUS_NAME: &str = "org.blelink";
pub const OBJECT_PATH: &str = "/org/blelink/radio";

fn parse_address(address: &str) -> zbus::fdo::Result<DeviceAddress> {
   let addr =
      Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
   Ok(DeviceAddress::new(addr.to_string()))
}

fn parse_uuid(uuid: &str) -> zbus::fdo::Result<Uuid> {
   Uuid::parse_str(uuid).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

fn failed(e: impl ToString) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(e.to_string())
}

pub struct RadioService {
   radio: Radio,
   scan: ScanSupervisor,
}

impl RadioService {
   pub const fn new(radio: Radio, scan: ScanSupervisor) -> Self {
      Self { radio, scan }
   }
}

#[interface(name = "org.blelink.Radio")]
impl RadioService {
   async fn start_scan(&self) -> zbus::fdo::Result<bool> {
      info!("Scan requested over D-Bus");
      self.scan.start().await;
      Ok(true)
   }

   async fn stop_scan(&self) -> zbus::fdo::Result<bool> {
      self.scan.stop().await.map_err(failed)
   }

   async fn connect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.radio.connect(addr).await.map_err(failed)?;
      Ok(true)
   }

   async fn disconnect(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.radio.disconnect(addr).await.map_err(failed)?;
      Ok(true)
   }

   async fn disconnect_all(&self) -> zbus::fdo::Result<u32> {
      let count = self.radio.disconnect_all().await.map_err(failed)?;
      Ok(u32::try_from(count).unwrap_or(u32::MAX))
   }

   async fn read_characteristic(
      &self,
      address: String,
      characteristic: String,
   ) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let uuid = parse_uuid(&characteristic)?;
      self
         .radio
         .read_characteristic(addr, uuid)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn write_characteristic(
      &self,
      address: String,
      characteristic: String,
      value: String,
   ) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let uuid = parse_uuid(&characteristic)?;
      let value = hex::decode(value).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
      self
         .radio
         .write_characteristic(addr, uuid, value)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn set_notify(
      &self,
      address: String,
      characteristic: String,
      enabled: bool,
   ) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      let uuid = parse_uuid(&characteristic)?;
      self
         .radio
         .set_notify(addr, uuid, enabled)
         .await
         .map_err(failed)?;
      Ok(true)
   }

   async fn read_rssi(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr = parse_address(&address)?;
      self.radio.read_rssi(addr).await.map_err(failed)?;
      Ok(true)
   }

   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let devices: Vec<serde_json::Value> = self
         .radio
         .devices()
         .iter()
         .map(|d| d.to_json())
         .collect();
      serde_json::to_string(&devices).map_err(failed)
   }

   async fn get_sessions(&self) -> zbus::fdo::Result<String> {
      let sessions: Vec<serde_json::Value> = self
         .radio
         .sessions()
         .await
         .into_iter()
         .map(|(address, state)| {
            serde_json::json!({
               "address": address,
               "state": state,
            })
         })
         .collect();
      serde_json::to_string(&sessions).map_err(failed)
   }

   async fn get_adapter_state(&self) -> zbus::fdo::Result<String> {
      Ok(self
         .radio
         .adapter_state()
         .map_or_else(|| "unknown".to_string(), |s| s.to_string()))
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_found(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
      rssi: i16,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      name: &str,
      rssi: i16,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn scan_failed(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn session_event(
      emitter: &SignalEmitter<'_>,
      address: &str,
      event: &str,
   ) -> zbus::Result<()>;
}

//! blelink D-Bus service
//!
//! This daemon scans for low-energy peripherals on the host adapter, keeps
//! GATT sessions to them, and exposes both over the session bus.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::signal;
use zbus::{Connection, connection, object_server::InterfaceRef};

use blelink::{
   bluetooth::bluez::BluezRadio,
   config::Config,
   error::Result,
   event::{RadioEvent, ScanEvent, Subscription},
   radio::{Radio, ScanSupervisor},
};
use dbus::{BUS_NAME, OBJECT_PATH, RadioService, RadioServiceSignals};

mod dbus;

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting blelink D-Bus service...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   let platform = Arc::new(BluezRadio::new(config.adapter.as_deref()).await?);
   info!("Opened adapter {}", platform.adapter_name());
   let radio = Radio::new(platform, &config)?;
   // Subscribed before scanning so no discovery is missed
   let events = radio.subscribe();

   // Create D-Bus service
   let scan = ScanSupervisor::new(radio.clone());
   if config.scan.scan_on_start {
      scan.start().await;
   }
   let service = RadioService::new(radio.clone(), scan.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(BUS_NAME)?
      .serve_at(OBJECT_PATH, service)?
      .build()
      .await?;

   info!("blelink D-Bus service started at {BUS_NAME}");

   // Start event processor
   EventProcessor {
      radio: radio.clone(),
      config,
   }
   .spawn(&connection, events)
   .await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down blelink service...");

   match radio.disconnect_all().await {
      Ok(count) => info!("Disconnected {count} sessions"),
      Err(e) => warn!("Failed to disconnect sessions: {e}"),
   }
   if let Err(e) = scan.stop().await {
      warn!("Failed to stop scan: {e}");
   }

   Ok(())
}

/// Relays bus events to D-Bus signals and connects known devices.
struct EventProcessor {
   radio: Radio,
   config: Config,
}

impl EventProcessor {
   async fn dispatch(&self, iface: &InterfaceRef<RadioService>, event: RadioEvent) -> Result<()> {
      match event {
         RadioEvent::Scan(ScanEvent::DeviceFound(device)) => {
            let name = device.display_name.as_deref().unwrap_or_default();
            iface
               .device_found(device.address.as_str(), name, device.rssi)
               .await?;

            if let Some(known) = self.config.is_known_device(device.address.as_str()) {
               info!("Known device {known} ({}) found, connecting", device.address);
               if let Err(e) = self.radio.connect(device.address.clone()).await {
                  warn!("Failed to connect to {}: {e}", device.address);
               }
            }
         },
         RadioEvent::Scan(ScanEvent::DeviceUpdated(device)) => {
            let name = device.display_name.as_deref().unwrap_or_default();
            iface
               .device_updated(device.address.as_str(), name, device.rssi)
               .await?;
         },
         RadioEvent::Scan(ScanEvent::ScanFailed(reason)) => {
            iface.scan_failed(&reason.to_string()).await?;
         },
         RadioEvent::Session(event) => {
            debug!("Session event on {}: {:?}", event.address, event.kind);
            iface
               .session_event(event.address.as_str(), &event.kind.to_json().to_string())
               .await?;
         },
      }
      Ok(())
   }

   async fn spawn(self, connection: &Connection, mut events: Subscription) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, RadioService>(OBJECT_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = events.recv().await {
            if let Err(e) = self.dispatch(&iface, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

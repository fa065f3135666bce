//! Session manager for connected peripherals.
//!
//! This module owns one GATT session per device address and drives each
//! through `Disconnected -> Connecting -> Connected -> Disconnecting ->
//! Disconnected`, forwarding transport callbacks to the event bus.

use std::{
   collections::{HashMap, VecDeque},
   mem,
};

use log::{debug, info, warn};
use tokio::{
   select,
   sync::{mpsc, oneshot},
};
use uuid::Uuid;

use crate::{
   bluetooth::platform::{
      GattCallback, GattMessage, GattSink, GattStatus, PlatformRef, ProfileState, Transport,
   },
   config::TeardownPolicy,
   device::{DeviceAddress, DeviceRegistry},
   error::{RadioError, Result},
   event::{EventSender, RadioEvent, SessionEvent, SessionEventKind, SessionEvents, SessionState},
};

/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;
/// Events held per session while a buffered teardown is pending
const TEARDOWN_BUFFER_LIMIT: usize = 64;

// === Sessions ===

/// Progress of service discovery on a connected session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ServicePhase {
   Discovering,
   Ready,
}

struct Session {
   generation: u64,
   state: SessionState,
   phase: Option<ServicePhase>,
   transport: Option<Box<dyn Transport>>,
}

/// A session removed by `disconnect_all` under [`TeardownPolicy::Buffer`].
struct Teardown {
   address: DeviceAddress,
   // Kept open until the disconnect is confirmed
   _transport: Box<dyn Transport>,
   buffered: VecDeque<SessionEventKind>,
}

// === Commands ===

enum ManagerCommand {
   Connect(DeviceAddress, oneshot::Sender<Result<()>>),
   Disconnect(DeviceAddress, oneshot::Sender<Result<()>>),
   DisconnectAll(oneshot::Sender<usize>),
   ReadCharacteristic(DeviceAddress, Uuid, oneshot::Sender<Result<()>>),
   WriteCharacteristic(DeviceAddress, Uuid, Vec<u8>, oneshot::Sender<Result<()>>),
   SetNotify(DeviceAddress, Uuid, bool, oneshot::Sender<Result<()>>),
   ReadRssi(DeviceAddress, oneshot::Sender<Result<()>>),
   GetState(DeviceAddress, oneshot::Sender<Option<SessionState>>),
   GetAllStates(oneshot::Sender<Vec<(DeviceAddress, SessionState)>>),
}

// === Main Manager ===

/// Owns the per-device sessions.
///
/// All session state lives on one actor task; this handle only sends it
/// commands. It is cheaply cloneable.
#[derive(Clone)]
pub struct SessionManager {
   inbox: mpsc::Sender<ManagerCommand>,
   event_tx: EventSender,
}

impl SessionManager {
   pub fn new(
      platform: PlatformRef,
      registry: DeviceRegistry,
      event_tx: EventSender,
      policy: TeardownPolicy,
   ) -> Self {
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let (gatt_tx, gatt_rx) = mpsc::unbounded_channel();
      let actor = ManagerActor {
         platform,
         registry,
         event_tx: event_tx.clone(),
         policy,
         gatt_tx,
         sessions: HashMap::new(),
         tearing_down: HashMap::new(),
         next_generation: 1,
      };
      tokio::spawn(actor.run(command_rx, gatt_rx));
      Self {
         inbox: command_tx,
         event_tx,
      }
   }

   async fn request<T>(&self, cmd: ManagerCommand, rx: oneshot::Receiver<T>) -> Result<T> {
      self
         .inbox
         .send(cmd)
         .await
         .map_err(|_| RadioError::ManagerShutdown)?;
      rx.await.map_err(|_| RadioError::ManagerShutdown)
   }

   /// Opens a session to a discovered device.
   ///
   /// Returns once the platform connect has been issued; the outcome arrives
   /// on the session's event stream.
   pub async fn connect(&self, address: DeviceAddress) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self.request(ManagerCommand::Connect(address, tx), rx).await?
   }

   /// Requests disconnection. A no-op when no session exists.
   pub async fn disconnect(&self, address: DeviceAddress) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self.request(ManagerCommand::Disconnect(address, tx), rx).await?
   }

   /// Requests disconnection of every session and clears the registry
   /// before any of them completes. Returns the number of sessions.
   pub async fn disconnect_all(&self) -> Result<usize> {
      let (tx, rx) = oneshot::channel();
      self.request(ManagerCommand::DisconnectAll(tx), rx).await
   }

   pub async fn read_characteristic(
      &self,
      address: DeviceAddress,
      characteristic: Uuid,
   ) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .request(
            ManagerCommand::ReadCharacteristic(address, characteristic, tx),
            rx,
         )
         .await?
   }

   pub async fn write_characteristic(
      &self,
      address: DeviceAddress,
      characteristic: Uuid,
      value: Vec<u8>,
   ) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .request(
            ManagerCommand::WriteCharacteristic(address, characteristic, value, tx),
            rx,
         )
         .await?
   }

   pub async fn set_notify(
      &self,
      address: DeviceAddress,
      characteristic: Uuid,
      enabled: bool,
   ) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .request(
            ManagerCommand::SetNotify(address, characteristic, enabled, tx),
            rx,
         )
         .await?
   }

   pub async fn read_rssi(&self, address: DeviceAddress) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self.request(ManagerCommand::ReadRssi(address, tx), rx).await?
   }

   pub async fn state(&self, address: DeviceAddress) -> Option<SessionState> {
      let (tx, rx) = oneshot::channel();
      self
         .request(ManagerCommand::GetState(address, tx), rx)
         .await
         .ok()
         .flatten()
   }

   pub async fn sessions(&self) -> Vec<(DeviceAddress, SessionState)> {
      let (tx, rx) = oneshot::channel();
      self
         .request(ManagerCommand::GetAllStates(tx), rx)
         .await
         .unwrap_or_default()
   }

   /// Event stream of one session.
   pub fn events(&self, address: DeviceAddress) -> SessionEvents {
      self.event_tx.subscribe().session_events(address)
   }
}

// === Manager Actor ===

struct ManagerActor {
   platform: PlatformRef,
   registry: DeviceRegistry,
   event_tx: EventSender,
   policy: TeardownPolicy,
   gatt_tx: mpsc::UnboundedSender<GattMessage>,

   // State
   sessions: HashMap<DeviceAddress, Session>,
   tearing_down: HashMap<u64, Teardown>, // keyed by session generation
   next_generation: u64,
}

impl ManagerActor {
   async fn run(
      mut self,
      mut command_rx: mpsc::Receiver<ManagerCommand>,
      mut gatt_rx: mpsc::UnboundedReceiver<GattMessage>,
   ) {
      info!("Session manager starting up");

      loop {
         select! {
            cmd = command_rx.recv() => {
               let Some(cmd) = cmd else {
                  info!("Session manager shutting down");
                  break;
               };
               self.handle_command(cmd);
            }
            Some(msg) = gatt_rx.recv() => {
               self.handle_gatt(msg);
            }
         }
      }

      self.cleanup();
   }

   fn emit(&self, address: &DeviceAddress, kind: SessionEventKind) {
      self.event_tx.emit(RadioEvent::Session(SessionEvent {
         address: address.clone(),
         kind,
      }));
   }

   fn emit_state(&self, address: &DeviceAddress, state: SessionState, status: GattStatus) {
      self.emit(address, SessionEventKind::StateChanged { state, status });
   }

   fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::Connect(addr, reply) => {
            let _ = reply.send(self.connect(addr));
         },
         ManagerCommand::Disconnect(addr, reply) => {
            let _ = reply.send(self.disconnect(&addr));
         },
         ManagerCommand::DisconnectAll(reply) => {
            let _ = reply.send(self.disconnect_all());
         },
         ManagerCommand::ReadCharacteristic(addr, characteristic, reply) => {
            let result = self
               .connected_transport(&addr)
               .and_then(|t| t.read_characteristic(characteristic));
            let _ = reply.send(result);
         },
         ManagerCommand::WriteCharacteristic(addr, characteristic, value, reply) => {
            let result = self
               .connected_transport(&addr)
               .and_then(|t| t.write_characteristic(characteristic, &value));
            let _ = reply.send(result);
         },
         ManagerCommand::SetNotify(addr, characteristic, enabled, reply) => {
            let result = self
               .connected_transport(&addr)
               .and_then(|t| t.set_notify(characteristic, enabled));
            let _ = reply.send(result);
         },
         ManagerCommand::ReadRssi(addr, reply) => {
            let result = self.connected_transport(&addr).and_then(|t| t.read_rssi());
            let _ = reply.send(result);
         },
         ManagerCommand::GetState(addr, reply) => {
            let _ = reply.send(self.sessions.get(&addr).map(|s| s.state));
         },
         ManagerCommand::GetAllStates(reply) => {
            let mut states: Vec<_> = self
               .sessions
               .iter()
               .map(|(addr, s)| (addr.clone(), s.state))
               .collect();
            states.sort_by(|a, b| a.0.cmp(&b.0));
            let _ = reply.send(states);
         },
      }
   }

   fn connected_transport(&self, addr: &DeviceAddress) -> Result<&dyn Transport> {
      self
         .sessions
         .get(addr)
         .filter(|s| s.state == SessionState::Connected)
         .and_then(|s| s.transport.as_deref())
         .ok_or_else(|| RadioError::NotConnected(addr.clone()))
   }

   fn connect(&mut self, addr: DeviceAddress) -> Result<()> {
      if !self.registry.contains(&addr) {
         return Err(RadioError::UnknownDevice(addr));
      }
      if let Some(session) = self.sessions.get(&addr) {
         debug!("Rejecting connect to {addr}: session is {}", session.state);
         return Err(RadioError::AlreadyConnected(addr));
      }

      let generation = self.next_generation;
      self.next_generation += 1;

      // The sink exists before the platform sees the request.
      let sink = GattSink::new(addr.clone(), generation, self.gatt_tx.clone());
      info!("Connecting to {addr}");
      self.sessions.insert(addr.clone(), Session {
         generation,
         state: SessionState::Connecting,
         phase: None,
         transport: None,
      });
      self.emit_state(&addr, SessionState::Connecting, GattStatus::Success);

      match self.platform.connect(&addr, sink) {
         Ok(transport) => {
            if let Some(session) = self.sessions.get_mut(&addr) {
               session.transport = Some(transport);
            }
         },
         Err(e) => {
            warn!("Failed to issue connect to {addr}: {e}");
            self.sessions.remove(&addr);
            self.emit_state(&addr, SessionState::Disconnected, GattStatus::Failure);
         },
      }
      Ok(())
   }

   fn disconnect(&mut self, addr: &DeviceAddress) -> Result<()> {
      let Some(session) = self.sessions.get_mut(addr) else {
         debug!("Disconnect for {addr} ignored, no session");
         return Ok(());
      };
      if session.state == SessionState::Disconnecting {
         return Ok(());
      }

      info!("Disconnecting from {addr}");
      session.state = SessionState::Disconnecting;
      if let Some(transport) = &session.transport
         && let Err(e) = transport.disconnect()
      {
         warn!("Failed to issue disconnect to {addr}: {e}");
      }
      self.emit_state(addr, SessionState::Disconnecting, GattStatus::Success);
      Ok(())
   }

   fn disconnect_all(&mut self) -> usize {
      // Bindings go first so nothing is delivered for these sessions from
      // here on, except through a buffered teardown.
      let sessions = mem::take(&mut self.sessions);
      let count = sessions.len();

      for (addr, session) in sessions {
         info!("Disconnecting from {addr} (disconnect all)");
         let Some(transport) = session.transport else {
            continue;
         };
         if let Err(e) = transport.disconnect() {
            warn!("Failed to issue disconnect to {addr}: {e}");
         }
         if self.policy == TeardownPolicy::Buffer {
            self.tearing_down.insert(session.generation, Teardown {
               address: addr,
               _transport: transport,
               buffered: VecDeque::new(),
            });
         }
      }
      count
   }

   fn handle_gatt(&mut self, msg: GattMessage) {
      let GattMessage {
         address,
         generation,
         callback,
      } = msg;
      debug!("GATT callback from {address}: {}", describe(&callback));

      if self
         .sessions
         .get(&address)
         .is_some_and(|s| s.generation == generation)
      {
         self.apply_callback(&address, callback);
      } else if self.tearing_down.contains_key(&generation) {
         self.buffer_callback(generation, callback);
      } else {
         debug!("Dropping callback for unbound session {address}#{generation}");
      }
   }

   fn apply_callback(&mut self, addr: &DeviceAddress, callback: GattCallback) {
      let (status, new_state) = match callback {
         GattCallback::ConnectionStateChanged { status, new_state } => (status, new_state),
         other => {
            if matches!(other, GattCallback::ServicesDiscovered { .. })
               && let Some(session) = self.sessions.get_mut(addr)
            {
               if session.phase != Some(ServicePhase::Discovering) {
                  debug!("Unsolicited service discovery result on {addr}");
               }
               session.phase = Some(ServicePhase::Ready);
            }
            if let Some(kind) = translate(other) {
               self.emit(addr, kind);
            }
            return;
         },
      };

      let status = GattStatus::from_code(status);
      let Some(profile) = ProfileState::from_repr(new_state) else {
         debug!("Dropping unrecognized link state {new_state} for {addr}");
         return;
      };

      match profile {
         ProfileState::Connected if status.is_success() => self.on_link_up(addr),
         ProfileState::Connected | ProfileState::Disconnected => {
            if let Some(session) = self.sessions.remove(addr) {
               if status.is_success() {
                  info!("Disconnected from {addr}");
               } else {
                  warn!(
                     "Connection to {addr} failed while {}: {status}",
                     session.state
                  );
               }
            }
            self.emit_state(addr, SessionState::Disconnected, status);
         },
         ProfileState::Connecting | ProfileState::Disconnecting => {
            let state = if profile == ProfileState::Connecting {
               SessionState::Connecting
            } else {
               SessionState::Disconnecting
            };
            if let Some(session) = self.sessions.get_mut(addr)
               && session.state != state
            {
               session.state = state;
               self.emit_state(addr, state, status);
            }
         },
      }
   }

   fn on_link_up(&mut self, addr: &DeviceAddress) {
      let Some(session) = self.sessions.get_mut(addr) else {
         return;
      };
      if session.state != SessionState::Connecting {
         debug!("Ignoring link-up for {addr} while {}", session.state);
         return;
      }

      info!("Connected to {addr}, discovering services");
      session.state = SessionState::Connected;
      session.phase = Some(ServicePhase::Discovering);
      let discovery = session
         .transport
         .as_ref()
         .map(|transport| transport.discover_services());

      self.emit_state(addr, SessionState::Connected, GattStatus::Success);
      self.emit(addr, SessionEventKind::ServicesDiscovering);

      if let Some(Err(e)) = discovery {
         warn!("Failed to request service discovery on {addr}: {e}");
      }
   }

   fn buffer_callback(&mut self, generation: u64, callback: GattCallback) {
      let confirmed = matches!(
         callback,
         GattCallback::ConnectionStateChanged { new_state, .. }
            if new_state == ProfileState::Disconnected as i32
      );

      let Some(teardown) = self.tearing_down.get_mut(&generation) else {
         return;
      };
      if let Some(kind) = translate(callback) {
         if teardown.buffered.len() == TEARDOWN_BUFFER_LIMIT {
            teardown.buffered.pop_front();
         }
         teardown.buffered.push_back(kind);
      }

      if confirmed && let Some(teardown) = self.tearing_down.remove(&generation) {
         debug!(
            "Teardown of {} confirmed, flushing {} events",
            teardown.address,
            teardown.buffered.len()
         );
         for kind in teardown.buffered {
            self.emit(&teardown.address, kind);
         }
      }
   }

   fn cleanup(&mut self) {
      info!("Cleaning up session manager");
      for (addr, session) in self.sessions.drain() {
         if let Some(transport) = session.transport
            && let Err(e) = transport.disconnect()
         {
            warn!("Failed to disconnect {addr} during cleanup: {e}");
         }
      }
      self.tearing_down.clear();
   }
}

/// Maps a raw callback to the event published for it.
fn translate(callback: GattCallback) -> Option<SessionEventKind> {
   Some(match callback {
      GattCallback::ConnectionStateChanged { status, new_state } => {
         let state = match ProfileState::from_repr(new_state)? {
            ProfileState::Disconnected => SessionState::Disconnected,
            ProfileState::Connecting => SessionState::Connecting,
            ProfileState::Connected => SessionState::Connected,
            ProfileState::Disconnecting => SessionState::Disconnecting,
         };
         SessionEventKind::StateChanged {
            state,
            status: GattStatus::from_code(status),
         }
      },
      GattCallback::ServicesDiscovered { status } => SessionEventKind::ServicesReady {
         status: GattStatus::from_code(status),
      },
      GattCallback::CharacteristicRead {
         characteristic,
         value,
         status,
      } => SessionEventKind::CharacteristicRead {
         characteristic,
         value,
         status: GattStatus::from_code(status),
      },
      GattCallback::CharacteristicWrite {
         characteristic,
         status,
      } => SessionEventKind::CharacteristicWrite {
         characteristic,
         status: GattStatus::from_code(status),
      },
      GattCallback::CharacteristicChanged {
         characteristic,
         value,
      } => SessionEventKind::CharacteristicChanged {
         characteristic,
         value,
      },
      GattCallback::DescriptorWrite { descriptor, status } => SessionEventKind::DescriptorWrite {
         descriptor,
         status: GattStatus::from_code(status),
      },
      GattCallback::RemoteRssi { rssi, status } => SessionEventKind::RssiRead {
         rssi,
         status: GattStatus::from_code(status),
      },
   })
}

fn describe(callback: &GattCallback) -> String {
   match callback {
      GattCallback::ConnectionStateChanged { status, new_state } => format!(
         "connection state {} status={}",
         ProfileState::from_repr(*new_state)
            .map_or_else(|| format!("unknown({new_state})"), |s| s.to_string()),
         GattStatus::from_code(*status)
      ),
      GattCallback::ServicesDiscovered { status } => {
         format!("services discovered status={}", GattStatus::from_code(*status))
      },
      GattCallback::CharacteristicRead {
         characteristic,
         value,
         status,
      } => format!(
         "characteristic read {characteristic} ({} bytes) status={}",
         value.len(),
         GattStatus::from_code(*status)
      ),
      GattCallback::CharacteristicWrite {
         characteristic,
         status,
      } => format!(
         "characteristic write {characteristic} status={}",
         GattStatus::from_code(*status)
      ),
      GattCallback::CharacteristicChanged {
         characteristic,
         value,
      } => format!("characteristic changed {characteristic} ({} bytes)", value.len()),
      GattCallback::DescriptorWrite { descriptor, status } => format!(
         "descriptor write {descriptor} status={}",
         GattStatus::from_code(*status)
      ),
      GattCallback::RemoteRssi { rssi, status } => {
         format!("rssi {rssi} status={}", GattStatus::from_code(*status))
      },
   }
}

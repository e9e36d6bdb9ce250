use std::collections::VecDeque;
use std::sync::Arc;
use futures::channel::mpsc::{channel, unbounded, Receiver, Sender, UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::{SinkExt, StreamExt};
use indexmap::{IndexMap, IndexSet};
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::constants::{COMMAND_CHANNEL_SIZE, CONNECT_DEADLINE, WRITE_DEADLINE};
use crate::device::transport::{Transport, TransportEventReceiver};
use crate::device::types::{Command, ConnectionState, Device, Event, TransportEvent};
use crate::error::CommandError;
use crate::session::relay::EventRelay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            connect_timeout: Duration::from_millis(CONNECT_DEADLINE),
            write_timeout: Duration::from_millis(WRITE_DEADLINE),
        }
    }
}

impl From<&Config> for SessionConfig {
    fn from(config: &Config) -> Self {
        SessionConfig {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            write_timeout: Duration::from_millis(config.write_timeout_ms),
        }
    }
}

type Reply = oneshot::Sender<Result<(), CommandError>>;

enum Request {
    Dispatch { command: Command, reply: Reply },
    Devices { reply: oneshot::Sender<Vec<Device>> },
    Device { name: String, reply: oneshot::Sender<Option<Device>> },
    Scanning { reply: oneshot::Sender<bool> },
}

#[derive(Debug)]
enum Deadline {
    Connect { name: String, attempt: u64 },
    Disconnect { name: String, attempt: u64 },
    Write { name: String, attempt: u64 },
}

struct Pending {
    attempt: u64,
    reply: Reply,
}

struct QueuedWrite {
    uuid: Uuid,
    value: Vec<u8>,
    reply: Reply,
}

struct DeviceEntry {
    device: Device,
    pending_connect: Option<Pending>,
    // attempt id of an unconfirmed disconnect
    disconnect_requested: Option<u64>,
    in_flight_write: Option<Pending>,
    queued_writes: VecDeque<QueuedWrite>,
}

impl DeviceEntry {
    fn new(name: &str, rssi: i16) -> Self {
        DeviceEntry {
            device: Device { name: name.to_string(), rssi, state: ConnectionState::Disconnected },
            pending_connect: None,
            disconnect_requested: None,
            in_flight_write: None,
            queued_writes: VecDeque::new(),
        }
    }

    fn is_ready(&self) -> bool {
        self.device.state == ConnectionState::ServicesReady && self.disconnect_requested.is_none()
    }

    fn fail_writes(&mut self) {
        let name = &self.device.name;
        if let Some(write) = self.in_flight_write.take() {
            respond(write.reply, Err(CommandError::NotConnected { name: name.clone() }));
        }
        for write in self.queued_writes.drain(..) {
            respond(write.reply, Err(CommandError::NotConnected { name: name.clone() }));
        }
    }
}

/// Takes the pending operation out of `slot` only if it belongs to `attempt`.
fn take_attempt(slot: &mut Option<Pending>, attempt: u64) -> Option<Pending> {
    if slot.as_ref().map(|pending| pending.attempt) == Some(attempt) {
        slot.take()
    } else {
        None
    }
}

fn respond(reply: Reply, result: Result<(), CommandError>) {
    if reply.send(result).is_err() {
        debug!("Caller stopped waiting for a command result");
    }
}

fn schedule(deadlines: &UnboundedSender<Deadline>, deadline: Deadline, after: Duration) {
    let deadlines = deadlines.clone();
    spawn(async move {
        sleep(after).await;
        // the session may already be gone
        let _ = deadlines.unbounded_send(deadline);
    });
}

/// Owns all device state. Commands, transport callbacks and deadline
/// expiries are handled one at a time by a single task.
struct Session {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    relay: EventRelay,
    central: ConnectionState,
    devices: IndexMap<String, DeviceEntry>,
    // scan results since the last successful connect
    discovered: IndexSet<String>,
    next_attempt: u64,
    deadlines: UnboundedSender<Deadline>,
}

impl Session {
    fn attempt(&mut self) -> u64 {
        self.next_attempt += 1;
        self.next_attempt
    }

    fn set_central(&mut self, next: ConnectionState) {
        if !self.central.can_transition_to(next) {
            error!("Refusing illegal scanner transition {} -> {}", self.central, next);
            return;
        }

        info!("Scanner {} -> {}", self.central, next);
        self.central = next;
        self.relay.emit(match next {
            ConnectionState::Scanning => Event::ScanStarted,
            _ => Event::ScanStopped,
        });
    }

    fn transition(&mut self, name: &str, next: ConnectionState) -> bool {
        let Some(entry) = self.devices.get_mut(name) else {
            warn!("Transition for unknown device {}", name);
            return false;
        };

        let current = entry.device.state;
        if !current.can_transition_to(next) {
            error!("Refusing illegal transition of {}: {} -> {}", name, current, next);
            return false;
        }

        info!("Device {}: {} -> {}", name, current, next);
        entry.device.state = next;
        self.relay.emit(Event::StateChanged { name: name.to_string(), state: next });
        true
    }

    /// Resets a device to `Disconnected` and tells the application.
    fn mark_disconnected(&mut self, name: &str) {
        if self.transition(name, ConnectionState::Disconnected) {
            self.relay.emit(Event::DisconnectedOrFailed { name: name.to_string() });
        }
        if let Some(entry) = self.devices.get_mut(name) {
            entry.disconnect_requested = None;
            entry.fail_writes();
        }
    }

    /// `Connecting -> Failed -> Disconnected`, emitting the failure in between.
    fn mark_failed(&mut self, name: &str) {
        if self.transition(name, ConnectionState::Failed) {
            self.relay.emit(Event::DisconnectedOrFailed { name: name.to_string() });
            self.transition(name, ConnectionState::Disconnected);
        }
        if let Some(entry) = self.devices.get_mut(name) {
            entry.disconnect_requested = None;
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Dispatch { command, reply } => self.handle_command(command, reply),
            Request::Devices { reply } => {
                let devices = self.discovered.iter()
                    .filter_map(|name| self.devices.get(name))
                    .map(|entry| entry.device.clone())
                    .collect();
                let _ = reply.send(devices);
            },
            Request::Device { name, reply } => {
                let _ = reply.send(self.devices.get(&name).map(|entry| entry.device.clone()));
            },
            Request::Scanning { reply } => {
                let _ = reply.send(self.central == ConnectionState::Scanning);
            },
        }
    }

    fn handle_command(&mut self, command: Command, reply: Reply) {
        debug!("Handling {:?}", command);
        match command {
            Command::StartScan => respond(reply, self.start_scan()),
            Command::StopScan => respond(reply, self.stop_scan()),
            Command::Connect(name) => self.connect(name, reply),
            Command::Disconnect(name) => respond(reply, self.disconnect(&name)),
            Command::WriteCharacteristic { device, uuid, value } => self.write(device, uuid, value, reply),
            Command::ReadCharacteristic { device, uuid } => respond(reply, self.read(device, uuid)),
        }
    }

    fn start_scan(&mut self) -> Result<(), CommandError> {
        if self.central == ConnectionState::Scanning {
            return Err(CommandError::AlreadyScanning);
        }

        self.transport.start_scan()?;
        self.set_central(ConnectionState::Scanning);
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<(), CommandError> {
        if self.central != ConnectionState::Scanning {
            return Err(CommandError::NotScanning);
        }

        self.transport.stop_scan()?;
        self.set_central(ConnectionState::Disconnected);
        Ok(())
    }

    fn connect(&mut self, name: String, reply: Reply) {
        let Some(entry) = self.devices.get(&name) else {
            return respond(reply, Err(CommandError::UnknownDevice { name }));
        };

        match entry.device.state {
            ConnectionState::Connected | ConnectionState::ServicesReady => {
                return respond(reply, Err(CommandError::AlreadyConnected { name }));
            },
            ConnectionState::Connecting => {
                return respond(reply, Err(CommandError::ConnectInProgress { name }));
            },
            _ => {},
        }

        let attempt = self.attempt();
        self.transition(&name, ConnectionState::Connecting);

        if let Err(err) = self.transport.connect(&name) {
            warn!("Connecting to {} failed: {:?}", name, err);
            self.mark_failed(&name);
            return respond(reply, Err(err.into()));
        }

        if let Some(entry) = self.devices.get_mut(&name) {
            entry.disconnect_requested = None;
            entry.pending_connect = Some(Pending { attempt, reply });
        }
        schedule(&self.deadlines, Deadline::Connect { name, attempt }, self.config.connect_timeout);
    }

    fn disconnect(&mut self, name: &str) -> Result<(), CommandError> {
        let attempt = self.attempt();
        let Some(entry) = self.devices.get_mut(name) else {
            return Err(CommandError::UnknownDevice { name: name.to_string() });
        };

        if entry.device.state == ConnectionState::Disconnected {
            return Err(CommandError::NotConnected { name: name.to_string() });
        }

        if let Some(pending) = entry.pending_connect.take() {
            info!("Cancelling pending connect to {}", name);
            respond(pending.reply, Err(CommandError::Cancelled));
        }
        entry.disconnect_requested = Some(attempt);

        if let Err(err) = self.transport.disconnect(name) {
            warn!("Disconnecting from {} failed: {:?}", name, err);
            self.mark_disconnected(name);
            return Err(err.into());
        }

        schedule(
            &self.deadlines,
            Deadline::Disconnect { name: name.to_string(), attempt },
            self.config.connect_timeout,
        );
        Ok(())
    }

    fn resolve_ready(&self, device: Option<String>) -> Result<String, CommandError> {
        match device {
            Some(name) => match self.devices.get(&name) {
                None => Err(CommandError::UnknownDevice { name }),
                Some(entry) if entry.is_ready() => Ok(name),
                Some(_) => Err(CommandError::NotReady),
            },
            None => self.devices.values()
                .find(|entry| entry.is_ready())
                .map(|entry| entry.device.name.clone())
                .ok_or(CommandError::NotReady),
        }
    }

    fn write(&mut self, device: Option<String>, uuid: Uuid, value: Vec<u8>, reply: Reply) {
        let name = match self.resolve_ready(device) {
            Ok(name) => name,
            Err(err) => return respond(reply, Err(err)),
        };

        if let Some(entry) = self.devices.get_mut(&name) {
            entry.queued_writes.push_back(QueuedWrite { uuid, value, reply });
            if entry.in_flight_write.is_some() {
                debug!("Write to {} queued behind an in-flight write", name);
                return;
            }
        }
        self.start_next_write(&name);
    }

    fn start_next_write(&mut self, name: &str) {
        loop {
            let Some(entry) = self.devices.get_mut(name) else { return };
            if entry.in_flight_write.is_some() {
                return;
            }
            let Some(write) = entry.queued_writes.pop_front() else { return };

            self.next_attempt += 1;
            let attempt = self.next_attempt;
            match self.transport.write_characteristic(name, attempt, write.uuid, &write.value) {
                Ok(()) => {
                    entry.in_flight_write = Some(Pending { attempt, reply: write.reply });
                    schedule(
                        &self.deadlines,
                        Deadline::Write { name: name.to_string(), attempt },
                        self.config.write_timeout,
                    );
                    return;
                },
                Err(err) => {
                    warn!("Writing {} to {} failed: {:?}", write.uuid, name, err);
                    respond(write.reply, Err(err.into()));
                },
            }
        }
    }

    fn read(&mut self, device: Option<String>, uuid: Uuid) -> Result<(), CommandError> {
        let name = self.resolve_ready(device)?;
        self.transport.read_characteristic(&name, uuid)?;
        Ok(())
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        debug!("Transport event {:?}", event);
        match event {
            TransportEvent::DeviceDiscovered { name, rssi } => self.on_discovered(name, rssi),
            TransportEvent::Connected { name } => self.on_connected(&name),
            TransportEvent::ServicesDiscovered { name } => self.on_services_discovered(&name),
            TransportEvent::DisconnectedOrFailed { name } => self.on_disconnected(&name),
            TransportEvent::ScanFailed { reason } => {
                if self.central == ConnectionState::Scanning {
                    warn!("Scanning failed: {}", reason);
                    self.set_central(ConnectionState::Disconnected);
                }
            },
            TransportEvent::WriteCompleted { name, id, uuid, result } => self.on_write_completed(&name, id, uuid, result),
            TransportEvent::CharacteristicValue { name, uuid, value } => {
                if self.is_connected(&name) {
                    self.relay.emit(Event::CharacteristicValue { name, uuid, value });
                } else {
                    debug!("Ignoring value of {} from {} which is not connected", uuid, name);
                }
            },
            TransportEvent::ReadFailed { name, uuid, reason } => {
                if self.is_connected(&name) {
                    warn!("Reading {} from {} failed: {}", uuid, name, reason);
                    self.relay.emit(Event::ReadFailed { name, uuid, reason });
                } else {
                    debug!("Ignoring failed read of {} from {} which is not connected", uuid, name);
                }
            },
        }
    }

    fn is_connected(&self, name: &str) -> bool {
        self.devices.get(name).map_or(false, |entry| entry.device.state.is_connected())
    }

    fn on_discovered(&mut self, name: String, rssi: i16) {
        if self.central != ConnectionState::Scanning {
            debug!("Ignoring discovery of {} while not scanning", name);
            return;
        }

        self.devices.entry(name.clone())
            .and_modify(|entry| entry.device.rssi = rssi)
            .or_insert_with(|| DeviceEntry::new(&name, rssi));
        self.discovered.insert(name.clone());
        self.relay.emit(Event::DeviceDiscovered { name, rssi });
    }

    fn on_connected(&mut self, name: &str) {
        let pending = match self.devices.get_mut(name) {
            Some(entry) if entry.device.state == ConnectionState::Connecting => entry.pending_connect.take(),
            _ => None,
        };
        let Some(pending) = pending else {
            debug!("Ignoring connect of {} without a pending attempt", name);
            return;
        };

        self.transition(name, ConnectionState::Connected);
        self.relay.emit(Event::Connected { name: name.to_string() });
        respond(pending.reply, Ok(()));

        // scan results are meaningless once connected
        self.discovered.clear();
        if self.central == ConnectionState::Scanning {
            if let Err(err) = self.transport.stop_scan() {
                warn!("Failed to stop scanning: {:?}", err);
            }
            self.set_central(ConnectionState::Disconnected);
        }

        if let Err(err) = self.transport.discover_services(name) {
            warn!("Discovering services of {} failed: {:?}", name, err);
            if let Err(err) = self.transport.disconnect(name) {
                warn!("Disconnecting from {} failed: {:?}", name, err);
            }
            self.mark_disconnected(name);
        }
    }

    fn on_services_discovered(&mut self, name: &str) {
        match self.devices.get(name) {
            Some(entry) if entry.device.state == ConnectionState::Connected && entry.disconnect_requested.is_none() => {},
            _ => {
                debug!("Ignoring services of {} which is not freshly connected", name);
                return;
            },
        }

        if self.transition(name, ConnectionState::ServicesReady) {
            self.relay.emit(Event::ServicesReady { name: name.to_string() });
        }
    }

    fn on_disconnected(&mut self, name: &str) {
        let Some(entry) = self.devices.get_mut(name) else {
            warn!("Disconnect of unknown device {}", name);
            return;
        };

        match entry.device.state {
            ConnectionState::Disconnected => debug!("{} is already disconnected", name),
            ConnectionState::Connecting => match entry.pending_connect.take() {
                Some(pending) => {
                    self.mark_failed(name);
                    respond(pending.reply, Err(CommandError::TransportFailure {
                        reason: format!("connecting to {} failed", name),
                    }));
                },
                // the attempt was cancelled by a disconnect
                None => self.mark_disconnected(name),
            },
            _ => self.mark_disconnected(name),
        }
    }

    fn on_write_completed(&mut self, name: &str, id: u64, uuid: Uuid, result: Result<(), String>) {
        let write = self.devices.get_mut(name).and_then(|entry| take_attempt(&mut entry.in_flight_write, id));
        let Some(write) = write else {
            // completion of a write that already timed out
            debug!("Ignoring late write completion {} of {} on {}", id, uuid, name);
            return;
        };

        respond(write.reply, result.map_err(|reason| CommandError::TransportFailure { reason }));
        self.start_next_write(name);
    }

    fn handle_deadline(&mut self, deadline: Deadline) {
        match deadline {
            Deadline::Connect { name, attempt } => {
                let pending = self.devices.get_mut(&name)
                    .and_then(|entry| take_attempt(&mut entry.pending_connect, attempt));
                let Some(pending) = pending else { return };

                warn!("Connecting to {} took too long", name);
                if let Err(err) = self.transport.disconnect(&name) {
                    debug!("Could not cancel connect to {}: {:?}", name, err);
                }
                self.mark_disconnected(&name);
                respond(pending.reply, Err(CommandError::Timeout));
            },
            Deadline::Disconnect { name, attempt } => {
                let unconfirmed = self.devices.get(&name)
                    .map(|entry| entry.disconnect_requested == Some(attempt))
                    .unwrap_or(false);

                if unconfirmed {
                    warn!("Disconnect of {} was never confirmed, resetting", name);
                    self.mark_disconnected(&name);
                }
            },
            Deadline::Write { name, attempt } => {
                let write = self.devices.get_mut(&name)
                    .and_then(|entry| take_attempt(&mut entry.in_flight_write, attempt));
                let Some(write) = write else { return };

                warn!("Writing to {} took too long", name);
                respond(write.reply, Err(CommandError::Timeout));
                self.start_next_write(&name);
            },
        }
    }

    async fn run(
        mut self,
        cancel: CancellationToken,
        mut requests: Receiver<Request>,
        mut callbacks: TransportEventReceiver,
        mut deadlines: UnboundedReceiver<Deadline>,
    ) {
        'mainloop: loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                Some(event) = callbacks.next() => self.handle_transport_event(event),
                Some(deadline) = deadlines.next() => self.handle_deadline(deadline),
                request = requests.next() => match request {
                    Some(request) => self.handle_request(request),
                    None => break 'mainloop,
                },
            }
        }

        // dropping the session fails every pending reply with ManagerStopped
        info!("Session manager stopped");
    }
}

/// Cloneable handle used to talk to a running session manager.
#[derive(Clone)]
pub struct SessionHandle {
    sender: Sender<Request>,
}

impl SessionHandle {
    async fn request(&self, request: Request) -> Result<(), CommandError> {
        let mut sender = self.sender.clone();
        sender.send(request).await.map_err(|_| CommandError::ManagerStopped)
    }

    /// Resolves once the effect of `command` is known: immediately for
    /// rejections, scans, reads and disconnects; on confirmation or timeout
    /// for connects and writes.
    pub async fn dispatch(&self, command: Command) -> Result<(), CommandError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Dispatch { command, reply }).await?;
        response.await.unwrap_or(Err(CommandError::ManagerStopped))
    }

    /// Devices discovered since the last successful connect, in discovery order.
    pub async fn devices(&self) -> Result<Vec<Device>, CommandError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Devices { reply }).await?;
        response.await.map_err(|_| CommandError::ManagerStopped)
    }

    pub async fn device(&self, name: &str) -> Result<Option<Device>, CommandError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Device { name: name.to_string(), reply }).await?;
        response.await.map_err(|_| CommandError::ManagerStopped)
    }

    pub async fn is_scanning(&self) -> Result<bool, CommandError> {
        let (reply, response) = oneshot::channel();
        self.request(Request::Scanning { reply }).await?;
        response.await.map_err(|_| CommandError::ManagerStopped)
    }
}

pub fn session_manager_task(
    cancel: CancellationToken,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    callbacks: TransportEventReceiver,
    relay: EventRelay,
) -> (SessionHandle, JoinHandle<()>) {
    let (sender, requests) = channel::<Request>(COMMAND_CHANNEL_SIZE);
    let (deadline_sender, deadlines) = unbounded::<Deadline>();

    let session = Session {
        config,
        transport,
        relay,
        central: ConnectionState::Disconnected,
        devices: IndexMap::new(),
        discovered: IndexSet::new(),
        next_attempt: 0,
        deadlines: deadline_sender,
    };

    let handle = spawn(session.run(cancel, requests, callbacks, deadlines));
    (SessionHandle { sender }, handle)
}

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use log::debug;
use uuid::Uuid;

use crate::device::types::TransportEvent;
use crate::error::DeviceError;

/// Operations a BLE driver exposes to the session manager.
///
/// Every call only initiates the operation and must return promptly. The
/// outcome is reported later through [`TransportCallbacks`], possibly from
/// another thread. An `Err` return means the operation could not be started.
pub trait Transport: Send + Sync {
    fn start_scan(&self) -> Result<(), DeviceError>;
    fn stop_scan(&self) -> Result<(), DeviceError>;
    fn connect(&self, name: &str) -> Result<(), DeviceError>;
    fn disconnect(&self, name: &str) -> Result<(), DeviceError>;
    fn discover_services(&self, name: &str) -> Result<(), DeviceError>;
    /// `id` must be echoed back in [`TransportCallbacks::did_write`].
    fn write_characteristic(&self, name: &str, id: u64, uuid: Uuid, value: &[u8]) -> Result<(), DeviceError>;
    fn read_characteristic(&self, name: &str, uuid: Uuid) -> Result<(), DeviceError>;
}

/// The delegate surface of a transport. Cheap to clone and safe to use from
/// any thread; every callback is queued for the session manager.
#[derive(Debug, Clone)]
pub struct TransportCallbacks {
    sender: UnboundedSender<TransportEvent>,
}

pub type TransportEventReceiver = UnboundedReceiver<TransportEvent>;

pub fn callback_channel() -> (TransportCallbacks, TransportEventReceiver) {
    let (sender, receiver) = unbounded();
    (TransportCallbacks { sender }, receiver)
}

impl TransportCallbacks {
    pub fn send(&self, event: TransportEvent) {
        if let Err(err) = self.sender.unbounded_send(event) {
            debug!("Session manager is gone, dropping transport event {:?}", err.into_inner());
        }
    }

    pub fn did_discover_device(&self, name: &str, rssi: i16) {
        self.send(TransportEvent::DeviceDiscovered { name: name.to_string(), rssi });
    }

    pub fn did_connect(&self, name: &str) {
        self.send(TransportEvent::Connected { name: name.to_string() });
    }

    pub fn did_discover_services(&self, name: &str) {
        self.send(TransportEvent::ServicesDiscovered { name: name.to_string() });
    }

    pub fn did_disconnect_or_fail(&self, name: &str) {
        self.send(TransportEvent::DisconnectedOrFailed { name: name.to_string() });
    }

    pub fn did_fail_scan(&self, reason: String) {
        self.send(TransportEvent::ScanFailed { reason });
    }

    pub fn did_write(&self, name: &str, id: u64, uuid: Uuid, result: Result<(), String>) {
        self.send(TransportEvent::WriteCompleted { name: name.to_string(), id, uuid, result });
    }

    pub fn did_read(&self, name: &str, uuid: Uuid, value: Vec<u8>) {
        self.send(TransportEvent::CharacteristicValue { name: name.to_string(), uuid, value });
    }

    pub fn did_fail_read(&self, name: &str, uuid: Uuid, reason: String) {
        self.send(TransportEvent::ReadFailed { name: name.to_string(), uuid, reason });
    }
}

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    ServicesReady,
    Failed,
}

impl ConnectionState {
    /// Whether a device (or the central, for `Scanning`) may move from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Scanning)
                | (Scanning, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, ServicesReady)
                | (Connected, Disconnected)
                | (ServicesReady, Disconnected)
                | (Failed, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::ServicesReady)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let result = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Scanning => "Scanning",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::ServicesReady => "ServicesReady",
            ConnectionState::Failed => "Failed",
        };

        write!(f, "{}", result)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub name: String,
    pub rssi: i16,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    StartScan,
    StopScan,
    Connect(String),
    Disconnect(String),
    WriteCharacteristic {
        device: Option<String>,
        uuid: Uuid,
        value: Vec<u8>,
    },
    ReadCharacteristic {
        device: Option<String>,
        uuid: Uuid,
    },
}

/// Notifications sent to the application. Serialized with a `type` discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    DeviceDiscovered { name: String, rssi: i16 },
    Connected { name: String },
    ServicesReady { name: String },
    DisconnectedOrFailed { name: String },
    CharacteristicValue { name: String, uuid: Uuid, value: Vec<u8> },
    ReadFailed { name: String, uuid: Uuid, reason: String },
    StateChanged { name: String, state: ConnectionState },
    ScanStarted,
    ScanStopped,
    Overflow { dropped: usize },
}

/// Raw callbacks reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    DeviceDiscovered { name: String, rssi: i16 },
    Connected { name: String },
    ServicesDiscovered { name: String },
    DisconnectedOrFailed { name: String },
    ScanFailed { reason: String },
    /// `id` is the one passed to [`Transport::write_characteristic`](crate::device::transport::Transport::write_characteristic).
    WriteCompleted { name: String, id: u64, uuid: Uuid, result: Result<(), String> },
    CharacteristicValue { name: String, uuid: Uuid, value: Vec<u8> },
    ReadFailed { name: String, uuid: Uuid, reason: String },
}

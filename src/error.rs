use std::io;
use std::str::Utf8Error;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },

    #[error("Invalid characteristic uuid in config: {value}")]
    InvalidUuid { value: String },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start bridge (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start bridge (device): {source}")]
    DeviceError { #[from] source: DeviceError },

    #[error("Failed to read/write the message channel: {source}")]
    IOError { #[from] source: io::Error },
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Peripheral {name} has not been seen by the adapter")]
    UnknownPeripheral { name: String },

    #[error("A required bluetooth characteristic is not available: {uuid}")]
    MissingCharacteristic { uuid: uuid::Uuid },
}

/// Broad classes of command failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    StateConflict,
    Timeout,
    TransportFailure,
    Unavailable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("Already scanning")]
    AlreadyScanning,

    #[error("Not scanning")]
    NotScanning,

    #[error("Unknown device: {name}")]
    UnknownDevice { name: String },

    #[error("Device {name} is already connected")]
    AlreadyConnected { name: String },

    #[error("Device {name} is already connecting")]
    ConnectInProgress { name: String },

    #[error("Device {name} is not connected")]
    NotConnected { name: String },

    #[error("No device with discovered services is available")]
    NotReady,

    #[error("Operation was cancelled by a disconnect")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,

    #[error("Transport failure: {reason}")]
    TransportFailure { reason: String },

    #[error("The session manager has stopped")]
    ManagerStopped,
}

impl CommandError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CommandError::Timeout => ErrorKind::Timeout,
            CommandError::TransportFailure { .. } => ErrorKind::TransportFailure,
            CommandError::ManagerStopped => ErrorKind::Unavailable,
            _ => ErrorKind::StateConflict,
        }
    }
}

impl From<DeviceError> for CommandError {
    fn from(source: DeviceError) -> Self {
        CommandError::TransportFailure { reason: source.to_string() }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("Malformed command: {reason}")]
    MalformedCommand { reason: String },

    #[error("Method not implemented: {method}")]
    NotImplemented { method: String },

    #[error("Command rejected: {source}")]
    Rejected { #[from] source: CommandError },
}

impl RouterError {
    pub fn malformed<T: Into<String>>(reason: T) -> Self {
        RouterError::MalformedCommand { reason: reason.into() }
    }
}

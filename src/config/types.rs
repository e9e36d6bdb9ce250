use serde::{Deserialize, Serialize};

use crate::device::constants::{
    BATTERY_LEVEL_CHARACTERISTIC, COMMAND_CHARACTERISTIC, CONNECT_DEADLINE, EVENT_BUFFER_CAPACITY,
    LIGHT_CHARACTERISTIC, WRITE_DEADLINE,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub event_buffer_capacity: usize,
    pub command_characteristic: String,
    pub light_characteristic: String,
    pub battery_level_characteristic: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connect_timeout_ms: CONNECT_DEADLINE,
            write_timeout_ms: WRITE_DEADLINE,
            event_buffer_capacity: EVENT_BUFFER_CAPACITY,
            command_characteristic: COMMAND_CHARACTERISTIC.to_string(),
            light_characteristic: LIGHT_CHARACTERISTIC.to_string(),
            battery_level_characteristic: BATTERY_LEVEL_CHARACTERISTIC.to_string(),
        }
    }
}

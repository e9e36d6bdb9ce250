use btleplug::api::bleuuid::{uuid_from_u16, uuid_from_u32};
use uuid::Uuid;

/**
 * How long (milliseconds) a connect attempt may take before it is rolled back.
 */
pub const CONNECT_DEADLINE: u64 = 10_000;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 10_000;

/**
 * How many events the relay keeps while no listener is attached.
 */
pub const EVENT_BUFFER_CAPACITY: usize = 256;

/**
 * Capacity of the channel carrying commands into the session manager.
 */
pub const COMMAND_CHANNEL_SIZE: usize = 64;

/**
 * The characteristic the bridge writes `sendCommand` frames to.
 */
pub const COMMAND_CHARACTERISTIC: &str = "1001";

/**
 * The characteristic driving the light toggle; 1 is on, 0 is off.
 */
pub const LIGHT_CHARACTERISTIC: &str = "1001";

/**
 * The standard GATT Battery Level characteristic.
 */
pub const BATTERY_LEVEL_CHARACTERISTIC: &str = "2A19";

pub const LIGHT_ON: [u8; 1] = [0x01];
pub const LIGHT_OFF: [u8; 1] = [0x00];

/// Parses a characteristic uuid in its 16-bit (`2A19`), 32-bit or full
/// 128-bit text form. Short forms are expanded with the Bluetooth base uuid.
pub fn parse_characteristic_uuid(value: &str) -> Option<Uuid> {
    let value = value.trim();
    let hex = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")).unwrap_or(value);

    // from_str_radix would also take a sign
    let is_hex = hex.bytes().all(|byte| byte.is_ascii_hexdigit());

    match hex.len() {
        4 if is_hex => u16::from_str_radix(hex, 16).ok().map(uuid_from_u16),
        8 if is_hex => u32::from_str_radix(hex, 16).ok().map(uuid_from_u32),
        4 | 8 => None,
        _ => Uuid::parse_str(value).ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uuids_expand_with_base_uuid() {
        let battery = parse_characteristic_uuid("2A19").unwrap();
        assert_eq!(battery.to_string(), "00002a19-0000-1000-8000-00805f9b34fb");

        let light = parse_characteristic_uuid("0x1001").unwrap();
        assert_eq!(light.to_string(), "00001001-0000-1000-8000-00805f9b34fb");
    }

    #[test]
    fn full_uuids_parse_unchanged() {
        let uuid = parse_characteristic_uuid("06d1e5e7-79ad-4a71-8faa-373789f7d93c").unwrap();
        assert_eq!(uuid.to_string(), "06d1e5e7-79ad-4a71-8faa-373789f7d93c");
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_characteristic_uuid("zz").is_none());
        assert!(parse_characteristic_uuid("2A1G").is_none());
        assert!(parse_characteristic_uuid("").is_none());
    }

    #[test]
    fn signed_short_forms_are_rejected() {
        assert!(parse_characteristic_uuid("+2A1").is_none());
        assert!(parse_characteristic_uuid("0x+2A1").is_none());
        assert!(parse_characteristic_uuid("+0002A19").is_none());
        assert!(parse_characteristic_uuid("-2A1").is_none());
    }
}

use log::debug;
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::constants::{parse_characteristic_uuid, LIGHT_OFF, LIGHT_ON};
use crate::device::types::Command;
use crate::error::{ConfigError, RouterError};
use crate::session::manager::SessionHandle;

/// A method call as it arrives over the message channel.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCommand {
    #[serde(default)]
    pub id: Option<u64>,
    pub method: String,
    #[serde(default)]
    pub arguments: Value,
}

impl RawCommand {
    pub fn new<T: Into<String>>(method: T, arguments: Value) -> Self {
        RawCommand { id: None, method: method.into(), arguments }
    }
}

/// Characteristics targeted by the convenience methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterTargets {
    pub command: Uuid,
    pub light: Uuid,
    pub battery_level: Uuid,
}

impl TryFrom<&Config> for RouterTargets {
    type Error = ConfigError;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        let parse = |value: &String| parse_characteristic_uuid(value)
            .ok_or_else(|| ConfigError::InvalidUuid { value: value.clone() });

        Ok(RouterTargets {
            command: parse(&config.command_characteristic)?,
            light: parse(&config.light_characteristic)?,
            battery_level: parse(&config.battery_level_characteristic)?,
        })
    }
}

struct Arguments<'a> {
    method: &'a str,
    map: Option<&'a Map<String, Value>>,
}

impl<'a> Arguments<'a> {
    fn new(raw: &'a RawCommand) -> Result<Self, RouterError> {
        let map = match &raw.arguments {
            Value::Null => None,
            Value::Object(map) => Some(map),
            _ => return Err(RouterError::malformed(format!("{}: arguments must be an object", raw.method))),
        };
        Ok(Arguments { method: &raw.method, map })
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.and_then(|map| map.get(key)).filter(|value| !value.is_null())
    }

    fn missing(&self, key: &str) -> RouterError {
        RouterError::malformed(format!("{}: missing {}", self.method, key))
    }

    fn invalid(&self, key: &str, expected: &str) -> RouterError {
        RouterError::malformed(format!("{}: {} must be {}", self.method, key, expected))
    }

    fn string(&self, key: &str) -> Result<String, RouterError> {
        self.optional_string(key)?.ok_or_else(|| self.missing(key))
    }

    fn optional_string(&self, key: &str) -> Result<Option<String>, RouterError> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(value)) if !value.is_empty() => Ok(Some(value.clone())),
            Some(_) => Err(self.invalid(key, "a non-empty string")),
        }
    }

    fn integer(&self, key: &str) -> Result<i64, RouterError> {
        self.get(key)
            .ok_or_else(|| self.missing(key))?
            .as_i64()
            .ok_or_else(|| self.invalid(key, "an integer"))
    }

    fn boolean(&self, key: &str) -> Result<bool, RouterError> {
        self.get(key)
            .ok_or_else(|| self.missing(key))?
            .as_bool()
            .ok_or_else(|| self.invalid(key, "a boolean"))
    }

    fn uuid(&self, key: &str) -> Result<Uuid, RouterError> {
        let value = self.string(key)?;
        parse_characteristic_uuid(&value).ok_or_else(|| self.invalid(key, "a characteristic uuid"))
    }

    fn bytes(&self, key: &str) -> Result<Vec<u8>, RouterError> {
        let values = self.get(key)
            .ok_or_else(|| self.missing(key))?
            .as_array()
            .ok_or_else(|| self.invalid(key, "an array of bytes"))?;

        values.iter()
            .map(|value| value.as_u64().and_then(|byte| u8::try_from(byte).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| self.invalid(key, "an array of bytes"))
    }
}

/// Validates a raw method call and translates it to a typed [`Command`].
pub fn parse_command(raw: &RawCommand, targets: &RouterTargets) -> Result<Command, RouterError> {
    let args = Arguments::new(raw)?;

    let command = match raw.method.as_str() {
        "startScan" => Command::StartScan,
        "stopScan" => Command::StopScan,
        "connectDevice" => Command::Connect(args.string("name")?),
        "disconnectDevice" => Command::Disconnect(args.string("name")?),
        "writeCharacteristic" => Command::WriteCharacteristic {
            device: args.optional_string("device")?,
            uuid: args.uuid("uuid")?,
            value: args.bytes("value")?,
        },
        "readCharacteristic" => Command::ReadCharacteristic {
            device: args.optional_string("device")?,
            uuid: args.uuid("uuid")?,
        },
        "readBatteryLevel" => Command::ReadCharacteristic {
            device: args.optional_string("device")?,
            uuid: targets.battery_level,
        },
        "sendCommand" => {
            let text = args.string("command")?;
            let kind = u8::try_from(args.integer("type")?)
                .map_err(|_| args.invalid("type", "between 0 and 255"))?;

            let mut value = Vec::with_capacity(text.len() + 1);
            value.push(kind);
            value.extend_from_slice(text.as_bytes());

            Command::WriteCharacteristic { device: args.optional_string("device")?, uuid: targets.command, value }
        },
        "toggleLight" => {
            let value = if args.boolean("on")? { LIGHT_ON } else { LIGHT_OFF };
            Command::WriteCharacteristic { device: args.optional_string("device")?, uuid: targets.light, value: value.to_vec() }
        },
        _ => return Err(RouterError::NotImplemented { method: raw.method.clone() }),
    };

    Ok(command)
}

#[derive(Clone)]
pub struct CommandRouter {
    session: SessionHandle,
    targets: RouterTargets,
}

impl CommandRouter {
    pub fn new(session: SessionHandle, targets: RouterTargets) -> Self {
        CommandRouter { session, targets }
    }

    pub async fn submit(&self, raw: RawCommand) -> Result<(), RouterError> {
        let command = parse_command(&raw, &self.targets)?;
        debug!("Routing {} as {:?}", raw.method, command);
        self.session.dispatch(command).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn targets() -> RouterTargets {
        RouterTargets::try_from(&Config::default()).unwrap()
    }

    fn parse(method: &str, arguments: Value) -> Result<Command, RouterError> {
        parse_command(&RawCommand::new(method, arguments), &targets())
    }

    #[test]
    fn connect_requires_a_name() {
        assert_eq!(parse("connectDevice", json!({"name": "Pico-1"})), Ok(Command::Connect("Pico-1".to_string())));

        assert!(matches!(parse("connectDevice", json!({})), Err(RouterError::MalformedCommand { .. })));
        assert!(matches!(parse("connectDevice", Value::Null), Err(RouterError::MalformedCommand { .. })));
        assert!(matches!(parse("connectDevice", json!({"name": 7})), Err(RouterError::MalformedCommand { .. })));
        assert!(matches!(parse("disconnectDevice", json!({"name": ""})), Err(RouterError::MalformedCommand { .. })));
    }

    #[test]
    fn unknown_methods_are_not_implemented() {
        assert_eq!(
            parse("pairDevice", json!({"name": "Pico-1"})),
            Err(RouterError::NotImplemented { method: "pairDevice".to_string() }),
        );
    }

    #[test]
    fn arguments_must_be_an_object() {
        assert!(matches!(parse("startScan", json!([1, 2])), Err(RouterError::MalformedCommand { .. })));
        assert_eq!(parse("startScan", Value::Null), Ok(Command::StartScan));
    }

    #[test]
    fn characteristic_io_parses_uuid_and_bytes() {
        let command = parse("writeCharacteristic", json!({"uuid": "1001", "value": [1, 255]})).unwrap();
        assert_eq!(command, Command::WriteCharacteristic {
            device: None,
            uuid: parse_characteristic_uuid("1001").unwrap(),
            value: vec![1, 255],
        });

        assert!(matches!(
            parse("writeCharacteristic", json!({"uuid": "1001", "value": [256]})),
            Err(RouterError::MalformedCommand { .. }),
        ));
        assert!(matches!(
            parse("readCharacteristic", json!({"uuid": "not-a-uuid"})),
            Err(RouterError::MalformedCommand { .. }),
        ));

        let read = parse("readCharacteristic", json!({"uuid": "2A19", "device": "Pico-1"})).unwrap();
        assert_eq!(read, Command::ReadCharacteristic {
            device: Some("Pico-1".to_string()),
            uuid: targets().battery_level,
        });
    }

    #[test]
    fn send_command_frames_type_and_text() {
        let command = parse("sendCommand", json!({"command": "on", "type": 2})).unwrap();
        assert_eq!(command, Command::WriteCharacteristic {
            device: None,
            uuid: targets().command,
            value: vec![2, b'o', b'n'],
        });

        assert!(matches!(parse("sendCommand", json!({"command": "on"})), Err(RouterError::MalformedCommand { .. })));
        assert!(matches!(
            parse("sendCommand", json!({"command": "on", "type": 300})),
            Err(RouterError::MalformedCommand { .. }),
        ));
    }

    #[test]
    fn convenience_methods_target_configured_characteristics() {
        assert_eq!(parse("readBatteryLevel", Value::Null), Ok(Command::ReadCharacteristic {
            device: None,
            uuid: targets().battery_level,
        }));
        assert_eq!(parse("toggleLight", json!({"on": false})), Ok(Command::WriteCharacteristic {
            device: None,
            uuid: targets().light,
            value: vec![0],
        }));
    }
}

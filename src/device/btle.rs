use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use btleplug::api::{Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::transport::{Transport, TransportCallbacks};
use crate::error::DeviceError;

/**
 * Reported for peripherals whose advertisement carried no signal strength.
 */
pub const UNKNOWN_RSSI: i16 = -127;

#[derive(Default)]
struct PeripheralTable {
    by_name: HashMap<String, Peripheral>,
    names: HashMap<PeripheralId, String>,
    notifications: HashMap<String, CancellationToken>,
    // links whose loss has not been reported yet
    connected: HashSet<String>,
}

impl PeripheralTable {
    fn mark_connected(&mut self, name: &str) {
        self.connected.insert(name.to_string());
    }

    /// True for the first caller after a connect; a lost link is reported once.
    fn take_connected(&mut self, name: &str) -> bool {
        self.connected.remove(name)
    }

    fn stop_notifications(&mut self, name: &str) {
        if let Some(token) = self.notifications.remove(name) {
            token.cancel();
        }
    }
}

/// A [`Transport`] on top of the first adapter btleplug finds.
#[derive(Clone)]
pub struct BtleTransport {
    adapter: Adapter,
    callbacks: TransportCallbacks,
    table: Arc<Mutex<PeripheralTable>>,
    cancel: CancellationToken,
}

fn peripheral_name(properties: &btleplug::api::PeripheralProperties) -> String {
    properties.local_name.clone().unwrap_or_else(|| properties.address.to_string())
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic, DeviceError> {
    peripheral.characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == uuid)
        .ok_or(DeviceError::MissingCharacteristic { uuid })
}

impl BtleTransport {
    pub async fn new(callbacks: TransportCallbacks, cancel: CancellationToken) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?
            .into_iter()
            .next()
            .ok_or(DeviceError::NoAdapter)?;

        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let transport = BtleTransport {
            adapter,
            callbacks,
            table: Arc::new(Mutex::new(PeripheralTable::default())),
            cancel,
        };
        transport.central_events_task().await?;
        Ok(transport)
    }

    fn table(&self) -> MutexGuard<'_, PeripheralTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn peripheral(&self, name: &str) -> Result<Peripheral, DeviceError> {
        self.table().by_name
            .get(name)
            .cloned()
            .ok_or_else(|| DeviceError::UnknownPeripheral { name: name.to_string() })
    }

    async fn record_peripheral(&self, id: &PeripheralId) -> Result<Option<(String, i16)>, DeviceError> {
        let peripheral = self.adapter.peripheral(id).await?;
        let properties = match peripheral.properties().await? {
            Some(properties) => properties,
            None => {
                warn!("Peripheral has no properties");
                return Ok(None);
            },
        };

        let name = peripheral_name(&properties);
        let rssi = properties.rssi.unwrap_or(UNKNOWN_RSSI);

        let mut table = self.table();
        table.names.insert(id.clone(), name.clone());
        table.by_name.insert(name.clone(), peripheral);
        Ok(Some((name, rssi)))
    }

    async fn central_events_task(&self) -> Result<(), DeviceError> {
        let mut events = self.adapter.events().await?;
        let transport = self.clone();

        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = transport.cancel.cancelled() => {
                        break 'mainloop;
                    },
                    event = events.next() => match event {
                        None => break 'mainloop,
                        Some(CentralEvent::DeviceDiscovered(id)) | Some(CentralEvent::DeviceUpdated(id)) => {
                            match transport.record_peripheral(&id).await {
                                Ok(Some((name, rssi))) => transport.callbacks.did_discover_device(&name, rssi),
                                Ok(None) => {},
                                Err(err) => warn!("Could not query peripheral for properties: {:?}", err),
                            }
                        },
                        Some(CentralEvent::DeviceDisconnected(id)) => {
                            let name = {
                                let mut table = transport.table();
                                let name = table.names.get(&id).cloned();
                                match name {
                                    Some(name) if table.take_connected(&name) => {
                                        table.stop_notifications(&name);
                                        Some(name)
                                    },
                                    _ => None,
                                }
                            };

                            match name {
                                Some(name) => {
                                    info!("Peripheral {} disconnected", name);
                                    transport.callbacks.did_disconnect_or_fail(&name);
                                },
                                None => debug!("Disconnect of {:?} was already reported", id),
                            }
                        },
                        Some(other) => debug!("Ignoring central event {:?}", other),
                    }
                }
            }
            debug!("Central event task stopped");
        });

        Ok(())
    }

    async fn subscribe_notifications(&self, name: &str, peripheral: &Peripheral) -> Result<(), DeviceError> {
        for characteristic in peripheral.characteristics() {
            if characteristic.properties.contains(CharPropFlags::NOTIFY) {
                info!("Subscribing to characteristic {:?} {:?}", characteristic.service_uuid, characteristic.uuid);
                peripheral.subscribe(&characteristic).await?;
            }
        }

        let mut notification_stream = peripheral.notifications().await?;
        let cancel = self.cancel.child_token();
        {
            let mut table = self.table();
            table.stop_notifications(name);
            table.notifications.insert(name.to_string(), cancel.clone());
        }

        let callbacks = self.callbacks.clone();
        let name = name.to_string();
        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    data = notification_stream.next() => match data {
                        Some(data) => callbacks.did_read(&name, data.uuid, data.value),
                        None => break 'mainloop,
                    }
                }
            }
        });

        Ok(())
    }
}

impl Transport for BtleTransport {
    fn start_scan(&self) -> Result<(), DeviceError> {
        let adapter = self.adapter.clone();
        let callbacks = self.callbacks.clone();

        spawn(async move {
            info!("Scanning...");
            if let Err(err) = adapter.start_scan(ScanFilter::default()).await {
                warn!("Scanning failed {:?}", err);
                callbacks.did_fail_scan(err.to_string());
            }
        });
        Ok(())
    }

    fn stop_scan(&self) -> Result<(), DeviceError> {
        let adapter = self.adapter.clone();

        spawn(async move {
            if let Err(err) = adapter.stop_scan().await {
                warn!("Failed to stop scanning: {:?}", err);
            }
        });
        Ok(())
    }

    fn connect(&self, name: &str) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(name)?;
        let transport = self.clone();
        let name = name.to_string();

        spawn(async move {
            info!("Connecting to peripheral {}...", name);
            match peripheral.connect().await {
                Ok(()) => {
                    transport.table().mark_connected(&name);
                    transport.callbacks.did_connect(&name);
                },
                Err(err) => {
                    warn!("Connecting to peripheral failed: {:?}", err);
                    transport.callbacks.did_disconnect_or_fail(&name);
                },
            }
        });
        Ok(())
    }

    fn disconnect(&self, name: &str) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(name)?;
        let was_connected = {
            let mut table = self.table();
            table.stop_notifications(name);
            table.connected.contains(name)
        };
        let transport = self.clone();
        let name = name.to_string();

        spawn(async move {
            if let Err(err) = peripheral.disconnect().await {
                warn!("Disconnecting from peripheral failed: {:?}", err);
            }
            // some platforms never raise DeviceDisconnected for a local disconnect
            if transport.table().take_connected(&name) || !was_connected {
                transport.callbacks.did_disconnect_or_fail(&name);
            }
        });
        Ok(())
    }

    fn discover_services(&self, name: &str) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(name)?;
        let transport = self.clone();
        let name = name.to_string();

        spawn(async move {
            info!("Connected; Discovering services of {}...", name);
            let result = match peripheral.discover_services().await {
                Ok(()) => transport.subscribe_notifications(&name, &peripheral).await,
                Err(err) => Err(DeviceError::from(err)),
            };

            match result {
                Ok(()) => transport.callbacks.did_discover_services(&name),
                Err(err) => {
                    warn!("Discovering services of {} failed: {:?}", name, err);
                    if let Err(err) = peripheral.disconnect().await {
                        warn!("Disconnecting from peripheral failed: {:?}", err);
                    }
                    if transport.table().take_connected(&name) {
                        transport.callbacks.did_disconnect_or_fail(&name);
                    }
                },
            }
        });
        Ok(())
    }

    fn write_characteristic(&self, name: &str, id: u64, uuid: Uuid, value: &[u8]) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(name)?;
        let characteristic = find_characteristic(&peripheral, uuid)?;
        let callbacks = self.callbacks.clone();
        let name = name.to_string();
        let value = value.to_vec();

        let write_type = if characteristic.properties.contains(CharPropFlags::WRITE) {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        spawn(async move {
            let result = peripheral.write(&characteristic, &value, write_type).await
                .map_err(|err| {
                    warn!("Failed to send to characteristic {}: {:?}", uuid, err);
                    err.to_string()
                });
            callbacks.did_write(&name, id, uuid, result);
        });
        Ok(())
    }

    fn read_characteristic(&self, name: &str, uuid: Uuid) -> Result<(), DeviceError> {
        let peripheral = self.peripheral(name)?;
        let characteristic = find_characteristic(&peripheral, uuid)?;
        let callbacks = self.callbacks.clone();
        let name = name.to_string();

        spawn(async move {
            match peripheral.read(&characteristic).await {
                Ok(value) => callbacks.did_read(&name, uuid, value),
                Err(err) => {
                    warn!("Failed to read characteristic {}: {:?}", uuid, err);
                    callbacks.did_fail_read(&name, uuid, err.to_string());
                },
            }
        });
        Ok(())
    }
}

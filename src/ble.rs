use async_trait::async_trait;
use btleplug::{
    api::{
        Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
        ScanFilter, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use futures::{
    channel::mpsc::{self, UnboundedSender},
    stream::{BoxStream, StreamExt},
};
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{FtmsError, Result},
    listeners::lock,
    types::{BluetoothState, DeviceDescriptor},
    FTMS_SERVICE_UUID,
};

/// Something the platform BLE stack reported without being asked
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Adapter power state changed
    AdapterStateChanged(BluetoothState),
    /// A device advertising the Fitness Machine Service was seen
    DeviceDiscovered(DeviceDescriptor),
    /// A subscribed characteristic notified or indicated a value
    Notification {
        /// Characteristic the value came from
        characteristic: Uuid,
        /// Raw value
        value: Vec<u8>,
    },
    /// The link to a device went down
    Disconnected {
        /// Platform id of the device
        device_id: String,
    },
}

/// Stream of [`TransportEvent`]s, in the order the platform delivered them
pub type EventStream = BoxStream<'static, TransportEvent>;

/// The platform BLE primitives the connection state machine drives
///
/// A transport holds at most one connection. Characteristic UUIDs refer to
/// characteristics of the Fitness Machine Service on that connection.
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Current adapter power state
    async fn adapter_state(&self) -> Result<BluetoothState>;

    /// Open the event stream; a later call replaces the previous stream
    async fn events(&self) -> Result<EventStream>;

    /// Begin scanning for Fitness Machine Service advertisements
    async fn start_scan(&self) -> Result<()>;

    /// Stop scanning
    async fn stop_scan(&self) -> Result<()>;

    /// Establish the GATT connection
    async fn connect(&self, device: &DeviceDescriptor) -> Result<()>;

    /// Enumerate services and list the characteristics of the FTMS service
    ///
    /// An empty list means the service is absent.
    async fn discover_characteristics(&self) -> Result<Vec<Uuid>>;

    /// Enable notifications or indications on a characteristic
    async fn subscribe(&self, characteristic: Uuid) -> Result<()>;

    /// Read a characteristic value
    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a value, with response
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Tear the connection down; a no-op when not connected
    async fn disconnect(&self) -> Result<()>;
}

/// [`BleTransport`] backed by btleplug and the host's first Bluetooth adapter
pub struct BtleplugTransport {
    _manager: Manager,
    central: Adapter,
    peripheral: tokio::sync::Mutex<Option<Peripheral>>,
    events_tx: Mutex<Option<UnboundedSender<TransportEvent>>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    notification_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::AdapterNotFound`] if the host has no adapter, or
    /// [`FtmsError::Ble`] if the Bluetooth stack cannot be reached.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(FtmsError::AdapterNotFound)?;

        Ok(Self {
            _manager: manager,
            central,
            peripheral: tokio::sync::Mutex::new(None),
            events_tx: Mutex::new(None),
            event_task: Mutex::new(None),
            notification_task: Mutex::new(None),
        })
    }

    fn sender(&self) -> Result<UnboundedSender<TransportEvent>> {
        lock(&self.events_tx)
            .clone()
            .ok_or(FtmsError::NotInitialized)
    }

    async fn connected_peripheral(&self) -> Result<Peripheral> {
        self.peripheral
            .lock()
            .await
            .clone()
            .ok_or(FtmsError::NotConnected)
    }

    async fn characteristic(&self, uuid: Uuid) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.connected_peripheral().await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid && c.service_uuid == FTMS_SERVICE_UUID)
            .ok_or_else(|| FtmsError::Protocol(format!("Characteristic {uuid} not found")))?;
        Ok((peripheral, characteristic))
    }

    fn stop_notifications(&self) {
        if let Some(task) = lock(&self.notification_task).take() {
            task.abort();
        }
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.stop_notifications();
        if let Some(task) = lock(&self.event_task).take() {
            task.abort();
        }
    }
}

const fn map_central_state(state: CentralState) -> BluetoothState {
    match state {
        CentralState::PoweredOn => BluetoothState::PoweredOn,
        CentralState::PoweredOff => BluetoothState::PoweredOff,
        _ => BluetoothState::Unknown,
    }
}

/// Build a descriptor for a peripheral advertising the FTMS service
async fn describe(central: &Adapter, id: &PeripheralId) -> Option<DeviceDescriptor> {
    let peripheral = central.peripheral(id).await.ok()?;
    let properties = peripheral.properties().await.ok()??;

    if !properties.services.contains(&FTMS_SERVICE_UUID) {
        return None;
    }

    Some(DeviceDescriptor::new(
        id.to_string(),
        properties.local_name.unwrap_or_default(),
        properties.address.to_string(),
        properties.rssi,
    ))
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn adapter_state(&self) -> Result<BluetoothState> {
        Ok(map_central_state(self.central.adapter_state().await?))
    }

    async fn events(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded();
        let mut central_events = self.central.events().await?;
        let central = self.central.clone();
        let sender = tx.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = central_events.next().await {
                let mapped = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        describe(&central, &id)
                            .await
                            .map(TransportEvent::DeviceDiscovered)
                    }
                    CentralEvent::DeviceDisconnected(id) => Some(TransportEvent::Disconnected {
                        device_id: id.to_string(),
                    }),
                    CentralEvent::StateUpdate(state) => {
                        Some(TransportEvent::AdapterStateChanged(map_central_state(state)))
                    }
                    _ => None,
                };

                if let Some(event) = mapped {
                    if sender.unbounded_send(event).is_err() {
                        break;
                    }
                }
            }
            debug!("Adapter event stream ended");
        });

        if let Some(previous) = lock(&self.event_task).replace(task) {
            previous.abort();
        }
        *lock(&self.events_tx) = Some(tx);
        Ok(rx.boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        let scan_filter = ScanFilter {
            services: vec![FTMS_SERVICE_UUID],
        };
        self.central.start_scan(scan_filter).await?;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.central.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<()> {
        let peripheral = self
            .central
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == device.id)
            .ok_or_else(|| FtmsError::DeviceNotFound(device.id.clone()))?;

        peripheral.connect().await?;
        info!("GATT connection established with {}", device.name);

        *self.peripheral.lock().await = Some(peripheral);
        Ok(())
    }

    async fn discover_characteristics(&self) -> Result<Vec<Uuid>> {
        let peripheral = self.connected_peripheral().await?;
        peripheral.discover_services().await?;

        let characteristics = peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == FTMS_SERVICE_UUID)
            .map(|s| s.characteristics.into_iter().map(|c| c.uuid).collect())
            .unwrap_or_default();

        Ok(characteristics)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let sender = self.sender()?;
        let (peripheral, characteristic) = self.characteristic(characteristic).await?;

        peripheral.subscribe(&characteristic).await?;
        debug!("Subscribed to {}", characteristic.uuid);

        // One forwarding task per connection covers every subscribed characteristic
        let forwarding = lock(&self.notification_task).is_some();
        if !forwarding {
            let mut notifications = peripheral.notifications().await?;
            let task = tokio::spawn(async move {
                while let Some(notification) = notifications.next().await {
                    let event = TransportEvent::Notification {
                        characteristic: notification.uuid,
                        value: notification.value,
                    };
                    if sender.unbounded_send(event).is_err() {
                        break;
                    }
                }
                debug!("Notification stream ended");
            });
            *lock(&self.notification_task) = Some(task);
        }

        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(characteristic).await?;
        Ok(peripheral.read(&characteristic).await?)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(characteristic).await?;
        peripheral
            .write(&characteristic, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let peripheral = self.peripheral.lock().await.take();
        self.stop_notifications();

        if let Some(peripheral) = peripheral {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Peripheral disconnect failed: {e}");
                return Err(e.into());
            }
        }

        Ok(())
    }
}

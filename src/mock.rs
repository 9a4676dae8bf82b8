use async_trait::async_trait;
use futures::{
    channel::mpsc::{self, UnboundedSender},
    stream::StreamExt,
};
use std::{collections::HashMap, sync::Mutex, time::Duration};
use tracing::debug;
use uuid::Uuid;

use crate::{
    ble::{BleTransport, EventStream, TransportEvent},
    error::{FtmsError, Result},
    listeners::lock,
    protocol::{Opcode, ResultCode},
    telemetry::flags,
    types::{BluetoothState, DeviceDescriptor},
    CONTROL_POINT_UUID, FEATURE_UUID, MACHINE_STATUS_UUID, SUPPORTED_SPEED_RANGE_UUID,
    TRAINING_STATUS_UUID, TREADMILL_DATA_UUID,
};

/// Supported Speed Range value for 0.5 - 12.0 km/h in 0.1 km/h steps
pub const SAMPLE_SPEED_RANGE: [u8; 6] = [0x32, 0x00, 0xB0, 0x04, 0x0A, 0x00];

#[derive(Debug)]
struct MockState {
    adapter_state: BluetoothState,
    devices: Vec<DeviceDescriptor>,
    characteristics: Vec<Uuid>,
    values: HashMap<Uuid, Vec<u8>>,
    connected: Option<DeviceDescriptor>,
    /// Device a delayed connect is waiting on
    connecting: Option<DeviceDescriptor>,
    scanning: bool,
    subscriptions: Vec<Uuid>,
    writes: Vec<(Uuid, Vec<u8>)>,
    acknowledgement: Option<u8>,
    connect_delay: Option<Duration>,
    disconnect_delay: Option<Duration>,
    connect_failure: Option<String>,
    write_failure: Option<String>,
    disconnect_failure: Option<String>,
}

/// In-memory [`BleTransport`] simulating FTMS treadmills
///
/// Scanning reports every configured device twice, the way repeated
/// advertisements arrive from a real adapter. Control point writes are
/// answered with a response indication carrying the configured result code.
#[derive(Debug)]
pub struct MockTransport {
    state: Mutex<MockState>,
    events_tx: Mutex<Option<UnboundedSender<TransportEvent>>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Powered on adapter, two sample treadmills, every FTMS characteristic
    /// present and commands acknowledged with success
    #[must_use]
    pub fn new() -> Self {
        let values = HashMap::from([(SUPPORTED_SPEED_RANGE_UUID, SAMPLE_SPEED_RANGE.to_vec())]);

        Self {
            state: Mutex::new(MockState {
                adapter_state: BluetoothState::PoweredOn,
                devices: sample_devices(),
                characteristics: vec![
                    FEATURE_UUID,
                    TREADMILL_DATA_UUID,
                    TRAINING_STATUS_UUID,
                    SUPPORTED_SPEED_RANGE_UUID,
                    CONTROL_POINT_UUID,
                    MACHINE_STATUS_UUID,
                ],
                values,
                connected: None,
                connecting: None,
                scanning: false,
                subscriptions: Vec::new(),
                writes: Vec::new(),
                acknowledgement: Some(ResultCode::Success as u8),
                connect_delay: None,
                disconnect_delay: None,
                connect_failure: None,
                write_failure: None,
                disconnect_failure: None,
            }),
            events_tx: Mutex::new(None),
        }
    }

    /// Replace the devices reported while scanning
    #[must_use]
    pub fn with_devices(self, devices: Vec<DeviceDescriptor>) -> Self {
        lock(&self.state).devices = devices;
        self
    }

    /// Replace the characteristics the FTMS service exposes
    #[must_use]
    pub fn with_characteristics(self, characteristics: Vec<Uuid>) -> Self {
        lock(&self.state).characteristics = characteristics;
        self
    }

    /// Set the value returned when `characteristic` is read
    #[must_use]
    pub fn with_value(self, characteristic: Uuid, value: Vec<u8>) -> Self {
        lock(&self.state).values.insert(characteristic, value);
        self
    }

    /// Start with the adapter in `state`
    #[must_use]
    pub fn with_adapter_state(self, state: BluetoothState) -> Self {
        lock(&self.state).adapter_state = state;
        self
    }

    /// Result code sent back for control point writes, `None` for silence
    #[must_use]
    pub fn with_acknowledgement(self, result_code: Option<u8>) -> Self {
        self.set_acknowledgement(result_code);
        self
    }

    /// Delay every connect by `delay`
    #[must_use]
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        lock(&self.state).connect_delay = Some(delay);
        self
    }

    /// Delay every disconnect by `delay`
    #[must_use]
    pub fn with_disconnect_delay(self, delay: Duration) -> Self {
        lock(&self.state).disconnect_delay = Some(delay);
        self
    }

    /// Change the result code sent back for control point writes
    pub fn set_acknowledgement(&self, result_code: Option<u8>) {
        lock(&self.state).acknowledgement = result_code;
    }

    /// Change the adapter power state and report it
    pub fn set_adapter_state(&self, state: BluetoothState) {
        lock(&self.state).adapter_state = state;
        self.emit(TransportEvent::AdapterStateChanged(state));
    }

    /// Make the next connect fail with `message`
    pub fn fail_next_connect(&self, message: impl Into<String>) {
        lock(&self.state).connect_failure = Some(message.into());
    }

    /// Make every write fail with `message`, or succeed again with `None`
    pub fn fail_writes(&self, message: Option<String>) {
        lock(&self.state).write_failure = message;
    }

    /// Make the next disconnect report `message` after tearing the link down
    pub fn fail_next_disconnect(&self, message: impl Into<String>) {
        lock(&self.state).disconnect_failure = Some(message.into());
    }

    /// Deliver a value on `characteristic` as if the machine notified it
    pub fn notify(&self, characteristic: Uuid, value: Vec<u8>) {
        self.emit(TransportEvent::Notification {
            characteristic,
            value,
        });
    }

    /// Report a device as if an advertisement had been received
    pub fn advertise(&self, device: DeviceDescriptor) {
        self.emit(TransportEvent::DeviceDiscovered(device));
    }

    /// Lose the link without being asked to, as an out of range device would
    ///
    /// During a delayed connect the disconnect is reported for the device being
    /// connected, while the connect itself still completes.
    pub fn drop_link(&self) {
        let device = {
            let mut state = lock(&self.state);
            state.subscriptions.clear();
            state.connected.take().or_else(|| state.connecting.clone())
        };

        if let Some(device) = device {
            debug!("Mock link to {} dropped", device.id);
            self.emit(TransportEvent::Disconnected {
                device_id: device.id,
            });
        }
    }

    /// Whether a scan is running
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        lock(&self.state).scanning
    }

    /// Whether the link is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected.is_some()
    }

    /// Characteristics subscribed on the current link
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Uuid> {
        lock(&self.state).subscriptions.clone()
    }

    /// Every value written to `characteristic`, oldest first
    #[must_use]
    pub fn writes_to(&self, characteristic: Uuid) -> Vec<Vec<u8>> {
        lock(&self.state)
            .writes
            .iter()
            .filter(|(uuid, _)| *uuid == characteristic)
            .map(|(_, data)| data.clone())
            .collect()
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(tx) = lock(&self.events_tx).as_ref() {
            // a closed receiver means nobody is listening any more
            tx.unbounded_send(event).ok();
        }
    }

    fn connected_state(&self) -> Result<std::sync::MutexGuard<'_, MockState>> {
        let state = lock(&self.state);
        if state.connected.is_none() {
            return Err(FtmsError::NotConnected);
        }
        Ok(state)
    }
}

/// Two treadmills with distinct signal strengths
#[must_use]
pub fn sample_devices() -> Vec<DeviceDescriptor> {
    vec![
        DeviceDescriptor::new(
            "mock-device-1",
            "Mock Treadmill",
            "AA:BB:CC:DD:EE:FF",
            Some(-50),
        ),
        DeviceDescriptor::new(
            "mock-device-2",
            "Mock Treadmill 2",
            "11:22:33:44:55:66",
            Some(-65),
        ),
    ]
}

/// Build a Treadmill Data frame with speed, total distance and elapsed time
#[must_use]
pub fn treadmill_frame(speed_kmh: f64, distance_m: u32, elapsed_seconds: u16) -> Vec<u8> {
    let flags = flags::TOTAL_DISTANCE | flags::ELAPSED_TIME;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let speed = (speed_kmh * 100.0).round() as u16;

    let mut frame = Vec::with_capacity(9);
    frame.extend_from_slice(&flags.to_le_bytes());
    frame.extend_from_slice(&speed.to_le_bytes());
    frame.extend_from_slice(&distance_m.to_le_bytes()[..3]);
    frame.extend_from_slice(&elapsed_seconds.to_le_bytes());
    frame
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn adapter_state(&self) -> Result<BluetoothState> {
        Ok(lock(&self.state).adapter_state)
    }

    async fn events(&self) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded();
        *lock(&self.events_tx) = Some(tx);
        Ok(rx.boxed())
    }

    async fn start_scan(&self) -> Result<()> {
        let devices = {
            let mut state = lock(&self.state);
            if !state.adapter_state.is_ready() {
                return Err(FtmsError::BluetoothUnavailable {
                    state: state.adapter_state,
                });
            }
            state.scanning = true;
            state.devices.clone()
        };

        for _ in 0..2 {
            for device in &devices {
                self.advertise(device.clone());
            }
        }

        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        lock(&self.state).scanning = false;
        Ok(())
    }

    async fn connect(&self, device: &DeviceDescriptor) -> Result<()> {
        let delay = {
            let mut state = lock(&self.state);
            if !state.adapter_state.is_ready() {
                return Err(FtmsError::Transport(
                    "Bluetooth is not enabled".to_string(),
                ));
            }
            if state.connect_delay.is_some() {
                state.connecting = Some(device.clone());
            }
            state.connect_delay
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.connecting = None;
        if let Some(message) = state.connect_failure.take() {
            return Err(FtmsError::ConnectionFailed(message));
        }
        if !state.devices.iter().any(|d| d.is_same_device(device)) {
            return Err(FtmsError::DeviceNotFound(device.id.clone()));
        }

        state.connected = Some(device.clone());
        Ok(())
    }

    async fn discover_characteristics(&self) -> Result<Vec<Uuid>> {
        Ok(self.connected_state()?.characteristics.clone())
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let mut state = self.connected_state()?;
        if !state.characteristics.contains(&characteristic) {
            return Err(FtmsError::Protocol(format!(
                "Characteristic {characteristic} not found"
            )));
        }
        state.subscriptions.push(characteristic);
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        self.connected_state()?
            .values
            .get(&characteristic)
            .cloned()
            .ok_or_else(|| FtmsError::Protocol(format!("No value for {characteristic}")))
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let acknowledgement = {
            let mut state = self.connected_state()?;
            if let Some(message) = state.write_failure.clone() {
                return Err(FtmsError::Transport(message));
            }
            state.writes.push((characteristic, data.to_vec()));
            state.acknowledgement
        };

        if characteristic == CONTROL_POINT_UUID {
            if let (Some(result), Some(&opcode)) = (acknowledgement, data.first()) {
                self.notify(
                    CONTROL_POINT_UUID,
                    vec![Opcode::ResponseCode as u8, opcode, result],
                );
            }
        }

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let delay = lock(&self.state).disconnect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        state.connected = None;
        state.subscriptions.clear();

        match state.disconnect_failure.take() {
            Some(message) => Err(FtmsError::Transport(message)),
            None => Ok(()),
        }
    }
}

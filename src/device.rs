use crate::{
    ble::{BleTransport, BtleplugTransport, EventStream, TransportEvent},
    error::{FtmsError, Result},
    listeners::{lock, Listeners, Subscription},
    protocol::{ControlCommand, ControlPointResponse},
    speed::{SpeedRange, SpeedState, DEFAULT_SPEED_RANGE},
    telemetry::TelemetryReading,
    types::{
        BluetoothState, ConnectedMachine, ConnectionParams, ConnectionState, DeviceDescriptor,
        TimeoutConfig,
    },
    CONTROL_POINT_UUID, SUPPORTED_SPEED_RANGE_UUID, TREADMILL_DATA_UUID,
};
use futures::StreamExt;
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Main interface for driving an FTMS treadmill
///
/// `FitnessMachine` owns the connection state machine on top of a
/// [`BleTransport`]. It scans for machines advertising the Fitness Machine
/// Service, keeps at most one connection, fans telemetry out to subscribers
/// and sends control point commands one at a time.
///
/// Every state change is published synchronously to
/// [`on_connection_state_change`](Self::on_connection_state_change) callbacks
/// and to [`watch_connection_state`](Self::watch_connection_state) receivers.
///
/// # Examples
///
/// ```no_run
/// use ftms_treadmill::{FitnessMachine, MockTransport};
/// use ftms_treadmill::mock::sample_devices;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let machine = FitnessMachine::new(MockTransport::new());
///     machine.initialize().await?;
///
///     let device = sample_devices().remove(0);
///     let connected = machine.connect(&device).await?;
///     println!("Telemetry available: {}", connected.has_telemetry);
///
///     machine.disconnect().await?;
///     Ok(())
/// }
/// ```
pub struct FitnessMachine<T: BleTransport> {
    transport: Arc<T>,
    shared: Arc<Shared>,
    params: ConnectionParams,
    timeout_config: TimeoutConfig,
    /// Serializes connect and disconnect
    lifecycle: tokio::sync::Mutex<()>,
    /// Serializes control point commands
    commands: tokio::sync::Mutex<()>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the public interface and the event pump
struct Shared {
    link: Mutex<Link>,
    /// Orders publication of connection states
    publishing: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    bluetooth_tx: watch::Sender<BluetoothState>,
    bluetooth_listeners: Listeners<BluetoothState>,
    connection_listeners: Listeners<ConnectionState>,
    telemetry_listeners: Listeners<TelemetryReading>,
    discovery_listeners: Listeners<DeviceDescriptor>,
    scan: Mutex<Option<ScanSession>>,
    pending: Mutex<Option<PendingCommand>>,
}

#[derive(Debug)]
struct Link {
    initialized: bool,
    state: ConnectionState,
    machine: Option<ConnectedMachine>,
    /// Bumped by every connect attempt and every teardown
    attempt: u64,
    /// Bumped by connect attempts only
    connects: u64,
    target: Option<String>,
    lost_while_connecting: bool,
    speed_range: SpeedRange,
    last_reading: Option<TelemetryReading>,
}

struct ScanSession {
    seen: HashSet<String>,
    _subscription: Subscription,
}

struct PendingCommand {
    opcode: u8,
    responder: oneshot::Sender<ControlPointResponse>,
}

impl Shared {
    fn new() -> Self {
        Self {
            link: Mutex::new(Link {
                initialized: false,
                state: ConnectionState::Disconnected,
                machine: None,
                attempt: 0,
                connects: 0,
                target: None,
                lost_while_connecting: false,
                speed_range: DEFAULT_SPEED_RANGE,
                last_reading: None,
            }),
            publishing: Mutex::new(()),
            state_tx: watch::Sender::new(ConnectionState::Disconnected),
            bluetooth_tx: watch::Sender::new(BluetoothState::Unknown),
            bluetooth_listeners: Listeners::new(),
            connection_listeners: Listeners::new(),
            telemetry_listeners: Listeners::new(),
            discovery_listeners: Listeners::new(),
            scan: Mutex::new(None),
            pending: Mutex::new(None),
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        lock(&self.link)
    }

    /// Publish the current connection state to watchers and callbacks
    ///
    /// The state is read under `publishing`, so observers never see an older
    /// state after a newer one. A state overtaken before its publication is
    /// skipped.
    fn publish(&self) {
        let _order = lock(&self.publishing);
        let state = self.link().state;

        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            info!("Connection state: {}", state);
            self.connection_listeners.emit(&state);
        }
    }

    fn set_bluetooth_state(&self, state: BluetoothState) {
        let changed = self.bluetooth_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            info!("Bluetooth adapter: {}", state);
            self.bluetooth_listeners.emit(&state);
        }
    }

    fn report_device(&self, device: &DeviceDescriptor) {
        let first_sighting = lock(&self.scan)
            .as_mut()
            .is_some_and(|session| session.seen.insert(device.id.clone()));

        if first_sighting {
            debug!(
                "Discovered {} ({}) rssi {:?}",
                device.display_name(),
                device.id,
                device.rssi
            );
            self.discovery_listeners.emit(device);
        }
    }

    fn handle_notification(&self, characteristic: Uuid, value: &[u8]) {
        if characteristic == TREADMILL_DATA_UUID {
            let reading = TelemetryReading::decode(value);
            {
                let mut link = self.link();
                if link.state != ConnectionState::Connected {
                    return;
                }
                link.last_reading = Some(reading);
            }
            self.telemetry_listeners.emit(&reading);
        } else if characteristic == CONTROL_POINT_UUID {
            self.resolve_command(value);
        } else {
            debug!("Ignoring notification from {}", characteristic);
        }
    }

    fn resolve_command(&self, value: &[u8]) {
        let Some(response) = ControlPointResponse::decode(value) else {
            return;
        };

        let mut pending = lock(&self.pending);
        match pending.take() {
            Some(command) if command.opcode == response.request_opcode => {
                // the waiter may already have timed out
                command.responder.send(response).ok();
            }
            other => {
                *pending = other;
                warn!(
                    "Unexpected control point response for opcode {:#04X}",
                    response.request_opcode
                );
            }
        }
    }

    /// Move to `Disconnecting` if `device_id` is the connected machine
    fn begin_link_loss(&self, device_id: &str) -> bool {
        {
            let mut link = self.link();
            match link.state {
                ConnectionState::Connecting if link.target.as_deref() == Some(device_id) => {
                    link.lost_while_connecting = true;
                    return false;
                }
                ConnectionState::Connected
                    if link
                        .machine
                        .as_ref()
                        .is_some_and(|m| m.device.id == device_id) =>
                {
                    link.state = ConnectionState::Disconnecting;
                    link.machine = None;
                    link.attempt += 1;
                }
                _ => return false,
            }
        }

        warn!("Link to {} lost", device_id);
        self.publish();
        self.teardown();
        true
    }

    /// Drop telemetry subscribers and fail the in-flight command
    fn teardown(&self) {
        self.telemetry_listeners.clear();
        // dropping the responder wakes the waiter with an error
        lock(&self.pending).take();
    }

    fn finish_disconnect(&self) {
        {
            let mut link = self.link();
            link.state = ConnectionState::Disconnected;
            link.machine = None;
            link.target = None;
            link.speed_range = DEFAULT_SPEED_RANGE;
            link.last_reading = None;
        }
        self.publish();
    }

    fn is_current_attempt(&self, attempt: u64) -> bool {
        let link = self.link();
        link.attempt == attempt && link.state == ConnectionState::Connecting
    }

    fn complete_connect(&self, attempt: u64, machine: ConnectedMachine) -> Result<ConnectedMachine> {
        let mut link = self.link();
        if link.attempt != attempt || link.state != ConnectionState::Connecting {
            return Err(FtmsError::ConnectionFailed(
                "connection attempt was cancelled".to_string(),
            ));
        }
        if link.lost_while_connecting {
            return Err(FtmsError::Disconnected);
        }

        link.state = ConnectionState::Connected;
        link.machine = Some(machine.clone());
        link.target = None;
        link.speed_range = DEFAULT_SPEED_RANGE;
        link.last_reading = None;
        Ok(machine)
    }

    /// Return to `Disconnected` unless someone else already moved on
    fn abandon_connect(&self, attempt: u64) -> bool {
        let mut link = self.link();
        if link.attempt != attempt || link.state != ConnectionState::Connecting {
            return false;
        }
        link.state = ConnectionState::Disconnected;
        link.target = None;
        true
    }
}

/// Forward transport events into the shared state until the stream ends
async fn run_event_loop<T: BleTransport>(
    shared: Arc<Shared>,
    transport: Arc<T>,
    mut events: EventStream,
) {
    while let Some(event) = events.next().await {
        match event {
            TransportEvent::AdapterStateChanged(state) => shared.set_bluetooth_state(state),
            TransportEvent::DeviceDiscovered(device) => shared.report_device(&device),
            TransportEvent::Notification {
                characteristic,
                value,
            } => shared.handle_notification(characteristic, &value),
            TransportEvent::Disconnected { device_id } => {
                if shared.begin_link_loss(&device_id) {
                    if let Err(e) = transport.disconnect().await {
                        debug!("Transport cleanup after link loss failed: {e}");
                    }
                    shared.finish_disconnect();
                }
            }
        }
    }

    debug!("Transport event stream ended");
}

impl FitnessMachine<BtleplugTransport> {
    /// Create a machine interface on the host's first Bluetooth adapter
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::AdapterNotFound`] if no adapter is present, or
    /// [`FtmsError::Ble`] if the Bluetooth stack cannot be opened.
    pub async fn with_default_adapter() -> Result<Self> {
        Ok(Self::new(BtleplugTransport::new().await?))
    }
}

impl<T: BleTransport> FitnessMachine<T> {
    /// Create a machine interface with default parameters
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ConnectionParams::default(), TimeoutConfig::default())
    }

    /// Create a machine interface with custom connection parameters and timeouts
    pub fn with_config(
        transport: T,
        params: ConnectionParams,
        timeout_config: TimeoutConfig,
    ) -> Self {
        Self {
            transport: Arc::new(transport),
            shared: Arc::new(Shared::new()),
            params,
            timeout_config,
            lifecycle: tokio::sync::Mutex::new(()),
            commands: tokio::sync::Mutex::new(()),
            event_task: Mutex::new(None),
        }
    }

    /// The underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connection parameters in use
    pub const fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Timeouts in use
    pub const fn timeout_config(&self) -> &TimeoutConfig {
        &self.timeout_config
    }

    /// Read the adapter state and start listening to transport events
    ///
    /// Calling this again while initialized does nothing.
    ///
    /// # Errors
    ///
    /// Returns any transport error raised while opening the adapter.
    pub async fn initialize(&self) -> Result<()> {
        if self.shared.link().initialized {
            debug!("Already initialized");
            return Ok(());
        }

        let state = self.transport.adapter_state().await?;
        self.shared.set_bluetooth_state(state);

        let events = self.transport.events().await?;
        let task = tokio::spawn(run_event_loop(
            self.shared.clone(),
            self.transport.clone(),
            events,
        ));
        if let Some(previous) = lock(&self.event_task).replace(task) {
            previous.abort();
        }

        self.shared.link().initialized = true;
        info!("Fitness machine interface initialized, Bluetooth {}", state);
        Ok(())
    }

    /// Stop scanning, disconnect and drop every registered callback
    ///
    /// The interface can be initialized again afterwards.
    pub async fn destroy(&self) {
        if let Err(e) = self.stop_scan().await {
            warn!("Failed to stop scan: {e}");
        }
        if let Err(e) = self.disconnect().await {
            warn!("Failed to disconnect: {e}");
        }
        if let Some(task) = lock(&self.event_task).take() {
            task.abort();
        }

        self.shared.link().initialized = false;
        self.shared.bluetooth_listeners.clear();
        self.shared.connection_listeners.clear();
        self.shared.telemetry_listeners.clear();
        info!("Fitness machine interface destroyed");
    }

    /// Last known adapter state
    pub fn bluetooth_state(&self) -> BluetoothState {
        *self.shared.bluetooth_tx.borrow()
    }

    /// Receiver that observes every adapter state change
    pub fn watch_bluetooth_state(&self) -> watch::Receiver<BluetoothState> {
        self.shared.bluetooth_tx.subscribe()
    }

    /// Register a callback for adapter state changes
    pub fn on_bluetooth_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&BluetoothState) + Send + Sync + 'static,
    {
        self.shared.bluetooth_listeners.subscribe(callback)
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.link().state
    }

    /// Receiver that observes every connection state change
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Register a callback for connection state changes
    pub fn on_connection_state_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        self.shared.connection_listeners.subscribe(callback)
    }

    /// The connected machine, present only while `Connected`
    pub fn connected_machine(&self) -> Option<ConnectedMachine> {
        self.shared.link().machine.clone()
    }

    /// Check if a machine is connected
    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Check if a scan is running
    pub fn is_scanning(&self) -> bool {
        lock(&self.shared.scan).is_some()
    }

    /// Most recent telemetry from the connected machine
    pub fn last_reading(&self) -> Option<TelemetryReading> {
        self.shared.link().last_reading
    }

    /// Speed range used to govern speed commands
    ///
    /// [`DEFAULT_SPEED_RANGE`] until [`read_speed_range`](Self::read_speed_range)
    /// succeeds on the current connection.
    pub fn speed_range(&self) -> SpeedRange {
        self.shared.link().speed_range
    }

    /// Current speed within the governing range
    pub fn speed_state(&self) -> SpeedState {
        let link = self.shared.link();
        let speed = link.last_reading.map_or(0.0, |r| r.speed_kmh);
        SpeedState::new(speed, &link.speed_range)
    }

    async fn wait_for_power_on(&self) -> Result<()> {
        let mut rx = self.shared.bluetooth_tx.subscribe();
        let limit = Duration::from_millis(self.params.power_on_timeout_ms);

        let ready = matches!(
            timeout(limit, rx.wait_for(|s| s.is_ready())).await,
            Ok(Ok(_))
        );
        if ready {
            Ok(())
        } else {
            let state = self.bluetooth_state();
            warn!("Bluetooth did not power on, adapter is {}", state);
            Err(FtmsError::BluetoothUnavailable { state })
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.shared.link().initialized {
            Ok(())
        } else {
            Err(FtmsError::NotInitialized)
        }
    }

    /// Refuse to scan during a connect attempt, or after one started since `since`
    fn scan_allowed(&self, since: Option<u64>) -> Result<u64> {
        let link = self.shared.link();
        let overtaken = since.is_some_and(|connects| connects != link.connects);
        if link.state == ConnectionState::Connecting || overtaken {
            warn!("Refusing to scan while {}", link.state);
            return Err(FtmsError::InvalidState { state: link.state });
        }
        Ok(link.connects)
    }

    fn connected(&self) -> Result<ConnectedMachine> {
        let link = self.shared.link();
        if !link.initialized {
            return Err(FtmsError::NotInitialized);
        }
        match (link.state, link.machine.as_ref()) {
            (ConnectionState::Connected, Some(machine)) => Ok(machine.clone()),
            _ => Err(FtmsError::NotConnected),
        }
    }

    /// Scan for machines advertising the Fitness Machine Service
    ///
    /// `on_device` is called once per device id for this scan session, however
    /// often the device advertises. Starting a scan while one is running
    /// replaces the previous callback and forgets the devices already seen.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::BluetoothUnavailable`] if the adapter does not power
    /// on within `power_on_timeout_ms`, and [`FtmsError::InvalidState`] while a
    /// connect attempt is in progress or if one began while waiting for power.
    pub async fn start_scan<F>(&self, on_device: F) -> Result<()>
    where
        F: Fn(&DeviceDescriptor) + Send + Sync + 'static,
    {
        self.ensure_initialized()?;
        let observed = self.scan_allowed(None)?;

        self.wait_for_power_on().await?;
        self.scan_allowed(Some(observed))?;

        // held until the radio is scanning so a connect's stop_scan comes after
        let _lifecycle = self.lifecycle.lock().await;
        let previous = {
            let link = self.shared.link();
            if link.state == ConnectionState::Connecting || link.connects != observed {
                return Err(FtmsError::InvalidState { state: link.state });
            }
            lock(&self.shared.scan).replace(ScanSession {
                seen: HashSet::new(),
                _subscription: self.shared.discovery_listeners.subscribe(on_device),
            })
        };
        // waits for a running discovery callback, so not under the link lock
        drop(previous);

        if let Err(e) = self.transport.start_scan().await {
            lock(&self.shared.scan).take();
            error!("Failed to start scan: {e}");
            return Err(e);
        }

        info!("Scanning for fitness machines");
        Ok(())
    }

    /// Stop scanning
    ///
    /// The discovery callback is never invoked once this returns, even if the
    /// transport is slow to stop.
    ///
    /// # Errors
    ///
    /// Returns any transport error raised while stopping the radio.
    pub async fn stop_scan(&self) -> Result<()> {
        if lock(&self.shared.scan).take().is_none() {
            return Ok(());
        }

        self.transport.stop_scan().await?;
        info!("Scan stopped");
        Ok(())
    }

    /// Connect to `device` and detect its capabilities
    ///
    /// Stops a running scan, waits for the adapter to power on, connects,
    /// discovers the FTMS characteristics and subscribes to Treadmill Data and
    /// the Control Point where present. Any failure settles back in
    /// `Disconnected`.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::InvalidState`] unless `Disconnected`, leaving the
    /// current connection untouched. Otherwise returns
    /// [`FtmsError::BluetoothUnavailable`], [`FtmsError::Timeout`],
    /// [`FtmsError::ConnectionFailed`] or the transport error that stopped the
    /// attempt.
    pub async fn connect(&self, device: &DeviceDescriptor) -> Result<ConnectedMachine> {
        let attempt = {
            let mut link = self.shared.link();
            if !link.initialized {
                return Err(FtmsError::NotInitialized);
            }
            if link.state != ConnectionState::Disconnected {
                warn!(
                    "Refusing to connect to {} while {}",
                    device.display_name(),
                    link.state
                );
                return Err(FtmsError::InvalidState { state: link.state });
            }
            link.state = ConnectionState::Connecting;
            link.attempt += 1;
            link.connects += 1;
            link.target = Some(device.id.clone());
            link.lost_while_connecting = false;
            link.attempt
        };

        info!("Connecting to {} ({})", device.display_name(), device.id);
        self.shared.publish();

        let _lifecycle = self.lifecycle.lock().await;
        if !self.shared.is_current_attempt(attempt) {
            return Err(FtmsError::ConnectionFailed(
                "connection attempt was cancelled".to_string(),
            ));
        }

        if let Err(e) = self.stop_scan().await {
            warn!("Failed to stop scan before connecting: {e}");
        }

        let outcome = match self.establish(device).await {
            Ok(machine) => self.shared.complete_connect(attempt, machine),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(machine) => {
                self.shared.publish();
                info!(
                    "Connected to {}: telemetry={} control_point={} speed_range={}",
                    device.display_name(),
                    machine.has_telemetry,
                    machine.has_control_point,
                    machine.has_speed_range
                );
                Ok(machine)
            }
            Err(e) => {
                error!("Connection to {} failed: {e}", device.display_name());
                if let Err(cleanup) = self.transport.disconnect().await {
                    debug!("Cleanup after failed connect: {cleanup}");
                }
                if self.shared.abandon_connect(attempt) {
                    self.shared.publish();
                }
                Err(e)
            }
        }
    }

    async fn establish(&self, device: &DeviceDescriptor) -> Result<ConnectedMachine> {
        self.wait_for_power_on().await?;

        let connect_ms = self.params.connect_timeout_ms;
        timeout(
            Duration::from_millis(connect_ms),
            self.transport.connect(device),
        )
        .await
        .map_err(|_| FtmsError::Timeout {
            timeout_ms: connect_ms,
        })?
        .map_err(|e| FtmsError::ConnectionFailed(e.to_string()))?;

        let discovery_ms = self.timeout_config.discovery_timeout_ms;
        let characteristics = timeout(
            Duration::from_millis(discovery_ms),
            self.transport.discover_characteristics(),
        )
        .await
        .map_err(|_| FtmsError::Timeout {
            timeout_ms: discovery_ms,
        })??;

        let machine = ConnectedMachine::from_characteristics(device.clone(), &characteristics);
        debug!(
            "{} exposes {} FTMS characteristics",
            device.display_name(),
            characteristics.len()
        );

        if machine.has_telemetry {
            self.transport.subscribe(TREADMILL_DATA_UUID).await?;
        }
        if machine.has_control_point {
            self.transport.subscribe(CONTROL_POINT_UUID).await?;
        }

        Ok(machine)
    }

    /// Disconnect from the machine
    ///
    /// Safe from any state. A connect in progress is allowed to finish first.
    /// The interface always ends up `Disconnected`, telemetry subscribers are
    /// dropped and an in-flight command fails with [`FtmsError::Disconnected`].
    ///
    /// # Errors
    ///
    /// Returns the transport error if the link could not be torn down
    /// cleanly. The state is `Disconnected` regardless.
    pub async fn disconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = {
            let mut link = self.shared.link();
            let state = link.state;
            if matches!(
                state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                link.state = ConnectionState::Disconnecting;
                link.machine = None;
                link.attempt += 1;
            }
            state
        };

        match state {
            ConnectionState::Disconnected => return Ok(()),
            ConnectionState::Disconnecting => {
                // link loss teardown already running
                let mut rx = self.shared.state_tx.subscribe();
                if rx
                    .wait_for(|s| *s == ConnectionState::Disconnected)
                    .await
                    .is_err()
                {
                    debug!("Connection state channel closed");
                }
                return Ok(());
            }
            ConnectionState::Connecting | ConnectionState::Connected => {}
        }

        info!("Disconnecting from device");
        self.shared.publish();
        self.shared.teardown();

        let result = self.transport.disconnect().await;
        self.shared.finish_disconnect();

        if let Err(e) = &result {
            error!("Disconnect did not complete cleanly: {e}");
        }
        result
    }

    /// Subscribe to decoded Treadmill Data notifications
    ///
    /// Readings arrive in notification order. Subscribers are dropped when the
    /// connection ends, however it ends.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::NotConnected`] without a connection and
    /// [`FtmsError::Unsupported`] if the machine has no Treadmill Data
    /// characteristic.
    pub fn subscribe_telemetry<F>(&self, on_reading: F) -> Result<Subscription>
    where
        F: Fn(&TelemetryReading) + Send + Sync + 'static,
    {
        // registering under the link lock keeps a concurrent teardown from missing us
        let link = self.shared.link();
        if !link.initialized {
            return Err(FtmsError::NotInitialized);
        }
        let machine = match (link.state, link.machine.as_ref()) {
            (ConnectionState::Connected, Some(machine)) => machine,
            _ => return Err(FtmsError::NotConnected),
        };
        if !machine.has_telemetry {
            return Err(FtmsError::Unsupported("treadmill data"));
        }

        Ok(self.shared.telemetry_listeners.subscribe(on_reading))
    }

    /// Read the machine's Supported Speed Range
    ///
    /// Machines without the characteristic, or reporting a malformed value, get
    /// [`DEFAULT_SPEED_RANGE`]. The result governs later speed commands.
    ///
    /// # Errors
    ///
    /// Returns [`FtmsError::NotConnected`] without a connection,
    /// [`FtmsError::Timeout`] if the read does not finish within
    /// `read_timeout_ms`, or the transport error.
    pub async fn read_speed_range(&self) -> Result<SpeedRange> {
        let machine = self.connected()?;

        let range = if machine.has_speed_range {
            let read_ms = self.timeout_config.read_timeout_ms;
            let data = timeout(
                Duration::from_millis(read_ms),
                self.transport.read(SUPPORTED_SPEED_RANGE_UUID),
            )
            .await
            .map_err(|_| FtmsError::Timeout {
                timeout_ms: read_ms,
            })??;
            SpeedRange::decode(&data)
        } else {
            debug!(
                "{} has no Supported Speed Range characteristic",
                machine.device.display_name()
            );
            DEFAULT_SPEED_RANGE
        };

        {
            let mut link = self.shared.link();
            if link.machine.as_ref() == Some(&machine) {
                link.speed_range = range;
            }
        }

        info!(
            "Speed range {:.2}-{:.2} km/h in {:.2} km/h steps",
            range.min_kmh, range.max_kmh, range.increment_kmh
        );
        Ok(range)
    }

    /// Write a command to the control point and wait for its result
    ///
    /// Commands are sent one at a time. With
    /// [`ConnectionParams::require_acknowledgement`] off, the command is
    /// complete once the write is.
    ///
    /// # Errors
    ///
    /// - [`FtmsError::NotConnected`] without a connection
    /// - [`FtmsError::Unsupported`] if the machine has no control point
    /// - [`FtmsError::CommandRejected`] if the machine answers with a
    ///   non-success result
    /// - [`FtmsError::Timeout`] if no answer arrives within
    ///   `command_timeout_ms`
    /// - [`FtmsError::Disconnected`] if the link goes down while waiting
    pub async fn send_command(&self, command: ControlCommand) -> Result<()> {
        self.control_point()?;
        let _serial = self.commands.lock().await;
        // the link may have gone while queued
        self.control_point()?;

        let data = command.to_bytes();
        debug!("Sending {:?}: {:02X?}", command, &data[..]);

        if !self.params.require_acknowledgement {
            return self.transport.write(CONTROL_POINT_UUID, &data).await;
        }

        let (tx, rx) = oneshot::channel();
        *lock(&self.shared.pending) = Some(PendingCommand {
            opcode: command.opcode() as u8,
            responder: tx,
        });

        if let Err(e) = self.transport.write(CONTROL_POINT_UUID, &data).await {
            lock(&self.shared.pending).take();
            error!("Failed to write {:?}: {e}", command);
            return Err(e);
        }

        let timeout_ms = self.timeout_config.command_timeout_ms;
        let outcome = timeout(Duration::from_millis(timeout_ms), rx).await;
        lock(&self.shared.pending).take();

        match outcome {
            Ok(Ok(response)) if response.is_success() => {
                debug!("{:?} acknowledged", command);
                Ok(())
            }
            Ok(Ok(response)) => {
                let reason = response
                    .result()
                    .map_or_else(|| format!("{:#04X}", response.result_code), |r| r.to_string());
                warn!("{:?} rejected: {}", command, reason);
                Err(FtmsError::CommandRejected {
                    opcode: response.request_opcode,
                    result: response.result_code,
                })
            }
            Ok(Err(_)) => Err(FtmsError::Disconnected),
            Err(_) => {
                warn!("No response to {:?} within {}ms", command, timeout_ms);
                Err(FtmsError::Timeout { timeout_ms })
            }
        }
    }

    fn control_point(&self) -> Result<ConnectedMachine> {
        let machine = self.connected()?;
        if !machine.has_control_point {
            return Err(FtmsError::Unsupported("control point"));
        }
        Ok(machine)
    }

    /// Request control of the machine; required before other commands
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn request_control(&self) -> Result<()> {
        info!("Requesting control");
        self.send_command(ControlCommand::RequestControl).await
    }

    /// Start or resume the belt
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn start(&self) -> Result<()> {
        info!("Starting");
        self.send_command(ControlCommand::Start).await
    }

    /// Stop the workout
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping");
        self.send_command(ControlCommand::Stop).await
    }

    /// Pause the workout
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn pause(&self) -> Result<()> {
        info!("Pausing");
        self.send_command(ControlCommand::Pause).await
    }

    /// Reset the machine
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn reset(&self) -> Result<()> {
        info!("Resetting");
        self.send_command(ControlCommand::Reset).await
    }

    /// Set the target speed in km/h
    ///
    /// The request is rounded to the speed increment and clamped to the
    /// current [`speed_range`](Self::speed_range). Returns the speed actually
    /// sent.
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn set_target_speed(&self, kmh: f64) -> Result<f64> {
        let governed = self.speed_range().govern(kmh);
        if (governed - kmh).abs() > f64::EPSILON {
            debug!("Requested {:.2} km/h, sending {:.2} km/h", kmh, governed);
        }

        info!("Setting target speed to {:.2} km/h", governed);
        self.send_command(ControlCommand::SetTargetSpeed(governed))
            .await?;
        Ok(governed)
    }

    /// Raise the target speed one increment above the last reported speed
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn speed_up(&self) -> Result<f64> {
        let (current, range) = self.current_speed();
        self.set_target_speed(range.step_up(current)).await
    }

    /// Lower the target speed one increment below the last reported speed
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn speed_down(&self) -> Result<f64> {
        let (current, range) = self.current_speed();
        self.set_target_speed(range.step_down(current)).await
    }

    fn current_speed(&self) -> (f64, SpeedRange) {
        let link = self.shared.link();
        (
            link.last_reading.map_or(0.0, |r| r.speed_kmh),
            link.speed_range,
        )
    }

    /// Set a target step count
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn set_target_steps(&self, steps: u16) -> Result<()> {
        self.send_command(ControlCommand::SetTargetSteps(steps))
            .await
    }

    /// Set a target distance in meters
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn set_target_distance(&self, meters: u32) -> Result<()> {
        self.send_command(ControlCommand::SetTargetDistance(meters))
            .await
    }

    /// Set a target training time in seconds
    ///
    /// # Errors
    ///
    /// See [`send_command`](Self::send_command).
    pub async fn set_target_training_time(&self, seconds: u16) -> Result<()> {
        self.send_command(ControlCommand::SetTargetTrainingTime(seconds))
            .await
    }
}

impl<T: BleTransport> Drop for FitnessMachine<T> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.event_task).take() {
            task.abort();
        }

        let linked = self.shared.link().state != ConnectionState::Disconnected;
        if linked {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let transport = self.transport.clone();
                handle.spawn(async move {
                    let _ = transport.disconnect().await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{sample_devices, treadmill_frame, MockTransport};
    use tokio::sync::mpsc;
    use tokio_test::{assert_err, assert_ok};

    const EPSILON: f64 = 1e-9;

    fn quick_params() -> ConnectionParams {
        ConnectionParams {
            connect_timeout_ms: 500,
            power_on_timeout_ms: 100,
            require_acknowledgement: true,
        }
    }

    fn quick_timeouts() -> TimeoutConfig {
        TimeoutConfig {
            command_timeout_ms: 100,
            read_timeout_ms: 100,
            discovery_timeout_ms: 500,
        }
    }

    async fn ready(transport: MockTransport) -> FitnessMachine<MockTransport> {
        let machine = FitnessMachine::with_config(transport, quick_params(), quick_timeouts());
        assert_ok!(machine.initialize().await);
        machine
    }

    async fn connected(transport: MockTransport) -> FitnessMachine<MockTransport> {
        let machine = ready(transport).await;
        assert_ok!(machine.connect(&sample_devices()[0]).await);
        machine
    }

    fn record_states(
        machine: &FitnessMachine<MockTransport>,
    ) -> (Arc<Mutex<Vec<ConnectionState>>>, Subscription) {
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        let subscription = machine.on_connection_state_change(move |state| {
            sink.lock().unwrap().push(*state);
        });
        (states, subscription)
    }

    async fn wait_for_state(machine: &FitnessMachine<MockTransport>, state: ConnectionState) {
        let mut rx = machine.watch_connection_state();
        let reached = matches!(
            timeout(Duration::from_secs(1), rx.wait_for(|s| *s == state)).await,
            Ok(Ok(_))
        );
        assert!(reached, "never reached {state}");
    }

    async fn drain<V>(rx: &mut mpsc::UnboundedReceiver<V>, quiet: Duration) -> Vec<V> {
        let mut items = Vec::new();
        while let Ok(Some(item)) = timeout(quiet, rx.recv()).await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_connect_detects_capabilities() {
        let machine = ready(MockTransport::new()).await;
        let (states, _subscription) = record_states(&machine);

        let device = sample_devices().remove(0);
        let connected = assert_ok!(machine.connect(&device).await);

        assert!(connected.has_telemetry);
        assert!(connected.has_control_point);
        assert!(connected.has_speed_range);
        assert_eq!(connected.device, device);
        assert_eq!(machine.connection_state(), ConnectionState::Connected);
        assert_eq!(machine.connected_machine(), Some(connected));
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(
            machine.transport().subscriptions(),
            vec![TREADMILL_DATA_UUID, CONTROL_POINT_UUID]
        );
    }

    #[tokio::test]
    async fn test_connect_without_optional_characteristics() {
        let transport = MockTransport::new().with_characteristics(vec![TREADMILL_DATA_UUID]);
        let machine = connected(transport).await;

        let capabilities = machine.connected_machine().unwrap();
        assert!(capabilities.has_telemetry);
        assert!(!capabilities.has_control_point);
        assert!(!capabilities.has_speed_range);
        assert_eq!(machine.transport().subscriptions(), vec![TREADMILL_DATA_UUID]);

        assert!(matches!(
            machine.start().await,
            Err(FtmsError::Unsupported(_))
        ));
        assert_eq!(
            assert_ok!(machine.read_speed_range().await),
            DEFAULT_SPEED_RANGE
        );
        assert!(machine.transport().writes_to(CONTROL_POINT_UUID).is_empty());
    }

    #[tokio::test]
    async fn test_connect_without_ftms_service() {
        let transport = MockTransport::new().with_characteristics(Vec::new());
        let machine = connected(transport).await;

        let capabilities = machine.connected_machine().unwrap();
        assert!(!capabilities.has_telemetry);
        assert!(!capabilities.has_control_point);
        assert!(!capabilities.has_speed_range);
        assert!(matches!(
            machine.subscribe_telemetry(|_| {}),
            Err(FtmsError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_rejected_while_connected() {
        let machine = connected(MockTransport::new()).await;
        let before = machine.connected_machine();

        let err = assert_err!(machine.connect(&sample_devices()[1]).await);
        assert!(matches!(
            err,
            FtmsError::InvalidState {
                state: ConnectionState::Connected
            }
        ));
        assert_eq!(machine.connection_state(), ConnectionState::Connected);
        assert_eq!(machine.connected_machine(), before);
    }

    #[tokio::test]
    async fn test_connect_rejected_while_connecting() {
        let transport = MockTransport::new().with_connect_delay(Duration::from_millis(100));
        let machine = Arc::new(ready(transport).await);

        let first = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.connect(&sample_devices()[0]).await })
        };
        wait_for_state(&machine, ConnectionState::Connecting).await;

        let err = assert_err!(machine.connect(&sample_devices()[1]).await);
        assert!(matches!(
            err,
            FtmsError::InvalidState {
                state: ConnectionState::Connecting
            }
        ));

        let connected = assert_ok!(first.await.unwrap());
        assert_eq!(connected.device.id, "mock-device-1");
    }

    #[tokio::test]
    async fn test_failed_connect_returns_to_disconnected() {
        let machine = ready(MockTransport::new()).await;
        let (states, _subscription) = record_states(&machine);

        machine.transport().fail_next_connect("radio busy");
        let err = assert_err!(machine.connect(&sample_devices()[0]).await);
        assert!(matches!(err, FtmsError::ConnectionFailed(_)));
        assert_eq!(machine.connection_state(), ConnectionState::Disconnected);
        assert!(machine.connected_machine().is_none());
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );

        // a later attempt starts from a clean slate
        assert_ok!(machine.connect(&sample_devices()[0]).await);
        assert!(machine.is_connected());
    }

    #[tokio::test]
    async fn test_connect_waits_for_power_on() {
        let transport = MockTransport::new().with_adapter_state(BluetoothState::PoweredOff);
        let machine = Arc::new(
            FitnessMachine::with_config(
                transport,
                ConnectionParams {
                    power_on_timeout_ms: 1_000,
                    ..quick_params()
                },
                quick_timeouts(),
            ),
        );
        assert_ok!(machine.initialize().await);
        assert_eq!(machine.bluetooth_state(), BluetoothState::PoweredOff);

        let powered = Arc::new(Mutex::new(Vec::new()));
        let _subscription = {
            let powered = powered.clone();
            machine.on_bluetooth_state_change(move |state| powered.lock().unwrap().push(*state))
        };

        let switch = {
            let machine = machine.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                machine.transport().set_adapter_state(BluetoothState::PoweredOn);
            })
        };

        assert_ok!(machine.connect(&sample_devices()[0]).await);
        assert_ok!(switch.await);
        assert_eq!(*powered.lock().unwrap(), vec![BluetoothState::PoweredOn]);
    }

    #[tokio::test]
    async fn test_connect_gives_up_when_bluetooth_stays_off() {
        let transport = MockTransport::new().with_adapter_state(BluetoothState::PoweredOff);
        let machine = ready(transport).await;

        let err = assert_err!(machine.connect(&sample_devices()[0]).await);
        assert!(matches!(
            err,
            FtmsError::BluetoothUnavailable {
                state: BluetoothState::PoweredOff
            }
        ));
        assert_eq!(machine.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_link_loss_clears_connection() {
        let machine = connected(MockTransport::new()).await;
        let (states, _states_subscription) = record_states(&machine);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _telemetry = assert_ok!(machine.subscribe_telemetry(move |reading| {
            tx.send(*reading).ok();
        }));

        machine.transport().drop_link();
        wait_for_state(&machine, ConnectionState::Disconnected).await;

        assert!(machine.connected_machine().is_none());
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected
            ]
        );
        assert!(machine.shared.telemetry_listeners.is_empty());

        machine
            .transport()
            .notify(TREADMILL_DATA_UUID, treadmill_frame(5.0, 100, 60));
        assert!(drain(&mut rx, Duration::from_millis(30)).await.is_empty());
        assert!(matches!(
            machine.start().await,
            Err(FtmsError::NotConnected)
        ));

        // the interface is usable again
        assert_ok!(machine.connect(&sample_devices()[0]).await);
    }

    #[tokio::test]
    async fn test_link_loss_of_other_device_is_ignored() {
        let machine = connected(MockTransport::new()).await;
        assert!(!machine.shared.begin_link_loss("mock-device-2"));
        assert_eq!(machine.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let machine = connected(MockTransport::new()).await;
        let (states, _subscription) = record_states(&machine);

        assert_ok!(machine.disconnect().await);
        assert_ok!(machine.disconnect().await);

        assert_eq!(machine.connection_state(), ConnectionState::Disconnected);
        assert!(machine.connected_machine().is_none());
        assert!(!machine.transport().is_connected());
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn test_disconnect_reports_teardown_failure() {
        let machine = connected(MockTransport::new()).await;
        machine.transport().fail_next_disconnect("stack busy");

        let err = assert_err!(machine.disconnect().await);
        assert!(matches!(err, FtmsError::Transport(_)));
        assert_eq!(machine.connection_state(), ConnectionState::Disconnected);
        assert!(machine.connected_machine().is_none());
    }

    #[tokio::test]
    async fn test_telemetry_is_delivered_in_order() {
        let machine = connected(MockTransport::new()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _telemetry = assert_ok!(machine.subscribe_telemetry(move |reading| {
            tx.send(reading.speed_kmh).ok();
        }));

        for (i, speed) in [1.0, 2.5, 4.0].into_iter().enumerate() {
            let distance = u32::try_from(i).unwrap() * 10;
            machine
                .transport()
                .notify(TREADMILL_DATA_UUID, treadmill_frame(speed, distance, 1));
        }

        let speeds = drain(&mut rx, Duration::from_millis(50)).await;
        assert_eq!(speeds.len(), 3);
        for (received, expected) in speeds.iter().zip([1.0, 2.5, 4.0]) {
            assert!((received - expected).abs() < EPSILON);
        }
        assert!((machine.last_reading().unwrap().speed_kmh - 4.0).abs() < EPSILON);
    }

    #[tokio::test]
    async fn test_unsubscribed_telemetry_stops() {
        let machine = connected(MockTransport::new()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let telemetry = assert_ok!(machine.subscribe_telemetry(move |reading| {
            tx.send(reading.speed_kmh).ok();
        }));

        machine
            .transport()
            .notify(TREADMILL_DATA_UUID, treadmill_frame(3.0, 0, 0));
        assert_eq!(drain(&mut rx, Duration::from_millis(30)).await.len(), 1);

        telemetry.unsubscribe();
        machine
            .transport()
            .notify(TREADMILL_DATA_UUID, treadmill_frame(3.5, 0, 0));
        assert!(drain(&mut rx, Duration::from_millis(30)).await.is_empty());
    }

    #[tokio::test]
    async fn test_command_acknowledged() {
        let machine = connected(MockTransport::new()).await;

        assert_ok!(machine.request_control().await);
        assert_ok!(machine.start().await);
        assert_ok!(machine.pause().await);
        assert_ok!(machine.stop().await);
        assert_ok!(machine.reset().await);

        assert_eq!(
            machine.transport().writes_to(CONTROL_POINT_UUID),
            vec![
                vec![0x00],
                vec![0x07],
                vec![0x08, 0x02],
                vec![0x08, 0x01],
                vec![0x01]
            ]
        );
    }

    #[tokio::test]
    async fn test_command_rejected() {
        let machine = connected(MockTransport::new()).await;
        machine.transport().set_acknowledgement(Some(0x05));

        let err = assert_err!(machine.start().await);
        assert!(matches!(
            err,
            FtmsError::CommandRejected {
                opcode: 0x07,
                result: 0x05
            }
        ));
    }

    #[tokio::test]
    async fn test_command_times_out_without_response() {
        let machine = connected(MockTransport::new().with_acknowledgement(None)).await;

        let err = assert_err!(machine.stop().await);
        assert!(matches!(err, FtmsError::Timeout { timeout_ms: 100 }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_invalid_and_mismatched_responses_are_ignored() {
        let transport = MockTransport::new().with_acknowledgement(None);
        let machine = Arc::new(
            FitnessMachine::with_config(transport, quick_params(), TimeoutConfig::default()),
        );
        assert_ok!(machine.initialize().await);
        assert_ok!(machine.connect(&sample_devices()[0]).await);

        let responder = {
            let machine = machine.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let transport = machine.transport();
                transport.notify(CONTROL_POINT_UUID, vec![0x80, 0x07]);
                transport.notify(CONTROL_POINT_UUID, vec![0x01, 0x07, 0x01]);
                transport.notify(CONTROL_POINT_UUID, vec![0x80, 0x02, 0x04]);
                transport.notify(CONTROL_POINT_UUID, vec![0x80, 0x07, 0x01]);
            })
        };

        assert_ok!(machine.start().await);
        assert_ok!(responder.await);
    }

    #[tokio::test]
    async fn test_command_without_acknowledgement() {
        let transport = MockTransport::new().with_acknowledgement(None);
        let machine = FitnessMachine::with_config(
            transport,
            ConnectionParams {
                require_acknowledgement: false,
                ..quick_params()
            },
            quick_timeouts(),
        );
        assert_ok!(machine.initialize().await);
        assert_ok!(machine.connect(&sample_devices()[0]).await);

        assert_ok!(machine.start().await);
        assert_eq!(
            machine.transport().writes_to(CONTROL_POINT_UUID),
            vec![vec![0x07]]
        );
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let machine = connected(MockTransport::new()).await;
        machine
            .transport()
            .fail_writes(Some("write not permitted".to_string()));

        let err = assert_err!(machine.start().await);
        assert!(matches!(err, FtmsError::Transport(_)));
    }

    #[tokio::test]
    async fn test_commands_require_connection() {
        let machine = FitnessMachine::new(MockTransport::new());
        assert!(matches!(
            machine.start().await,
            Err(FtmsError::NotInitialized)
        ));
        assert!(matches!(
            machine.connect(&sample_devices()[0]).await,
            Err(FtmsError::NotInitialized)
        ));

        assert_ok!(machine.initialize().await);
        for result in [
            machine.start().await,
            machine.stop().await,
            machine.request_control().await,
        ] {
            assert!(matches!(result, Err(FtmsError::NotConnected)));
        }
        assert!(matches!(
            machine.set_target_speed(5.0).await,
            Err(FtmsError::NotConnected)
        ));
        assert!(matches!(
            machine.read_speed_range().await,
            Err(FtmsError::NotConnected)
        ));
        assert!(matches!(
            machine.subscribe_telemetry(|_| {}),
            Err(FtmsError::NotConnected)
        ));
        assert!(machine.transport().writes_to(CONTROL_POINT_UUID).is_empty());
    }

    #[tokio::test]
    async fn test_target_speed_is_governed() {
        let transport = MockTransport::new()
            .with_value(SUPPORTED_SPEED_RANGE_UUID, vec![0x64, 0x00, 0xDC, 0x05, 0x0A, 0x00]);
        let machine = connected(transport).await;

        let range = assert_ok!(machine.read_speed_range().await);
        assert!((range.min_kmh - 1.0).abs() < EPSILON);
        assert!((range.max_kmh - 15.0).abs() < EPSILON);
        assert_eq!(machine.speed_range(), range);

        let sent = assert_ok!(machine.set_target_speed(20.0).await);
        assert!((sent - 15.0).abs() < EPSILON);

        let sent = assert_ok!(machine.set_target_speed(5.04).await);
        assert!((sent - 5.0).abs() < EPSILON);

        let sent = assert_ok!(machine.set_target_speed(0.2).await);
        assert!((sent - 1.0).abs() < EPSILON);

        assert_eq!(
            machine.transport().writes_to(CONTROL_POINT_UUID),
            vec![
                vec![0x02, 0xDC, 0x05],
                vec![0x02, 0xF4, 0x01],
                vec![0x02, 0x64, 0x00]
            ]
        );
    }

    #[tokio::test]
    async fn test_speed_range_resets_on_disconnect() {
        let transport = MockTransport::new()
            .with_value(SUPPORTED_SPEED_RANGE_UUID, vec![0x64, 0x00, 0xDC, 0x05, 0x0A, 0x00]);
        let machine = connected(transport).await;

        assert_ok!(machine.read_speed_range().await);
        assert_ok!(machine.disconnect().await);
        assert_eq!(machine.speed_range(), DEFAULT_SPEED_RANGE);
    }

    #[tokio::test]
    async fn test_speed_steps_from_last_reading() {
        let machine = connected(MockTransport::new()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _telemetry = assert_ok!(machine.subscribe_telemetry(move |reading| {
            tx.send(*reading).ok();
        }));

        machine
            .transport()
            .notify(TREADMILL_DATA_UUID, treadmill_frame(5.0, 0, 0));
        assert_eq!(drain(&mut rx, Duration::from_millis(30)).await.len(), 1);

        let state = machine.speed_state();
        assert!((state.speed_kmh - 5.0).abs() < EPSILON);
        assert!(state.can_increase());

        let up = assert_ok!(machine.speed_up().await);
        assert!((up - 5.1).abs() < EPSILON);
        let down = assert_ok!(machine.speed_down().await);
        assert!((down - 4.9).abs() < EPSILON);

        assert_eq!(
            machine.transport().writes_to(CONTROL_POINT_UUID),
            vec![vec![0x02, 0xFE, 0x01], vec![0x02, 0xEA, 0x01]]
        );
    }

    #[tokio::test]
    async fn test_scan_reports_each_device_once() {
        let machine = ready(MockTransport::new()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        assert_ok!(
            machine
                .start_scan(move |device| {
                    tx.send(device.id.clone()).ok();
                })
                .await
        );
        assert!(machine.is_scanning());

        let ids = drain(&mut rx, Duration::from_millis(50)).await;
        assert_eq!(ids, vec!["mock-device-1", "mock-device-2"]);

        assert_ok!(machine.stop_scan().await);
        assert!(!machine.is_scanning());
        assert!(!machine.transport().is_scanning());

        machine
            .transport()
            .advertise(DeviceDescriptor::new("late", "Late", "", None));
        assert!(drain(&mut rx, Duration::from_millis(30)).await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_stops_scan() {
        let machine = ready(MockTransport::new()).await;
        assert_ok!(machine.start_scan(|_| {}).await);

        assert_ok!(machine.connect(&sample_devices()[0]).await);
        assert!(!machine.is_scanning());
        assert!(!machine.transport().is_scanning());
    }

    #[tokio::test]
    async fn test_destroy_tears_everything_down() {
        let machine = connected(MockTransport::new()).await;
        assert_ok!(machine.start_scan(|_| {}).await);

        machine.destroy().await;
        assert_eq!(machine.connection_state(), ConnectionState::Disconnected);
        assert!(!machine.is_scanning());
        assert!(!machine.transport().is_connected());
        assert!(matches!(
            machine.connect(&sample_devices()[0]).await,
            Err(FtmsError::NotInitialized)
        ));

        assert_ok!(machine.initialize().await);
        assert_ok!(machine.connect(&sample_devices()[0]).await);
    }

    #[tokio::test]
    async fn test_scan_refused_when_connect_starts_during_power_on() {
        let transport = MockTransport::new().with_adapter_state(BluetoothState::PoweredOff);
        let machine = Arc::new(ready(transport).await);

        let scan = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.start_scan(|_| {}).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let connect = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.connect(&sample_devices()[0]).await })
        };
        wait_for_state(&machine, ConnectionState::Connecting).await;
        machine.transport().set_adapter_state(BluetoothState::PoweredOn);

        let err = assert_err!(scan.await.unwrap());
        assert!(matches!(err, FtmsError::InvalidState { .. }));
        assert_ok!(connect.await.unwrap());

        assert_eq!(machine.connection_state(), ConnectionState::Connected);
        assert!(!machine.is_scanning());
        assert!(!machine.transport().is_scanning());
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting() {
        let transport = MockTransport::new().with_connect_delay(Duration::from_millis(100));
        let machine = Arc::new(ready(transport).await);
        let (states, _subscription) = record_states(&machine);

        let connect = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.connect(&sample_devices()[0]).await })
        };
        wait_for_state(&machine, ConnectionState::Connecting).await;

        assert_ok!(machine.disconnect().await);
        assert_ok!(connect.await.unwrap());

        assert_eq!(machine.connection_state(), ConnectionState::Disconnected);
        assert!(machine.connected_machine().is_none());
        assert!(!machine.transport().is_connected());
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Connected,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected
            ]
        );
    }

    #[tokio::test]
    async fn test_link_loss_while_connecting_fails_attempt() {
        let transport = MockTransport::new().with_connect_delay(Duration::from_millis(100));
        let machine = Arc::new(ready(transport).await);
        let (states, _subscription) = record_states(&machine);

        let connect = {
            let machine = machine.clone();
            tokio::spawn(async move { machine.connect(&sample_devices()[0]).await })
        };
        wait_for_state(&machine, ConnectionState::Connecting).await;
        machine.transport().drop_link();

        let err = assert_err!(connect.await.unwrap());
        assert!(matches!(err, FtmsError::Disconnected));

        assert_eq!(machine.connection_state(), ConnectionState::Disconnected);
        assert!(machine.connected_machine().is_none());
        assert!(!machine.transport().is_connected());
        assert_eq!(
            *states.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Disconnected]
        );

        assert_ok!(machine.connect(&sample_devices()[0]).await);
    }

    #[tokio::test]
    async fn test_disconnect_during_link_loss_teardown() {
        let transport = MockTransport::new().with_disconnect_delay(Duration::from_millis(100));
        let machine = connected(transport).await;
        let (states, _subscription) = record_states(&machine);

        machine.transport().drop_link();
        wait_for_state(&machine, ConnectionState::Disconnecting).await;

        assert_ok!(machine.disconnect().await);
        assert_eq!(machine.connection_state(), ConnectionState::Disconnected);
        assert!(machine.connected_machine().is_none());
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected
            ]
        );
    }

    #[test]
    fn test_publish_reports_latest_state_once() {
        let shared = Shared::new();
        let states = Arc::new(Mutex::new(Vec::new()));
        let sink = states.clone();
        let _subscription = shared.connection_listeners.subscribe(move |state| {
            sink.lock().unwrap().push(*state);
        });

        // Connected overtaken by a link loss before it was published
        shared.link().state = ConnectionState::Connecting;
        shared.publish();
        shared.link().state = ConnectionState::Connected;
        shared.link().state = ConnectionState::Disconnecting;
        shared.publish();
        shared.link().state = ConnectionState::Disconnected;
        shared.publish();
        shared.publish();

        assert_eq!(*shared.state_tx.borrow(), ConnectionState::Disconnected);
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected
            ]
        );
    }
}

use serde::{Deserialize, Serialize};
use std::{
    fmt,
    hash::{Hash, Hasher},
};
use uuid::Uuid;

use crate::{CONTROL_POINT_UUID, SUPPORTED_SPEED_RANGE_UUID, TREADMILL_DATA_UUID};

/// Placeholder name for devices that advertise without one
pub const UNKNOWN_DEVICE_NAME: &str = "Unknown Device";

/// RSSI assumed for devices that did not report signal strength when sorting
const MISSING_RSSI_DBM: i16 = -100;

/// Bluetooth adapter power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BluetoothState {
    /// State not yet reported by the platform
    #[default]
    Unknown,
    /// Adapter is resetting
    Resetting,
    /// Host has no BLE support
    Unsupported,
    /// Application lacks Bluetooth permission
    Unauthorized,
    /// Adapter is switched off
    PoweredOff,
    /// Adapter is on and usable
    PoweredOn,
}

impl BluetoothState {
    /// Whether scanning and connecting are possible
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::PoweredOn)
    }

    /// User-facing description of the adapter state
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::PoweredOn => "Bluetooth is ready",
            Self::PoweredOff => "Bluetooth is turned off",
            Self::Unauthorized => "Bluetooth permission denied",
            Self::Unsupported => "Bluetooth is not supported on this device",
            Self::Resetting => "Bluetooth is resetting...",
            Self::Unknown => "Bluetooth state is unknown",
        }
    }
}

impl fmt::Display for BluetoothState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Resetting => write!(f, "Resetting"),
            Self::Unsupported => write!(f, "Unsupported"),
            Self::Unauthorized => write!(f, "Unauthorized"),
            Self::PoweredOff => write!(f, "Powered Off"),
            Self::PoweredOn => write!(f, "Powered On"),
        }
    }
}

/// Connection lifecycle state of the fitness machine link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No link
    #[default]
    Disconnected,
    /// Connect attempt in flight
    Connecting,
    /// Link up and capabilities discovered
    Connected,
    /// Teardown in flight
    Disconnecting,
}

impl ConnectionState {
    /// Check if the link is up
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }

    /// User-facing description of the connection state
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Connected => "Connected",
            Self::Connecting => "Connecting...",
            Self::Disconnecting => "Disconnecting...",
            Self::Disconnected => "Disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// A fitness machine seen while scanning
///
/// Identity is the platform `id` alone: two descriptors with the same id but a
/// different name or RSSI describe the same device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Opaque platform identifier, stable for this session
    pub id: String,
    /// Human readable name
    pub name: String,
    /// MAC address or platform address string
    pub address: String,
    /// Signal strength in dBm
    pub rssi: Option<i16>,
}

impl DeviceDescriptor {
    /// Create a descriptor, substituting a placeholder for an empty name
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        address: impl Into<String>,
        rssi: Option<i16>,
    ) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            name: if name.is_empty() {
                UNKNOWN_DEVICE_NAME.to_string()
            } else {
                name
            },
            address: address.into(),
            rssi,
        }
    }

    /// Name to show for this device
    ///
    /// Falls back to the address, formatted as `XX:XX:XX:XX:XX:XX` when it is a
    /// bare 12 digit hex string.
    #[must_use]
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() && self.name != UNKNOWN_DEVICE_NAME {
            return self.name.clone();
        }

        if self.address.len() == 12 && self.address.chars().all(|c| c.is_ascii_hexdigit()) {
            return self
                .address
                .as_bytes()
                .chunks(2)
                .map(|pair| String::from_utf8_lossy(pair).into_owned())
                .collect::<Vec<_>>()
                .join(":");
        }

        self.address.clone()
    }

    /// Check if both descriptors refer to the same device
    #[must_use]
    pub fn is_same_device(&self, other: &Self) -> bool {
        self.id == other.id
    }

    /// Sort devices by signal strength, strongest first
    pub fn sort_by_signal(devices: &mut [Self]) {
        devices.sort_by(|a, b| {
            let rssi_a = a.rssi.unwrap_or(MISSING_RSSI_DBM);
            let rssi_b = b.rssi.unwrap_or(MISSING_RSSI_DBM);
            rssi_b.cmp(&rssi_a)
        });
    }
}

impl PartialEq for DeviceDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.is_same_device(other)
    }
}

impl Eq for DeviceDescriptor {}

impl Hash for DeviceDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// A connected machine and the FTMS characteristics it actually exposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedMachine {
    /// The device the link is up with
    pub device: DeviceDescriptor,
    /// Treadmill Data characteristic present
    pub has_telemetry: bool,
    /// Fitness Machine Control Point characteristic present
    pub has_control_point: bool,
    /// Supported Speed Range characteristic present
    pub has_speed_range: bool,
}

impl ConnectedMachine {
    /// Record capabilities from the characteristic UUIDs found in the FTMS service
    #[must_use]
    pub fn from_characteristics(device: DeviceDescriptor, characteristics: &[Uuid]) -> Self {
        Self {
            device,
            has_telemetry: characteristics.contains(&TREADMILL_DATA_UUID),
            has_control_point: characteristics.contains(&CONTROL_POINT_UUID),
            has_speed_range: characteristics.contains(&SUPPORTED_SPEED_RANGE_UUID),
        }
    }
}

/// Connection parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    /// GATT connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// How long scan/connect wait for the adapter to power on
    pub power_on_timeout_ms: u64,
    /// Wait for the control point indication before reporting a command as done
    pub require_acknowledgement: bool,
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            power_on_timeout_ms: 5_000,
            require_acknowledgement: true,
        }
    }
}

/// Per-operation timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Control point acknowledgement timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Characteristic read timeout in milliseconds
    pub read_timeout_ms: u64,
    /// Service and characteristic discovery timeout in milliseconds
    pub discovery_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 3_000,
            read_timeout_ms: 3_000,
            discovery_timeout_ms: 15_000,
        }
    }
}

use thiserror::Error;

use crate::types::{BluetoothState, ConnectionState};

/// Errors that can occur when talking to a fitness machine
#[derive(Error, Debug)]
pub enum FtmsError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is available on this host
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    /// The Bluetooth adapter is not powered on
    #[error("Bluetooth is not available: {state}")]
    BluetoothUnavailable {
        /// Adapter state observed when the operation gave up
        state: BluetoothState,
    },

    /// `initialize()` has not been called, or `destroy()` already was
    #[error("BLE manager not initialized")]
    NotInitialized,

    /// The requested device is unknown to the transport
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device connection failed
    #[error("Failed to connect to device: {0}")]
    ConnectionFailed(String),

    /// Device disconnected while an operation was in flight
    #[error("Device disconnected")]
    Disconnected,

    /// An operation needing a connected machine was issued without one
    #[error("No device connected")]
    NotConnected,

    /// Operation is not valid in the current connection state
    #[error("Invalid connection state: {state}")]
    InvalidState {
        /// Connection state at the time of the call
        state: ConnectionState,
    },

    /// The connected machine does not expose the required characteristic
    #[error("Machine does not support {0}")]
    Unsupported(&'static str),

    /// Operation timed out
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The machine acknowledged a command with a non-success result code
    #[error("Command {opcode:#04X} rejected by machine: result code {result:#04X}")]
    CommandRejected {
        /// Request opcode echoed by the machine
        opcode: u8,
        /// Result code reported by the machine
        result: u8,
    },

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport failure reported by a non-btleplug backend
    #[error("Transport error: {0}")]
    Transport(String),
}

/// Result type for fitness machine operations
pub type Result<T> = std::result::Result<T, FtmsError>;

impl FtmsError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::AdapterNotFound
                | Self::BluetoothUnavailable { .. }
                | Self::ConnectionFailed(_)
                | Self::Disconnected
                | Self::DeviceNotFound(_)
                | Self::Transport(_)
        )
    }

    /// Check if this error is recoverable by simply retrying the operation
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::CommandRejected { .. } | Self::Protocol(_)
        )
    }

    /// Check if the call was rejected before touching the radio
    #[must_use]
    pub const fn is_precondition_error(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized
                | Self::NotConnected
                | Self::InvalidState { .. }
                | Self::Unsupported(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let connection_error = FtmsError::ConnectionFailed("test".to_string());
        assert!(connection_error.is_connection_error());
        assert!(!connection_error.is_recoverable());
        assert!(!connection_error.is_precondition_error());

        let timeout_error = FtmsError::Timeout { timeout_ms: 3000 };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        let state_error = FtmsError::InvalidState {
            state: ConnectionState::Connected,
        };
        assert!(state_error.is_precondition_error());
        assert!(!state_error.is_connection_error());
    }

    #[test]
    fn test_error_display() {
        let error = FtmsError::CommandRejected {
            opcode: 0x02,
            result: 0x03,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("0x02"));
        assert!(error_string.contains("0x03"));

        let error = FtmsError::InvalidState {
            state: ConnectionState::Connecting,
        };
        assert!(format!("{error}").contains("Connecting"));
    }
}

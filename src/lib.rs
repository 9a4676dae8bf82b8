#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # ftms-treadmill
//!
//! A Rust library for driving treadmills that implement the Bluetooth SIG
//! Fitness Machine Service (FTMS) over Bluetooth Low Energy.
//!
//! The library discovers treadmills advertising the service, manages a single
//! connection at a time, decodes the Treadmill Data characteristic into
//! [`TelemetryReading`]s and sends commands through the Fitness Machine Control
//! Point.
//!
//! ## Connection Lifecycle
//!
//! A [`FitnessMachine`] moves through
//! `Disconnected → Connecting → Connected → Disconnecting → Disconnected`.
//! A connect attempt that fails at any step settles back in `Disconnected`, and
//! a link lost while connected goes through `Disconnecting` exactly as an
//! explicit [`FitnessMachine::disconnect`] does.
//!
//! Capabilities are detected rather than assumed: [`ConnectedMachine`] records
//! which characteristics the treadmill actually exposes, and operations that
//! need a missing one fail with [`FtmsError::Unsupported`].
//!
//! ## Safety Warning
//!
//! ⚠️ **Important**: This library controls physical exercise equipment. Keep
//! the treadmill's own safety key attached and make sure a stop is always one
//! action away in your application.
//!
//! ## Quick Start
//!
//! ```no_run
//! use ftms_treadmill::FitnessMachine;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let machine = FitnessMachine::with_default_adapter().await?;
//!     machine.initialize().await?;
//!
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     machine
//!         .start_scan(move |device| {
//!             tx.send(device.clone()).ok();
//!         })
//!         .await?;
//!
//!     let device = tokio::time::timeout(Duration::from_secs(10), rx.recv())
//!         .await?
//!         .ok_or("scan ended")?;
//!     machine.connect(&device).await?;
//!
//!     let _telemetry = machine.subscribe_telemetry(|reading| {
//!         println!("{:.2} km/h, {:.2} km", reading.speed_kmh, reading.distance_km);
//!     })?;
//!
//!     machine.request_control().await?;
//!     machine.start().await?;
//!     machine.set_target_speed(5.0).await?;
//!
//!     tokio::time::sleep(Duration::from_secs(30)).await;
//!     machine.stop().await?;
//!     machine.disconnect().await?;
//!
//!     Ok(())
//! }
//! ```

use uuid::Uuid;

/// Bluetooth Low Energy transport seam and the btleplug implementation
pub mod ble;
/// Connection state machine and machine control interface
pub mod device;
/// Error types and handling
pub mod error;
/// Callback registration with cancellation handles
pub mod listeners;
/// In-memory transport for tests and demos
pub mod mock;
/// Fitness Machine Control Point commands and responses
pub mod protocol;
/// Supported speed range and speed governing
pub mod speed;
/// Treadmill Data decoding
pub mod telemetry;
/// Type definitions and data structures
pub mod types;

// Re-export the main types for convenient usage
pub use ble::{BleTransport, BtleplugTransport, TransportEvent};
pub use device::FitnessMachine;
pub use error::{FtmsError, Result};
pub use listeners::{Listeners, Subscription};
pub use mock::MockTransport;
pub use protocol::{ControlCommand, ControlPointResponse, Opcode, ResultCode};
pub use speed::{SpeedRange, SpeedState, DEFAULT_SPEED_RANGE};
pub use telemetry::TelemetryReading;
pub use types::{
    BluetoothState, ConnectedMachine, ConnectionParams, ConnectionState, DeviceDescriptor,
    TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fitness Machine Service (0x1826)
///
/// Scanning filters on this service, and every characteristic below is looked
/// up inside it.
pub const FTMS_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1826_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Feature (0x2ACC)
pub const FEATURE_UUID: Uuid = Uuid::from_u128(0x0000_2acc_0000_1000_8000_0080_5f9b_34fb);

/// Treadmill Data (0x2ACD), notified with live telemetry
pub const TREADMILL_DATA_UUID: Uuid = Uuid::from_u128(0x0000_2acd_0000_1000_8000_0080_5f9b_34fb);

/// Training Status (0x2AD3)
pub const TRAINING_STATUS_UUID: Uuid = Uuid::from_u128(0x0000_2ad3_0000_1000_8000_0080_5f9b_34fb);

/// Supported Speed Range (0x2AD4), read on demand
pub const SUPPORTED_SPEED_RANGE_UUID: Uuid =
    Uuid::from_u128(0x0000_2ad4_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Control Point (0x2AD9)
///
/// Commands are written here with response; results come back as indications.
pub const CONTROL_POINT_UUID: Uuid = Uuid::from_u128(0x0000_2ad9_0000_1000_8000_0080_5f9b_34fb);

/// Fitness Machine Status (0x2ADA)
pub const MACHINE_STATUS_UUID: Uuid = Uuid::from_u128(0x0000_2ada_0000_1000_8000_0080_5f9b_34fb);

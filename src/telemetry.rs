//! Treadmill Data (0x2ACD) notification decoding.
//!
//! Frame layout:
//! - Bytes 0-1: flags (u16 little-endian)
//! - Bytes 2-3: instantaneous speed (u16 little-endian, 0.01 km/h), always present
//! - Optional fields, in flag-bit order, each present only when its bit is set
//! - Optional trailing u16 little-endian step count when at least two bytes remain
//!
//! The trailing step count is a vendor convention, not an FTMS field. It is read
//! from whatever follows the last flagged field, so a machine that sets a flag
//! this decoder does not know about would shift it. Kept for compatibility with
//! walking pads that report steps this way.

use bytes::Buf;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Shortest frame carrying flags and instantaneous speed
pub const MIN_FRAME_LEN: usize = 4;

/// Upper bound for decoded speed in km/h
pub const MAX_SPEED_KMH: f64 = 30.0;
/// Upper bound for decoded distance in km
pub const MAX_DISTANCE_KM: f64 = 999.99;
/// Upper bound for decoded elapsed time in seconds
pub const MAX_ELAPSED_SECONDS: u32 = 86_400;
/// Upper bound for decoded energy in kcal
pub const MAX_ENERGY_KCAL: u32 = 99_999;
/// Upper bound for decoded step count
pub const MAX_STEPS: u32 = 999_999;

/// Treadmill Data flag bits
pub mod flags {
    /// Bit 0, "more data". Ignored: speed is always read.
    pub const MORE_DATA: u16 = 0x0001;
    /// Average speed, 2 bytes
    pub const AVERAGE_SPEED: u16 = 0x0002;
    /// Total distance, 3 bytes (u24 meters)
    pub const TOTAL_DISTANCE: u16 = 0x0004;
    /// Inclination and ramp angle, 4 bytes
    pub const INCLINATION: u16 = 0x0008;
    /// Positive and negative elevation gain, 4 bytes
    pub const ELEVATION_GAIN: u16 = 0x0010;
    /// Instantaneous pace, 1 byte
    pub const INSTANTANEOUS_PACE: u16 = 0x0020;
    /// Average pace, 1 byte
    pub const AVERAGE_PACE: u16 = 0x0040;
    /// Expended energy: total (2), per hour (2), per minute (1)
    pub const EXPENDED_ENERGY: u16 = 0x0080;
    /// Heart rate, 1 byte
    pub const HEART_RATE: u16 = 0x0100;
    /// Metabolic equivalent, 1 byte
    pub const METABOLIC_EQUIVALENT: u16 = 0x0200;
    /// Elapsed time, 2 bytes (u16 seconds)
    pub const ELAPSED_TIME: u16 = 0x0400;
    /// Remaining time, 2 bytes
    pub const REMAINING_TIME: u16 = 0x0800;
    /// Force on belt and power output, 4 bytes
    pub const FORCE_AND_POWER: u16 = 0x1000;
}

/// One decoded Treadmill Data notification
///
/// Fields absent from the frame stay at zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryReading {
    /// Instantaneous speed in km/h
    pub speed_kmh: f64,
    /// Total distance in km
    pub distance_km: f64,
    /// Elapsed time in seconds
    pub elapsed_seconds: u32,
    /// Total expended energy in kcal
    pub energy_kcal: u32,
    /// Step count
    pub steps: u32,
}

type FieldSetter = fn(&mut TelemetryReading, &[u8]);

/// An optional field gated by a flag bit
struct OptionalField {
    flag: u16,
    width: usize,
    setter: Option<FieldSetter>,
}

impl OptionalField {
    const fn skip(flag: u16, width: usize) -> Self {
        Self {
            flag,
            width,
            setter: None,
        }
    }

    const fn read(flag: u16, width: usize, setter: FieldSetter) -> Self {
        Self {
            flag,
            width,
            setter: Some(setter),
        }
    }
}

/// Optional fields in wire order
const OPTIONAL_FIELDS: [OptionalField; 12] = [
    OptionalField::skip(flags::AVERAGE_SPEED, 2),
    OptionalField::read(flags::TOTAL_DISTANCE, 3, set_distance),
    OptionalField::skip(flags::INCLINATION, 4),
    OptionalField::skip(flags::ELEVATION_GAIN, 4),
    OptionalField::skip(flags::INSTANTANEOUS_PACE, 1),
    OptionalField::skip(flags::AVERAGE_PACE, 1),
    OptionalField::read(flags::EXPENDED_ENERGY, 5, set_energy),
    OptionalField::skip(flags::HEART_RATE, 1),
    OptionalField::skip(flags::METABOLIC_EQUIVALENT, 1),
    OptionalField::read(flags::ELAPSED_TIME, 2, set_elapsed),
    OptionalField::skip(flags::REMAINING_TIME, 2),
    OptionalField::skip(flags::FORCE_AND_POWER, 4),
];

fn set_distance(reading: &mut TelemetryReading, mut field: &[u8]) {
    #[allow(clippy::cast_precision_loss)]
    let meters = field.get_uint_le(3) as f64;
    reading.distance_km = (meters / 1000.0).min(MAX_DISTANCE_KM);
}

fn set_energy(reading: &mut TelemetryReading, mut field: &[u8]) {
    // Per-hour and per-minute energy follow; nothing downstream consumes them.
    reading.energy_kcal = u32::from(field.get_u16_le()).min(MAX_ENERGY_KCAL);
}

fn set_elapsed(reading: &mut TelemetryReading, mut field: &[u8]) {
    reading.elapsed_seconds = u32::from(field.get_u16_le()).min(MAX_ELAPSED_SECONDS);
}

impl TelemetryReading {
    /// Decode a Treadmill Data notification
    ///
    /// Never fails. Frames shorter than [`MIN_FRAME_LEN`] decode to the all-zero
    /// reading. A frame truncated inside a flagged field stops decoding there:
    /// fields before the truncation are kept, while later flagged fields and the
    /// trailing step count are not read, since their offsets are unreliable.
    /// Every value is clamped to its `MAX_*` bound.
    #[must_use]
    pub fn decode(data: &[u8]) -> Self {
        if data.len() < MIN_FRAME_LEN {
            debug!("Telemetry frame too short: {} bytes", data.len());
            return Self::default();
        }

        let mut buf = data;
        let frame_flags = buf.get_u16_le();
        let mut reading = Self {
            speed_kmh: (f64::from(buf.get_u16_le()) / 100.0).min(MAX_SPEED_KMH),
            ..Self::default()
        };

        for field in &OPTIONAL_FIELDS {
            if frame_flags & field.flag == 0 {
                continue;
            }

            if buf.remaining() < field.width {
                debug!(
                    "Telemetry frame truncated at flag {:#06X}: {} of {} bytes",
                    field.flag,
                    buf.remaining(),
                    field.width
                );
                return reading;
            }

            if let Some(setter) = field.setter {
                setter(&mut reading, &buf[..field.width]);
            }
            buf.advance(field.width);
        }

        if buf.remaining() >= 2 {
            reading.steps = u32::from(buf.get_u16_le()).min(MAX_STEPS);
        }

        reading
    }
}

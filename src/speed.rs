//! Supported Speed Range (0x2AD4) decoding and speed governing.

use bytes::Buf;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Length of a Supported Speed Range value: min, max and increment as u16
pub const SPEED_RANGE_FRAME_LEN: usize = 6;

/// Range used whenever the machine does not report a usable one
pub const DEFAULT_SPEED_RANGE: SpeedRange = SpeedRange::new(0.5, 12.0, 0.1);

/// Speeds the machine accepts, in km/h
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedRange {
    /// Minimum supported speed
    pub min_kmh: f64,
    /// Maximum supported speed
    pub max_kmh: f64,
    /// Smallest accepted speed step
    pub increment_kmh: f64,
}

impl Default for SpeedRange {
    fn default() -> Self {
        DEFAULT_SPEED_RANGE
    }
}

impl SpeedRange {
    /// Create a speed range
    #[must_use]
    pub const fn new(min_kmh: f64, max_kmh: f64, increment_kmh: f64) -> Self {
        Self {
            min_kmh,
            max_kmh,
            increment_kmh,
        }
    }

    /// Decode a Supported Speed Range characteristic value
    ///
    /// Each field is a u16 little-endian in 0.01 km/h units. Short payloads, and
    /// payloads with `min > max` or a zero increment, yield
    /// [`DEFAULT_SPEED_RANGE`].
    #[must_use]
    pub fn decode(data: &[u8]) -> Self {
        if data.len() < SPEED_RANGE_FRAME_LEN {
            debug!(
                "Speed range payload too short ({} bytes), using default",
                data.len()
            );
            return DEFAULT_SPEED_RANGE;
        }

        let mut buf = data;
        let min = buf.get_u16_le();
        let max = buf.get_u16_le();
        let increment = buf.get_u16_le();

        if min > max || increment == 0 {
            warn!(
                "Malformed speed range min={} max={} increment={}, using default",
                min, max, increment
            );
            return DEFAULT_SPEED_RANGE;
        }

        Self::new(
            f64::from(min) / 100.0,
            f64::from(max) / 100.0,
            f64::from(increment) / 100.0,
        )
    }

    /// Whether `speed` lies within `[min_kmh, max_kmh]`
    #[must_use]
    pub fn is_in_range(&self, speed: f64) -> bool {
        speed >= self.min_kmh && speed <= self.max_kmh
    }

    /// Saturate `speed` to `[min_kmh, max_kmh]`
    ///
    /// NaN maps to `min_kmh`.
    #[must_use]
    pub fn clamp(&self, speed: f64) -> f64 {
        if speed.is_nan() || speed < self.min_kmh {
            self.min_kmh
        } else if speed > self.max_kmh {
            self.max_kmh
        } else {
            speed
        }
    }

    /// Round `speed` to the nearest multiple of the increment
    ///
    /// Returns the input unchanged when the increment is not positive.
    #[must_use]
    pub fn round_to_increment(&self, speed: f64) -> f64 {
        if !(self.increment_kmh > 0.0) {
            return speed;
        }
        (speed / self.increment_kmh).round() * self.increment_kmh
    }

    /// The speed actually sent for a request: rounded, then clamped
    #[must_use]
    pub fn govern(&self, requested: f64) -> f64 {
        self.clamp(self.round_to_increment(requested))
    }

    /// One increment above `current`, governed
    #[must_use]
    pub fn step_up(&self, current: f64) -> f64 {
        self.govern(current + self.increment_kmh)
    }

    /// One increment below `current`, governed
    #[must_use]
    pub fn step_down(&self, current: f64) -> f64 {
        self.govern(current - self.increment_kmh)
    }
}

/// Current speed together with the bounds it moves within
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedState {
    /// Current speed in km/h
    pub speed_kmh: f64,
    /// Lower bound in km/h
    pub min_kmh: f64,
    /// Upper bound in km/h
    pub max_kmh: f64,
}

impl Default for SpeedState {
    fn default() -> Self {
        Self::new(0.0, &DEFAULT_SPEED_RANGE)
    }
}

impl SpeedState {
    /// Speed state for `speed_kmh` within `range`
    #[must_use]
    pub const fn new(speed_kmh: f64, range: &SpeedRange) -> Self {
        Self {
            speed_kmh,
            min_kmh: range.min_kmh,
            max_kmh: range.max_kmh,
        }
    }

    /// Position of the speed within the range, from 0.0 to 1.0
    #[must_use]
    pub fn percentage(&self) -> f64 {
        let span = self.max_kmh - self.min_kmh;
        if span <= 0.0 {
            return 0.0;
        }
        ((self.speed_kmh - self.min_kmh) / span).clamp(0.0, 1.0)
    }

    /// Whether the speed is below the upper bound
    #[must_use]
    pub fn can_increase(&self) -> bool {
        self.speed_kmh < self.max_kmh
    }

    /// Whether the speed is above the lower bound
    #[must_use]
    pub fn can_decrease(&self) -> bool {
        self.speed_kmh > self.min_kmh
    }
}

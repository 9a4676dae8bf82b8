use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::warn;

/// Length of a control point response: response opcode, request opcode, result
pub const RESPONSE_FRAME_LEN: usize = 3;

/// Stop/Pause parameter value requesting a stop
pub const STOP_PARAM: u8 = 0x01;

/// Stop/Pause parameter value requesting a pause
pub const PAUSE_PARAM: u8 = 0x02;

/// Largest value a u24 field can carry
const MAX_U24: u32 = 0x00FF_FFFF;

/// Fitness Machine Control Point opcodes used by treadmills
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Take control of the machine; must precede other commands
    RequestControl = 0x00,
    /// Reset the machine
    Reset = 0x01,
    /// Set target speed (u16, 0.01 km/h)
    SetTargetSpeed = 0x02,
    /// Start or resume the workout
    StartOrResume = 0x07,
    /// Stop or pause the workout (u8 parameter)
    StopOrPause = 0x08,
    /// Set target step count (u16)
    SetTargetSteps = 0x0A,
    /// Set target distance (u24 meters)
    SetTargetDistance = 0x0C,
    /// Set target training time (u16 seconds)
    SetTargetTrainingTime = 0x0D,
    /// Leading byte of every response indication
    ResponseCode = 0x80,
}

impl Opcode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::RequestControl),
            0x01 => Some(Self::Reset),
            0x02 => Some(Self::SetTargetSpeed),
            0x07 => Some(Self::StartOrResume),
            0x08 => Some(Self::StopOrPause),
            0x0A => Some(Self::SetTargetSteps),
            0x0C => Some(Self::SetTargetDistance),
            0x0D => Some(Self::SetTargetTrainingTime),
            0x80 => Some(Self::ResponseCode),
            _ => None,
        }
    }
}

/// Result codes carried in control point responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    /// Operation completed
    Success = 0x01,
    /// Opcode not supported by the machine
    OpcodeNotSupported = 0x02,
    /// Parameter out of range or malformed
    InvalidParameter = 0x03,
    /// Machine could not carry out the operation
    OperationFailed = 0x04,
    /// Control has not been granted to this client
    ControlNotPermitted = 0x05,
}

impl ResultCode {
    /// Convert from u8
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Success),
            0x02 => Some(Self::OpcodeNotSupported),
            0x03 => Some(Self::InvalidParameter),
            0x04 => Some(Self::OperationFailed),
            0x05 => Some(Self::ControlNotPermitted),
            _ => None,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::OpcodeNotSupported => write!(f, "Opcode Not Supported"),
            Self::InvalidParameter => write!(f, "Invalid Parameter"),
            Self::OperationFailed => write!(f, "Operation Failed"),
            Self::ControlNotPermitted => write!(f, "Control Not Permitted"),
        }
    }
}

/// A command written to the Fitness Machine Control Point
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    /// Request control of the machine
    RequestControl,
    /// Reset the machine
    Reset,
    /// Start or resume
    Start,
    /// Stop the workout
    Stop,
    /// Pause the workout
    Pause,
    /// Set target speed in km/h
    SetTargetSpeed(f64),
    /// Set target step count
    SetTargetSteps(u16),
    /// Set target distance in meters; values above u24 saturate
    SetTargetDistance(u32),
    /// Set target training time in seconds
    SetTargetTrainingTime(u16),
}

impl ControlCommand {
    /// Opcode this command is sent with
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        match self {
            Self::RequestControl => Opcode::RequestControl,
            Self::Reset => Opcode::Reset,
            Self::Start => Opcode::StartOrResume,
            Self::Stop | Self::Pause => Opcode::StopOrPause,
            Self::SetTargetSpeed(_) => Opcode::SetTargetSpeed,
            Self::SetTargetSteps(_) => Opcode::SetTargetSteps,
            Self::SetTargetDistance(_) => Opcode::SetTargetDistance,
            Self::SetTargetTrainingTime(_) => Opcode::SetTargetTrainingTime,
        }
    }

    /// Serialize the command to its control point frame
    ///
    /// Speeds are sent as `round(kmh * 100)`, saturating to the u16 range.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(self.opcode() as u8);

        match *self {
            Self::RequestControl | Self::Reset | Self::Start => {}
            Self::Stop => buf.put_u8(STOP_PARAM),
            Self::Pause => buf.put_u8(PAUSE_PARAM),
            Self::SetTargetSpeed(kmh) => buf.put_u16_le(speed_units(kmh)),
            Self::SetTargetSteps(steps) => buf.put_u16_le(steps),
            Self::SetTargetDistance(meters) => {
                buf.put_uint_le(u64::from(meters.min(MAX_U24)), 3);
            }
            Self::SetTargetTrainingTime(seconds) => buf.put_u16_le(seconds),
        }

        buf.freeze()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn speed_units(kmh: f64) -> u16 {
    // `as` saturates, and maps NaN to zero
    (kmh * 100.0).round() as u16
}

/// A decoded control point response indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlPointResponse {
    /// Opcode of the request being answered
    pub request_opcode: u8,
    /// Raw result code
    pub result_code: u8,
}

impl ControlPointResponse {
    /// Decode a control point indication
    ///
    /// Returns `None` for frames shorter than [`RESPONSE_FRAME_LEN`] or not
    /// starting with the response opcode.
    #[must_use]
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < RESPONSE_FRAME_LEN {
            warn!("Control point response too short: {:02X?}", data);
            return None;
        }

        let mut buf = data;
        let opcode = buf.get_u8();
        if opcode != Opcode::ResponseCode as u8 {
            warn!("Control point frame is not a response: {:02X?}", data);
            return None;
        }

        Some(Self {
            request_opcode: buf.get_u8(),
            result_code: buf.get_u8(),
        })
    }

    /// Result code, if it is one this crate knows
    #[must_use]
    pub const fn result(&self) -> Option<ResultCode> {
        ResultCode::from_u8(self.result_code)
    }

    /// Whether the machine reported success
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result_code == ResultCode::Success as u8
    }

    /// Whether this response answers `command`
    #[must_use]
    pub const fn answers(&self, command: &ControlCommand) -> bool {
        self.request_opcode == command.opcode() as u8
    }
}

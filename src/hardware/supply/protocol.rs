//! Wire codec for the Glassman FJ series digital interface.
//!
//! Commands are ASCII frames: SOH, a command body, a two-character hex
//! checksum over the body, CR. Responses carry a leading tag character
//! instead of SOH (`R` status, `B` version, `E` error, bare `A` ack);
//! their checksum covers everything between the tag and the checksum.

use bytes::BufMut;
use thiserror::Error;

use crate::misc::buf::{BufMutExt, Encode, parse_hex};

use super::defs::{ControlMode, DeviceStatus, MAX_CURRENT, MAX_VOLTAGE, Setpoint};

pub const SOH: u8 = 0x01;
pub const CR: u8 = 0x0D;

/// Full scale of the 12-bit setpoint DAC.
pub const FULL_SCALE_SET: u16 = 0xFFF;
/// Full scale of the 10-bit readback ADC.
pub const FULL_SCALE_READ: u16 = 0x3FF;

const STATUS_PAYLOAD_LEN: usize = 10;

/* === Definitions === */

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// `Q` — report output voltage, current and status flags.
    Query,
    /// `S` — program both setpoints and the digital control lines.
    SetOutput {
        voltage: u16,
        current: u16,
        control: DigitalControl,
    },
    /// `V` — report the firmware version.
    Version,
    /// `C` — enable or disable the 1.5 s communication timeout.
    /// Disabling is strictly a bench-debugging aid.
    SetCommTimeout(bool),
}

/// Digital control byte of the set command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DigitalControl {
    HvOff,
    HvOn,
    /// Zeroes both setpoints and drops HV, clearing any latched fault.
    Reset,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    Ack,
    Status(DeviceStatus),
    Version(String),
    Fault(DeviceFault),
}

#[derive(Copy, Clone, Debug, Error, PartialEq)]
pub enum RangeError {
    #[error("voltage {0} kV outside 0..={MAX_VOLTAGE} kV")]
    Voltage(f64),
    #[error("current {0} mA outside 0..={MAX_CURRENT} mA")]
    Current(f64),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("response truncated ({0} bytes)")]
    Length(usize),
    #[error("checksum mismatch (expected {expected:02X}, received {received:02X})")]
    Checksum { expected: u8, received: u8 },
    #[error("non-hex digit in numeric field")]
    Digit,
    #[error("unknown response tag {0:#04X}")]
    Tag(u8),
}

/// Error codes reported by the device in an `E` frame.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum DeviceFault {
    #[error("undefined command code")]
    UndefinedCommand,
    #[error("checksum error in received command")]
    Checksum,
    #[error("extra bytes received")]
    ExtraBytes,
    #[error("illegal digital control byte in set command")]
    IllegalControl,
    #[error("set command received while a fault is active")]
    SetDuringFault,
    #[error("processing error")]
    Processing,
    #[error("unrecognised error code {0}")]
    Unknown(u8),
}

/* === Scaling === */

pub fn voltage_counts(kv: f64) -> Result<u16, RangeError> {
    if !(0.0..=MAX_VOLTAGE).contains(&kv) {
        return Err(RangeError::Voltage(kv));
    }

    Ok((kv * FULL_SCALE_SET as f64 / MAX_VOLTAGE).round() as u16)
}

pub fn current_counts(ma: f64) -> Result<u16, RangeError> {
    if !(0.0..=MAX_CURRENT).contains(&ma) {
        return Err(RangeError::Current(ma));
    }

    Ok((ma * FULL_SCALE_SET as f64 / MAX_CURRENT).round() as u16)
}

/// Readback counts to kV, reported to 0.1 kV like the front panel.
pub fn voltage_kv(counts: u16) -> f64 {
    round_tenth(counts as f64 * MAX_VOLTAGE / FULL_SCALE_READ as f64)
}

pub fn current_ma(counts: u16) -> f64 {
    round_tenth(counts as f64 * MAX_CURRENT / FULL_SCALE_READ as f64)
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Arithmetic checksum: sum of the covered bytes, modulo 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &byte| acc.wrapping_add(byte))
}

/* === Implementations === */

impl Request {
    pub fn set_output(setpoint: Setpoint, control: DigitalControl) -> Result<Self, RangeError> {
        Ok(Request::SetOutput {
            voltage: voltage_counts(setpoint.voltage)?,
            current: current_counts(setpoint.current)?,
            control,
        })
    }

    /// Zero setpoint plus power-off, independent of any prior state.
    pub fn reset() -> Self {
        Request::SetOutput {
            voltage: 0,
            current: 0,
            control: DigitalControl::Reset,
        }
    }

    fn encode_body<B: BufMut>(&self, buf: &mut B) {
        match self {
            Request::Query => buf.put_u8(b'Q'),

            Request::SetOutput {
                voltage,
                current,
                control,
            } => {
                buf.put_u8(b'S');
                buf.put_hex3(*voltage);
                buf.put_hex3(*current);
                buf.put_slice(b"000000");
                buf.put_u8(control.digit());
            }

            Request::Version => buf.put_u8(b'V'),

            Request::SetCommTimeout(enabled) => {
                buf.put_u8(b'C');
                buf.put_u8(if *enabled { b'0' } else { b'1' });
            }
        }
    }
}

impl Encode for Request {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut body = Vec::with_capacity(16);
        self.encode_body(&mut body);

        buf.put_u8(SOH);
        buf.put_slice(&body);
        buf.put_hex2(checksum(&body));
        buf.put_u8(CR);
    }
}

impl DigitalControl {
    fn digit(self) -> u8 {
        match self {
            DigitalControl::HvOff => b'1',
            DigitalControl::HvOn => b'2',
            DigitalControl::Reset => b'4',
        }
    }
}

impl Response {
    /// Parses one response line (CR already stripped).
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        let (&tag, rest) = frame.split_first().ok_or(FrameError::Length(0))?;

        // A set command is acknowledged with a bare `A`, no checksum.
        if tag == b'A' {
            return match rest.len() {
                0 => Ok(Response::Ack),
                _ => Err(FrameError::Length(frame.len())),
            };
        }

        if rest.len() < 2 {
            return Err(FrameError::Length(frame.len()));
        }

        let (payload, sum) = rest.split_at(rest.len() - 2);
        let received = parse_hex(sum).ok_or(FrameError::Digit)? as u8;
        let expected = checksum(payload);

        if expected != received {
            return Err(FrameError::Checksum { expected, received });
        }

        match tag {
            b'R' => Ok(Response::Status(decode_status(payload)?)),

            b'B' => Ok(Response::Version(
                String::from_utf8_lossy(payload).into_owned(),
            )),

            b'E' => {
                let code = match payload.first() {
                    Some(digit @ b'0'..=b'9') => digit - b'0',
                    _ => return Err(FrameError::Digit),
                };

                Ok(Response::Fault(DeviceFault::from_code(code)))
            }

            other => Err(FrameError::Tag(other)),
        }
    }
}

/// Status payload: 3-hex voltage, 3-hex current, 3-hex unused monitor
/// field, then one hex status nibble (output-on, fault, mode).
fn decode_status(payload: &[u8]) -> Result<DeviceStatus, FrameError> {
    if payload.len() != STATUS_PAYLOAD_LEN {
        return Err(FrameError::Length(payload.len()));
    }

    let voltage = parse_hex(&payload[0..3]).ok_or(FrameError::Digit)?;
    let current = parse_hex(&payload[3..6]).ok_or(FrameError::Digit)?;
    let word = parse_hex(&payload[9..10]).ok_or(FrameError::Digit)?;

    Ok(DeviceStatus {
        voltage: voltage_kv(voltage),
        current: current_ma(current),
        output_on: word & 0b100 != 0,
        fault: word & 0b010 != 0,
        mode: match word & 0b001 {
            0 => ControlMode::Voltage,
            _ => ControlMode::Current,
        },
    })
}

impl DeviceFault {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => DeviceFault::UndefinedCommand,
            2 => DeviceFault::Checksum,
            3 => DeviceFault::ExtraBytes,
            4 => DeviceFault::IllegalControl,
            5 => DeviceFault::SetDuringFault,
            6 => DeviceFault::Processing,
            other => DeviceFault::Unknown(other),
        }
    }
}

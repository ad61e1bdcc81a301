use std::fmt;

use serde::{Deserialize, Serialize};
use strum::Display;

/// Rated output of the FJ40P03 (positive polarity, 40 kV, 3 mA).
pub const MAX_VOLTAGE: f64 = 40.0;
pub const MAX_CURRENT: f64 = 3.0;

/// Snapshot decoded from a single status frame. Replaced wholesale on
/// every poll, never mutated in place.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct DeviceStatus {
    /// Measured output voltage in kV.
    pub voltage: f64,
    /// Measured output current in mA.
    pub current: f64,
    pub output_on: bool,
    pub fault: bool,
    pub mode: ControlMode,
}

/// Which regulation loop the supply is currently limited by.
#[derive(Copy, Clone, Debug, Default, Deserialize, Display, Eq, PartialEq, Serialize)]
#[strum(serialize_all = "lowercase")]
pub enum ControlMode {
    #[default]
    Voltage,
    Current,
}

/// User-commanded output target. Only mutated by an explicit command,
/// never by the poller.
#[derive(Copy, Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Setpoint {
    /// Target voltage in kV.
    pub voltage: f64,
    /// Current limit in mA.
    pub current: f64,
}

/// The published view of the device. `stale` is raised when the latest
/// poll produced a corrupt response and `status` is a re-report of the
/// previous snapshot.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Telemetry {
    pub status: DeviceStatus,
    pub stale: bool,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:5.1} kV  {:4.1} mA  {} mode  HV {}",
            self.voltage,
            self.current,
            self.mode,
            if self.output_on { "on" } else { "off" },
        )?;

        if self.fault {
            write!(f, "  FAULT")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_line_is_readable() {
        let status = DeviceStatus {
            voltage: 39.8,
            current: 2.1,
            output_on: true,
            fault: false,
            mode: ControlMode::Voltage,
        };

        assert_eq!(status.to_string(), " 39.8 kV   2.1 mA  voltage mode  HV on");
    }

    #[test]
    fn fault_is_flagged() {
        let status = DeviceStatus {
            fault: true,
            ..Default::default()
        };

        assert!(status.to_string().ends_with("FAULT"));
    }
}

use std::time::Duration;

use ferrodrive_control::ControlError;
use ferrodrive_kinematics::KinematicsError;
use thiserror::Error;

/// Failure reported by an injected hardware capability.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("device disconnected")]
    Disconnected,
    #[error("reading out of range: {0}")]
    OutOfRange(f64),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ChassisError {
    /// The IMU did not finish self-calibration in time. Tracking continues with
    /// degraded heading accuracy.
    #[error("IMU calibration did not finish after {attempts} attempt(s) of {timeout:?}")]
    CalibrationTimeout { attempts: u32, timeout: Duration },

    /// A sensor read failed or returned an unusable value. The last good pose is held.
    #[error("sensor read fault on {device}: {source}")]
    SensorReadFault {
        device: &'static str,
        #[source]
        source: DeviceError,
    },

    /// The drive motors rejected a command.
    #[error("drive motor command failed: {0}")]
    MotorFault(#[source] DeviceError),

    /// Geometry or controller settings violate their constraints.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl ChassisError {
    pub(crate) fn sensor(device: &'static str, source: DeviceError) -> Self {
        ChassisError::SensorReadFault { device, source }
    }
}

impl From<KinematicsError> for ChassisError {
    fn from(err: KinematicsError) -> Self {
        ChassisError::InvalidConfiguration(err.to_string())
    }
}

impl From<ControlError> for ChassisError {
    fn from(err: ControlError) -> Self {
        ChassisError::InvalidConfiguration(err.to_string())
    }
}

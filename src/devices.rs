//! Hardware capabilities the chassis is built from.
//!
//! Motor groups, encoders and the IMU are injected as trait objects so the
//! control core never touches global device handles and can run against the
//! [`sim`](crate::sim) robot.

use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ChassisError, DeviceError};

/// An absolute-position rotation encoder.
pub trait RotationSensor: Send {
    /// Accumulated rotation since the last reset, in degrees.
    fn position_degrees(&mut self) -> Result<f64, DeviceError>;

    /// Zero the accumulated rotation.
    fn reset_position(&mut self) -> Result<(), DeviceError>;
}

/// A sensor reporting linear distance travelled along one axis of the robot.
pub trait DistanceSensor: Send {
    /// Distance travelled since the last reset.
    fn cumulative_distance(&mut self) -> Result<f64, DeviceError>;

    /// Zero the travelled distance.
    fn reset(&mut self) -> Result<(), DeviceError>;

    /// Signed distance from the tracking center, perpendicular to the travel
    /// direction, positive to the sensor's right.
    fn offset(&self) -> f64;
}

/// Gyroscope/accelerometer heading source.
pub trait InertialSensor: Send {
    /// Absolute heading in degrees, clockwise positive.
    fn heading(&mut self) -> Result<f64, DeviceError>;

    /// Begin the sensor's self-calibration routine.
    fn start_calibration(&mut self) -> Result<(), DeviceError>;

    /// Whether calibration is still running.
    fn is_calibrating(&mut self) -> Result<bool, DeviceError>;
}

/// Left and right drive motor groups.
pub trait DriveMotors: Send {
    /// Apply a normalized velocity command to both sides.
    fn command(&mut self, command: WheelCommand) -> Result<(), DeviceError>;
}

/// Joystick-style operator input.
pub trait ManualInput: Send {
    /// `(forward, turn)` axis readings in `[-1, 1]`.
    fn axes(&mut self) -> Result<(f64, f64), DeviceError>;
}

/// Drive motors shared between the motion task and manual control.
pub type SharedDrive = Arc<Mutex<Box<dyn DriveMotors>>>;

/// Normalized left/right drive command, each side in `[-1, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WheelCommand {
    pub left: f64,
    pub right: f64,
}

impl WheelCommand {
    pub const STOP: WheelCommand = WheelCommand {
        left: 0.0,
        right: 0.0,
    };

    /// Builds a command, clamping each side into range. Non-finite sides read as 0.
    pub fn clamped(left: f64, right: f64) -> Self {
        WheelCommand {
            left: sanitize(left).clamp(-1.0, 1.0),
            right: sanitize(right).clamp(-1.0, 1.0),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.left == 0.0 && self.right == 0.0
    }
}

impl fmt::Display for WheelCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(L: {:+.2}, R: {:+.2})", self.left, self.right)
    }
}

pub(crate) fn sanitize(value: f64) -> f64 {
    if value.is_finite() { value } else { 0.0 }
}

/// An unpowered odometry wheel on a rotation encoder.
pub struct TrackingWheel {
    encoder: Box<dyn RotationSensor>,
    diameter: f64,
    offset: f64,
    gear_ratio: f64,
}

impl TrackingWheel {
    /// # Errors
    ///
    /// Returns [`ChassisError::InvalidConfiguration`] if `diameter` or
    /// `gear_ratio` is not positive, or `offset` is not finite.
    pub fn new(
        encoder: Box<dyn RotationSensor>,
        diameter: f64,
        offset: f64,
        gear_ratio: f64,
    ) -> Result<Self, ChassisError> {
        if !(diameter > 0.0) || !diameter.is_finite() {
            return Err(ChassisError::InvalidConfiguration(format!(
                "tracking wheel diameter must be positive, got {diameter}"
            )));
        }
        if !(gear_ratio > 0.0) || !gear_ratio.is_finite() {
            return Err(ChassisError::InvalidConfiguration(format!(
                "tracking wheel gear ratio must be positive, got {gear_ratio}"
            )));
        }
        if !offset.is_finite() {
            return Err(ChassisError::InvalidConfiguration(
                "tracking wheel offset must be finite".into(),
            ));
        }
        Ok(Self {
            encoder,
            diameter,
            offset,
            gear_ratio,
        })
    }
}

impl DistanceSensor for TrackingWheel {
    fn cumulative_distance(&mut self) -> Result<f64, DeviceError> {
        let degrees = self.encoder.position_degrees()?;
        if !degrees.is_finite() {
            return Err(DeviceError::OutOfRange(degrees));
        }
        Ok(degrees / 360.0 * PI * self.diameter * self.gear_ratio)
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.encoder.reset_position()
    }

    fn offset(&self) -> f64 {
        self.offset
    }
}

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![doc = "A `no_std` library for 2D differential-drive pose math."]
#![doc = ""]
#![doc = "Headings are in degrees, measured clockwise from the field's +y axis, so heading 0"]
#![doc = "faces +y and heading 90 faces +x. Distances are in whatever linear unit the"]
#![doc = "caller measures wheels in (inches on a competition field)."]

use core::f64::consts::PI;
use core::fmt;
use libm::{atan2, cos, fabs, hypot, sin};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub mod error;
pub use error::KinematicsError;

const DEG_TO_RAD: f64 = PI / 180.0;
const RAD_TO_DEG: f64 = 180.0 / PI;

/// Normalize a heading in degrees to `[-180, 180)`.
///
/// A heading of exactly 180 maps to -180. Values already in range are
/// returned unchanged, bit for bit.
pub fn normalize_heading(heading: f64) -> f64 {
    let a = heading % 360.0;
    if a >= 180.0 {
        a - 360.0
    } else if a < -180.0 {
        a + 360.0
    } else {
        a
    }
}

/// Shortest signed rotation from `current` to `target`, in `(-180, 180]` degrees.
///
/// Positive values are clockwise. A half turn is always reported as +180.
pub fn angle_error(target: f64, current: f64) -> f64 {
    let e = normalize_heading(target - current);
    if e == -180.0 { 180.0 } else { e }
}

/// Chord length travelled by the tracking center, given the distance a
/// tracking wheel measured over a step and the heading change (radians).
///
/// `offset` is the wheel's signed distance from the tracking center, measured
/// perpendicular to its travel direction and positive to the wheel's right.
/// With no rotation the chord is exactly the measured distance.
pub fn arc_chord(delta: f64, delta_theta: f64, offset: f64) -> f64 {
    if fabs(delta_theta) < 1e-9 {
        delta
    } else {
        2.0 * sin(delta_theta / 2.0) * (delta / delta_theta + offset)
    }
}

/// A 2‑D field pose `(x, y, heading)`.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Pose {
    /// Field x position.
    pub x: f64,
    /// Field y position.
    pub y: f64,
    /// Heading (deg, clockwise from +y), normalized to `[-180, 180)`.
    pub heading: f64,
}

impl Pose {
    /// Construct a new pose. The heading is normalized.
    ///
    /// # Arguments
    ///
    /// * `x`: Field x position.
    /// * `y`: Field y position.
    /// * `heading`: Heading in degrees.
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Pose {
            x,
            y,
            heading: normalize_heading(heading),
        }
    }

    /// Straight-line distance to a point.
    pub fn distance_to(&self, x: f64, y: f64) -> f64 {
        hypot(x - self.x, y - self.y)
    }

    /// Heading (deg) the robot would need to face to look at a point.
    pub fn bearing_to(&self, x: f64, y: f64) -> f64 {
        normalize_heading(atan2(x - self.x, y - self.y) * RAD_TO_DEG)
    }

    /// Integrates a robot-frame displacement into this pose.
    ///
    /// The displacement is rotated into the field frame using the heading at
    /// the middle of the step. The resulting heading is normalized.
    ///
    /// # Arguments
    ///
    /// * `local`: Displacement measured in the robot frame over the step.
    /// * `delta_heading`: Heading change over the step in degrees.
    pub fn integrate(&self, local: LocalDisplacement, delta_heading: f64) -> Pose {
        let mid = (self.heading + delta_heading / 2.0) * DEG_TO_RAD;
        let (s, c) = (sin(mid), cos(mid));
        Pose {
            x: self.x + local.forward * s + local.lateral * c,
            y: self.y + local.forward * c - local.lateral * s,
            heading: normalize_heading(self.heading + delta_heading),
        }
    }
}

impl fmt::Display for Pose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(x: {:.2}, y: {:.2}, θ: {:.2}°)", self.x, self.y, self.heading)
    }
}

/// A displacement expressed in the robot frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocalDisplacement {
    /// Distance travelled along the robot's forward axis.
    pub forward: f64,
    /// Distance travelled towards the robot's right.
    pub lateral: f64,
}

impl LocalDisplacement {
    /// Construct a local displacement.
    pub const fn new(forward: f64, lateral: f64) -> Self {
        LocalDisplacement { forward, lateral }
    }
}

/// Left and right wheel surface velocities.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WheelSpeeds {
    /// Left wheel linear velocity (units/s).
    pub left: f64,
    /// Right wheel linear velocity (units/s).
    pub right: f64,
}

impl WheelSpeeds {
    /// Construct wheel speeds.
    pub const fn new(left: f64, right: f64) -> Self {
        WheelSpeeds { left, right }
    }
}

impl fmt::Display for WheelSpeeds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(vL: {:.2}/s, vR: {:.2}/s)", self.left, self.right)
    }
}

/// Linear and angular chassis velocities.
/// These represent the overall motion of the robot's chassis.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChassisSpeeds {
    /// Linear speed of the chassis center (units/s).
    pub v: f64,
    /// Angular speed of the chassis (rad/s, clockwise positive).
    pub omega: f64,
}

impl ChassisSpeeds {
    /// Construct chassis speeds.
    pub const fn new(v: f64, omega: f64) -> Self {
        ChassisSpeeds { v, omega }
    }
}

impl fmt::Display for ChassisSpeeds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(v: {:.2}/s, ω: {:.2} rad/s)", self.v, self.omega)
    }
}

/// Differential‑drive geometry.
///
/// This struct encapsulates the physical parameters of a differential-drive robot
/// (track width, drive wheel diameter and wheel rpm) and provides methods for
/// kinematic calculations.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DifferentialDrive {
    /// Distance between the left and right wheel contact lines.
    track_width: f64,
    /// Drive wheel diameter.
    wheel_diameter: f64,
    /// Drive wheel rpm at full power, after gearing.
    rpm: f64,
}

impl DifferentialDrive {
    /// Construct a new differential‑drive geometry.
    ///
    /// # Errors
    ///
    /// Returns `Err(KinematicsError::InvalidTrackWidth)` if `track_width` is not positive,
    /// `Err(KinematicsError::InvalidWheelDiameter)` if `wheel_diameter` is not positive and
    /// `Err(KinematicsError::InvalidRpm)` if `rpm` is not positive.
    pub fn new(track_width: f64, wheel_diameter: f64, rpm: f64) -> Result<Self, KinematicsError> {
        if !(track_width > 0.0) || !track_width.is_finite() {
            return Err(KinematicsError::InvalidTrackWidth("must be positive"));
        }
        if !(wheel_diameter > 0.0) || !wheel_diameter.is_finite() {
            return Err(KinematicsError::InvalidWheelDiameter("must be positive"));
        }
        if !(rpm > 0.0) || !rpm.is_finite() {
            return Err(KinematicsError::InvalidRpm("must be positive"));
        }
        Ok(DifferentialDrive {
            track_width,
            wheel_diameter,
            rpm,
        })
    }

    /// Returns the track width.
    pub fn track_width(&self) -> f64 {
        self.track_width
    }

    /// Returns the drive wheel diameter.
    pub fn wheel_diameter(&self) -> f64 {
        self.wheel_diameter
    }

    /// Surface speed of a drive wheel at full power (units/s).
    pub fn max_wheel_speed(&self) -> f64 {
        PI * self.wheel_diameter * self.rpm / 60.0
    }

    /// Calculates the robot's chassis speeds from the wheel surface speeds.
    /// This is the forward kinematics problem.
    pub fn forward_kinematics(&self, wheel_speeds: WheelSpeeds) -> ChassisSpeeds {
        let v = (wheel_speeds.left + wheel_speeds.right) / 2.0;
        let omega = (wheel_speeds.left - wheel_speeds.right) / self.track_width;
        ChassisSpeeds::new(v, omega)
    }

    /// Updates the robot's pose given its current pose, chassis speeds, and time delta.
    ///
    /// Assumes constant chassis speeds over `dt`, so the robot moves along a
    /// circular arc. The final heading is normalized to `[-180, 180)`.
    ///
    /// # Errors
    ///
    /// Returns `Err(KinematicsError::NegativeTimeDelta)` if `dt` is negative.
    pub fn update_pose(
        &self,
        current_pose: Pose,
        chassis_speeds: ChassisSpeeds,
        dt: f64,
    ) -> Result<Pose, KinematicsError> {
        if dt < 0.0 {
            return Err(KinematicsError::NegativeTimeDelta("must be non-negative"));
        }

        let delta_theta = chassis_speeds.omega * dt;
        let forward = arc_chord(chassis_speeds.v * dt, delta_theta, 0.0);
        Ok(current_pose.integrate(
            LocalDisplacement::new(forward, 0.0),
            delta_theta * RAD_TO_DEG,
        ))
    }
}

impl fmt::Display for DifferentialDrive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DifferentialDrive (track: {:.2}, wheel: {:.2}, rpm: {:.0})",
            self.track_width, self.wheel_diameter, self.rpm
        )
    }
}

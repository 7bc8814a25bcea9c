//! Motion control for differential-drive robots.
//!
//! Pose tracking from tracking wheels and an IMU, PID-driven point and heading
//! motions, and arcade/tank manual drive, all behind a [`Chassis`]. Hardware is
//! injected through the traits in [`devices`]; [`sim`] provides a simulated
//! robot for tests and the demo binary.

pub mod blackboard;
pub mod bus;
pub mod chassis;
pub mod config;
pub mod devices;
pub mod error;
pub mod motion;
pub mod odometry;
pub mod sim;

pub use chassis::{Chassis, ChassisConfig, arcade, tank};
pub use error::{ChassisError, DeviceError};
pub use ferrodrive_control::{ControllerSettings, SettleBand};
pub use ferrodrive_kinematics::{DifferentialDrive, Pose};
pub use motion::{
    MotionHandle, MotionOutcome, MotionReport, MoveToPointParams, TurnDirection,
    TurnToHeadingParams, TurnToPointParams,
};

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![doc = "A `no_std` feedback controller for drivetrain motion."]
#![doc = ""]
#![doc = "[`PidController`] combines proportional, integral and derivative terms with"]
#![doc = "integral anti-windup, an optional slew limit on the output and a dual-band"]
#![doc = "settling detector: a motion is finished once its error stays inside a tight band"]
#![doc = "for a short time, or inside a loose band for a longer time."]

pub mod error;
mod pid;
mod settings;

pub use error::ControlError;
pub use pid::{ControllerState, PidController, SettleBand};
pub use settings::ControllerSettings;

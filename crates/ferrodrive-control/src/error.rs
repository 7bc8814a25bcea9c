//! Error types for controller construction.

use core::fmt;

/// Errors raised when controller settings violate their constraints.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlError {
    /// A gain (`kp`, `ki` or `kd`) is negative or not finite.
    InvalidGain(&'static str),
    /// `windup_range` is negative or not finite.
    InvalidWindupRange(&'static str),
    /// An exit band range is negative or not finite.
    InvalidExitRange(&'static str),
    /// `max_acceleration` is negative or not finite.
    InvalidSlew(&'static str),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::InvalidGain(msg) => write!(f, "Invalid gain: {}", msg),
            ControlError::InvalidWindupRange(msg) => write!(f, "Invalid windup range: {}", msg),
            ControlError::InvalidExitRange(msg) => write!(f, "Invalid exit range: {}", msg),
            ControlError::InvalidSlew(msg) => write!(f, "Invalid max acceleration: {}", msg),
        }
    }
}

impl core::error::Error for ControlError {}

use core::time::Duration;

use crate::ControlError;

/// Tuning for one control axis (linear or angular).
///
/// Errors are in the axis' own unit (inches for linear, degrees for angular).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    /// Proportional gain.
    pub kp: f64,
    /// Integral gain.
    pub ki: f64,
    /// Derivative gain.
    pub kd: f64,
    /// The integral only accumulates while `|error| <= windup_range`.
    pub windup_range: f64,
    /// Tight settling band.
    pub small_error: f64,
    /// Time the error must stay inside the tight band.
    pub small_error_timeout: Duration,
    /// Loose settling band.
    pub large_error: f64,
    /// Time the error must stay inside the loose band.
    pub large_error_timeout: Duration,
    /// Largest per-step increase in output magnitude. 0 disables the limit.
    pub max_acceleration: f64,
}

impl ControllerSettings {
    /// Checks every field against its constraints.
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint: gains, windup range, band ranges
    /// and `max_acceleration` must all be finite and non-negative.
    pub fn validate(&self) -> Result<(), ControlError> {
        if !non_negative(self.kp) || !non_negative(self.ki) || !non_negative(self.kd) {
            return Err(ControlError::InvalidGain("must be finite and non-negative"));
        }
        if !non_negative(self.windup_range) {
            return Err(ControlError::InvalidWindupRange(
                "must be finite and non-negative",
            ));
        }
        if !non_negative(self.small_error) || !non_negative(self.large_error) {
            return Err(ControlError::InvalidExitRange(
                "must be finite and non-negative",
            ));
        }
        if !non_negative(self.max_acceleration) {
            return Err(ControlError::InvalidSlew("must be finite and non-negative"));
        }
        Ok(())
    }
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

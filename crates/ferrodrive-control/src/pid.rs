use core::time::Duration;

use libm::fabs;

use crate::{ControlError, ControllerSettings};

/// Which settling band finished a motion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleBand {
    /// The error stayed inside `small_error` for `small_error_timeout`.
    Small,
    /// The error stayed inside `large_error` for `large_error_timeout`.
    Large,
}

/// Mutable controller memory, cleared by [`PidController::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControllerState {
    /// Accumulated `error * dt`.
    pub integral: f64,
    /// Error of the previous step, `None` right after a reset.
    pub previous_error: Option<f64>,
    /// Output of the previous step, or the value the caller reported applying
    /// instead. The reference for slew limiting.
    pub previous_output: f64,
    /// Time spent continuously inside the small band, `None` when outside.
    pub time_in_small_error: Option<Duration>,
    /// Time spent continuously inside the large band, `None` when outside.
    pub time_in_large_error: Option<Duration>,
}

/// PID controller for one axis.
#[derive(Debug, Clone)]
pub struct PidController {
    settings: ControllerSettings,
    state: ControllerState,
}

impl PidController {
    /// Creates a controller from validated settings.
    ///
    /// # Errors
    ///
    /// Returns the [`ControlError`] reported by [`ControllerSettings::validate`].
    pub fn new(settings: ControllerSettings) -> Result<Self, ControlError> {
        settings.validate()?;
        Ok(Self {
            settings,
            state: ControllerState::default(),
        })
    }

    /// The settings this controller was built with.
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Current controller memory.
    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    /// Clears integral, derivative history, slew reference and settle timers.
    pub fn reset(&mut self) {
        self.state = ControllerState::default();
    }

    /// Advances the controller by one step and returns its output.
    ///
    /// # Arguments
    ///
    /// * `error`: Signed error for this step.
    /// * `dt`: Time since the previous step.
    pub fn step(&mut self, error: f64, dt: Duration) -> f64 {
        self.step_with_band_error(error, error, dt)
    }

    /// Like [`PidController::step`], but times the settling bands on
    /// `band_error` instead of the control error.
    pub fn step_with_band_error(&mut self, error: f64, band_error: f64, dt: Duration) -> f64 {
        let s = &self.settings;
        let secs = dt.as_secs_f64();
        let magnitude = fabs(error);
        let band_magnitude = fabs(band_error);

        if magnitude <= s.windup_range {
            self.state.integral += error * secs;
        } else {
            self.state.integral = 0.0;
        }

        let derivative = match self.state.previous_error {
            Some(previous) if secs > 0.0 => (error - previous) / secs,
            _ => 0.0,
        };

        let mut output = s.kp * error + s.ki * self.state.integral + s.kd * derivative;

        let previous_output = self.state.previous_output;
        if s.max_acceleration > 0.0 && fabs(output) > fabs(previous_output) {
            let change = (output - previous_output).clamp(-s.max_acceleration, s.max_acceleration);
            output = previous_output + change;
        }

        self.state.time_in_small_error =
            advance_band(self.state.time_in_small_error, band_magnitude <= s.small_error, dt);
        self.state.time_in_large_error =
            advance_band(self.state.time_in_large_error, band_magnitude <= s.large_error, dt);

        self.state.previous_error = Some(error);
        self.state.previous_output = output;
        output
    }

    /// Records the output the caller actually applied after its own clamping,
    /// so the next step's slew limit starts from it.
    pub fn record_applied(&mut self, output: f64) {
        self.state.previous_output = output;
    }

    /// The band that has been held long enough, preferring the small band.
    pub fn settled(&self) -> Option<SettleBand> {
        let held = |time: Option<Duration>, timeout: Duration| time.is_some_and(|t| t >= timeout);
        if held(self.state.time_in_small_error, self.settings.small_error_timeout) {
            Some(SettleBand::Small)
        } else if held(self.state.time_in_large_error, self.settings.large_error_timeout) {
            Some(SettleBand::Large)
        } else {
            None
        }
    }

    /// True once either settling band has been held for its timeout.
    pub fn is_settled(&self) -> bool {
        self.settled().is_some()
    }
}

// Entering a band starts its timer at zero; staying inside accumulates dt.
fn advance_band(time: Option<Duration>, inside: bool, dt: Duration) -> Option<Duration> {
    match (inside, time) {
        (false, _) => None,
        (true, None) => Some(Duration::ZERO),
        (true, Some(t)) => Some(t + dt),
    }
}

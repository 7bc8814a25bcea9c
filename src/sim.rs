//! Simulated differential-drive robot.
//!
//! The sim integrates lazily: every device call first advances the true pose
//! to the current [`tokio::time::Instant`] in 1 ms sub-steps, using whatever
//! wheel command was last applied. Under a paused tokio clock this makes
//! runs fully deterministic.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::Arc;
use std::time::Duration;

use ferrodrive_kinematics::{DifferentialDrive, Pose, WheelSpeeds};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::devices::{
    DriveMotors, InertialSensor, ManualInput, RotationSensor, SharedDrive, TrackingWheel,
    WheelCommand,
};
use crate::error::{ChassisError, DeviceError};

const SUB_STEP: Duration = Duration::from_millis(1);
const HISTORY_CAPACITY: usize = 4096;

/// Which way a simulated tracking wheel rolls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Vertical,
    Horizontal,
}

/// Devices that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    Drive,
    Imu,
    Encoders,
}

#[derive(Debug)]
struct Encoder {
    axis: Axis,
    offset: f64,
    diameter: f64,
    degrees: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct FaultState {
    latched: bool,
    remaining: u32,
}

impl FaultState {
    // Consumes one injected failure, if any.
    fn trip(&mut self) -> bool {
        if self.latched {
            return true;
        }
        if self.remaining > 0 {
            self.remaining -= 1;
            return true;
        }
        false
    }
}

#[derive(Debug, Default)]
struct Faults {
    drive: FaultState,
    imu: FaultState,
    encoders: FaultState,
}

impl Faults {
    fn get_mut(&mut self, fault: SimFault) -> &mut FaultState {
        match fault {
            SimFault::Drive => &mut self.drive,
            SimFault::Imu => &mut self.imu,
            SimFault::Encoders => &mut self.encoders,
        }
    }
}

#[derive(Debug)]
struct SimState {
    drive: DifferentialDrive,
    truth: Pose,
    command: WheelCommand,
    // Most recent commands, oldest first.
    history: VecDeque<WheelCommand>,
    clock: Instant,
    encoders: Vec<Encoder>,
    // `None` means a started calibration never completes.
    imu_calibration: Option<Duration>,
    imu_ready_at: Option<Instant>,
    imu_calibrating: bool,
    imu_offset: f64,
    faults: Faults,
}

impl SimState {
    fn advance(&mut self) {
        let now = Instant::now();
        let max_speed = self.drive.max_wheel_speed();
        while self.clock < now {
            let step = (now - self.clock).min(SUB_STEP);
            let dt = step.as_secs_f64();
            let speeds = WheelSpeeds::new(
                self.command.left * max_speed,
                self.command.right * max_speed,
            );
            let chassis = self.drive.forward_kinematics(speeds);
            if let Ok(pose) = self.drive.update_pose(self.truth, chassis, dt) {
                self.truth = pose;
            }
            // Arc length travelled by a point `offset` to the right of center.
            for encoder in &mut self.encoders {
                let travel = match encoder.axis {
                    Axis::Vertical => (chassis.v - encoder.offset * chassis.omega) * dt,
                    Axis::Horizontal => -encoder.offset * chassis.omega * dt,
                };
                encoder.degrees += travel / (PI * encoder.diameter) * 360.0;
            }
            self.clock += step;
        }
        if self.imu_calibrating && self.imu_ready_at.is_some_and(|at| now >= at) {
            self.imu_calibrating = false;
        }
    }
}

/// Shared handle to one simulated robot. Clones refer to the same robot.
#[derive(Debug, Clone)]
pub struct SimRobot {
    state: Arc<Mutex<SimState>>,
}

impl SimRobot {
    pub fn new(drive: DifferentialDrive) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                drive,
                truth: Pose::default(),
                command: WheelCommand::STOP,
                history: VecDeque::with_capacity(HISTORY_CAPACITY),
                clock: Instant::now(),
                encoders: Vec::new(),
                imu_calibration: Some(Duration::from_millis(200)),
                imu_ready_at: None,
                imu_calibrating: false,
                imu_offset: 0.0,
                faults: Faults::default(),
            })),
        }
    }

    /// How long a started IMU calibration takes. `None` never finishes.
    pub fn with_imu_calibration(self, duration: Option<Duration>) -> Self {
        self.state.lock().imu_calibration = duration;
        self
    }

    /// Constant bias added to every IMU heading reading.
    pub fn with_imu_offset(self, degrees: f64) -> Self {
        self.state.lock().imu_offset = degrees;
        self
    }

    /// The true pose, advanced to now.
    pub fn truth(&self) -> Pose {
        let mut state = self.state.lock();
        state.advance();
        state.truth
    }

    /// Makes every call on the device fail until cleared.
    pub fn set_fault(&self, fault: SimFault, active: bool) {
        self.state.lock().faults.get_mut(fault).latched = active;
    }

    /// Makes the next `calls` calls on the device fail.
    pub fn fail_next(&self, fault: SimFault, calls: u32) {
        self.state.lock().faults.get_mut(fault).remaining = calls;
    }

    pub fn last_command(&self) -> WheelCommand {
        self.state.lock().command
    }

    /// The most recent commands the motors accepted, oldest first.
    pub fn commands(&self) -> Vec<WheelCommand> {
        self.state.lock().history.iter().copied().collect()
    }

    pub fn drive(&self) -> SharedDrive {
        Arc::new(Mutex::new(Box::new(SimMotors {
            state: self.state.clone(),
        })))
    }

    pub fn imu(&self) -> SimImu {
        SimImu {
            state: self.state.clone(),
        }
    }

    pub fn encoder(&self, axis: Axis, diameter: f64, offset: f64) -> SimEncoder {
        let mut state = self.state.lock();
        state.advance();
        state.encoders.push(Encoder {
            axis,
            offset,
            diameter,
            degrees: 0.0,
        });
        SimEncoder {
            state: self.state.clone(),
            index: state.encoders.len() - 1,
        }
    }

    /// A tracking wheel on a fresh simulated encoder.
    ///
    /// # Errors
    ///
    /// Returns [`ChassisError::InvalidConfiguration`] for invalid wheel geometry.
    pub fn tracking_wheel(
        &self,
        axis: Axis,
        diameter: f64,
        offset: f64,
    ) -> Result<TrackingWheel, ChassisError> {
        let encoder = self.encoder(axis, diameter, offset);
        TrackingWheel::new(Box::new(encoder), diameter, offset, 1.0)
    }
}

pub struct SimMotors {
    state: Arc<Mutex<SimState>>,
}

impl DriveMotors for SimMotors {
    fn command(&mut self, command: WheelCommand) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.faults.drive.trip() {
            return Err(DeviceError::Disconnected);
        }
        state.advance();
        state.command = command;
        if state.history.len() == HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(command);
        Ok(())
    }
}

pub struct SimEncoder {
    state: Arc<Mutex<SimState>>,
    index: usize,
}

impl RotationSensor for SimEncoder {
    fn position_degrees(&mut self) -> Result<f64, DeviceError> {
        let mut state = self.state.lock();
        if state.faults.encoders.trip() {
            return Err(DeviceError::Disconnected);
        }
        state.advance();
        state
            .encoders
            .get(self.index)
            .map(|e| e.degrees)
            .ok_or(DeviceError::Disconnected)
    }

    fn reset_position(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.faults.encoders.trip() {
            return Err(DeviceError::Disconnected);
        }
        state.advance();
        let encoder = state
            .encoders
            .get_mut(self.index)
            .ok_or(DeviceError::Disconnected)?;
        encoder.degrees = 0.0;
        Ok(())
    }
}

pub struct SimImu {
    state: Arc<Mutex<SimState>>,
}

impl InertialSensor for SimImu {
    fn heading(&mut self) -> Result<f64, DeviceError> {
        let mut state = self.state.lock();
        if state.faults.imu.trip() {
            return Err(DeviceError::Disconnected);
        }
        state.advance();
        Ok(state.truth.heading + state.imu_offset)
    }

    fn start_calibration(&mut self) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        if state.faults.imu.trip() {
            return Err(DeviceError::Disconnected);
        }
        state.advance();
        state.imu_calibrating = true;
        state.imu_ready_at = state.imu_calibration.map(|d| state.clock + d);
        Ok(())
    }

    fn is_calibrating(&mut self) -> Result<bool, DeviceError> {
        let mut state = self.state.lock();
        if state.faults.imu.trip() {
            return Err(DeviceError::Disconnected);
        }
        state.advance();
        Ok(state.imu_calibrating)
    }
}

/// Replays a fixed sequence of stick positions, then holds the last one.
#[derive(Debug, Default)]
pub struct ScriptedInput {
    script: VecDeque<(f64, f64)>,
    last: (f64, f64),
}

impl ScriptedInput {
    pub fn new(script: impl IntoIterator<Item = (f64, f64)>) -> Self {
        Self {
            script: script.into_iter().collect(),
            last: (0.0, 0.0),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.script.is_empty()
    }
}

impl ManualInput for ScriptedInput {
    fn axes(&mut self) -> Result<(f64, f64), DeviceError> {
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        Ok(self.last)
    }
}

#[cfg(test)]
pub(crate) fn test_robot() -> SimRobot {
    SimRobot::new(DifferentialDrive::new(10.5, 3.25, 450.0).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::DistanceSensor;
    use tokio::time;
    const EPSILON: f64 = 1e-6;

    #[tokio::test(start_paused = true)]
    async fn test_straight_drive_moves_along_heading() {
        let sim = test_robot();
        let max = DifferentialDrive::new(10.5, 3.25, 450.0).unwrap().max_wheel_speed();
        let mut wheel = sim.tracking_wheel(Axis::Vertical, 2.0, 3.0).unwrap();
        sim.drive().lock().command(WheelCommand::clamped(0.5, 0.5)).unwrap();
        time::sleep(Duration::from_secs(1)).await;

        let truth = sim.truth();
        assert!(truth.x.abs() < EPSILON);
        assert!((truth.y - 0.5 * max).abs() < EPSILON);
        assert!((wheel.cumulative_distance().unwrap() - 0.5 * max).abs() < EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spin_in_place_only_moves_offset_wheels() {
        let sim = test_robot();
        let mut centered = sim.tracking_wheel(Axis::Vertical, 2.0, 0.0).unwrap();
        let mut right = sim.tracking_wheel(Axis::Vertical, 2.0, 2.0).unwrap();
        let mut imu = sim.imu();
        sim.drive().lock().command(WheelCommand::clamped(0.2, -0.2)).unwrap();
        time::sleep(Duration::from_millis(100)).await;

        let heading = imu.heading().unwrap();
        assert!(heading > 0.0);
        assert!(centered.cumulative_distance().unwrap().abs() < EPSILON);
        // The right-hand wheel rolls backwards during a clockwise spin.
        let expected = -2.0 * heading.to_radians();
        assert!((right.cumulative_distance().unwrap() - expected).abs() < EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_imu_calibration_duration() {
        let sim = test_robot().with_imu_calibration(Some(Duration::from_millis(50)));
        let mut imu = sim.imu();
        imu.start_calibration().unwrap();
        assert!(imu.is_calibrating().unwrap());
        time::sleep(Duration::from_millis(50)).await;
        assert!(!imu.is_calibrating().unwrap());

        let stuck = test_robot().with_imu_calibration(None);
        let mut imu = stuck.imu();
        imu.start_calibration().unwrap();
        time::sleep(Duration::from_secs(60)).await;
        assert!(imu.is_calibrating().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_faults() {
        let sim = test_robot();
        let drive = sim.drive();
        sim.set_fault(SimFault::Drive, true);
        assert!(drive.lock().command(WheelCommand::STOP).is_err());
        assert!(sim.commands().is_empty());
        sim.set_fault(SimFault::Drive, false);
        assert!(drive.lock().command(WheelCommand::STOP).is_ok());

        let mut imu = sim.imu();
        sim.fail_next(SimFault::Imu, 2);
        assert_eq!(imu.heading(), Err(DeviceError::Disconnected));
        assert_eq!(imu.heading(), Err(DeviceError::Disconnected));
        assert!(imu.heading().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_history_keeps_most_recent() {
        let sim = test_robot();
        let drive = sim.drive();
        for i in 0..HISTORY_CAPACITY + 10 {
            let left = i as f64 * 1e-4;
            drive.lock().command(WheelCommand::clamped(left, 0.0)).unwrap();
        }
        let commands = sim.commands();
        assert_eq!(commands.len(), HISTORY_CAPACITY);
        assert!((commands[0].left - 10.0 * 1e-4).abs() < EPSILON);
        assert_eq!(commands.last(), Some(&sim.last_command()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_imu_offset() {
        let sim = test_robot().with_imu_offset(30.0);
        assert!((sim.imu().heading().unwrap() - 30.0).abs() < EPSILON);
        assert_eq!(sim.truth().heading, 0.0);
    }

    #[test]
    fn test_scripted_input_holds_last() {
        let mut input = ScriptedInput::new([(0.5, 0.0), (0.2, 0.1)]);
        assert_eq!(input.axes().unwrap(), (0.5, 0.0));
        assert_eq!(input.axes().unwrap(), (0.2, 0.1));
        assert!(input.is_exhausted());
        assert_eq!(input.axes().unwrap(), (0.2, 0.1));
    }
}

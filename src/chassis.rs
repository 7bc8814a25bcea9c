//! The public face of the crate: one differential-drive robot.
//!
//! A [`Chassis`] owns the odometry, the motion executor and the drive motors.
//! After [`Chassis::calibrate`] a background task keeps the pose current, and
//! motion commands read it from the shared blackboard.

use std::sync::Arc;
use std::time::Duration;

use ferrodrive_control::ControllerSettings;
use ferrodrive_kinematics::{DifferentialDrive, Pose};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::blackboard::{self, Blackboard, State};
use crate::bus::Topic;
use crate::config::Settings;
use crate::devices::{SharedDrive, WheelCommand, sanitize};
use crate::error::ChassisError;
use crate::motion::{
    MotionExecutor, MotionHandle, MotionReport, MotionSettings, MoveToPointParams,
    TurnToHeadingParams, TurnToPointParams,
};
use crate::odometry::{OdomSensors, Odometry, OdometrySettings};

const POSE_TOPIC_CAPACITY: usize = 64;

/// Validated-on-construction parameters of a [`Chassis`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChassisConfig {
    pub geometry: DifferentialDrive,
    pub linear: ControllerSettings,
    pub angular: ControllerSettings,
    pub odometry: OdometrySettings,
    pub motion: MotionSettings,
    pub initial_pose: Option<Pose>,
}

impl TryFrom<&Settings> for ChassisConfig {
    type Error = ChassisError;

    fn try_from(settings: &Settings) -> Result<Self, Self::Error> {
        Ok(ChassisConfig {
            geometry: settings.drivetrain.geometry()?,
            linear: settings.linear.into(),
            angular: settings.angular.into(),
            odometry: settings.odometry.settings(),
            motion: settings.motion.into(),
            initial_pose: settings.odometry.initial_pose,
        })
    }
}

/// Wheel command for single-stick driving: `left = forward + turn`,
/// `right = forward - turn`, each side clamped to `[-1, 1]`.
pub fn arcade(forward: f64, turn: f64) -> WheelCommand {
    let (forward, turn) = (sanitize(forward), sanitize(turn));
    WheelCommand::clamped(forward + turn, forward - turn)
}

/// Wheel command with each side set directly.
pub fn tank(left: f64, right: f64) -> WheelCommand {
    WheelCommand::clamped(left, right)
}

pub struct Chassis {
    odometry: Arc<Odometry>,
    motion: MotionExecutor,
    drive: SharedDrive,
    board: Blackboard,
    pose_topic: Topic<Pose>,
    tracking: Mutex<Option<JoinHandle<()>>>,
}

impl Chassis {
    /// Builds a chassis, rejecting invalid geometry, sensors or settings.
    ///
    /// # Errors
    ///
    /// Returns [`ChassisError::InvalidConfiguration`] naming the first problem found.
    pub fn new(
        config: ChassisConfig,
        drive: SharedDrive,
        sensors: OdomSensors,
    ) -> Result<Self, ChassisError> {
        let board: Blackboard = Arc::default();
        let pose_topic = Topic::new(POSE_TOPIC_CAPACITY);
        let odometry = Odometry::new(sensors, config.odometry, board.clone(), pose_topic.clone())?;
        let motion = MotionExecutor::new(
            drive.clone(),
            board.clone(),
            config.linear,
            config.angular,
            config.motion,
        )?;
        if let Some(pose) = config.initial_pose {
            odometry.set_pose(pose.x, pose.y, pose.heading);
        }
        info!(geometry = %config.geometry, "Chassis ready");

        Ok(Self {
            odometry: Arc::new(odometry),
            motion,
            drive,
            board,
            pose_topic,
            tracking: Mutex::new(None),
        })
    }

    /// Resets the sensors, calibrates the IMU and starts pose tracking.
    ///
    /// A calibration timeout is returned as an error but tracking still
    /// starts, with [`Chassis::heading_degraded`] set.
    pub async fn calibrate(&self) -> Result<(), ChassisError> {
        let result = self.odometry.calibrate().await;
        match result {
            Ok(()) | Err(ChassisError::CalibrationTimeout { .. }) => self.start_tracking(),
            Err(_) => {}
        }
        result
    }

    fn start_tracking(&self) {
        let mut tracking = self.tracking.lock();
        if tracking.is_some() {
            return;
        }
        let odometry = Arc::clone(&self.odometry);
        let board = Arc::clone(&self.board);
        let period = odometry.settings().period;
        *tracking = Some(tokio::spawn(async move {
            info!(?period, "Odometry task started");
            let mut tick = time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if let Err(e) = odometry.update() {
                    warn!(error = %e, "Odometry update failed, holding pose");
                    blackboard::raise_fault(&board, &e.to_string());
                }
            }
        }));
    }

    pub fn is_tracking(&self) -> bool {
        self.tracking.lock().is_some()
    }

    pub fn set_pose(&self, x: f64, y: f64, heading: f64) {
        self.odometry.set_pose(x, y, heading);
    }

    pub fn pose(&self) -> Pose {
        self.odometry.pose()
    }

    pub fn heading_degraded(&self) -> bool {
        self.board.read().heading_degraded
    }

    /// Snapshot of the shared robot state, including recorded faults.
    pub fn state(&self) -> State {
        blackboard::snapshot(&self.board)
    }

    pub fn clear_faults(&self) {
        blackboard::clear_faults(&self.board);
    }

    /// The pose most recently published by the tracking task.
    pub fn last_published_pose(&self) -> Option<Pose> {
        self.pose_topic.latest().map(|pose| *pose)
    }

    /// Every pose the tracking task publishes.
    pub fn subscribe_pose(&self) -> broadcast::Receiver<Arc<Pose>> {
        self.pose_topic.subscribe()
    }

    pub async fn move_to_point(
        &self,
        x: f64,
        y: f64,
        timeout: Duration,
        params: MoveToPointParams,
    ) -> MotionHandle {
        self.motion.move_to_point(x, y, timeout, params).await
    }

    pub async fn turn_to_heading(
        &self,
        heading: f64,
        timeout: Duration,
        params: TurnToHeadingParams,
    ) -> MotionHandle {
        self.motion.turn_to_heading(heading, timeout, params).await
    }

    pub async fn turn_to_point(
        &self,
        x: f64,
        y: f64,
        timeout: Duration,
        params: TurnToPointParams,
    ) -> MotionHandle {
        self.motion.turn_to_point(x, y, timeout, params).await
    }

    pub async fn wait_until_done(&self) -> Option<MotionReport> {
        self.motion.wait_until_done().await
    }

    pub async fn cancel_motion(&self) {
        self.motion.cancel().await;
    }

    pub fn is_in_motion(&self) -> bool {
        self.motion.is_in_motion()
    }

    /// Drives with arcade mixing. See [`arcade`].
    pub fn arcade(&self, forward: f64, turn: f64) -> Result<WheelCommand, ChassisError> {
        self.apply(arcade(forward, turn))
    }

    /// Drives each side directly. See [`tank`].
    pub fn tank(&self, left: f64, right: f64) -> Result<WheelCommand, ChassisError> {
        self.apply(tank(left, right))
    }

    fn apply(&self, command: WheelCommand) -> Result<WheelCommand, ChassisError> {
        self.drive
            .lock()
            .command(command)
            .map_err(ChassisError::MotorFault)?;
        blackboard::record_command(&self.board, command);
        Ok(command)
    }
}

impl Drop for Chassis {
    fn drop(&mut self) {
        if let Some(task) = self.tracking.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::MotionOutcome;
    use crate::sim::{Axis, SimFault, SimRobot, test_robot};
    use tokio::sync::broadcast::error::TryRecvError;
    const EPSILON: f64 = 1e-6;

    fn controller(kp: f64) -> ControllerSettings {
        ControllerSettings {
            kp,
            ki: 0.0,
            kd: 0.0,
            windup_range: 0.0,
            small_error: 1.0,
            small_error_timeout: Duration::from_millis(100),
            large_error: 3.0,
            large_error_timeout: Duration::from_millis(500),
            max_acceleration: 0.0,
        }
    }

    fn config() -> ChassisConfig {
        ChassisConfig {
            geometry: DifferentialDrive::new(10.5, 3.25, 450.0).unwrap(),
            linear: controller(0.1),
            angular: controller(0.02),
            odometry: OdometrySettings {
                period: Duration::from_millis(10),
                calibration_timeout: Duration::from_millis(500),
                calibration_attempts: 2,
            },
            motion: MotionSettings::default(),
            initial_pose: None,
        }
    }

    fn build(sim: &SimRobot, config: ChassisConfig) -> Chassis {
        let wheel = sim.tracking_wheel(Axis::Vertical, 2.0, 3.0).unwrap();
        let sensors = OdomSensors::new(Box::new(wheel)).with_imu(Box::new(sim.imu()));
        Chassis::new(config, sim.drive(), sensors).unwrap()
    }

    #[test]
    fn test_arcade_mixing() {
        assert_eq!(arcade(1.0, 0.0), WheelCommand { left: 1.0, right: 1.0 });
        assert_eq!(arcade(0.0, 1.0), WheelCommand { left: 1.0, right: -1.0 });
        assert_eq!(arcade(0.5, 0.25), WheelCommand { left: 0.75, right: 0.25 });
        assert_eq!(arcade(0.0, 0.4), WheelCommand { left: 0.4, right: -0.4 });
        assert_eq!(arcade(1.0, 1.0), WheelCommand { left: 1.0, right: 0.0 });
        assert_eq!(arcade(-1.0, 1.0), WheelCommand { left: 0.0, right: -1.0 });
        assert_eq!(arcade(f64::NAN, 0.3), WheelCommand { left: 0.3, right: -0.3 });
        assert_eq!(arcade(0.5, f64::INFINITY), WheelCommand { left: 0.5, right: 0.5 });
    }

    #[test]
    fn test_arcade_in_range_and_symmetric() {
        let axes = [-2.0, -1.0, -0.6, -0.1, 0.0, 0.3, 0.9, 1.0, 3.0];
        for forward in axes {
            for turn in axes {
                let cmd = arcade(forward, turn);
                assert!((-1.0..=1.0).contains(&cmd.left));
                assert!((-1.0..=1.0).contains(&cmd.right));
                let mirrored = arcade(forward, -turn);
                assert!((cmd.left - mirrored.right).abs() < EPSILON);
                assert!((cmd.right - mirrored.left).abs() < EPSILON);
            }
        }
    }

    #[test]
    fn test_tank_clamps() {
        assert_eq!(tank(2.0, -0.5), WheelCommand { left: 1.0, right: -0.5 });
        assert_eq!(tank(f64::NAN, -4.0), WheelCommand { left: 0.0, right: -1.0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_invalid_settings() {
        let sim = test_robot();
        let mut bad = config();
        bad.linear.windup_range = -1.0;
        let wheel = sim.tracking_wheel(Axis::Vertical, 2.0, 0.0).unwrap();
        let sensors = OdomSensors::new(Box::new(wheel)).with_imu(Box::new(sim.imu()));
        assert!(matches!(
            Chassis::new(bad, sim.drive(), sensors),
            Err(ChassisError::InvalidConfiguration(_))
        ));

        // No heading source at all.
        let wheel = sim.tracking_wheel(Axis::Vertical, 2.0, 0.0).unwrap();
        assert!(Chassis::new(config(), sim.drive(), OdomSensors::new(Box::new(wheel))).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_pose_and_set_pose() {
        let sim = test_robot();
        let mut cfg = config();
        cfg.initial_pose = Some(Pose::new(1.0, -2.0, 270.0));
        let chassis = build(&sim, cfg);
        assert_eq!(chassis.pose(), Pose::new(1.0, -2.0, -90.0));

        chassis.calibrate().await.unwrap();
        chassis.set_pose(5.0, 5.0, 90.0);
        let pose = chassis.pose();
        assert_eq!((pose.x, pose.y, pose.heading), (5.0, 5.0, 90.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tracking_follows_sim() {
        let sim = test_robot();
        let chassis = build(&sim, config());
        assert!(!chassis.is_tracking());
        chassis.calibrate().await.unwrap();
        assert!(chassis.is_tracking());
        assert!(!chassis.heading_degraded());
        assert!(chassis.last_published_pose().is_none());
        assert!(chassis.state().last_update_ts.is_none());

        chassis.arcade(0.4, 0.1).unwrap();
        let first_command = chassis.state().last_cmd_ts;
        time::sleep(Duration::from_millis(500)).await;
        chassis.tank(0.0, 0.0).unwrap();
        assert!(chassis.state().last_cmd_ts - first_command >= Duration::from_millis(500));
        time::sleep(Duration::from_millis(30)).await;

        let updated = chassis.state().last_update_ts.unwrap();
        assert!(time::Instant::now() - updated <= Duration::from_millis(10));

        let truth = sim.truth();
        let pose = chassis.pose();
        assert!(truth.distance_to(0.0, 0.0) > 5.0);
        assert!(pose.distance_to(truth.x, truth.y) < EPSILON);
        assert!((pose.heading - truth.heading).abs() < EPSILON);
        assert_eq!(chassis.last_published_pose(), Some(pose));
        assert!(chassis.state().last_command.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_calibration_timeout_degrades_but_tracks() {
        let sim = test_robot().with_imu_calibration(None);
        let chassis = build(&sim, config());

        let result = chassis.calibrate().await;
        assert!(matches!(
            result,
            Err(ChassisError::CalibrationTimeout { attempts: 2, .. })
        ));
        assert!(chassis.heading_degraded());
        assert!(chassis.is_tracking());

        chassis.tank(0.5, 0.5).unwrap();
        time::sleep(Duration::from_millis(100)).await;
        assert!(chassis.pose().y > 0.0);
        chassis.tank(0.0, 0.0).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_fault_holds_pose_then_catches_up() {
        let sim = test_robot();
        let chassis = build(&sim, config());
        chassis.calibrate().await.unwrap();
        // Let the tracking task take its first reading.
        time::sleep(Duration::from_millis(20)).await;

        sim.set_fault(SimFault::Encoders, true);
        chassis.tank(0.5, 0.5).unwrap();
        time::sleep(Duration::from_millis(100)).await;
        chassis.tank(0.0, 0.0).unwrap();
        assert_eq!(chassis.pose(), Pose::default());
        assert!(!chassis.state().faults.is_empty());

        sim.set_fault(SimFault::Encoders, false);
        time::sleep(Duration::from_millis(30)).await;
        assert!((chassis.pose().y - sim.truth().y).abs() < EPSILON);
        chassis.clear_faults();
        assert!(chassis.state().faults.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_motor_fault_is_reported() {
        let sim = test_robot();
        let chassis = build(&sim, config());
        sim.fail_next(SimFault::Drive, 1);
        assert!(matches!(chassis.arcade(0.5, 0.0), Err(ChassisError::MotorFault(_))));
        assert!(chassis.arcade(0.5, 0.0).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_to_point_settles() {
        let sim = test_robot();
        let chassis = build(&sim, config());
        chassis.calibrate().await.unwrap();

        chassis
            .move_to_point(0.0, 24.0, Duration::from_secs(3), MoveToPointParams::default())
            .await;
        assert!(chassis.is_in_motion());
        let report = chassis.wait_until_done().await.unwrap();

        assert!(report.outcome.is_settled());
        assert!(!chassis.is_in_motion());
        let truth = sim.truth();
        assert!(truth.distance_to(0.0, 24.0) < 1.5);
        assert!(sim.last_command().is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_move_to_point_backwards() {
        let sim = test_robot();
        let chassis = build(&sim, config());
        chassis.calibrate().await.unwrap();

        let params = MoveToPointParams {
            forwards: false,
            ..MoveToPointParams::default()
        };
        let report = chassis
            .move_to_point(0.0, -24.0, Duration::from_secs(3), params)
            .await
            .wait()
            .await;
        assert!(report.outcome.is_settled());
        // Reversed straight there without turning round.
        assert!(sim.truth().distance_to(0.0, -24.0) < 1.5);
        assert!(chassis.pose().heading.abs() < 1.0);
        assert!(sim.commands().iter().any(|c| c.left < -0.5 && c.right < -0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slew_limit_holds_through_reversal() {
        let sim = test_robot();
        let limit = 0.012;
        let linear = ControllerSettings {
            max_acceleration: limit,
            ..controller(0.1)
        };
        let chassis = build(&sim, ChassisConfig { linear, ..config() });
        chassis.calibrate().await.unwrap();

        let report = chassis
            .move_to_point(0.0, -24.0, Duration::from_secs(4), MoveToPointParams::default())
            .await
            .wait()
            .await;
        assert!(report.outcome.is_settled());

        let lateral: Vec<f64> = sim.commands().iter().map(|c| (c.left + c.right) / 2.0).collect();
        assert!(lateral.iter().any(|&l| l > 0.5));
        for pair in lateral.windows(2) {
            let (before, after) = (pair[0], pair[1]);
            if after.abs() > before.abs() + EPSILON {
                assert!((after - before).abs() <= limit + EPSILON, "{before} -> {after}");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_across_wrap_goes_clockwise() {
        let sim = test_robot();
        let chassis = build(&sim, config());
        chassis.calibrate().await.unwrap();
        chassis.set_pose(0.0, 0.0, 170.0);
        let mut poses = chassis.subscribe_pose();

        let report = chassis
            .turn_to_heading(-170.0, Duration::from_secs(2), TurnToHeadingParams::default())
            .await
            .wait()
            .await;
        assert!(report.outcome.is_settled());
        assert!((chassis.pose().heading + 170.0).abs() < 1.5);

        // The short way round never swings back through 0.
        loop {
            match poses.try_recv() {
                Ok(pose) => assert!(pose.heading.abs() > 160.0, "went the long way: {pose}"),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        assert!((sim.truth().heading - 20.0).abs() < 1.5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_to_point() {
        let sim = test_robot();
        let chassis = build(&sim, config());
        chassis.calibrate().await.unwrap();

        let report = chassis
            .turn_to_point(10.0, 0.0, Duration::from_secs(2), TurnToPointParams::default())
            .await
            .wait()
            .await;
        assert!(report.outcome.is_settled());
        assert!((chassis.pose().heading - 90.0).abs() < 1.5);

        let params = TurnToPointParams {
            forwards: false,
            ..TurnToPointParams::default()
        };
        let report = chassis
            .turn_to_point(10.0, 0.0, Duration::from_secs(2), params)
            .await
            .wait()
            .await;
        assert_eq!(report.outcome, MotionOutcome::Settled(ferrodrive_control::SettleBand::Small));
        assert!((chassis.pose().heading.abs() - 90.0).abs() < 1.5);
        assert!(chassis.pose().heading < 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_tracking() {
        let sim = test_robot();
        let chassis = build(&sim, config());
        chassis.calibrate().await.unwrap();
        let mut poses = chassis.subscribe_pose();
        drop(chassis);
        time::sleep(Duration::from_millis(50)).await;

        let end = loop {
            match poses.try_recv() {
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(end, TryRecvError::Closed);
    }
}

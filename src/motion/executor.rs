use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ferrodrive_control::{ControllerSettings, PidController};
use ferrodrive_kinematics::{Pose, angle_error, normalize_heading};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{
    MotionGoal, MotionHandle, MotionOutcome, MotionReport, MotionSettings, MotionStatus,
    MoveToPointParams, Target, TurnDirection, TurnToHeadingParams, TurnToPointParams,
    wait_for_report,
};
use crate::blackboard::{self, Blackboard};
use crate::devices::{SharedDrive, WheelCommand};
use crate::error::ChassisError;

/// Runs motion commands one at a time.
pub struct MotionExecutor {
    drive: SharedDrive,
    board: Blackboard,
    linear: Arc<Mutex<PidController>>,
    angular: Arc<Mutex<PidController>>,
    settings: MotionSettings,
    next_id: AtomicU64,
    // Serializes start and cancel so a new motion never overlaps the old one.
    active: tokio::sync::Mutex<Option<ActiveMotion>>,
    current: Mutex<Option<(u64, Pose, watch::Receiver<MotionStatus>)>>,
}

struct ActiveMotion {
    id: u64,
    cancel: Arc<Notify>,
    task: JoinHandle<()>,
}

impl MotionExecutor {
    /// # Errors
    ///
    /// Returns [`ChassisError::InvalidConfiguration`] if either controller's
    /// settings are invalid or the loop period is zero.
    pub fn new(
        drive: SharedDrive,
        board: Blackboard,
        linear: ControllerSettings,
        angular: ControllerSettings,
        settings: MotionSettings,
    ) -> Result<Self, ChassisError> {
        if settings.loop_period.is_zero() {
            return Err(ChassisError::InvalidConfiguration(
                "motion loop period must be non-zero".into(),
            ));
        }
        if !settings.close_range.is_finite() || settings.close_range < 0.0 {
            return Err(ChassisError::InvalidConfiguration(
                "close range must be finite and non-negative".into(),
            ));
        }
        Ok(Self {
            drive,
            board,
            linear: Arc::new(Mutex::new(PidController::new(linear)?)),
            angular: Arc::new(Mutex::new(PidController::new(angular)?)),
            settings,
            next_id: AtomicU64::new(1),
            active: tokio::sync::Mutex::new(None),
            current: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }

    /// Drives to `(x, y)`, turning towards it on the way.
    pub async fn move_to_point(
        &self,
        x: f64,
        y: f64,
        timeout: Duration,
        params: MoveToPointParams,
    ) -> MotionHandle {
        let target = Target::Point { x, y, params };
        self.start(MotionGoal { target, timeout }).await
    }

    /// Turns in place to an absolute heading.
    pub async fn turn_to_heading(
        &self,
        heading: f64,
        timeout: Duration,
        params: TurnToHeadingParams,
    ) -> MotionHandle {
        let target = Target::Heading {
            heading: normalize_heading(heading),
            params,
        };
        self.start(MotionGoal { target, timeout }).await
    }

    /// Turns in place until the robot faces `(x, y)`.
    pub async fn turn_to_point(
        &self,
        x: f64,
        y: f64,
        timeout: Duration,
        params: TurnToPointParams,
    ) -> MotionHandle {
        let target = Target::FacePoint { x, y, params };
        self.start(MotionGoal { target, timeout }).await
    }

    /// Waits for the latest motion. Returns `None` if nothing was ever issued.
    pub async fn wait_until_done(&self) -> Option<MotionReport> {
        let (id, start, mut status) = self.current.lock().clone()?;
        Some(wait_for_report(&mut status, id, start).await)
    }

    /// Stops the running motion, if any, and waits for its task to exit.
    pub async fn cancel(&self) {
        let mut active = self.active.lock().await;
        if let Some(motion) = active.take() {
            self.stop(motion).await;
        }
    }

    pub fn is_in_motion(&self) -> bool {
        self.current
            .lock()
            .as_ref()
            .is_some_and(|(_, _, status)| !status.borrow().is_finished())
    }

    async fn start(&self, goal: MotionGoal) -> MotionHandle {
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            self.stop(previous).await;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let start = blackboard::pose(&self.board);
        self.linear.lock().reset();
        self.angular.lock().reset();

        let (status_tx, status_rx) = watch::channel(MotionStatus::Running);
        let cancel = Arc::new(Notify::new());
        let run = MotionRun {
            id,
            goal,
            start,
            settings: self.settings,
            drive: self.drive.clone(),
            board: self.board.clone(),
            linear: self.linear.clone(),
            angular: self.angular.clone(),
            cancel: cancel.clone(),
            status: status_tx,
        };

        info!(
            id,
            target = ?goal.target,
            timeout = ?goal.timeout,
            %start,
            "Motion started"
        );
        let task = tokio::spawn(run.execute());
        *self.current.lock() = Some((id, start, status_rx.clone()));
        *active = Some(ActiveMotion { id, cancel, task });

        MotionHandle {
            id,
            start,
            status: status_rx,
        }
    }

    async fn stop(&self, motion: ActiveMotion) {
        motion.cancel.notify_one();
        if let Err(e) = motion.task.await {
            // The task never reached its own stop command.
            warn!(id = motion.id, error = %e, "Motion task ended abnormally");
            command(&self.drive, &self.board, WheelCommand::STOP);
        }
    }
}

impl Drop for MotionExecutor {
    fn drop(&mut self) {
        // The task stops the wheels on its way out.
        if let Some(motion) = self.active.get_mut().take() {
            motion.cancel.notify_one();
        }
    }
}

/// Everything one motion task owns.
struct MotionRun {
    id: u64,
    goal: MotionGoal,
    start: Pose,
    settings: MotionSettings,
    drive: SharedDrive,
    board: Blackboard,
    linear: Arc<Mutex<PidController>>,
    angular: Arc<Mutex<PidController>>,
    cancel: Arc<Notify>,
    status: watch::Sender<MotionStatus>,
}

enum Tick {
    Drive(WheelCommand),
    Done(MotionOutcome),
}

/// Per-motion memory carried between loop iterations.
#[derive(Debug, Default)]
struct Progress {
    close: bool,
    direction: TurnDirection,
}

impl Progress {
    fn for_target(target: &Target) -> Self {
        let direction = match target {
            Target::Point { .. } => TurnDirection::Auto,
            Target::Heading { params, .. } => params.direction,
            Target::FacePoint { params, .. } => params.direction,
        };
        Self {
            close: false,
            direction,
        }
    }

    /// Applies the requested turn direction to the shortest-path error.
    /// Once the two agree the direction falls back to `Auto` so the turn can
    /// settle without being forced past the target again.
    fn turn_error(&mut self, shortest: f64) -> f64 {
        let forced = match self.direction {
            TurnDirection::Auto => return shortest,
            TurnDirection::Clockwise if shortest < 0.0 => shortest + 360.0,
            TurnDirection::CounterClockwise if shortest > 0.0 => shortest - 360.0,
            TurnDirection::Clockwise | TurnDirection::CounterClockwise => shortest,
        };
        if forced == shortest {
            self.direction = TurnDirection::Auto;
        }
        forced
    }
}

impl MotionRun {
    async fn execute(self) {
        let started = Instant::now();
        // `None` when the timeout is too large to represent: no deadline.
        let deadline = started.checked_add(self.goal.timeout);
        let mut ticker = time::interval(self.settings.loop_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick: Option<Instant> = None;
        let mut progress = Progress::for_target(&self.goal.target);

        let outcome = loop {
            tokio::select! {
                biased;
                _ = self.cancel.notified() => break MotionOutcome::Cancelled,
                _ = time::sleep_until(deadline.unwrap_or(started)), if deadline.is_some() => {
                    break MotionOutcome::TimedOut
                }
                now = ticker.tick() => {
                    let dt = last_tick.map_or(self.settings.loop_period, |last| now - last);
                    last_tick = Some(now);
                    let pose = blackboard::pose(&self.board);
                    match self.tick(&mut progress, pose, dt) {
                        Tick::Drive(cmd) => command(&self.drive, &self.board, cmd),
                        Tick::Done(outcome) => break outcome,
                    }
                }
            }
        };

        command(&self.drive, &self.board, WheelCommand::STOP);
        let report = MotionReport {
            id: self.id,
            outcome,
            start: self.start,
            end: blackboard::pose(&self.board),
            elapsed: started.elapsed(),
        };
        info!(
            id = self.id,
            outcome = ?report.outcome,
            end = %report.end,
            elapsed = ?report.elapsed,
            "Motion finished"
        );
        self.status.send_replace(MotionStatus::Finished(report));
    }

    fn tick(&self, progress: &mut Progress, pose: Pose, dt: Duration) -> Tick {
        match self.goal.target {
            Target::Point { x, y, params } => self.drive_to(progress, pose, x, y, params, dt),
            Target::Heading { heading, params } => {
                self.turn_to(progress, pose, heading, params.max_speed, params.early_exit_range, dt)
            }
            Target::FacePoint { x, y, params } => {
                let mut heading = pose.bearing_to(x, y);
                if !params.forwards {
                    heading = normalize_heading(heading + 180.0);
                }
                self.turn_to(progress, pose, heading, params.max_speed, params.early_exit_range, dt)
            }
        }
    }

    fn drive_to(
        &self,
        progress: &mut Progress,
        pose: Pose,
        x: f64,
        y: f64,
        params: MoveToPointParams,
        dt: Duration,
    ) -> Tick {
        let distance = pose.distance_to(x, y);
        if !progress.close && distance < self.settings.close_range {
            progress.close = true;
            debug!(id = self.id, distance, "Within close range, holding heading");
        }

        let bearing = pose.bearing_to(x, y);
        let facing = if params.forwards {
            pose.heading
        } else {
            normalize_heading(pose.heading + 180.0)
        };
        // Distance projected onto the robot's forward axis; negative once the
        // point is behind it.
        let lateral_error = distance * angle_error(bearing, pose.heading).to_radians().cos();
        let heading_error = angle_error(bearing, facing);

        // Bands are timed on the distance left, and only count once close.
        let (lateral_out, settled) = {
            let mut pid = self.linear.lock();
            let out = pid.step_with_band_error(lateral_error, distance, dt);
            (out, pid.settled())
        };
        if let Some(band) = settled.filter(|_| progress.close) {
            return Tick::Done(MotionOutcome::Settled(band));
        }
        if params.early_exit_range > 0.0 && distance < params.early_exit_range {
            return Tick::Done(MotionOutcome::EarlyExit);
        }

        let angular_out = if progress.close {
            0.0
        } else {
            self.angular.lock().step(heading_error, dt)
        };

        let max_speed = speed_cap(params.max_speed);
        let mut lateral = lateral_out.clamp(-max_speed, max_speed);
        let angular = angular_out.clamp(-max_speed, max_speed);
        if !progress.close {
            lateral = if params.forwards {
                lateral.max(0.0)
            } else {
                lateral.min(0.0)
            };
        }
        let overturn = lateral.abs() + angular.abs() - max_speed;
        if overturn > 0.0 {
            lateral -= lateral.signum() * overturn;
        }
        self.linear.lock().record_applied(lateral);
        if !progress.close {
            self.angular.lock().record_applied(angular);
        }

        debug!(
            id = self.id,
            distance,
            lateral_error,
            heading_error,
            lateral,
            angular,
            "Point step"
        );
        Tick::Drive(WheelCommand::clamped(lateral + angular, lateral - angular))
    }

    fn turn_to(
        &self,
        progress: &mut Progress,
        pose: Pose,
        heading: f64,
        max_speed: f64,
        early_exit_range: f64,
        dt: Duration,
    ) -> Tick {
        let error = progress.turn_error(angle_error(heading, pose.heading));

        let (out, settled) = {
            let mut pid = self.angular.lock();
            let out = pid.step(error, dt);
            (out, pid.settled())
        };
        if let Some(band) = settled {
            return Tick::Done(MotionOutcome::Settled(band));
        }
        if early_exit_range > 0.0 && error.abs() < early_exit_range {
            return Tick::Done(MotionOutcome::EarlyExit);
        }

        let max_speed = speed_cap(max_speed);
        let power = out.clamp(-max_speed, max_speed);
        self.angular.lock().record_applied(power);
        debug!(id = self.id, heading = pose.heading, error, power, "Turn step");
        Tick::Drive(WheelCommand::clamped(power, -power))
    }
}

fn speed_cap(max_speed: f64) -> f64 {
    if max_speed.is_finite() {
        max_speed.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

fn command(drive: &SharedDrive, board: &Blackboard, cmd: WheelCommand) {
    if let Err(e) = drive.lock().command(cmd) {
        warn!(error = %e, %cmd, "Drive command failed");
        blackboard::raise_fault(board, &format!("drive: {e}"));
    }
    blackboard::record_command(board, cmd);
}

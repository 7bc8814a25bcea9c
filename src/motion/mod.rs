//! Closed-loop motion commands.
//!
//! Each command spawns one control task that reads the pose from the
//! blackboard every loop period, feeds the error through the linear and/or
//! angular [`PidController`](ferrodrive_control::PidController) and commands
//! the drive motors. Only one motion runs at a time: issuing a new command
//! cancels the one in flight. Whatever ends a motion (settling, early exit,
//! timeout or cancellation) the wheels are commanded to stop.

mod executor;

use std::time::Duration;

use ferrodrive_control::SettleBand;
use ferrodrive_kinematics::Pose;
use tokio::sync::watch;

pub use executor::MotionExecutor;

/// Rotation direction for heading targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnDirection {
    /// Always take the shorter way round.
    #[default]
    Auto,
    Clockwise,
    CounterClockwise,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveToPointParams {
    /// Drive front-first. When false the robot backs into the point.
    pub forwards: bool,
    /// Output cap in `[0, 1]`.
    pub max_speed: f64,
    /// Finish as soon as the robot is this close to the point. 0 disables.
    pub early_exit_range: f64,
}

impl Default for MoveToPointParams {
    fn default() -> Self {
        Self {
            forwards: true,
            max_speed: 1.0,
            early_exit_range: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnToHeadingParams {
    pub direction: TurnDirection,
    pub max_speed: f64,
    /// Finish as soon as the heading error is below this many degrees. 0 disables.
    pub early_exit_range: f64,
}

impl Default for TurnToHeadingParams {
    fn default() -> Self {
        Self {
            direction: TurnDirection::Auto,
            max_speed: 1.0,
            early_exit_range: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TurnToPointParams {
    /// Face the point with the front of the robot. When false the back faces it.
    pub forwards: bool,
    pub direction: TurnDirection,
    pub max_speed: f64,
    pub early_exit_range: f64,
}

impl Default for TurnToPointParams {
    fn default() -> Self {
        Self {
            forwards: true,
            direction: TurnDirection::Auto,
            max_speed: 1.0,
            early_exit_range: 0.0,
        }
    }
}

/// Loop timing and geometry shared by every motion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionSettings {
    pub loop_period: Duration,
    /// Within this distance of a point target the heading correction is
    /// dropped, so the robot does not spin trying to face the point it is on.
    pub close_range: f64,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            loop_period: Duration::from_millis(10),
            close_range: 7.5,
        }
    }
}

/// What a motion task is steering towards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target {
    Point {
        x: f64,
        y: f64,
        params: MoveToPointParams,
    },
    Heading {
        heading: f64,
        params: TurnToHeadingParams,
    },
    FacePoint {
        x: f64,
        y: f64,
        params: TurnToPointParams,
    },
}

/// One motion command: a target plus its deadline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionGoal {
    pub target: Target,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionOutcome {
    /// The controller held its error inside a settling band long enough.
    Settled(SettleBand),
    /// The caller's early exit range was reached.
    EarlyExit,
    /// The deadline passed first. The robot is left where it stopped.
    TimedOut,
    /// A newer command or an explicit cancel preempted this one.
    Cancelled,
}

impl MotionOutcome {
    pub fn is_settled(&self) -> bool {
        matches!(self, MotionOutcome::Settled(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotionReport {
    pub id: u64,
    pub outcome: MotionOutcome,
    pub start: Pose,
    pub end: Pose,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionStatus {
    Running,
    Finished(MotionReport),
}

impl MotionStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, MotionStatus::Finished(_))
    }
}

/// Caller-side view of one issued motion.
#[derive(Debug, Clone)]
pub struct MotionHandle {
    id: u64,
    start: Pose,
    status: watch::Receiver<MotionStatus>,
}

impl MotionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Pose the motion started from.
    pub fn start_pose(&self) -> Pose {
        self.start
    }

    pub fn is_finished(&self) -> bool {
        self.status.borrow().is_finished()
    }

    /// Waits for the motion to finish, however it ends.
    pub async fn wait(mut self) -> MotionReport {
        wait_for_report(&mut self.status, self.id, self.start).await
    }
}

async fn wait_for_report(
    status: &mut watch::Receiver<MotionStatus>,
    id: u64,
    start: Pose,
) -> MotionReport {
    match status.wait_for(MotionStatus::is_finished).await {
        Ok(finished) => match *finished {
            MotionStatus::Finished(report) => report,
            MotionStatus::Running => unreachable!("wait_for only returns finished states"),
        },
        // The task went away without reporting, which only happens if it panicked.
        Err(_) => MotionReport {
            id,
            outcome: MotionOutcome::Cancelled,
            start,
            end: start,
            elapsed: Duration::ZERO,
        },
    }
}

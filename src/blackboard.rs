use parking_lot::RwLock;
use std::sync::Arc;
use tokio::time::Instant;

use ferrodrive_kinematics::Pose;

use crate::devices::WheelCommand;

const MAX_FAULTS: usize = 10;

/// Robot state shared between the odometry task, the motion task and callers.
#[derive(Debug, Clone)]
pub struct State {
    pub pose: Pose,
    /// Set when IMU calibration timed out and heading accuracy is reduced.
    pub heading_degraded: bool,
    pub calibrated: bool,
    pub last_command: WheelCommand,
    pub last_cmd_ts: Instant,
    /// When odometry last integrated a reading.
    pub last_update_ts: Option<Instant>,
    pub faults: Vec<String>,
}

impl Default for State {
    fn default() -> Self {
        State {
            pose: Pose::default(),
            heading_degraded: false,
            calibrated: false,
            last_command: WheelCommand::STOP,
            last_cmd_ts: Instant::now(),
            last_update_ts: None,
            faults: Vec::new(),
        }
    }
}

pub type Blackboard = Arc<RwLock<State>>;

pub fn snapshot(bb: &Blackboard) -> State {
    (*bb.read()).clone()
}

pub fn pose(bb: &Blackboard) -> Pose {
    bb.read().pose
}

pub fn record_command(bb: &Blackboard, command: WheelCommand) {
    let mut g = bb.write();
    g.last_command = command;
    g.last_cmd_ts = Instant::now();
}

pub fn raise_fault(bb: &Blackboard, msg: &str) {
    let mut g = bb.write();
    if !g.faults.iter().any(|s| s == msg) {
        if g.faults.len() >= MAX_FAULTS {
            g.faults.remove(0);
        }
        g.faults.push(msg.to_string());
    }
}

pub fn clear_faults(bb: &Blackboard) {
    bb.write().faults.clear();
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use ferrodrive::config::{DEFAULT_CONFIG_PATH, Settings, WheelConfig, load_config};
use ferrodrive::devices::{ManualInput, TrackingWheel};
use ferrodrive::odometry::OdomSensors;
use ferrodrive::sim::{Axis, ScriptedInput, SimRobot};
use ferrodrive::{
    Chassis, ChassisConfig, ChassisError, MoveToPointParams, Pose, TurnToHeadingParams,
};
use spin_sleep::SpinSleeper;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::{self, EnvFilter};

const TELEOP_PERIOD: Duration = Duration::from_millis(20);
const TELEMETRY_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let settings = load_config(&path).with_context(|| format!("loading {path}"))?;
    let config = ChassisConfig::try_from(&settings)?;

    info!("Ferrodrive demo started on a simulated robot");
    let sim = SimRobot::new(config.geometry);
    let sensors = sim_sensors(&sim, &settings)?;
    let chassis = Arc::new(Chassis::new(config, sim.drive(), sensors)?);

    match chassis.calibrate().await {
        Ok(()) => info!("Calibration complete"),
        Err(e @ ChassisError::CalibrationTimeout { .. }) => {
            warn!(error = %e, "Continuing with degraded heading")
        }
        Err(e) => return Err(e.into()),
    }

    let telemetry = tokio::spawn(telemetry(chassis.subscribe_pose()));

    autonomous(&chassis).await;

    info!("Spawning teleop thread...");
    let teleop_thread = std::thread::Builder::new().name("teleop".into()).spawn({
        let chassis = Arc::clone(&chassis);
        move || teleop(&chassis, demo_sticks())
    })?;
    tokio::task::spawn_blocking(move || teleop_thread.join())
        .await?
        .map_err(|_| anyhow!("teleop thread panicked"))?;

    telemetry.abort();
    let state = chassis.state();
    info!(
        pose = %state.pose,
        faults = ?state.faults,
        truth = %sim.truth(),
        since_command = ?state.last_cmd_ts.elapsed(),
        since_update = ?state.last_update_ts.map(|at| at.elapsed()),
        "Demo finished"
    );
    Ok(())
}

/// Drive 24 inches backwards along the y axis, then face -90.
async fn autonomous(chassis: &Chassis) {
    chassis.set_pose(0.0, 0.0, 0.0);

    chassis
        .move_to_point(0.0, -24.0, Duration::from_millis(2000), MoveToPointParams::default())
        .await;
    if let Some(report) = chassis.wait_until_done().await {
        info!(outcome = ?report.outcome, end = %report.end, "Move finished");
    }

    chassis
        .turn_to_heading(-90.0, Duration::from_millis(2000), TurnToHeadingParams::default())
        .await;
    if let Some(report) = chassis.wait_until_done().await {
        info!(outcome = ?report.outcome, end = %report.end, "Turn finished");
    }
}

fn teleop(chassis: &Chassis, mut input: ScriptedInput) {
    info!("Teleop thread started.");
    let sleeper = SpinSleeper::new(1_000);
    while !input.is_exhausted() {
        match input.axes() {
            Ok((forward, turn)) => {
                if let Err(e) = chassis.arcade(forward, turn) {
                    warn!(error = %e, "Arcade command failed");
                }
            }
            Err(e) => warn!(error = %e, "Controller read failed"),
        }
        sleeper.sleep(TELEOP_PERIOD);
    }
    if let Err(e) = chassis.tank(0.0, 0.0) {
        error!(error = %e, "Failed to stop after teleop");
    }
    info!("Teleop thread finished.");
}

// One second forward, half a second curving right, then release the sticks.
fn demo_sticks() -> ScriptedInput {
    let forward = std::iter::repeat_n((0.5, 0.0), 50);
    let curve = std::iter::repeat_n((0.4, 0.2), 25);
    ScriptedInput::new(forward.chain(curve).chain([(0.0, 0.0)]))
}

async fn telemetry(mut poses: broadcast::Receiver<Arc<Pose>>) {
    let mut last_logged: Option<Instant> = None;
    loop {
        match poses.recv().await {
            Ok(pose) => {
                if last_logged.is_none_or(|at| at.elapsed() >= TELEMETRY_INTERVAL) {
                    info!(x = pose.x, y = pose.y, heading = pose.heading, "Pose");
                    last_logged = Some(Instant::now());
                }
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "Telemetry lagging"),
            Err(RecvError::Closed) => break,
        }
    }
}

fn sim_sensors(sim: &SimRobot, settings: &Settings) -> anyhow::Result<OdomSensors> {
    let odom = &settings.odometry;
    let Some((first, rest)) = odom.vertical_wheels.split_first() else {
        bail!("at least one vertical tracking wheel is required");
    };

    let mut sensors = OdomSensors::new(Box::new(sim_wheel(sim, Axis::Vertical, first)?));
    if let Some(second) = rest.first() {
        sensors = sensors.with_second_vertical(Box::new(sim_wheel(sim, Axis::Vertical, second)?));
    }
    if let Some(horizontal) = &odom.horizontal_wheel {
        sensors = sensors.with_horizontal(Box::new(sim_wheel(sim, Axis::Horizontal, horizontal)?));
    }
    Ok(sensors.with_imu(Box::new(sim.imu())))
}

fn sim_wheel(
    sim: &SimRobot,
    axis: Axis,
    wheel: &WheelConfig,
) -> Result<TrackingWheel, ChassisError> {
    // The encoder sees the wheel through its gearing.
    let encoder = sim.encoder(axis, wheel.diameter * wheel.gear_ratio, wheel.offset);
    TrackingWheel::new(Box::new(encoder), wheel.diameter, wheel.offset, wheel.gear_ratio)
}

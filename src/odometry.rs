//! Pose estimation from tracking wheels and an inertial sensor.
//!
//! [`Odometry::update`] is driven at a fixed period. Each call reads every
//! sensor, turns the change since the previous reading into a robot-frame arc
//! and accumulates it into the pose on the [`Blackboard`]. Heading changes come
//! from the IMU when one is fitted, otherwise from the difference between two
//! parallel tracking wheels.

use std::time::Duration;

use ferrodrive_kinematics::{LocalDisplacement, Pose, angle_error, arc_chord};
use parking_lot::Mutex;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::blackboard::{self, Blackboard};
use crate::bus::Topic;
use crate::devices::{DistanceSensor, InertialSensor};
use crate::error::{ChassisError, DeviceError};

const CALIBRATION_POLL: Duration = Duration::from_millis(10);

/// The sensors odometry is computed from.
///
/// A vertical (forward-facing) tracking wheel is required. Heading comes from
/// the IMU, or from a second vertical wheel when no IMU is fitted.
pub struct OdomSensors {
    vertical: Box<dyn DistanceSensor>,
    second_vertical: Option<Box<dyn DistanceSensor>>,
    horizontal: Option<Box<dyn DistanceSensor>>,
    imu: Option<Box<dyn InertialSensor>>,
}

impl OdomSensors {
    pub fn new(vertical: Box<dyn DistanceSensor>) -> Self {
        Self {
            vertical,
            second_vertical: None,
            horizontal: None,
            imu: None,
        }
    }

    pub fn with_second_vertical(mut self, wheel: Box<dyn DistanceSensor>) -> Self {
        self.second_vertical = Some(wheel);
        self
    }

    pub fn with_horizontal(mut self, wheel: Box<dyn DistanceSensor>) -> Self {
        self.horizontal = Some(wheel);
        self
    }

    pub fn with_imu(mut self, imu: Box<dyn InertialSensor>) -> Self {
        self.imu = Some(imu);
        self
    }

    fn validate(&self) -> Result<(), ChassisError> {
        match (&self.imu, &self.second_vertical) {
            (None, None) => Err(ChassisError::InvalidConfiguration(
                "odometry needs an IMU or two vertical tracking wheels for heading".into(),
            )),
            (None, Some(second)) if second.offset() == self.vertical.offset() => {
                Err(ChassisError::InvalidConfiguration(
                    "vertical tracking wheels must have distinct offsets".into(),
                ))
            }
            _ => Ok(()),
        }
    }

    fn read(&mut self) -> Result<Sample, ChassisError> {
        let vertical = self
            .vertical
            .cumulative_distance()
            .map_err(|e| ChassisError::sensor("vertical tracking wheel", e))?;
        let second_vertical = self
            .second_vertical
            .as_mut()
            .map(|w| w.cumulative_distance())
            .transpose()
            .map_err(|e| ChassisError::sensor("second vertical tracking wheel", e))?;
        let horizontal = self
            .horizontal
            .as_mut()
            .map(|w| w.cumulative_distance())
            .transpose()
            .map_err(|e| ChassisError::sensor("horizontal tracking wheel", e))?;
        let imu = self
            .imu
            .as_mut()
            .map(|imu| imu.heading())
            .transpose()
            .and_then(|heading| match heading {
                Some(h) if !h.is_finite() => Err(DeviceError::OutOfRange(h)),
                other => Ok(other),
            })
            .map_err(|e| ChassisError::sensor("imu", e))?;

        Ok(Sample {
            vertical,
            second_vertical,
            horizontal,
            imu,
        })
    }

    fn reset_wheels(&mut self) -> Result<(), ChassisError> {
        self.vertical
            .reset()
            .map_err(|e| ChassisError::sensor("vertical tracking wheel", e))?;
        if let Some(wheel) = self.second_vertical.as_mut() {
            wheel
                .reset()
                .map_err(|e| ChassisError::sensor("second vertical tracking wheel", e))?;
        }
        if let Some(wheel) = self.horizontal.as_mut() {
            wheel
                .reset()
                .map_err(|e| ChassisError::sensor("horizontal tracking wheel", e))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    vertical: f64,
    second_vertical: Option<f64>,
    horizontal: Option<f64>,
    imu: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OdometrySettings {
    /// Period of the background update task.
    pub period: Duration,
    /// Bound on a single IMU calibration attempt.
    pub calibration_timeout: Duration,
    pub calibration_attempts: u32,
}

impl Default for OdometrySettings {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(10),
            calibration_timeout: Duration::from_millis(3000),
            calibration_attempts: 3,
        }
    }
}

struct Tracker {
    sensors: OdomSensors,
    previous: Option<Sample>,
}

pub struct Odometry {
    tracker: Mutex<Tracker>,
    board: Blackboard,
    pose_topic: Topic<Pose>,
    settings: OdometrySettings,
}

impl Odometry {
    /// # Errors
    ///
    /// Returns [`ChassisError::InvalidConfiguration`] when no heading source is
    /// available, the parallel wheels share an offset, or the settings ask for
    /// a zero period or zero calibration attempts.
    pub fn new(
        sensors: OdomSensors,
        settings: OdometrySettings,
        board: Blackboard,
        pose_topic: Topic<Pose>,
    ) -> Result<Self, ChassisError> {
        sensors.validate()?;
        if settings.period.is_zero() {
            return Err(ChassisError::InvalidConfiguration(
                "odometry period must be non-zero".into(),
            ));
        }
        if settings.calibration_attempts == 0 {
            return Err(ChassisError::InvalidConfiguration(
                "calibration needs at least one attempt".into(),
            ));
        }
        Ok(Self {
            tracker: Mutex::new(Tracker {
                sensors,
                previous: None,
            }),
            board,
            pose_topic,
            settings,
        })
    }

    pub fn settings(&self) -> &OdometrySettings {
        &self.settings
    }

    pub fn pose(&self) -> Pose {
        blackboard::pose(&self.board)
    }

    /// Overwrites the tracked pose. Later updates accumulate on top of it.
    pub fn set_pose(&self, x: f64, y: f64, heading: f64) {
        let pose = Pose::new(x, y, heading);
        self.board.write().pose = pose;
        info!(%pose, "Pose set");
    }

    /// Reads every sensor and integrates the motion since the previous call.
    ///
    /// The first call after construction or calibration only records the
    /// readings. On a sensor fault the pose and the stored readings are left
    /// as they were, so the next successful call accounts for the whole gap.
    pub fn update(&self) -> Result<Pose, ChassisError> {
        let mut tracker = self.tracker.lock();
        let sample = tracker.sensors.read()?;
        let Some(previous) = tracker.previous.replace(sample) else {
            return Ok(self.pose());
        };

        let delta_vertical = sample.vertical - previous.vertical;
        let delta_heading = match (sample.imu, previous.imu) {
            (Some(now), Some(before)) => angle_error(now, before),
            _ => {
                let second = tracker
                    .sensors
                    .second_vertical
                    .as_ref()
                    .map(|w| w.offset())
                    .unwrap_or_default();
                let delta_second = sample.second_vertical.unwrap_or_default()
                    - previous.second_vertical.unwrap_or_default();
                let separation = second - tracker.sensors.vertical.offset();
                ((delta_vertical - delta_second) / separation).to_degrees()
            }
        };
        let delta_theta = delta_heading.to_radians();

        let forward = arc_chord(delta_vertical, delta_theta, tracker.sensors.vertical.offset());
        let lateral = match (&tracker.sensors.horizontal, sample.horizontal, previous.horizontal) {
            (Some(wheel), Some(now), Some(before)) => {
                arc_chord(now - before, delta_theta, wheel.offset())
            }
            _ => 0.0,
        };
        drop(tracker);

        let pose = {
            let mut state = self.board.write();
            state.pose = state
                .pose
                .integrate(LocalDisplacement::new(forward, lateral), delta_heading);
            state.last_update_ts = Some(Instant::now());
            state.pose
        };
        debug!(x = pose.x, y = pose.y, heading = pose.heading, forward, lateral, "Odometry updated");
        self.pose_topic.publish(pose);
        Ok(pose)
    }

    /// Zeroes the tracking wheels and runs IMU self-calibration.
    ///
    /// Each attempt is bounded by `calibration_timeout`. When every attempt
    /// times out the heading is marked degraded on the blackboard and
    /// [`ChassisError::CalibrationTimeout`] is returned; tracking may still
    /// proceed using the uncalibrated heading.
    pub async fn calibrate(&self) -> Result<(), ChassisError> {
        let has_imu = {
            let mut tracker = self.tracker.lock();
            tracker.sensors.reset_wheels()?;
            tracker.previous = None;
            tracker.sensors.imu.is_some()
        };
        info!("Tracking wheels reset");

        let result = if has_imu {
            self.calibrate_imu().await
        } else {
            Ok(())
        };

        let degraded = matches!(result, Err(ChassisError::CalibrationTimeout { .. }));
        if result.is_ok() || degraded {
            let mut state = self.board.write();
            state.calibrated = true;
            state.heading_degraded = degraded;
        }
        self.tracker.lock().previous = None;
        result
    }

    async fn calibrate_imu(&self) -> Result<(), ChassisError> {
        let attempts = self.settings.calibration_attempts;
        let timeout = self.settings.calibration_timeout;
        for attempt in 1..=attempts {
            self.with_imu(|imu| imu.start_calibration())?;
            info!(attempt, "IMU calibration started");
            match time::timeout(timeout, self.wait_for_imu()).await {
                Ok(Ok(())) => {
                    info!(attempt, "IMU calibrated");
                    return Ok(());
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => warn!(attempt, ?timeout, "IMU calibration timed out"),
            }
        }
        warn!(attempts, "IMU calibration failed, heading accuracy degraded");
        Err(ChassisError::CalibrationTimeout { attempts, timeout })
    }

    async fn wait_for_imu(&self) -> Result<(), ChassisError> {
        while self.with_imu(|imu| imu.is_calibrating())? {
            time::sleep(CALIBRATION_POLL).await;
        }
        Ok(())
    }

    fn with_imu<T>(
        &self,
        f: impl FnOnce(&mut dyn InertialSensor) -> Result<T, DeviceError>,
    ) -> Result<T, ChassisError> {
        let mut tracker = self.tracker.lock();
        let imu = tracker
            .sensors
            .imu
            .as_deref_mut()
            .ok_or(ChassisError::sensor("imu", DeviceError::Disconnected))?;
        f(imu).map_err(|e| ChassisError::sensor("imu", e))
    }
}

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use ferrodrive_control::ControllerSettings;
use ferrodrive_kinematics::{DifferentialDrive, Pose};
use serde::Deserialize;
use tracing::{error, info};

use crate::error::ChassisError;
use crate::motion::MotionSettings;
use crate::odometry::OdometrySettings;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
const ENV_PREFIX: &str = "FERRODRIVE";

/// Everything needed to build a chassis, as read from the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub drivetrain: DrivetrainConfig,
    pub odometry: OdometryConfig,
    pub linear: ControllerConfig,
    pub angular: ControllerConfig,
    pub motion: MotionConfig,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DrivetrainConfig {
    pub track_width: f64,
    pub wheel_diameter: f64,
    pub rpm: f64,
}

impl DrivetrainConfig {
    pub fn geometry(&self) -> Result<DifferentialDrive, ChassisError> {
        Ok(DifferentialDrive::new(
            self.track_width,
            self.wheel_diameter,
            self.rpm,
        )?)
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct WheelConfig {
    pub diameter: f64,
    /// Positive to the right of the tracking center.
    pub offset: f64,
    #[serde(default = "unit_ratio")]
    pub gear_ratio: f64,
}

fn unit_ratio() -> f64 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct OdometryConfig {
    pub period_ms: u64,
    pub calibration_timeout_ms: u64,
    pub calibration_attempts: u32,
    #[serde(default)]
    pub initial_pose: Option<Pose>,
    #[serde(default)]
    pub vertical_wheels: Vec<WheelConfig>,
    #[serde(default)]
    pub horizontal_wheel: Option<WheelConfig>,
}

impl OdometryConfig {
    pub fn settings(&self) -> OdometrySettings {
        OdometrySettings {
            period: Duration::from_millis(self.period_ms),
            calibration_timeout: Duration::from_millis(self.calibration_timeout_ms),
            calibration_attempts: self.calibration_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ControllerConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub windup_range: f64,
    pub small_error: f64,
    pub small_error_timeout_ms: u64,
    pub large_error: f64,
    pub large_error_timeout_ms: u64,
    #[serde(default)]
    pub max_acceleration: f64,
}

impl From<ControllerConfig> for ControllerSettings {
    fn from(c: ControllerConfig) -> Self {
        ControllerSettings {
            kp: c.kp,
            ki: c.ki,
            kd: c.kd,
            windup_range: c.windup_range,
            small_error: c.small_error,
            small_error_timeout: Duration::from_millis(c.small_error_timeout_ms),
            large_error: c.large_error,
            large_error_timeout: Duration::from_millis(c.large_error_timeout_ms),
            max_acceleration: c.max_acceleration,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct MotionConfig {
    pub loop_period_ms: u64,
    pub close_range: f64,
}

impl From<MotionConfig> for MotionSettings {
    fn from(c: MotionConfig) -> Self {
        MotionSettings {
            loop_period: Duration::from_millis(c.loop_period_ms),
            close_range: c.close_range,
        }
    }
}

/// Loads settings from a TOML file, overridden by `FERRODRIVE__SECTION__KEY`
/// environment variables.
pub fn load_config(path: impl AsRef<Path>) -> Result<Settings, ConfigError> {
    let path = path.as_ref();
    info!("Attempting to load configuration from {}", path.display());

    let settings: Result<Settings, ConfigError> = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(true))
        .add_source(environment())
        .build()
        .and_then(|config| config.try_deserialize());

    match settings {
        Ok(settings) => {
            info!("Successfully loaded configuration: {:?}", settings);
            Ok(settings)
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            Err(e)
        }
    }
}

/// Parses settings from TOML text, still honouring environment overrides.
pub fn parse_config(toml: &str) -> Result<Settings, ConfigError> {
    Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .add_source(environment())
        .build()?
        .try_deserialize()
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    const EPSILON: f64 = 1e-9;

    fn default_path() -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join(DEFAULT_CONFIG_PATH)
    }

    #[test]
    fn test_default_file_is_valid() {
        let settings = load_config(default_path()).unwrap();

        assert!(settings.drivetrain.geometry().is_ok());
        assert!(!settings.odometry.vertical_wheels.is_empty());
        let linear: ControllerSettings = settings.linear.into();
        let angular: ControllerSettings = settings.angular.into();
        assert!(linear.validate().is_ok());
        assert!(angular.validate().is_ok());
        assert!(settings.odometry.settings().calibration_attempts > 0);
        assert!(!MotionSettings::from(settings.motion).loop_period.is_zero());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(load_config("config/does-not-exist.toml").is_err());
    }

    #[test]
    fn test_parse_converts_units() {
        let settings = parse_config(
            r#"
            [drivetrain]
            track_width = 12.0
            wheel_diameter = 4.0
            rpm = 200.0

            [odometry]
            period_ms = 5
            calibration_timeout_ms = 1500
            calibration_attempts = 2
            initial_pose = { x = 1.0, y = 2.0, heading = 45.0 }

            [[odometry.vertical_wheels]]
            diameter = 2.75
            offset = -1.5

            [odometry.horizontal_wheel]
            diameter = 2.0
            offset = -4.0
            gear_ratio = 0.5

            [linear]
            kp = 0.1
            ki = 0.0
            kd = 0.5
            windup_range = 3.0
            small_error = 1.0
            small_error_timeout_ms = 100
            large_error = 3.0
            large_error_timeout_ms = 500

            [angular]
            kp = 0.02
            ki = 0.0
            kd = 0.1
            windup_range = 0.0
            small_error = 1.0
            small_error_timeout_ms = 100
            large_error = 3.0
            large_error_timeout_ms = 500
            max_acceleration = 0.2

            [motion]
            loop_period_ms = 10
            close_range = 6.0
            "#,
        )
        .unwrap();

        let odom = settings.odometry.settings();
        assert_eq!(odom.period, Duration::from_millis(5));
        assert_eq!(odom.calibration_timeout, Duration::from_millis(1500));
        assert_eq!(settings.odometry.initial_pose, Some(Pose::new(1.0, 2.0, 45.0)));

        let vertical = settings.odometry.vertical_wheels[0];
        assert!((vertical.gear_ratio - 1.0).abs() < EPSILON);
        let horizontal = settings.odometry.horizontal_wheel.unwrap();
        assert!((horizontal.gear_ratio - 0.5).abs() < EPSILON);

        let linear = ControllerSettings::from(settings.linear);
        assert_eq!(linear.small_error_timeout, Duration::from_millis(100));
        assert_eq!(linear.max_acceleration, 0.0);
        let angular = ControllerSettings::from(settings.angular);
        assert!((angular.max_acceleration - 0.2).abs() < EPSILON);

        let motion = MotionSettings::from(settings.motion);
        assert!((motion.close_range - 6.0).abs() < EPSILON);
    }

    #[test]
    fn test_parse_rejects_missing_section() {
        assert!(parse_config("[drivetrain]\ntrack_width = 1.0").is_err());
    }

    #[test]
    fn test_bad_geometry_is_invalid_configuration() {
        let drivetrain = DrivetrainConfig {
            track_width: 0.0,
            wheel_diameter: 3.25,
            rpm: 450.0,
        };
        assert!(matches!(
            drivetrain.geometry(),
            Err(ChassisError::InvalidConfiguration(_))
        ));
    }
}

// Timeouts, topics, drive configuration
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::drive::{Axis, DriveTiming, MotionConfig};

// Runtime loop frequency (telemetry publish rate)
pub const LOOP_HZ: u64 = 10;

// Zenoh topics
pub const TOPIC_CMD: &str = "gantry/cmd"; // commands
pub const TOPIC_STATE: &str = "gantry/state/drives"; // per-axis telemetry
pub const TOPIC_HEALTH: &str = "gantry/state/health"; // health status

// Drive controller addresses (Modbus/TCP)
pub const DRIVE_X_ADDR: &str = "192.168.2.21:502";
pub const DRIVE_Y_ADDR: &str = "192.168.2.22:502";
pub const DRIVE_Z_ADDR: &str = "192.168.2.23:502";

// Register sequence timing
pub const POLL_INTERVAL_MS: u64 = 100;
pub const SETTLE_MS: u64 = 200;
pub const PULSE_HOLD_MS: u64 = 400;
pub const MOTION_TIMEOUT_MS: u64 = 120_000;

/// Error type for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// Fieldbus endpoints of the three drive controllers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrivesConfig {
    pub x: String,
    pub y: String,
    pub z: String,
    pub unit_id: u8,
    pub io_timeout_ms: u64,
}

impl Default for DrivesConfig {
    fn default() -> Self {
        Self {
            x: DRIVE_X_ADDR.to_string(),
            y: DRIVE_Y_ADDR.to_string(),
            z: DRIVE_Z_ADDR.to_string(),
            unit_id: 0,
            io_timeout_ms: crate::drive::modbus::DEFAULT_TIMEOUT_MS,
        }
    }
}

impl DrivesConfig {
    pub fn address(&self, axis: Axis) -> &str {
        match axis {
            Axis::X => &self.x,
            Axis::Y => &self.y,
            Axis::Z => &self.z,
        }
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Register sequence timing, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub poll_interval_ms: u64,
    pub settle_ms: u64,
    pub pulse_hold_ms: u64,
    pub motion_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: POLL_INTERVAL_MS,
            settle_ms: SETTLE_MS,
            pulse_hold_ms: PULSE_HOLD_MS,
            motion_timeout_ms: MOTION_TIMEOUT_MS,
        }
    }
}

impl From<TimingConfig> for DriveTiming {
    fn from(t: TimingConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(t.poll_interval_ms),
            settle: Duration::from_millis(t.settle_ms),
            pulse_hold: Duration::from_millis(t.pulse_hold_ms),
            motion_timeout: Duration::from_millis(t.motion_timeout_ms),
        }
    }
}

/// Top-level runtime configuration
///
/// Every field has a default, so an empty file is a valid configuration.
///
/// ```toml
/// [drives]
/// x = "192.168.2.21:502"
///
/// [motion]
/// cruise_height_um = 20000
///
/// [motion.calibration_offset]
/// x = 0
/// y = 90000
///
/// [timing]
/// motion_timeout_ms = 60000
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GantryConfig {
    pub drives: DrivesConfig,
    pub motion: MotionConfig,
    pub timing: TimingConfig,
}

impl GantryConfig {
    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound(path.display().to_string())
            } else {
                ConfigError::Parse(e.to_string())
            }
        })?;

        let config: Self =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.motion.bounds;
        if b.x_min > b.x_max || b.y_min > b.y_max {
            return Err(ConfigError::Validation(format!(
                "movement bounds are inverted: {:?}",
                b
            )));
        }
        if !(self.motion.um_per_tick.is_finite() && self.motion.um_per_tick > 0.0) {
            return Err(ConfigError::Validation(
                "um_per_tick must be a positive number".to_string(),
            ));
        }

        let t = &self.timing;
        for (name, value) in [
            ("poll_interval_ms", t.poll_interval_ms),
            ("settle_ms", t.settle_ms),
            ("pulse_hold_ms", t.pulse_hold_ms),
            ("motion_timeout_ms", t.motion_timeout_ms),
            ("io_timeout_ms", self.drives.io_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Validation(format!("{} cannot be zero", name)));
            }
        }

        for axis in Axis::ALL {
            if self.drives.address(axis).is_empty() {
                return Err(ConfigError::Validation(format!(
                    "drive {} address cannot be empty",
                    axis
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let file = write_config("");
        let config = GantryConfig::load(file.path()).unwrap();
        assert_eq!(config, GantryConfig::default());
        assert_eq!(config.motion.cruise_height_um, 20_000);
        assert_eq!(config.motion.calibration_offset.y, 90_000);
        assert_eq!(DriveTiming::from(config.timing), DriveTiming::default());
    }

    #[test]
    fn test_partial_override() {
        let file = write_config(
            r#"
            [drives]
            x = "10.0.0.5:502"

            [motion]
            cruise_height_um = 30000

            [motion.bounds]
            x_min = -1000
            x_max = 1000
            y_min = 0
            y_max = 500

            [timing]
            motion_timeout_ms = 5000
            "#,
        );
        let config = GantryConfig::load(file.path()).unwrap();
        assert_eq!(config.drives.address(Axis::X), "10.0.0.5:502");
        assert_eq!(config.drives.address(Axis::Y), DRIVE_Y_ADDR);
        assert_eq!(config.motion.cruise_height_um, 30_000);
        assert_eq!(config.motion.bounds.x_min, -1000);
        assert_eq!(config.motion.calibration_offset.y, 90_000);
        assert_eq!(config.timing.motion_timeout_ms, 5000);
        assert_eq!(config.timing.settle_ms, SETTLE_MS);
    }

    #[test]
    fn test_missing_file() {
        let err = GantryConfig::load(Path::new("/nonexistent/gantry.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_invalid_toml() {
        let file = write_config("[motion\ncruise_height_um = ");
        assert!(matches!(
            GantryConfig::load(file.path()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_validation() {
        let file = write_config("[motion.bounds]\nx_min = 10\nx_max = 0\ny_min = 0\ny_max = 1\n");
        assert!(matches!(
            GantryConfig::load(file.path()),
            Err(ConfigError::Validation(_))
        ));

        let mut config = GantryConfig::default();
        config.timing.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = GantryConfig::default();
        config.drives.z.clear();
        assert!(config.validate().is_err());
    }
}

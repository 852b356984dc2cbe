//! Configuration system using Figment.
//!
//! This module provides strongly-typed configuration loading for the sequencing
//! core. Configuration is loaded from:
//! 1. A TOML file (base configuration)
//! 2. Environment variables (prefixed with SCOPECTL_)
//!
//! # Environment Variable Overrides
//!
//! Environment variables with the `SCOPECTL_` prefix can override configuration
//! values:
//!
//! ```text
//! SCOPECTL_SERIAL_PORT=/dev/ttyUSB1
//! SCOPECTL_SERIAL_BAUD_RATE=19200
//! SCOPECTL_TIMING_POLLING_INTERVAL=100ms
//! ```
//!
//! # Example
//!
//! ```no_run
//! use scope_ctl::config::Settings;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load_from("config/scope.toml")?;
//!     println!("Stage axes: {}", settings.stage.axes.len());
//!     println!("Banned zones: {}", settings.stage.banned.len());
//!     Ok(())
//! }
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, ScopeError};

/// Top-level settings for the sequencing core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Stage geometry: axis limits and forbidden zones
    #[serde(default)]
    pub stage: StageConfig,
    /// Serial link to the motion controller
    #[serde(default)]
    pub serial: SerialConfig,
    /// Scheduling and polling timing
    #[serde(default)]
    pub timing: TimingConfig,
}

/// Stage geometry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StageConfig {
    /// Soft travel limits per axis, in stage units
    #[serde(default)]
    pub axes: Vec<AxisLimits>,
    /// Forbidden rectangles in XY stage space
    #[serde(default)]
    pub banned: Vec<RectConfig>,
}

/// Soft travel limits for one axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisLimits {
    /// Axis name (e.g., "x", "y", "z")
    pub name: String,
    /// Minimum allowed position
    pub min: f64,
    /// Maximum allowed position
    pub max: f64,
}

/// One forbidden rectangle, given as two opposite corners in XY stage space.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RectConfig {
    /// First corner (x, y)
    pub corner1: (f64, f64),
    /// Opposite corner (x, y)
    pub corner2: (f64, f64),
}

/// Serial link configuration for the motion controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Per-read deadline
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,
    /// How many times a timed-out read is retried before the command fails
    #[serde(default = "default_command_retries")]
    pub command_retries: u32,
    /// Terminator appended to outgoing commands
    #[serde(default = "default_line_terminator")]
    pub line_terminator: String,
    /// Character ending each response line
    #[serde(default = "default_response_delimiter")]
    pub response_delimiter: char,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: default_baud_rate(),
            read_timeout: default_read_timeout(),
            command_retries: default_command_retries(),
            line_terminator: default_line_terminator(),
            response_delimiter: default_response_delimiter(),
        }
    }
}

/// Scheduling and polling timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Width of a trigger toggle pulse
    #[serde(with = "humantime_serde", default = "default_toggle_time")]
    pub toggle_time: Duration,
    /// Interval between position polls while an axis is in motion
    #[serde(with = "humantime_serde", default = "default_polling_interval")]
    pub polling_interval: Duration,
    /// Position delta below which an axis counts as settled, in stage units
    #[serde(default = "default_settle_epsilon")]
    pub settle_epsilon: f64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            toggle_time: default_toggle_time(),
            polling_interval: default_polling_interval(),
            settle_epsilon: default_settle_epsilon(),
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_baud_rate() -> u32 {
    19200
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(500)
}

fn default_command_retries() -> u32 {
    3
}

fn default_line_terminator() -> String {
    "\r\n".to_string()
}

fn default_response_delimiter() -> char {
    '\n'
}

fn default_toggle_time() -> Duration {
    Duration::from_millis(10)
}

fn default_polling_interval() -> Duration {
    Duration::from_millis(150)
}

fn default_settle_epsilon() -> f64 {
    0.1
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load configuration from a TOML file and `SCOPECTL_` environment variables.
    ///
    /// Precedence (highest to lowest):
    /// 1. Environment variables
    /// 2. The TOML file
    ///
    /// After loading, configuration is validated.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCOPECTL_").split("_"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - Axis limits are not inverted
    /// - Banned rectangles are non-degenerate
    /// - Polling interval and toggle width are positive
    pub fn validate(&self) -> AppResult<()> {
        for axis in &self.stage.axes {
            if axis.min >= axis.max {
                return Err(ScopeError::Configuration(format!(
                    "Axis '{}' limits inverted: min {} >= max {}",
                    axis.name, axis.min, axis.max
                )));
            }
        }

        for (i, rect) in self.stage.banned.iter().enumerate() {
            if rect.corner1.0 == rect.corner2.0 || rect.corner1.1 == rect.corner2.1 {
                return Err(ScopeError::Configuration(format!(
                    "Banned rectangle {} is degenerate: {:?} / {:?}",
                    i, rect.corner1, rect.corner2
                )));
            }
        }

        if self.timing.polling_interval.is_zero() {
            return Err(ScopeError::Configuration(
                "Polling interval must be positive".to_string(),
            ));
        }
        if self.timing.polling_interval > Duration::from_millis(150) {
            return Err(ScopeError::Configuration(format!(
                "Polling interval {:?} exceeds the 150ms abort-latency bound",
                self.timing.polling_interval
            )));
        }
        if self.timing.toggle_time.is_zero() {
            return Err(ScopeError::Configuration(
                "Toggle time must be positive".to_string(),
            ));
        }
        if self.timing.settle_epsilon <= 0.0 {
            return Err(ScopeError::Configuration(
                "Settle epsilon must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_defaults_validate() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.timing.settle_epsilon, 0.1);
        assert_eq!(settings.timing.polling_interval, Duration::from_millis(150));
    }

    #[test]
    #[serial]
    fn test_load_full_config() {
        let file = write_config(
            r#"
            [[stage.axes]]
            name = "x"
            min = -25000.0
            max = 25000.0

            [[stage.axes]]
            name = "y"
            min = -12000.0
            max = 12000.0

            [[stage.banned]]
            corner1 = [0.0, 0.0]
            corner2 = [500.0, 800.0]

            [serial]
            port = "/dev/ttyS4"
            baud_rate = 9600

            [timing]
            toggle_time = "5ms"
            polling_interval = "50ms"
            settle_epsilon = 0.05
            "#,
        );

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.stage.axes.len(), 2);
        assert_eq!(settings.stage.banned.len(), 1);
        assert_eq!(settings.serial.port, "/dev/ttyS4");
        assert_eq!(settings.serial.baud_rate, 9600);
        assert_eq!(settings.timing.toggle_time, Duration::from_millis(5));
        assert_eq!(settings.timing.settle_epsilon, 0.05);
    }

    #[test]
    #[serial]
    fn test_inverted_axis_limits_rejected() {
        let file = write_config(
            r#"
            [[stage.axes]]
            name = "x"
            min = 100.0
            max = -100.0
            "#,
        );

        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("inverted"));
    }

    #[test]
    #[serial]
    fn test_degenerate_banned_rectangle_rejected() {
        let file = write_config(
            r#"
            [[stage.banned]]
            corner1 = [5.0, 0.0]
            corner2 = [5.0, 10.0]
            "#,
        );

        let err = Settings::load_from(file.path()).unwrap_err();
        assert!(err.to_string().contains("degenerate"));
    }

    #[test]
    #[serial]
    fn test_env_override() {
        let file = write_config(
            r#"
            [serial]
            port = "/dev/ttyUSB0"
            "#,
        );

        std::env::set_var("SCOPECTL_SERIAL_PORT", "/dev/ttyACM7");
        let settings = Settings::load_from(file.path()).unwrap();
        std::env::remove_var("SCOPECTL_SERIAL_PORT");

        assert_eq!(settings.serial.port, "/dev/ttyACM7");
    }

    #[test]
    #[serial]
    fn test_polling_interval_bound_enforced() {
        let settings = Settings {
            timing: TimingConfig {
                polling_interval: Duration::from_millis(400),
                ..TimingConfig::default()
            },
            ..Settings::default()
        };
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("150ms"));
    }
}

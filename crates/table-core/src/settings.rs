//! Settings using Figment
//!
//! Settings are loaded from:
//! 1. `sandtable.toml` (base configuration)
//! 2. Environment variables prefixed with `SANDTABLE_`, `__` separating sections
//!
//! Environment values win, which is how a deployment overrides the gear ratio
//! without touching the file:
//!
//! ```bash
//! SANDTABLE_TABLE__GEAR_RATIO_OVERRIDE=6.25 sandtable run star.thr
//! ```

use crate::error::{TableError, TableResult};
use crate::table::{HomingMode, TableType};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Controller link.
    pub connection: ConnectionSettings,
    /// Physical table.
    pub table: TableSettings,
    /// Pattern files and clear patterns.
    pub patterns: PatternSettings,
    /// Where the machine state lives.
    pub state: StateSettings,
    /// Visual-feedback behaviour.
    pub visual: VisualSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// How to reach the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Explicit serial port; tried first.
    pub port: Option<String>,
    /// Serial baud rate.
    pub baud_rate: u32,
    /// Ports tried last (platform UARTs that carry console noise).
    pub deprioritized_ports: Vec<String>,
    /// Socket fallback host, used when no serial port exists.
    pub socket_host: String,
    /// Socket fallback port.
    pub socket_port: u16,
    /// Socket connect timeout, seconds.
    pub socket_timeout_secs: u64,
    /// Soft-reset the controller during device initialisation.
    pub reset_on_connect: bool,
    /// Home automatically after connecting.
    pub auto_home: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 115_200,
            deprioritized_ports: vec!["/dev/ttyAMA0".to_string()],
            socket_host: "fluidnc.local".to_string(),
            socket_port: 23,
            socket_timeout_secs: 5,
            reset_on_connect: true,
            auto_home: true,
        }
    }
}

impl ConnectionSettings {
    /// Socket connect timeout.
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }
}

/// Physical table configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSettings {
    /// Force a table type instead of detecting it from steps/mm.
    pub table_type_override: Option<TableType>,
    /// Force a gear ratio.
    pub gear_ratio_override: Option<f64>,
    /// Homing mode; detected from the controller's homing cycle when unset.
    pub homing_mode: Option<HomingMode>,
    /// Theta assigned after sensor homing, degrees.
    pub angular_offset_deg: f64,
    /// Pattern feed rate, mm/min.
    pub speed: f64,
    /// Feed rate for clear patterns; `speed` when unset.
    pub clear_speed: Option<f64>,
    /// Feed rate used for crash homing, mm/min.
    pub homing_speed: f64,
}

impl Default for TableSettings {
    fn default() -> Self {
        Self {
            table_type_override: None,
            gear_ratio_override: None,
            homing_mode: None,
            angular_offset_deg: 0.0,
            speed: 500.0,
            clear_speed: None,
            homing_speed: 400.0,
        }
    }
}

impl TableSettings {
    /// Angular reference offset in radians.
    pub fn angular_offset_rad(&self) -> f64 {
        self.angular_offset_deg.to_radians()
    }
}

/// Pattern directory and clear-pattern overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternSettings {
    /// Directory holding `.thr` files (clear patterns included).
    pub dir: PathBuf,
    /// Custom "clear from inside" file, relative to `dir`.
    pub custom_clear_from_in: Option<String>,
    /// Custom "clear from outside" file, relative to `dir`.
    pub custom_clear_from_out: Option<String>,
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("patterns"),
            custom_clear_from_in: None,
            custom_clear_from_out: None,
        }
    }
}

/// State file location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSettings {
    /// JSON machine-state file.
    pub path: PathBuf,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("state.json"),
        }
    }
}

/// Visual-feedback timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualSettings {
    /// Seconds without a running session before `effect_idle` is re-asserted; 0 disables.
    pub idle_timeout_secs: u64,
    /// Interval of the status broadcast loop, milliseconds.
    pub status_interval_ms: u64,
}

impl Default for VisualSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 0,
            status_interval_ms: 1000,
        }
    }
}

/// Log output configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// trace, debug, info, warn, error
    pub level: String,
    /// pretty, compact, json
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

impl Settings {
    /// Load from `sandtable.toml` in the working directory plus environment.
    pub fn load() -> TableResult<Self> {
        Self::load_from("sandtable.toml")
    }

    /// Load from a specific file path; a missing file yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> TableResult<Self> {
        let settings: Settings = Self::figment(path.as_ref()).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// The provider stack, exposed so callers can layer extra providers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("SANDTABLE_").split("__"))
    }

    /// Validate settings after loading.
    pub fn validate(&self) -> TableResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(TableError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(TableError::Config(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        if self.table.speed <= 0.0 {
            return Err(TableError::Config(format!(
                "Invalid speed {}. Must be positive",
                self.table.speed
            )));
        }

        if let Some(ratio) = self.table.gear_ratio_override {
            if ratio <= 0.0 {
                return Err(TableError::Config(format!(
                    "Invalid gear_ratio_override {}. Must be positive",
                    ratio
                )));
            }
        }

        if self.connection.baud_rate == 0 {
            return Err(TableError::Config("baud_rate must be non-zero".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.connection.baud_rate, 115_200);
        assert_eq!(settings.patterns.dir, PathBuf::from("patterns"));
    }

    #[test]
    fn test_file_values_and_enums() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandtable.toml");
        std::fs::write(
            &path,
            r#"
[connection]
port = "/dev/ttyUSB0"

[table]
table_type_override = "dune_weaver_mini"
homing_mode = "sensor"
angular_offset_deg = 90.0
clear_speed = 400.0
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.connection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(
            settings.table.table_type_override,
            Some(TableType::DuneWeaverMini)
        );
        assert_eq!(settings.table.homing_mode, Some(HomingMode::Sensor));
        assert_eq!(settings.table.clear_speed, Some(400.0));
        assert!((settings.table.angular_offset_rad() - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn test_config_validation() {
        let mut settings = Settings::default();
        settings.logging.level = "loud".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.table.gear_ratio_override = Some(0.0);
        assert!(settings.validate().is_err());
    }
}

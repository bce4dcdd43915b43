//! TOML config file loading and validation.
//!
//! Every field has a default, so an empty (or missing) file yields a working
//! hub with the stock thresholds.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::actuator::parse_endpoint;
use crate::decision::{DurationTable, Thresholds};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

/// `auto` lets recommendations start the pump; `monitor` only records them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    #[default]
    Auto,
    Monitor,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mode: OperationMode,
    pub zone: String,
    pub thresholds: Thresholds,
    pub durations: DurationTable,
    pub sensors: SensorSettings,
    pub device: DeviceSettings,
    pub irrigation: IrrigationSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: OperationMode::Auto,
            zone: "zone1".to_string(),
            thresholds: Thresholds::default(),
            durations: DurationTable::default(),
            sensors: SensorSettings::default(),
            device: DeviceSettings::default(),
            irrigation: IrrigationSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensorSettings {
    /// Readings older than this never start the pump automatically.
    pub freshness_window_sec: u64,
}

impl Default for SensorSettings {
    fn default() -> Self {
        Self {
            freshness_window_sec: 600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Pump controller base URL. Optional: the device may register itself.
    pub endpoint: Option<String>,
    pub command_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub tick_interval_ms: u64,
    pub poll_interval_sec: u64,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            command_timeout_ms: 5_000,
            max_attempts: 3,
            retry_backoff_ms: 500,
            tick_interval_ms: 1_000,
            poll_interval_sec: 30,
        }
    }
}

impl DeviceSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IrrigationSettings {
    pub max_duration_minutes: u32,
    pub event_log_capacity: usize,
    pub decision_history: usize,
}

impl Default for IrrigationSettings {
    fn default() -> Self {
        Self {
            max_duration_minutes: 120,
            event_log_capacity: 100,
            decision_history: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    pub fn freshness_window(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.sensors.freshness_window_sec).unwrap_or(i64::MAX))
    }

    /// Validate all entries. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.zone.trim().is_empty() {
            errors.push("zone is empty".to_string());
        }

        self.validate_thresholds(&mut errors);
        self.validate_durations(&mut errors);
        self.validate_device(&mut errors);

        if self.sensors.freshness_window_sec == 0 {
            errors.push("sensors.freshness_window_sec must be positive".to_string());
        }
        if self.irrigation.event_log_capacity == 0 {
            errors.push("irrigation.event_log_capacity must be positive".to_string());
        }
        if self.irrigation.decision_history == 0 {
            errors.push("irrigation.decision_history must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_thresholds(&self, errors: &mut Vec<String>) {
        let t = &self.thresholds;

        for (name, value) in [
            ("soil_moisture_min", t.soil_moisture_min),
            ("soil_moisture_critical", t.soil_moisture_critical),
            ("humidity_min", t.humidity_min),
        ] {
            if !(0.0..=100.0).contains(&value) {
                errors.push(format!(
                    "thresholds.{name} {value} out of range [0, 100]"
                ));
            }
        }

        if t.soil_moisture_critical >= t.soil_moisture_min {
            errors.push(format!(
                "thresholds.soil_moisture_critical ({}) must be less than soil_moisture_min ({})",
                t.soil_moisture_critical, t.soil_moisture_min
            ));
        }
        if !t.water_level_min.is_finite() || t.water_level_min < 0.0 {
            errors.push(format!(
                "thresholds.water_level_min must be >= 0, got {}",
                t.water_level_min
            ));
        }
        if !t.temperature_max.is_finite() {
            errors.push(format!(
                "thresholds.temperature_max must be finite, got {}",
                t.temperature_max
            ));
        }
    }

    fn validate_durations(&self, errors: &mut Vec<String>) {
        let d = &self.durations;
        let max = self.irrigation.max_duration_minutes;

        if max == 0 {
            errors.push("irrigation.max_duration_minutes must be positive".to_string());
        }
        for (name, value) in [("light", d.light), ("moderate", d.moderate), ("heavy", d.heavy)] {
            if value == 0 {
                errors.push(format!("durations.{name} must be positive"));
            } else if value > max {
                errors.push(format!(
                    "durations.{name} ({value}) exceeds irrigation.max_duration_minutes ({max})"
                ));
            }
        }
        if !(d.light <= d.moderate && d.moderate <= d.heavy) {
            errors.push(format!(
                "durations must satisfy light <= moderate <= heavy, got {} / {} / {}",
                d.light, d.moderate, d.heavy
            ));
        }
    }

    fn validate_device(&self, errors: &mut Vec<String>) {
        let dev = &self.device;

        if let Some(endpoint) = &dev.endpoint {
            if let Err(e) = parse_endpoint(endpoint) {
                errors.push(format!("device.endpoint: {e}"));
            }
        }
        if dev.command_timeout_ms == 0 {
            errors.push("device.command_timeout_ms must be positive".to_string());
        }
        if dev.max_attempts == 0 {
            errors.push("device.max_attempts must be at least 1".to_string());
        }
        if dev.tick_interval_ms == 0 {
            errors.push("device.tick_interval_ms must be positive".to_string());
        }
        if dev.poll_interval_sec == 0 {
            errors.push("device.poll_interval_sec must be positive".to_string());
        } else if dev.poll_interval_sec.saturating_mul(1_000) < dev.tick_interval_ms {
            errors.push(format!(
                "device.poll_interval_sec ({}s) is shorter than device.tick_interval_ms ({}ms)",
                dev.poll_interval_sec, dev.tick_interval_ms
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file means
/// "all defaults".
pub fn load(path: &str) -> Result<Config> {
    let config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        Config::default()
    };
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
mode = "monitor"
zone = "greenhouse"

[thresholds]
soil_moisture_min = 35
soil_moisture_critical = 18
water_level_min = 150
temperature_max = 32
humidity_min = 45

[durations]
light = 5
moderate = 15
heavy = 25

[sensors]
freshness_window_sec = 300

[device]
endpoint = "http://192.168.1.50"
command_timeout_ms = 2000
max_attempts = 4
retry_backoff_ms = 250
tick_interval_ms = 1000
poll_interval_sec = 20

[irrigation]
max_duration_minutes = 60
event_log_capacity = 20
decision_history = 10
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mode, OperationMode::Monitor);
        assert_eq!(config.zone, "greenhouse");
        assert_eq!(config.thresholds.soil_moisture_critical, 18.0);
        assert_eq!(config.durations.heavy, 25);
        assert_eq!(config.device.endpoint.as_deref(), Some("http://192.168.1.50"));
        assert_eq!(config.device.max_attempts, 4);
        assert_eq!(config.irrigation.event_log_capacity, 20);
        assert_eq!(config.freshness_window(), time::Duration::minutes(5));
    }

    #[test]
    fn parse_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        config.validate().unwrap();
        assert_eq!(config.mode, OperationMode::Auto);
        assert_eq!(config.zone, "zone1");
        assert_eq!(config.thresholds, Thresholds::default());
        assert_eq!(config.durations.moderate, 20);
        assert_eq!(config.device.endpoint, None);
        assert_eq!(config.device.poll_interval_sec, 30);
    }

    #[test]
    fn parse_partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str("[thresholds]\nsoil_moisture_min = 40\n").unwrap();
        assert_eq!(config.thresholds.soil_moisture_min, 40.0);
        assert_eq!(config.thresholds.soil_moisture_critical, 20.0);
    }

    #[test]
    fn parse_unknown_mode_fails() {
        assert!(toml::from_str::<Config>("mode = \"yolo\"").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load("/nonexistent/pump-hub/config.toml").unwrap();
        assert_eq!(config.zone, "zone1");
    }

    // -- Thresholds -------------------------------------------------------

    #[test]
    fn critical_must_be_below_min() {
        let mut cfg = Config::default();
        cfg.thresholds.soil_moisture_critical = 30.0;
        assert_validation_err(&cfg, "must be less than soil_moisture_min");
    }

    #[test]
    fn moisture_threshold_out_of_range() {
        let mut cfg = Config::default();
        cfg.thresholds.soil_moisture_min = 120.0;
        assert_validation_err(&cfg, "soil_moisture_min 120 out of range");
    }

    #[test]
    fn negative_water_level_min() {
        let mut cfg = Config::default();
        cfg.thresholds.water_level_min = -5.0;
        assert_validation_err(&cfg, "water_level_min must be >= 0");
    }

    // -- Durations --------------------------------------------------------

    #[test]
    fn zero_duration_rejected() {
        let mut cfg = Config::default();
        cfg.durations.light = 0;
        assert_validation_err(&cfg, "durations.light must be positive");
    }

    #[test]
    fn durations_must_be_ordered() {
        let mut cfg = Config::default();
        cfg.durations.moderate = 40;
        assert_validation_err(&cfg, "light <= moderate <= heavy");
    }

    #[test]
    fn heavy_cannot_exceed_max_duration() {
        let mut cfg = Config::default();
        cfg.irrigation.max_duration_minutes = 25;
        assert_validation_err(&cfg, "durations.heavy (30) exceeds");
    }

    // -- Device -----------------------------------------------------------

    #[test]
    fn bad_endpoint_rejected() {
        let mut cfg = Config::default();
        cfg.device.endpoint = Some("ftp://pump".into());
        assert_validation_err(&cfg, "device.endpoint");
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut cfg = Config::default();
        cfg.device.max_attempts = 0;
        assert_validation_err(&cfg, "max_attempts must be at least 1");
    }

    #[test]
    fn poll_shorter_than_tick_rejected() {
        let mut cfg = Config::default();
        cfg.device.tick_interval_ms = 5_000;
        cfg.device.poll_interval_sec = 2;
        assert_validation_err(&cfg, "shorter than device.tick_interval_ms");
    }

    #[test]
    fn huge_intervals_do_not_overflow() {
        let mut cfg = Config::default();
        cfg.device.poll_interval_sec = u64::MAX;
        cfg.sensors.freshness_window_sec = u64::MAX;
        cfg.validate().unwrap();
        assert_eq!(cfg.freshness_window(), time::Duration::seconds(i64::MAX));
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.zone = " ".into();
        cfg.thresholds.soil_moisture_critical = 50.0;
        cfg.device.command_timeout_ms = 0;
        cfg.sensors.freshness_window_sec = 0;

        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("4 errors"), "{msg}");
        assert!(msg.contains("zone is empty"), "{msg}");
        assert!(msg.contains("soil_moisture_critical"), "{msg}");
        assert!(msg.contains("command_timeout_ms"), "{msg}");
        assert!(msg.contains("freshness_window_sec"), "{msg}");
    }
}

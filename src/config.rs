//! Simulation configuration.
//!
//! Every field has a default, so an empty TOML file is a valid config.
//! A loaded config is always validated before it is returned.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::types::Point;

/// Errors arising from configuration parsing, validation, or I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error reading {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: &'static str,
    },
}

/// Refill base position.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseConfig {
    pub x: f64,
    pub y: f64,
}

impl Default for BaseConfig {
    fn default() -> Self {
        Self { x: 0.0, y: 0.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimConfig {
    /// Capacity of the pending-fire queue and the completion buffer.
    pub buffer_capacity: usize,
    /// Litres of agent a unit carries when full.
    pub agent_capacity: i64,
    /// Distance units per simulated second.
    pub speed: f64,
    /// Real seconds slept per simulated second of travel.
    pub time_scale: f64,
    pub base: BaseConfig,
    pub handler_workers: usize,
    pub query_workers: usize,
    pub poll_interval_ms: u64,
    pub reply_timeout_ms: u64,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            agent_capacity: 15,
            speed: 10.0,
            time_scale: 0.01,
            base: BaseConfig::default(),
            handler_workers: 4,
            query_workers: 4,
            poll_interval_ms: 50,
            reply_timeout_ms: 5_000,
            log_level: "info".to_string(),
        }
    }
}

impl SimConfig {
    pub fn base_position(&self) -> Point {
        Point::new(self.base.x, self.base.y)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    /// Real time spent covering `distance`.
    pub fn travel_time(&self, distance: f64) -> Duration {
        let seconds = distance / self.speed * self.time_scale;
        if seconds.is_finite() && seconds > 0.0 {
            Duration::from_secs_f64(seconds)
        } else {
            Duration::ZERO
        }
    }

    /// Check constraints serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, value: String, reason| {
            Err(ConfigError::InvalidField {
                field,
                value,
                reason,
            })
        };
        if self.buffer_capacity == 0 {
            return invalid("buffer_capacity", "0".into(), "must be > 0");
        }
        if self.agent_capacity <= 0 {
            return invalid(
                "agent_capacity",
                self.agent_capacity.to_string(),
                "must be > 0",
            );
        }
        if !(self.speed.is_finite() && self.speed > 0.0) {
            return invalid("speed", self.speed.to_string(), "must be a positive number");
        }
        if !(self.time_scale.is_finite() && self.time_scale >= 0.0) {
            return invalid("time_scale", self.time_scale.to_string(), "must be >= 0");
        }
        if self.handler_workers == 0 {
            return invalid("handler_workers", "0".into(), "must be > 0");
        }
        if self.query_workers == 0 {
            return invalid("query_workers", "0".into(), "must be > 0");
        }
        if self.poll_interval_ms == 0 {
            return invalid("poll_interval_ms", "0".into(), "must be > 0");
        }
        Ok(())
    }
}

/// Parse and validate a config from TOML text. `source_name` only shows up
/// in error messages.
pub fn load_from_str(content: &str, source_name: &str) -> Result<SimConfig, ConfigError> {
    let config: SimConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
        file: source_name.to_string(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

pub fn load_from_file(path: &Path) -> Result<SimConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        file: path.display().to_string(),
        source,
    })?;
    load_from_str(&content, &path.display().to_string())
}

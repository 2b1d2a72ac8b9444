//! Settings for the resolvers and the simulation harness.
//!
//! Settings are stored at `<config dir>/tunnelcache/config.json`. A missing
//! file means defaults; unknown or missing fields fall back to defaults too.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backoff::BackoffSchedule;
use crate::error::SettingsError;

/// Application name used for the config directory
const APP_NAME: &str = "tunnelcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Environment variable overriding the simulated failure rate
pub const FAILURE_RATE_ENV: &str = "TUNNELCACHE_FAILURE_RATE";

/// Environment variable overriding the simulated daemon latency
pub const LATENCY_ENV: &str = "TUNNELCACHE_LATENCY_MS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSettings {
    pub scale_ms: u64,
    pub max_delay_ms: u64,
    /// Derived from scale and ceiling when absent
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl ScheduleSettings {
    fn from_schedule(schedule: BackoffSchedule) -> Self {
        Self {
            scale_ms: schedule.scale.as_millis() as u64,
            max_delay_ms: schedule.max_delay.as_millis() as u64,
            max_retries: Some(schedule.max_retries),
        }
    }

    pub fn schedule(&self) -> Result<BackoffSchedule, SettingsError> {
        let scale = Duration::from_millis(self.scale_ms);
        let max_delay = Duration::from_millis(self.max_delay_ms);
        match self.max_retries {
            Some(max_retries) => BackoffSchedule::try_new(scale, max_delay, max_retries),
            None => BackoffSchedule::from_scale_and_cap(scale, max_delay),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Probability in [0, 1] that a simulated daemon call fails
    pub failure_rate: f64,
    /// Simulated round-trip time for every daemon call
    pub latency_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            failure_rate: 0.3,
            latency_ms: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub location: ScheduleSettings,
    pub account: ScheduleSettings,
    pub simulation: SimulationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            location: ScheduleSettings::from_schedule(BackoffSchedule::LOCATION),
            account: ScheduleSettings::from_schedule(BackoffSchedule::ACCOUNT),
            simulation: SimulationSettings::default(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let settings: Settings = serde_json::from_str(&contents)?;
            debug!(?path, "Settings loaded");
            Ok(settings)
        } else {
            debug!(?path, "No settings file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), SettingsError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf, SettingsError> {
        let config_dir = dirs::config_dir().ok_or(SettingsError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply overrides from the environment, ignoring unparsable values
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(rate) = lookup(FAILURE_RATE_ENV)
            .and_then(|v| v.parse::<f64>().ok())
            .filter(|rate| rate.is_finite())
        {
            self.simulation.failure_rate = rate.clamp(0.0, 1.0);
        }
        if let Some(latency) = lookup(LATENCY_ENV).and_then(|v| v.parse::<u64>().ok()) {
            self.simulation.latency_ms = latency;
        }
    }
}

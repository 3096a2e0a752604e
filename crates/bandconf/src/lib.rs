//! Configuration loading for bandstand.
//!
//! This crate provides configuration loading with minimal dependencies so
//! every bandstand crate can import it without circular dependency issues.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (paths, agent command, capacity limits): things that
//!   cannot change once a jam is running.
//!
//! - **Tuning** (`TuningConfig`): numeric knobs for the aggregation engine.
//!   The defaults are what the band was voiced against; they are knobs, not
//!   invariants, and nothing outside this crate hard-codes them.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/bandstand/config.toml` (system)
//! 2. `~/.config/bandstand/config.toml` (user)
//! 3. `./bandstand.toml` (local override)
//! 4. Environment variables (`BANDSTAND_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! personas_dir = "~/.config/bandstand/personas"
//! policy_path = "~/.config/bandstand/policy.md"
//! reference_path = "~/.config/bandstand/pattern-reference.md"
//!
//! [agent]
//! command = "/usr/local/bin/band-agent"
//! args = ["--quiet"]
//!
//! [limits]
//! max_concurrent_jams = 4
//! max_total_agent_processes = 16
//!
//! [timing]
//! auto_tick_secs = 45
//! agent_timeout_secs = 90
//!
//! [tuning]
//! tempo_delta_clamp_pct = 50.0
//! energy_delta_clamp = 3.0
//! auto_tick_dampening = 0.5
//! bpm_floor = 40
//! bpm_ceiling = 300
//! ```

pub mod loader;

pub use loader::{
    discover_config_files, discover_config_files_with_override, expand_path, ConfigSources,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete bandstand configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BandConfig {
    /// Prompt resource locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Agent subprocess invocation.
    #[serde(default)]
    pub agent: AgentConfig,

    /// Global capacity ceilings for admission.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Timers and timeouts.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Aggregation engine knobs.
    #[serde(default)]
    pub tuning: TuningConfig,

    /// Logging.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl BandConfig {
    /// Load config from standard locations plus environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources().map(|(config, _)| config)
    }

    /// Load config, preferring an explicit CLI-provided file over the local
    /// override.
    pub fn load_with_override(
        cli_path: Option<&std::path::Path>,
    ) -> Result<Self, ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = BandConfig::default();

        for path in discover_config_files_with_override(cli_path) {
            let overlay = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, overlay);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);
        Ok(config)
    }

    /// Load config and report where values came from.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = BandConfig::default();

        for path in discover_config_files() {
            let overlay = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, overlay);
            sources.files.push(path);
        }

        loader::apply_env_overrides(&mut config, &mut sources);
        Ok((config, sources))
    }
}

/// Where prompt resources live. Read at session start, never written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory of per-role persona files (`<role>.md`).
    pub personas_dir: PathBuf,
    /// Shared band policy document.
    pub policy_path: PathBuf,
    /// Pattern language reference document.
    pub reference_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = directories::BaseDirs::new()
            .map(|d| d.config_dir().join("bandstand"))
            .unwrap_or_else(|| PathBuf::from("/etc/bandstand"));
        Self {
            personas_dir: base.join("personas"),
            policy_path: base.join("policy.md"),
            reference_path: base.join("pattern-reference.md"),
        }
    }
}

/// How to launch one agent subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Agent binary. Treated as an opaque request/response program speaking
    /// the newline-delimited JSON protocol on stdio.
    pub command: PathBuf,
    /// Extra arguments passed on every spawn.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: PathBuf::from("band-agent"),
            args: Vec::new(),
        }
    }
}

/// Global capacity ceilings consumed by the admission controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_concurrent_jams: u32,
    pub max_total_agent_processes: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jams: 4,
            max_total_agent_processes: 16,
        }
    }
}

/// Timers and timeouts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Seconds between auto-evolution ticks. The timer is one-shot and
    /// re-armed at turn completion, so slow turns stretch the interval.
    pub auto_tick_secs: u64,
    /// Ceiling on a single agent's turn round-trip.
    pub agent_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            auto_tick_secs: 45,
            agent_timeout_secs: 90,
        }
    }
}

/// Aggregation engine knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Largest tempo opinion accepted from a single agent, in percent.
    pub tempo_delta_clamp_pct: f64,
    /// Largest energy opinion accepted from a single agent, in levels.
    pub energy_delta_clamp: f64,
    /// Extra factor applied to averaged deltas on auto-tick turns.
    pub auto_tick_dampening: f64,
    pub bpm_floor: u32,
    pub bpm_ceiling: u32,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            tempo_delta_clamp_pct: 50.0,
            energy_delta_clamp: 3.0,
            auto_tick_dampening: 0.5,
            bpm_floor: 40,
            bpm_ceiling: 300,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Env-filter directive string, e.g. "info" or "bandstand=debug".
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = BandConfig::default();
        assert_eq!(config.limits.max_concurrent_jams, 4);
        assert_eq!(config.limits.max_total_agent_processes, 16);
        assert_eq!(config.tuning.tempo_delta_clamp_pct, 50.0);
        assert_eq!(config.tuning.energy_delta_clamp, 3.0);
        assert_eq!(config.tuning.auto_tick_dampening, 0.5);
        assert!(config.tuning.bpm_floor < config.tuning.bpm_ceiling);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = BandConfig::default();
        let text = toml::to_string(&config).unwrap();
        let back: BandConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.timing.auto_tick_secs, config.timing.auto_tick_secs);
        assert_eq!(back.telemetry.log_level, config.telemetry.log_level);
    }
}

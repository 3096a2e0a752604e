//! Config file discovery, loading, and environment variable overlay.

use crate::{BandConfig, ConfigError};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/bandstand/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("bandstand/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    // CLI override takes precedence over local
    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("bandstand.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<BandConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config: BandConfig =
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    config.paths.personas_dir = expand_path(&config.paths.personas_dir.to_string_lossy());
    config.paths.policy_path = expand_path(&config.paths.policy_path.to_string_lossy());
    config.paths.reference_path = expand_path(&config.paths.reference_path.to_string_lossy());

    Ok(config)
}

/// Merge two configs, with `overlay` taking precedence.
///
/// Merge is section-granular: an overlay section that differs from the
/// built-in defaults replaces the base section wholesale.
pub fn merge_configs(base: BandConfig, overlay: BandConfig) -> BandConfig {
    let defaults = BandConfig::default();

    macro_rules! pick {
        ($section:ident) => {
            if format!("{:?}", overlay.$section) != format!("{:?}", defaults.$section) {
                overlay.$section
            } else {
                base.$section
            }
        };
    }

    BandConfig {
        paths: pick!(paths),
        agent: pick!(agent),
        limits: pick!(limits),
        timing: pick!(timing),
        tuning: pick!(tuning),
        telemetry: pick!(telemetry),
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut BandConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("BANDSTAND_PERSONAS_DIR") {
        config.paths.personas_dir = expand_path(&v);
        sources.env_overrides.push("BANDSTAND_PERSONAS_DIR".to_string());
    }
    if let Ok(v) = env::var("BANDSTAND_POLICY_PATH") {
        config.paths.policy_path = expand_path(&v);
        sources.env_overrides.push("BANDSTAND_POLICY_PATH".to_string());
    }
    if let Ok(v) = env::var("BANDSTAND_REFERENCE_PATH") {
        config.paths.reference_path = expand_path(&v);
        sources.env_overrides.push("BANDSTAND_REFERENCE_PATH".to_string());
    }
    if let Ok(v) = env::var("BANDSTAND_AGENT_COMMAND") {
        config.agent.command = expand_path(&v);
        sources.env_overrides.push("BANDSTAND_AGENT_COMMAND".to_string());
    }

    if let Ok(v) = env::var("BANDSTAND_MAX_JAMS") {
        if let Ok(n) = v.parse() {
            config.limits.max_concurrent_jams = n;
            sources.env_overrides.push("BANDSTAND_MAX_JAMS".to_string());
        }
    }
    if let Ok(v) = env::var("BANDSTAND_MAX_AGENT_PROCESSES") {
        if let Ok(n) = v.parse() {
            config.limits.max_total_agent_processes = n;
            sources
                .env_overrides
                .push("BANDSTAND_MAX_AGENT_PROCESSES".to_string());
        }
    }
    if let Ok(v) = env::var("BANDSTAND_AUTO_TICK_SECS") {
        if let Ok(n) = v.parse() {
            config.timing.auto_tick_secs = n;
            sources.env_overrides.push("BANDSTAND_AUTO_TICK_SECS".to_string());
        }
    }
    if let Ok(v) = env::var("BANDSTAND_AGENT_TIMEOUT_SECS") {
        if let Ok(n) = v.parse() {
            config.timing.agent_timeout_secs = n;
            sources
                .env_overrides
                .push("BANDSTAND_AGENT_TIMEOUT_SECS".to_string());
        }
    }

    if let Ok(v) = env::var("BANDSTAND_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("BANDSTAND_LOG_LEVEL".to_string());
    }
    // Also support RUST_LOG
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
        PathBuf::from(path)
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

//! Configuration loading from `~/.recall/config.toml`.

use recall_types::config::RecallConfig;
use recall_types::error::{RecallError, RecallResult};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load configuration from a TOML file, falling back to defaults.
///
/// A missing, unreadable or unparsable file is logged and yields
/// [`RecallConfig::default`].
pub fn load_config(path: Option<&Path>) -> RecallConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return RecallConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match parse_config(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                RecallConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            RecallConfig::default()
        }
    }
}

/// Parse configuration TOML, rejecting invalid values.
pub fn parse_config(contents: &str) -> RecallResult<RecallConfig> {
    let config: RecallConfig =
        toml::from_str(contents).map_err(|e| RecallError::Config(e.to_string()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &RecallConfig) -> RecallResult<()> {
    let threshold = config.consolidation.similarity_threshold;
    if !(-1.0..=1.0).contains(&threshold) {
        return Err(RecallError::Config(format!(
            "consolidation.similarity_threshold must be within [-1, 1], got {threshold}"
        )));
    }
    if config.graph.default_depth > config.graph.max_depth {
        return Err(RecallError::Config(format!(
            "graph.default_depth ({}) exceeds graph.max_depth ({})",
            config.graph.default_depth, config.graph.max_depth
        )));
    }
    recall_types::memory::validate_importance(config.memory.important_threshold)
        .map_err(|e| RecallError::Config(format!("memory.important_threshold: {e}")))?;
    Ok(())
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    recall_home().join("config.toml")
}

/// Get the default Recall home directory.
pub fn recall_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".recall")
}

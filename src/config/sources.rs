//! Configuration sources and their precedence.

use crate::error::BatchError;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tracing::debug;

pub(super) type Builder = ConfigBuilder<DefaultState>;

/// Builder with the built-in provider table applied.
pub(super) fn builder_with_defaults() -> Result<Builder, ConfigError> {
    Config::builder()
        .set_default("default_provider", "pollinations")?
        .set_default("providers.pollinations.provider_type", "pollinations")?
        .set_default("providers.simulated.provider_type", "simulated")?
        .set_default("providers.simulated.expected_duration_secs", 2)
}

/// Path to the per-user config file, e.g. `~/.config/storyboard/config.toml`.
pub fn global_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "storyboard").map(|dirs| dirs.config_dir().join("config.toml"))
}

pub(super) fn add_global_file(builder: Builder) -> Builder {
    match global_config_path() {
        Some(path) if path.exists() => {
            debug!(config_path = %path.display(), "Loading global configuration");
            builder.add_source(File::from(path.as_path()).required(false))
        }
        _ => builder,
    }
}

pub(super) fn add_explicit_file(builder: Builder, path: &Path) -> Result<Builder, BatchError> {
    if !path.is_file() {
        return Err(BatchError::ConfigError(format!(
            "Config file not found: {}",
            path.display()
        )));
    }
    debug!(config_path = %path.display(), "Loading configuration file");
    Ok(builder.add_source(File::from(path).required(true)))
}

/// `STORYBOARD__SCHEDULER__TASK_TIMEOUT_SECS=30` sets `scheduler.task_timeout_secs`.
pub(super) fn add_environment(builder: Builder) -> Builder {
    builder.add_source(
        Environment::with_prefix("STORYBOARD")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true),
    )
}

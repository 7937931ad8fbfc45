use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::{Configuration, ValidationError, WriterSettings};

/// Name of the job configuration file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.json";

/// Prefix for writer settings environment variables.
const ENV_PREFIX: &str = "BQ_WRITER";

/// Separator between environment variable prefix and key segments.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested keys in environment variables.
const ENV_SEPARATOR: &str = "__";

/// Errors that can occur while loading the job configuration and writer settings.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    /// `config.json` is not present in the data directory.
    #[error("configuration file `{0}` does not exist")]
    MissingConfigurationFile(PathBuf),

    /// `config.json` exists but could not be read.
    #[error("failed to read configuration from `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// `config.json` is not valid JSON or has an invalid shape.
    #[error("failed to parse configuration from `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Environment variable settings could not be read or deserialized.
    #[error("failed to load writer settings from environment variables: {0}")]
    EnvironmentVariables(#[source] config::ConfigError),

    /// Settings were read but hold invalid values.
    #[error("invalid writer settings: {0}")]
    InvalidSettings(#[from] ValidationError),
}

/// Loads `config.json` from the platform data directory.
///
/// Only the document shape is checked here, see [`Configuration::validate`] for the semantic
/// checks.
pub fn load_configuration(data_dir: &Path) -> Result<Configuration, LoadConfigError> {
    let path = data_dir.join(CONFIG_FILE_NAME);
    if !path.is_file() {
        return Err(LoadConfigError::MissingConfigurationFile(path));
    }

    let contents = std::fs::read_to_string(&path).map_err(|source| LoadConfigError::Read {
        path: path.clone(),
        source,
    })?;

    serde_json::from_str(&contents).map_err(|source| LoadConfigError::Parse { path, source })
}

/// Loads [`WriterSettings`] from `BQ_WRITER_`-prefixed environment variables.
///
/// `BQ_WRITER_POLL_INTERVAL_SECONDS=10` sets `poll_interval_seconds`; unset keys keep their
/// defaults.
pub fn load_settings() -> Result<WriterSettings, LoadConfigError> {
    load_settings_from(None)
}

fn load_settings_from(
    source: Option<config::Map<String, String>>,
) -> Result<WriterSettings, LoadConfigError> {
    let environment = config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR)
        .try_parsing(true)
        .source(source);

    let settings: WriterSettings = config::Config::builder()
        .add_source(environment)
        .build()
        .map_err(LoadConfigError::EnvironmentVariables)?
        .try_deserialize()
        .map_err(LoadConfigError::EnvironmentVariables)?;

    settings.validate()?;

    Ok(settings)
}

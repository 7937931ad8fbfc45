use std::path::PathBuf;

use serde::Deserialize;

use crate::ValidationError;

const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;

const DEFAULT_MAX_POLL_RETRIES: u32 = 720;

/// Runtime tuning of the writer, read from `BQ_WRITER_`-prefixed environment variables.
///
/// None of these are part of the job configuration. Defaults wait up to an hour for a load job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WriterSettings {
    /// Seconds to sleep between two load job status refreshes.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    /// Number of status refreshes before a load job is considered stuck.
    #[serde(default = "default_max_poll_retries")]
    pub max_poll_retries: u32,
    /// Root of the per-run scratch directories, the system temp directory when unset.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

fn default_poll_interval_seconds() -> u64 {
    DEFAULT_POLL_INTERVAL_SECONDS
}

fn default_max_poll_retries() -> u32 {
    DEFAULT_MAX_POLL_RETRIES
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            max_poll_retries: DEFAULT_MAX_POLL_RETRIES,
            scratch_dir: None,
        }
    }
}

impl WriterSettings {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.poll_interval_seconds == 0 {
            return Err(ValidationError::PollIntervalZero);
        }

        if self.max_poll_retries == 0 {
            return Err(ValidationError::MaxPollRetriesZero);
        }

        Ok(())
    }

    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("bigquery-writer"))
    }
}

use thiserror::Error;

/// Configuration validation errors.
///
/// Every variant is something the user can fix by editing the job configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The `parameters` object is missing or has no keys.
    #[error("Configuration parameters are empty.")]
    EmptyParameters,
    /// The `run` action needs at least the `tables` key.
    #[error("There are no tables specified in the configuration.")]
    MissingTables,
    /// Dataset name is missing or blank.
    #[error("Dataset name must not be empty.")]
    EmptyDataset,
    /// Neither `parameters.project` nor the service account carries a project id.
    #[error("Project id is not defined in the configuration.")]
    MissingProject,
    /// No OAuth authorization and no service account block.
    #[error("Authorization credentials are missing in the configuration.")]
    MissingAuthorization,
    /// The OAuth `#data` blob is not a JSON object with tokens.
    #[error("OAuth authorization data is not valid JSON: {0}")]
    InvalidOAuthData(String),
    /// A credential field is missing or blank.
    #[error("Credential field `{0}` is missing or empty.")]
    MissingCredentialField(&'static str),
    /// `action` carries a value the connector does not know.
    #[error("Unknown action `{0}`.")]
    UnknownAction(String),
    /// Partitioning `type` is not one of `none`, `time` or `range`.
    #[error("Unsupported partitioning type `{0}`.")]
    UnsupportedPartitioning(String),
    /// Time partitioning granularity is not one of `DAY`, `HOUR`, `MONTH` or `YEAR`.
    #[error("Unsupported time partitioning granularity `{0}`.")]
    UnsupportedGranularity(String),
    /// A partitioning kind is missing one of its required fields.
    #[error("Partitioning of type `{kind}` requires `{field}`.")]
    MissingPartitioningField {
        kind: &'static str,
        field: &'static str,
    },
    /// Range partitioning bounds are inconsistent.
    #[error("Invalid range partitioning: {0}")]
    InvalidRange(String),
    /// Poll interval of load jobs cannot be zero.
    #[error("`poll_interval_seconds` cannot be zero")]
    PollIntervalZero,
    /// Maximum poll retries of load jobs cannot be zero.
    #[error("`max_poll_retries` cannot be zero")]
    MaxPollRetriesZero,
    /// `chunkSize` must be a positive number of megabytes.
    #[error("Chunk size of table `{0}` must be greater than zero.")]
    ChunkSizeZero(String),
}

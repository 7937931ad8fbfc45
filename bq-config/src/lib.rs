//! Typed configuration for the BigQuery writer.
//!
//! The platform hands every job a `config.json` inside the data directory. This crate
//! deserializes it into [`Configuration`], exposes the getters the writer and the driver
//! need and validates everything that can be checked before talking to BigQuery.

mod action;
mod base;
mod configuration;
mod credentials;
mod load;
mod settings;
mod table;

pub use action::Action;
pub use base::ValidationError;
pub use configuration::{
    Authorization, Configuration, InputMapping, OAuthApi, OAuthApiCredentials, Parameters,
    ServiceAccountParameters, Storage, StorageInput,
};
pub use credentials::{Credentials, GOOGLE_TOKEN_URI, OAuthCredentials, ServiceAccountCredentials};
pub use load::{CONFIG_FILE_NAME, LoadConfigError, load_configuration, load_settings};
pub use settings::WriterSettings;
pub use table::{
    ColumnDefinition, DEFAULT_CHUNK_SIZE_MB, Partitioning, RangePartitioning, TableDefinition,
    TimePartitioning, TimePartitioningGranularity,
};

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::ValidationError;

/// Size in megabytes above which an input file is split before upload.
pub const DEFAULT_CHUNK_SIZE_MB: u64 = 1000;

/// Declarative description of one destination table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    /// Platform identifier of the source table, matched against the input mapping.
    pub table_id: String,
    /// Name of the table in BigQuery.
    #[serde(default)]
    pub db_name: String,
    /// Ordered column definitions. Absent and empty are both reported by the writer.
    #[serde(default)]
    pub items: Option<Vec<ColumnDefinition>>,
    /// Append to an existing table instead of replacing it.
    #[serde(default)]
    pub incremental: bool,
    /// Tables with `export: false` are skipped entirely.
    #[serde(default = "default_export")]
    pub export: bool,
    #[serde(default)]
    pub partitioning: Partitioning,
    /// Clustering columns in priority order.
    #[serde(default)]
    pub clustering: Vec<String>,
    /// Split threshold in megabytes, [`DEFAULT_CHUNK_SIZE_MB`] when unset.
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

fn default_export() -> bool {
    true
}

impl TableDefinition {
    pub fn chunk_size_mb(&self) -> u64 {
        self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE_MB)
    }

    /// Source column names in configuration order.
    pub fn column_names(&self) -> Vec<String> {
        self.items
            .iter()
            .flatten()
            .map(|item| item.name.clone())
            .collect()
    }

    /// Destination column names in configuration order.
    pub fn destination_column_names(&self) -> Vec<String> {
        self.items
            .iter()
            .flatten()
            .map(|item| item.db_name.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.chunk_size == Some(0) {
            return Err(ValidationError::ChunkSizeZero(self.table_id.clone()));
        }

        Ok(())
    }
}

/// One column of a [`TableDefinition`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDefinition {
    /// Column name in the CSV header.
    pub name: String,
    /// Column name in BigQuery.
    pub db_name: String,
    /// BigQuery scalar type name. Parsed by the writer so the error can name the table.
    #[serde(rename = "type", default)]
    pub column_type: Option<String>,
}

/// Partitioning directive of a table.
///
/// Deserialized from `{"type": "none" | "time" | "range", ...}` and validated while parsing, so an
/// unsupported kind fails when the configuration is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "PartitioningConfig")]
pub enum Partitioning {
    #[default]
    None,
    Time(TimePartitioning),
    Range(RangePartitioning),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimePartitioning {
    /// Partitioning column, ingestion time when `None`.
    pub column: Option<String>,
    pub granularity: TimePartitioningGranularity,
    pub expiration_ms: Option<i64>,
    pub require_filter: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangePartitioning {
    pub column: String,
    pub start: i64,
    pub end: i64,
    pub interval: i64,
    pub require_filter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimePartitioningGranularity {
    Hour,
    #[default]
    Day,
    Month,
    Year,
}

impl TimePartitioningGranularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimePartitioningGranularity::Hour => "HOUR",
            TimePartitioningGranularity::Day => "DAY",
            TimePartitioningGranularity::Month => "MONTH",
            TimePartitioningGranularity::Year => "YEAR",
        }
    }
}

impl FromStr for TimePartitioningGranularity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HOUR" => Ok(TimePartitioningGranularity::Hour),
            "DAY" => Ok(TimePartitioningGranularity::Day),
            "MONTH" => Ok(TimePartitioningGranularity::Month),
            "YEAR" => Ok(TimePartitioningGranularity::Year),
            _ => Err(ValidationError::UnsupportedGranularity(s.to_owned())),
        }
    }
}

impl fmt::Display for TimePartitioningGranularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw shape of the partitioning object before validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PartitioningConfig {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    column: Option<String>,
    granularity: Option<String>,
    expiration_ms: Option<i64>,
    #[serde(default)]
    require_filter: bool,
    start: Option<i64>,
    end: Option<i64>,
    interval: Option<i64>,
}

impl TryFrom<PartitioningConfig> for Partitioning {
    type Error = ValidationError;

    fn try_from(config: PartitioningConfig) -> Result<Self, Self::Error> {
        let kind = config.kind.as_deref().unwrap_or("none");

        match kind {
            "none" | "" => Ok(Partitioning::None),
            "time" => {
                let granularity = match config.granularity.as_deref() {
                    Some(granularity) => granularity.parse()?,
                    None => TimePartitioningGranularity::default(),
                };

                Ok(Partitioning::Time(TimePartitioning {
                    column: config.column.filter(|column| !column.is_empty()),
                    granularity,
                    expiration_ms: config.expiration_ms,
                    require_filter: config.require_filter,
                }))
            }
            "range" => {
                let column = config
                    .column
                    .filter(|column| !column.is_empty())
                    .ok_or(ValidationError::MissingPartitioningField {
                        kind: "range",
                        field: "column",
                    })?;
                let start = config.start.ok_or(ValidationError::MissingPartitioningField {
                    kind: "range",
                    field: "start",
                })?;
                let end = config.end.ok_or(ValidationError::MissingPartitioningField {
                    kind: "range",
                    field: "end",
                })?;
                let interval = config
                    .interval
                    .ok_or(ValidationError::MissingPartitioningField {
                        kind: "range",
                        field: "interval",
                    })?;

                if interval <= 0 {
                    return Err(ValidationError::InvalidRange(format!(
                        "interval must be positive, got {interval}"
                    )));
                }
                if end <= start {
                    return Err(ValidationError::InvalidRange(format!(
                        "end ({end}) must be greater than start ({start})"
                    )));
                }

                Ok(Partitioning::Range(RangePartitioning {
                    column,
                    start,
                    end,
                    interval,
                    require_filter: config.require_filter,
                }))
            }
            other => Err(ValidationError::UnsupportedPartitioning(other.to_owned())),
        }
    }
}

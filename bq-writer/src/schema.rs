//! Mapping between declarative column definitions and BigQuery schemas.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use bq_config::TableDefinition;

use crate::bail;
use crate::error::{ErrorKind, WriterError, WriterResult};

/// BigQuery scalar column types accepted in table definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Bytes,
    Integer,
    Float,
    Numeric,
    BigNumeric,
    Boolean,
    Timestamp,
    Date,
    Time,
    Datetime,
    Geography,
    Json,
}

impl FieldType {
    /// Name used by the BigQuery REST API.
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "STRING",
            FieldType::Bytes => "BYTES",
            FieldType::Integer => "INTEGER",
            FieldType::Float => "FLOAT",
            FieldType::Numeric => "NUMERIC",
            FieldType::BigNumeric => "BIGNUMERIC",
            FieldType::Boolean => "BOOLEAN",
            FieldType::Timestamp => "TIMESTAMP",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Datetime => "DATETIME",
            FieldType::Geography => "GEOGRAPHY",
            FieldType::Json => "JSON",
        }
    }
}

impl FromStr for FieldType {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let field_type = match s.trim().to_ascii_uppercase().as_str() {
            "STRING" => FieldType::String,
            "BYTES" => FieldType::Bytes,
            "INTEGER" | "INT64" => FieldType::Integer,
            "FLOAT" | "FLOAT64" => FieldType::Float,
            "NUMERIC" | "DECIMAL" => FieldType::Numeric,
            "BIGNUMERIC" | "BIGDECIMAL" => FieldType::BigNumeric,
            "BOOLEAN" | "BOOL" => FieldType::Boolean,
            "TIMESTAMP" => FieldType::Timestamp,
            "DATE" => FieldType::Date,
            "TIME" => FieldType::Time,
            "DATETIME" => FieldType::Datetime,
            "GEOGRAPHY" => FieldType::Geography,
            "JSON" => FieldType::Json,
            _ => bail!(
                ErrorKind::InvalidFieldType,
                "Invalid column type",
                format!("{s} is not a valid value")
            ),
        };

        Ok(field_type)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FieldMode {
    #[default]
    Nullable,
    Required,
    Repeated,
}

impl FieldMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldMode::Nullable => "NULLABLE",
            FieldMode::Required => "REQUIRED",
            FieldMode::Repeated => "REPEATED",
        }
    }
}

/// One column of a BigQuery table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: String,
    pub field_type: FieldType,
    pub mode: FieldMode,
}

impl FieldSchema {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            mode: FieldMode::Nullable,
        }
    }
}

/// Ordered BigQuery schema derived from a table definition.
pub type ColumnSchema = Vec<FieldSchema>;

/// Builds the BigQuery schema of a table from its column definitions, keeping their order.
pub fn derive_schema(table: &TableDefinition) -> WriterResult<ColumnSchema> {
    let items = match table.items.as_deref() {
        Some(items) if !items.is_empty() => items,
        _ => bail!(
            ErrorKind::SchemaError,
            "Table has no columns",
            format!("Table {} has no columns defined.", table.table_id)
        ),
    };

    items
        .iter()
        .map(|item| -> WriterResult<FieldSchema> {
            let Some(column_type) = item.column_type.as_deref().filter(|t| !t.trim().is_empty())
            else {
                bail!(
                    ErrorKind::SchemaError,
                    "Column has no type",
                    format!(
                        "Column {} of table {} has no type defined.",
                        item.name, table.table_id
                    )
                );
            };

            let field_type = column_type.parse::<FieldType>().map_err(|err| {
                crate::writer_error!(
                    ErrorKind::InvalidFieldType,
                    "Invalid column type",
                    format!(
                        "{} Column {} of table {}.",
                        err.message(),
                        item.name,
                        table.table_id
                    )
                )
            })?;

            Ok(FieldSchema::new(item.db_name.clone(), field_type))
        })
        .collect()
}

/// Header row of a CSV file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsvHeader {
    pub columns: Vec<String>,
    /// Byte offset of the first data row.
    pub data_offset: u64,
}

/// Reads the header row of a comma separated, double quoted CSV file.
///
/// Only the first record is parsed.
pub fn read_csv_header(path: &Path) -> WriterResult<CsvHeader> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b',')
        .quote(b'"')
        .has_headers(true)
        .from_path(path)?;

    let columns = reader
        .headers()?
        .iter()
        .map(str::to_owned)
        .collect::<Vec<_>>();
    let data_offset = reader.position().byte();

    Ok(CsvHeader {
        columns,
        data_offset,
    })
}

pub fn read_csv_header_columns(path: &Path) -> WriterResult<Vec<String>> {
    read_csv_header(path).map(|header| header.columns)
}

/// Compares two column name sequences position by position.
///
/// Reordered but otherwise identical columns fail, as do sequences of different length.
pub fn validate_order<E, A>(
    expected: &[E],
    actual: &[A],
    expected_label: &str,
    actual_label: &str,
) -> WriterResult<()>
where
    E: AsRef<str>,
    A: AsRef<str>,
{
    let matches = expected.len() == actual.len()
        && expected
            .iter()
            .zip(actual)
            .all(|(expected, actual)| expected.as_ref() == actual.as_ref());

    if !matches {
        bail!(
            ErrorKind::ColumnOrderMismatch,
            "Column order mismatch",
            format!(
                "Column order mismatch. Actual {actual_label}: {}. Expected {expected_label}: {}.",
                join(actual),
                join(expected)
            )
        );
    }

    Ok(())
}

fn join<S: AsRef<str>>(names: &[S]) -> String {
    names
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(", ")
}

use std::fmt;
use std::path::PathBuf;

use bq_config::{Partitioning, TableDefinition};

use crate::schema::ColumnSchema;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectInfo {
    pub id: String,
    pub friendly_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    pub project_id: String,
    pub dataset_id: String,
    pub location: Option<String>,
}

/// Live table as reported by BigQuery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableInfo {
    pub dataset_id: String,
    pub table_id: String,
    /// Column names in physical order.
    pub column_names: Vec<String>,
    pub num_rows: Option<u64>,
}

/// Everything needed to create a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    pub table_id: String,
    pub schema: ColumnSchema,
    pub partitioning: Partitioning,
    pub clustering: Vec<String>,
}

impl TableSpec {
    pub fn from_definition(table: &TableDefinition, schema: ColumnSchema) -> Self {
        Self {
            table_id: table.db_name.clone(),
            schema,
            partitioning: table.partitioning.clone(),
            clustering: table.clustering.clone(),
        }
    }
}

/// Appending load of one local CSV file into a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub dataset_id: String,
    pub table_id: String,
    pub path: PathBuf,
    pub schema: ColumnSchema,
    pub skip_leading_rows: u32,
    pub allow_quoted_newlines: bool,
    pub preserve_ascii_control_characters: bool,
}

impl LoadRequest {
    /// CSV load that allows quoted newlines, keeps control characters and appends rows.
    pub fn csv(
        dataset_id: impl Into<String>,
        table_id: impl Into<String>,
        path: impl Into<PathBuf>,
        schema: ColumnSchema,
        skip_leading_rows: u32,
    ) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
            path: path.into(),
            schema,
            skip_leading_rows,
            allow_quoted_newlines: true,
            preserve_ascii_control_characters: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Done,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Done => "DONE",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub reason: Option<String>,
    /// Summary of the failure.
    pub message: String,
    /// Individual problems, usually one per rejected row or column.
    pub details: Vec<String>,
}

impl JobError {
    /// Returns the most specific description available.
    ///
    /// The summary usually only says that the job gave up, the row and column diagnostics are in
    /// the details.
    pub fn diagnostic(&self) -> String {
        let details = self
            .details
            .iter()
            .filter(|detail| **detail != self.message)
            .map(String::as_str)
            .collect::<Vec<_>>();

        if details.is_empty() {
            self.message.clone()
        } else {
            details.join("; ")
        }
    }
}

/// Handle of an asynchronous load job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJob {
    pub job_id: String,
    pub location: Option<String>,
    pub state: JobState,
    /// Only set once the job is [`JobState::Done`].
    pub error: Option<JobError>,
}

impl LoadJob {
    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
}

impl QueryResult {
    /// Value of the first column of the first row.
    pub fn scalar(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

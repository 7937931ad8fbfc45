//! JSON resources of the BigQuery REST API v2.

use serde::{Deserialize, Serialize};

use crate::warehouse::{DatasetInfo, JobError, JobState, LoadJob, ProjectInfo, TableInfo};

/// Error document returned with non-success statuses.
#[derive(Debug, Deserialize)]
pub(crate) struct ErrorResponse {
    pub error: ApiError,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiError {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub errors: Vec<ErrorProto>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(crate) struct ErrorProto {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProjectList {
    #[serde(default)]
    pub projects: Vec<ProjectListEntry>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProjectListEntry {
    #[serde(default)]
    pub id: Option<String>,
    pub project_reference: ProjectReference,
    #[serde(default)]
    pub friendly_name: Option<String>,
}

impl From<ProjectListEntry> for ProjectInfo {
    fn from(entry: ProjectListEntry) -> Self {
        ProjectInfo {
            id: entry.id.unwrap_or(entry.project_reference.project_id),
            friendly_name: entry.friendly_name,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProjectReference {
    pub project_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DatasetList {
    #[serde(default)]
    pub datasets: Vec<Dataset>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Dataset {
    pub dataset_reference: DatasetReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl From<Dataset> for DatasetInfo {
    fn from(dataset: Dataset) -> Self {
        DatasetInfo {
            project_id: dataset.dataset_reference.project_id,
            dataset_id: dataset.dataset_reference.dataset_id,
            location: dataset.location,
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct DatasetReference {
    pub project_id: String,
    pub dataset_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Table {
    pub table_reference: TableReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<TableSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_partitioning: Option<TimePartitioning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_partitioning: Option<RangePartitioning>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clustering: Option<Clustering>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_partition_filter: Option<bool>,
    /// Int64 values are strings in the REST API.
    #[serde(default, skip_serializing)]
    pub num_rows: Option<String>,
}

impl From<Table> for TableInfo {
    fn from(table: Table) -> Self {
        TableInfo {
            dataset_id: table.table_reference.dataset_id,
            table_id: table.table_reference.table_id,
            column_names: table
                .schema
                .map(|schema| schema.fields.into_iter().map(|field| field.name).collect())
                .unwrap_or_default(),
            num_rows: table.num_rows.and_then(|rows| rows.parse().ok()),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TableReference {
    pub project_id: String,
    pub dataset_id: String,
    pub table_id: String,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub(crate) struct TableSchema {
    #[serde(default)]
    pub fields: Vec<TableFieldSchema>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct TableFieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TimePartitioning {
    #[serde(rename = "type")]
    pub granularity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_ms: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct RangePartitioning {
    pub field: String,
    pub range: PartitionRange,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct PartitionRange {
    pub start: String,
    pub end: String,
    pub interval: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct Clustering {
    pub fields: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Job {
    pub job_reference: JobReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<JobConfiguration>,
    #[serde(default, skip_serializing)]
    pub status: Option<JobStatus>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobReference {
    pub project_id: String,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub(crate) struct JobConfiguration {
    pub load: JobConfigurationLoad,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobConfigurationLoad {
    pub destination_table: TableReference,
    pub schema: TableSchema,
    pub source_format: String,
    pub skip_leading_rows: u32,
    pub allow_quoted_newlines: bool,
    pub preserve_ascii_control_characters: bool,
    pub write_disposition: String,
    pub create_disposition: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JobStatus {
    pub state: String,
    #[serde(default)]
    pub error_result: Option<ErrorProto>,
    #[serde(default)]
    pub errors: Vec<ErrorProto>,
}

impl Job {
    pub fn into_load_job(self) -> LoadJob {
        let (state, error) = match self.status {
            Some(status) => {
                let state = match status.state.as_str() {
                    "DONE" => JobState::Done,
                    "RUNNING" => JobState::Running,
                    _ => JobState::Pending,
                };
                let error = status.error_result.map(|result| JobError {
                    reason: result.reason,
                    message: result.message,
                    details: status
                        .errors
                        .into_iter()
                        .map(|error| error.message)
                        .collect(),
                });
                (state, error)
            }
            None => (JobState::Pending, None),
        };

        LoadJob {
            job_id: self.job_reference.job_id,
            location: self.job_reference.location,
            state,
            error,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryRequest<'a> {
    pub query: &'a str,
    pub use_legacy_sql: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<&'a str>,
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QueryResponse {
    #[serde(default)]
    pub job_complete: bool,
    #[serde(default)]
    pub job_reference: Option<JobReference>,
    #[serde(default)]
    pub schema: Option<TableSchema>,
    #[serde(default)]
    pub rows: Vec<QueryRow>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueryRow {
    #[serde(default)]
    pub f: Vec<QueryCell>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct QueryCell {
    #[serde(default)]
    pub v: Option<serde_json::Value>,
}

impl QueryCell {
    pub fn into_string(self) -> Option<String> {
        match self.v? {
            serde_json::Value::Null => None,
            serde_json::Value::String(value) => Some(value),
            other => Some(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

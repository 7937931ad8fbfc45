use std::fmt;
use std::sync::Arc;

use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::{Body, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

use crate::bigquery::auth::TokenProvider;
use crate::bigquery::model::{
    Clustering, Dataset, DatasetList, DatasetReference, ErrorResponse, Job, JobConfiguration,
    JobConfigurationLoad, JobReference, PartitionRange, ProjectList, QueryRequest, QueryResponse,
    RangePartitioning, Table, TableFieldSchema, TableReference, TableSchema, TimePartitioning,
};
use crate::error::{ErrorKind, WriterError, WriterResult};
use crate::schema::ColumnSchema;
use crate::warehouse::{
    DatasetInfo, LoadJob, LoadRequest, ProjectInfo, QueryResult, TableInfo, TableSpec, Warehouse,
};
use crate::writer_error;
use bq_config::Partitioning;

/// Base URL of the BigQuery REST API.
pub const BIGQUERY_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";

/// Base URL for media uploads of load jobs.
pub const BIGQUERY_UPLOAD_URL: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";

/// Server side wait of a single query request.
const QUERY_TIMEOUT_MS: u64 = 10_000;

/// Number of follow up requests before an unfinished query is abandoned.
const MAX_QUERY_POLLS: u32 = 30;

/// Client for the BigQuery REST API bound to one project and location.
///
/// Every method issues exactly one logical call. Retries are applied by the caller through
/// [`crate::retry::RetryPolicy`], the only repetition done here is a single replay after the
/// access token was rejected.
pub struct BigQueryClient {
    http: reqwest::Client,
    token_provider: Arc<dyn TokenProvider>,
    project_id: String,
    location: Option<String>,
    base_url: String,
    upload_url: String,
}

impl fmt::Debug for BigQueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BigQueryClient")
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .field("base_url", &self.base_url)
            .field("upload_url", &self.upload_url)
            .finish()
    }
}

impl BigQueryClient {
    pub fn new(
        http: reqwest::Client,
        token_provider: Arc<dyn TokenProvider>,
        project_id: impl Into<String>,
        location: Option<String>,
    ) -> Self {
        Self {
            http,
            token_provider,
            project_id: project_id.into(),
            location,
            base_url: BIGQUERY_BASE_URL.to_owned(),
            upload_url: BIGQUERY_UPLOAD_URL.to_owned(),
        }
    }

    /// Points the client at another API endpoint, e.g. an emulator.
    pub fn with_base_urls(
        mut self,
        base_url: impl Into<String>,
        upload_url: impl Into<String>,
    ) -> Self {
        self.base_url = base_url.into();
        self.upload_url = upload_url.into();
        self
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    fn url(&self, base: &str, segments: &[&str]) -> WriterResult<Url> {
        let mut url = Url::parse(base).map_err(|err| {
            writer_error!(
                ErrorKind::InvalidState,
                "Invalid BigQuery endpoint",
                format!("{base}: {err}")
            )
        })?;
        url.path_segments_mut()
            .map_err(|()| {
                writer_error!(
                    ErrorKind::InvalidState,
                    "Invalid BigQuery endpoint",
                    base.to_owned()
                )
            })?
            .pop_if_empty()
            .extend(segments);

        Ok(url)
    }

    fn api_url(&self, segments: &[&str]) -> WriterResult<Url> {
        self.url(&self.base_url, segments)
    }

    /// Sends a request built by `build`, replaying it once with a fresh token after a 401.
    async fn execute<F>(&self, build: F) -> WriterResult<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder + Send + Sync,
    {
        let token = self.token_provider.access_token().await?;
        let response = build(&self.http).bearer_auth(token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check_status(response).await;
        }

        debug!("access token rejected, requesting a new one");
        self.token_provider.invalidate().await;
        let token = self.token_provider.access_token().await?;
        let response = build(&self.http).bearer_auth(token).send().await?;

        check_status(response).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> WriterResult<T> {
        let response = self.execute(|http| http.get(url.clone())).await?;

        Ok(response.json().await?)
    }

    /// Like [`BigQueryClient::get_json`] but maps 404 to `None`.
    async fn get_optional<T: DeserializeOwned>(&self, url: Url) -> WriterResult<Option<T>> {
        match self.get_json(url).await {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::DestinationNotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn table_reference(&self, dataset_id: &str, table_id: &str) -> TableReference {
        TableReference {
            project_id: self.project_id.clone(),
            dataset_id: dataset_id.to_owned(),
            table_id: table_id.to_owned(),
        }
    }

    fn table_resource(&self, dataset_id: &str, spec: &TableSpec) -> Table {
        let mut table = Table {
            table_reference: self.table_reference(dataset_id, &spec.table_id),
            schema: Some(table_schema(&spec.schema)),
            time_partitioning: None,
            range_partitioning: None,
            clustering: None,
            require_partition_filter: None,
            num_rows: None,
        };

        match &spec.partitioning {
            Partitioning::None => {}
            Partitioning::Time(time) => {
                table.time_partitioning = Some(TimePartitioning {
                    granularity: time.granularity.as_str().to_owned(),
                    field: time.column.clone(),
                    expiration_ms: time.expiration_ms.map(|ms| ms.to_string()),
                });
                table.require_partition_filter = time.require_filter.then_some(true);
            }
            Partitioning::Range(range) => {
                table.range_partitioning = Some(RangePartitioning {
                    field: range.column.clone(),
                    range: PartitionRange {
                        start: range.start.to_string(),
                        end: range.end.to_string(),
                        interval: range.interval.to_string(),
                    },
                });
                table.require_partition_filter = range.require_filter.then_some(true);
            }
        }

        if !spec.clustering.is_empty() {
            table.clustering = Some(Clustering {
                fields: spec.clustering.clone(),
            });
        }

        table
    }
}

fn table_schema(schema: &ColumnSchema) -> TableSchema {
    TableSchema {
        fields: schema
            .iter()
            .map(|field| TableFieldSchema {
                name: field.name.clone(),
                field_type: field.field_type.as_str().to_owned(),
                mode: Some(field.mode.as_str().to_owned()),
            })
            .collect(),
    }
}

async fn check_status(response: Response) -> WriterResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();

    Err(status_error(status, &body))
}

/// Classifies a non-success response by its status and BigQuery error reason.
fn status_error(status: StatusCode, body: &str) -> WriterError {
    let (message, reason) = match serde_json::from_str::<ErrorResponse>(body) {
        Ok(response) => {
            let reason = response
                .error
                .errors
                .first()
                .and_then(|error| error.reason.clone());
            (response.error.message, reason)
        }
        Err(_) if body.trim().is_empty() => (status.to_string(), None),
        Err(_) => (body.trim().to_owned(), None),
    };

    let (kind, description) = match status {
        StatusCode::BAD_REQUEST => (
            ErrorKind::DestinationInvalidRequest,
            "BigQuery rejected the request",
        ),
        StatusCode::UNAUTHORIZED => (
            ErrorKind::AuthenticationError,
            "BigQuery rejected the credentials",
        ),
        StatusCode::FORBIDDEN if reason.as_deref() == Some("rateLimitExceeded") => (
            ErrorKind::DestinationRateLimited,
            "BigQuery rate limit exceeded",
        ),
        StatusCode::FORBIDDEN => (
            ErrorKind::DestinationPermissionDenied,
            "BigQuery denied access",
        ),
        StatusCode::NOT_FOUND => (
            ErrorKind::DestinationNotFound,
            "BigQuery resource not found",
        ),
        StatusCode::TOO_MANY_REQUESTS => (
            ErrorKind::DestinationRateLimited,
            "BigQuery rate limit exceeded",
        ),
        status if status.is_server_error() => (
            ErrorKind::DestinationUnavailable,
            "BigQuery is unavailable",
        ),
        _ => (ErrorKind::DestinationError, "BigQuery request failed"),
    };

    writer_error!(kind, description, message)
}

impl Warehouse for BigQueryClient {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn list_projects(&self) -> WriterResult<Vec<ProjectInfo>> {
        let mut projects = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.api_url(&["projects"])?;
            if let Some(token) = page_token.as_deref() {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let page: ProjectList = self.get_json(url).await?;
            projects.extend(page.projects.into_iter().map(ProjectInfo::from));

            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(projects)
    }

    async fn list_datasets(&self, project_id: &str) -> WriterResult<Vec<DatasetInfo>> {
        let mut datasets = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.api_url(&["projects", project_id, "datasets"])?;
            if let Some(token) = page_token.as_deref() {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let page: DatasetList = self.get_json(url).await?;
            datasets.extend(page.datasets.into_iter().map(DatasetInfo::from));

            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(datasets)
    }

    async fn get_dataset(&self, dataset_id: &str) -> WriterResult<Option<DatasetInfo>> {
        let url = self.api_url(&["projects", &self.project_id, "datasets", dataset_id])?;

        Ok(self
            .get_optional::<Dataset>(url)
            .await?
            .map(DatasetInfo::from))
    }

    async fn create_dataset(&self, dataset_id: &str) -> WriterResult<DatasetInfo> {
        let url = self.api_url(&["projects", &self.project_id, "datasets"])?;
        let dataset = Dataset {
            dataset_reference: DatasetReference {
                project_id: self.project_id.clone(),
                dataset_id: dataset_id.to_owned(),
            },
            location: self.location.clone(),
        };

        let response = self
            .execute(|http| http.post(url.clone()).json(&dataset))
            .await?;
        let dataset: Dataset = response.json().await?;

        Ok(dataset.into())
    }

    async fn delete_dataset(&self, dataset_id: &str, delete_contents: bool) -> WriterResult<()> {
        let mut url = self.api_url(&["projects", &self.project_id, "datasets", dataset_id])?;
        if delete_contents {
            url.query_pairs_mut().append_pair("deleteContents", "true");
        }

        self.execute(|http| http.delete(url.clone())).await?;

        Ok(())
    }

    async fn get_table(&self, dataset_id: &str, table_id: &str) -> WriterResult<Option<TableInfo>> {
        let url = self.api_url(&[
            "projects",
            &self.project_id,
            "datasets",
            dataset_id,
            "tables",
            table_id,
        ])?;

        Ok(self.get_optional::<Table>(url).await?.map(TableInfo::from))
    }

    async fn create_table(&self, dataset_id: &str, spec: &TableSpec) -> WriterResult<TableInfo> {
        let url = self.api_url(&["projects", &self.project_id, "datasets", dataset_id, "tables"])?;
        let table = self.table_resource(dataset_id, spec);

        let response = self
            .execute(|http| http.post(url.clone()).json(&table))
            .await?;
        let table: Table = response.json().await?;

        Ok(table.into())
    }

    async fn delete_table(&self, dataset_id: &str, table_id: &str) -> WriterResult<()> {
        let url = self.api_url(&[
            "projects",
            &self.project_id,
            "datasets",
            dataset_id,
            "tables",
            table_id,
        ])?;

        self.execute(|http| http.delete(url.clone())).await?;

        Ok(())
    }

    async fn query(&self, sql: &str) -> WriterResult<QueryResult> {
        let url = self.api_url(&["projects", &self.project_id, "queries"])?;
        let request = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            location: self.location.as_deref(),
            timeout_ms: QUERY_TIMEOUT_MS,
        };

        let mut response: QueryResponse = self
            .execute(|http| http.post(url.clone()).json(&request))
            .await?
            .json()
            .await?;

        let mut polls = 0;
        while !response.job_complete {
            polls += 1;
            let Some(job) = response.job_reference.as_ref().filter(|_| polls <= MAX_QUERY_POLLS)
            else {
                return Err(writer_error!(
                    ErrorKind::InvalidState,
                    "Query did not complete",
                    sql.to_owned()
                ));
            };

            let mut url = self.api_url(&["projects", &self.project_id, "queries", &job.job_id])?;
            url.query_pairs_mut()
                .append_pair("timeoutMs", &QUERY_TIMEOUT_MS.to_string());
            if let Some(location) = job.location.as_deref() {
                url.query_pairs_mut().append_pair("location", location);
            }
            response = self.get_json(url).await?;
        }

        Ok(QueryResult {
            columns: response
                .schema
                .map(|schema| schema.fields.into_iter().map(|field| field.name).collect())
                .unwrap_or_default(),
            rows: response
                .rows
                .into_iter()
                .map(|row| row.f.into_iter().map(|cell| cell.into_string()).collect())
                .collect(),
        })
    }

    async fn submit_load(&self, request: &LoadRequest) -> WriterResult<LoadJob> {
        let job = Job {
            job_reference: JobReference {
                project_id: self.project_id.clone(),
                job_id: format!("bigquery_writer_{}", Uuid::new_v4().simple()),
                location: self.location.clone(),
            },
            configuration: Some(JobConfiguration {
                load: JobConfigurationLoad {
                    destination_table: self
                        .table_reference(&request.dataset_id, &request.table_id),
                    schema: table_schema(&request.schema),
                    source_format: "CSV".to_owned(),
                    skip_leading_rows: request.skip_leading_rows,
                    allow_quoted_newlines: request.allow_quoted_newlines,
                    preserve_ascii_control_characters: request.preserve_ascii_control_characters,
                    write_disposition: "WRITE_APPEND".to_owned(),
                    create_disposition: "CREATE_NEVER".to_owned(),
                },
            }),
            status: None,
        };

        let file = tokio::fs::File::open(&request.path).await?;
        let length = file.metadata().await?.len();

        let mut url = self.url(&self.upload_url, &["projects", &self.project_id, "jobs"])?;
        url.query_pairs_mut().append_pair("uploadType", "resumable");

        let response = self
            .execute(|http| {
                http.post(url.clone())
                    .header("X-Upload-Content-Type", "application/octet-stream")
                    .header("X-Upload-Content-Length", length.to_string())
                    .json(&job)
            })
            .await?;
        let session_url = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                writer_error!(
                    ErrorKind::InvalidState,
                    "BigQuery did not return an upload session",
                    format!("Load job {} has no upload location.", job.job_reference.job_id)
                )
            })?;

        debug!(
            job_id = %job.job_reference.job_id,
            path = %request.path.display(),
            bytes = length,
            "uploading load job data"
        );
        let token = self.token_provider.access_token().await?;
        let response = self
            .http
            .put(session_url)
            .bearer_auth(token)
            .header(CONTENT_LENGTH, length.to_string())
            .body(Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await?;
        let job: Job = check_status(response).await?.json().await?;

        Ok(job.into_load_job())
    }

    async fn refresh_job(&self, job: &LoadJob) -> WriterResult<LoadJob> {
        let mut url = self.api_url(&["projects", &self.project_id, "jobs", &job.job_id])?;
        if let Some(location) = job.location.as_deref().or(self.location.as_deref()) {
            url.query_pairs_mut().append_pair("location", location);
        }

        let refreshed: Job = self.get_json(url).await?;

        Ok(refreshed.into_load_job())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_classified() {
        let body = r#"{"error": {"code": 403, "message": "Exceeded rate limits", "errors": [{"reason": "rateLimitExceeded", "message": "Exceeded rate limits"}]}}"#;
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, body).kind(),
            ErrorKind::DestinationRateLimited
        );

        let body = r#"{"error": {"code": 403, "message": "Access Denied", "errors": [{"reason": "accessDenied", "message": "Access Denied"}]}}"#;
        let err = status_error(StatusCode::FORBIDDEN, body);
        assert_eq!(err.kind(), ErrorKind::DestinationPermissionDenied);
        assert_eq!(err.message(), "Access Denied");

        assert_eq!(
            status_error(StatusCode::SERVICE_UNAVAILABLE, "").kind(),
            ErrorKind::DestinationUnavailable
        );
        assert_eq!(
            status_error(StatusCode::TOO_MANY_REQUESTS, "slow down").message(),
            "slow down"
        );
        assert_eq!(
            status_error(StatusCode::CONFLICT, "").kind(),
            ErrorKind::DestinationError
        );
    }
}

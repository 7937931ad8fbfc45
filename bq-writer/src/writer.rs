use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bq_config::TableDefinition;
use futures::future::try_join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::bail;
use crate::error::{ErrorKind, WriterError, WriterResult};
use crate::retry::RetryPolicy;
use crate::schema::{ColumnSchema, derive_schema, read_csv_header, validate_order};
use crate::split::{ScratchDir, Splitter, chunk_count};
use crate::warehouse::{DatasetInfo, LoadJob, LoadRequest, TableInfo, TableSpec, Warehouse};

/// Upper bound of chunk uploads running at the same time.
pub const MAX_CONCURRENT_UPLOADS: usize = 5;

/// Job error reason BigQuery reports when a table received too many updates.
const RATE_LIMIT_REASON: &str = "rateLimitExceeded";

/// How long [`TableWriter::write_sync`] waits for load jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval_seconds: u64,
    pub max_retries: u32,
}

impl PollSettings {
    pub fn new(interval_seconds: u64, max_retries: u32) -> Self {
        Self {
            interval_seconds,
            max_retries,
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    /// Longest time a job is waited for.
    pub fn timeout_seconds(&self) -> u64 {
        self.interval_seconds.saturating_mul(u64::from(self.max_retries))
    }
}

/// Writes CSV files into BigQuery tables.
///
/// Every table goes through the same steps: the schema is derived and checked against the CSV
/// header, the project is verified, the dataset and table are reconciled, and the file is
/// loaded in one job or, when larger than the table's chunk size, in one job per chunk.
#[derive(Debug)]
pub struct TableWriter<W> {
    warehouse: Arc<W>,
    scratch_root: PathBuf,
    max_concurrent_uploads: usize,
    splitter: Splitter,
    transient: RetryPolicy,
    listing: RetryPolicy,
    rate_limited: RetryPolicy,
}

impl<W> TableWriter<W>
where
    W: Warehouse + Send + Sync + 'static,
{
    /// Creates a writer keeping chunk files below `scratch_root`.
    pub fn new(warehouse: Arc<W>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            warehouse,
            scratch_root: scratch_root.into(),
            max_concurrent_uploads: MAX_CONCURRENT_UPLOADS,
            splitter: Splitter::default(),
            transient: RetryPolicy::transient(),
            listing: RetryPolicy::listing(),
            rate_limited: RetryPolicy::rate_limited(),
        }
    }

    /// Replaces the backoff bounds of every retry policy.
    pub fn with_retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.transient = self.transient.with_backoff(initial, max);
        self.listing = self.listing.with_backoff(initial, max);
        self.rate_limited = self.rate_limited.with_backoff(initial, max);
        self
    }

    pub fn with_max_concurrent_uploads(mut self, max_concurrent_uploads: usize) -> Self {
        self.max_concurrent_uploads = max_concurrent_uploads.max(1);
        self
    }

    pub fn with_splitter(mut self, splitter: Splitter) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn warehouse(&self) -> &W {
        &self.warehouse
    }

    /// Fails unless the credentials can see the warehouse's project.
    pub async fn verify_project_exists(&self) -> WriterResult<()> {
        let warehouse = &*self.warehouse;
        let project_id = warehouse.project_id();
        let projects = self
            .listing
            .run("list_projects", move || warehouse.list_projects())
            .await?;

        if !projects.iter().any(|project| project.id == project_id) {
            bail!(
                ErrorKind::ProjectNotFound,
                "Project not found",
                format!("Project {project_id} was not found.")
            );
        }

        Ok(())
    }

    /// Returns the dataset, creating it when it does not exist.
    pub async fn obtain_dataset(&self, dataset_id: &str) -> WriterResult<DatasetInfo> {
        let warehouse = &*self.warehouse;
        let existing = self
            .transient
            .run("get_dataset", move || warehouse.get_dataset(dataset_id))
            .await?;
        if let Some(dataset) = existing {
            return Ok(dataset);
        }

        info!(dataset_id, "creating dataset");
        self.transient
            .run("create_dataset", move || warehouse.create_dataset(dataset_id))
            .await
    }

    /// Makes sure the table exists with the derived schema.
    ///
    /// An incremental load keeps an existing table after checking that its columns are in the
    /// configured order. Any other load replaces the existing table.
    pub async fn prepare_table(
        &self,
        dataset_id: &str,
        table: &TableDefinition,
        schema: &ColumnSchema,
        incremental: bool,
    ) -> WriterResult<TableInfo> {
        let warehouse = &*self.warehouse;
        let spec = &TableSpec::from_definition(table, schema.clone());
        let table_id = spec.table_id.as_str();

        let existing = self
            .transient
            .run("get_table", move || warehouse.get_table(dataset_id, table_id))
            .await?;

        match existing {
            Some(live) if incremental => {
                let configured = schema.iter().map(|field| field.name.as_str()).collect::<Vec<_>>();
                validate_order(&live.column_names, &configured, "BigQuery", "configuration")?;
                debug!(dataset_id, table_id, "appending to existing table");

                return Ok(live);
            }
            Some(_) => {
                info!(dataset_id, table_id, "replacing table");
                self.transient
                    .run("delete_table", move || warehouse.delete_table(dataset_id, table_id))
                    .await?;
            }
            None => info!(dataset_id, table_id, "creating table"),
        }

        self.transient
            .run("create_table", move || warehouse.create_table(dataset_id, spec))
            .await
    }

    /// Loads `csv_path` into `dataset_id` and returns the submitted, not yet finished, jobs.
    ///
    /// The file is consumed when it had to be chunked.
    pub async fn write(
        &self,
        csv_path: &Path,
        dataset_id: &str,
        table: &TableDefinition,
        incremental: bool,
    ) -> WriterResult<Vec<LoadJob>> {
        let table = &table_with_trimmed_name(table);
        let dataset_id = dataset_id.trim();
        if dataset_id.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "Dataset name is empty",
                "Dataset name must not be empty."
            );
        }
        if table.db_name.is_empty() {
            bail!(
                ErrorKind::ConfigError,
                "Table name is empty",
                format!("Table {} has no destination name.", table.table_id)
            );
        }

        self.write_table(csv_path, dataset_id, table, incremental)
            .await
            .map_err(|err| in_table(err, dataset_id, &table.db_name))
    }

    async fn write_table(
        &self,
        csv_path: &Path,
        dataset_id: &str,
        table: &TableDefinition,
        incremental: bool,
    ) -> WriterResult<Vec<LoadJob>> {
        let schema = derive_schema(table)?;
        let header = read_csv_header(csv_path)?;
        validate_order(&header.columns, &table.column_names(), "csv", "configuration")?;

        self.verify_project_exists().await?;
        self.obtain_dataset(dataset_id).await?;
        self.prepare_table(dataset_id, table, &schema, incremental)
            .await?;

        let size = tokio::fs::metadata(csv_path).await?.len();
        let Some(chunks) = chunk_count(size, table.chunk_size_mb()) else {
            let request = LoadRequest::csv(dataset_id, &table.db_name, csv_path, schema, 1);
            return Ok(vec![self.submit(request).await?]);
        };

        info!(
            dataset_id,
            table_id = %table.db_name,
            size,
            chunks,
            "csv file exceeds chunk size"
        );
        let scratch = ScratchDir::create(&self.scratch_root).await?;
        let paths = self
            .splitter
            .split(csv_path, header.data_offset, chunks, scratch.path())
            .await?;
        let jobs = self
            .upload_chunks(dataset_id, &table.db_name, &schema, paths)
            .await;
        scratch.remove().await;

        jobs
    }

    async fn submit(&self, request: LoadRequest) -> WriterResult<LoadJob> {
        submit_load(self.transient, &*self.warehouse, &request).await
    }

    /// Submits one job per chunk, at most `max_concurrent_uploads` at a time.
    async fn upload_chunks(
        &self,
        dataset_id: &str,
        table_id: &str,
        schema: &ColumnSchema,
        paths: Vec<PathBuf>,
    ) -> WriterResult<Vec<LoadJob>> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_uploads));
        let mut uploads = JoinSet::new();
        let count = paths.len();

        for (index, path) in paths.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let warehouse = Arc::clone(&self.warehouse);
            let policy = self.transient;
            let request = LoadRequest::csv(dataset_id, table_id, path, schema.clone(), 0);

            uploads.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|err| {
                    crate::writer_error!(
                        ErrorKind::InvalidState,
                        "Upload pool was closed",
                        err.to_string()
                    )
                })?;
                debug!(chunk = index, path = %request.path.display(), "uploading chunk");
                let job = submit_load(policy, &*warehouse, &request).await?;

                Ok::<_, WriterError>((index, job))
            });
        }

        let mut jobs = Vec::with_capacity(count);
        while let Some(result) = uploads.join_next().await {
            match result? {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    uploads.abort_all();
                    return Err(err);
                }
            }
        }
        jobs.sort_by_key(|(index, _)| *index);

        Ok(jobs.into_iter().map(|(_, job)| job).collect())
    }

    /// Loads `csv_path` and waits until every load job finished.
    ///
    /// Rate limit failures restart the whole load while the source file is still in place,
    /// which is only the case when it was loaded in a single job.
    pub async fn write_sync(
        &self,
        csv_path: &Path,
        dataset_id: &str,
        table: &TableDefinition,
        incremental: bool,
        poll: PollSettings,
    ) -> WriterResult<()> {
        self.rate_limited
            .run_when(
                "write",
                || async move {
                    let jobs = self.write(csv_path, dataset_id, table, incremental).await?;
                    try_join_all(jobs.into_iter().map(|job| self.wait_for_job(job, poll)))
                        .await
                        .map_err(|err| in_table(err, dataset_id.trim(), table.db_name.trim()))?;

                    Ok(())
                },
                |_| csv_path.exists(),
            )
            .await?;

        info!(
            dataset_id,
            table_id = %table.db_name,
            "table loaded"
        );

        Ok(())
    }

    /// Polls `job` until it is done or the poll budget is used up.
    pub async fn wait_for_job(&self, mut job: LoadJob, poll: PollSettings) -> WriterResult<LoadJob> {
        let warehouse = &*self.warehouse;
        let mut polls = 0;

        while !job.is_done() {
            if polls >= poll.max_retries {
                bail!(
                    ErrorKind::LoadJobTimeout,
                    "Load job did not finish",
                    format!(
                        "Load job {} did not finish within {} seconds.",
                        job.job_id,
                        poll.timeout_seconds()
                    )
                );
            }

            tokio::time::sleep(poll.interval()).await;
            let current = &job;
            let refreshed = self
                .transient
                .run("refresh_job", move || warehouse.refresh_job(current))
                .await?;
            job = refreshed;
            polls += 1;
            debug!(job_id = %job.job_id, state = %job.state, polls, "polled load job");
        }

        if let Some(error) = &job.error {
            let kind = if error.reason.as_deref() == Some(RATE_LIMIT_REASON) {
                ErrorKind::DestinationRateLimited
            } else {
                ErrorKind::LoadJobFailed
            };
            bail!(
                kind,
                "Load job failed",
                format!("Load job {} failed: {}", job.job_id, error.diagnostic())
            );
        }

        Ok(job)
    }
}

async fn submit_load<W: Warehouse>(
    policy: RetryPolicy,
    warehouse: &W,
    request: &LoadRequest,
) -> WriterResult<LoadJob> {
    let job = policy
        .run("submit_load", move || warehouse.submit_load(request))
        .await?;
    debug!(job_id = %job.job_id, path = %request.path.display(), "submitted load job");

    Ok(job)
}

fn table_with_trimmed_name(table: &TableDefinition) -> TableDefinition {
    let mut table = table.clone();
    table.db_name = table.db_name.trim().to_owned();
    table
}

/// Names the destination table in the error message.
fn in_table(err: WriterError, dataset_id: &str, table_id: &str) -> WriterError {
    let detail = format!("Table {dataset_id}.{table_id}: {}", err.message());
    err.with_detail(detail)
}

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::bail;
use crate::error::{ErrorKind, WriterError, WriterResult};
use crate::schema::{ColumnSchema, FieldType};
use crate::warehouse::{
    DatasetInfo, JobError, JobState, LoadJob, LoadRequest, ProjectInfo, QueryResult, TableInfo,
    TableSpec, Warehouse,
};

/// Longest dataset id BigQuery accepts.
const MAX_DATASET_ID_LENGTH: usize = 1024;

/// Warehouse call that can be observed and made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ListProjects,
    ListDatasets,
    GetDataset,
    CreateDataset,
    DeleteDataset,
    GetTable,
    CreateTable,
    DeleteTable,
    Query,
    SubmitLoad,
    RefreshJob,
}

#[derive(Debug)]
struct MemoryTable {
    spec: TableSpec,
    rows: Vec<Vec<String>>,
}

impl MemoryTable {
    fn info(&self, dataset_id: &str) -> TableInfo {
        TableInfo {
            dataset_id: dataset_id.to_owned(),
            table_id: self.spec.table_id.clone(),
            column_names: self.spec.schema.iter().map(|field| field.name.clone()).collect(),
            num_rows: Some(self.rows.len() as u64),
        }
    }
}

#[derive(Debug)]
struct MemoryJob {
    dataset_id: String,
    table_id: String,
    state: JobState,
    /// Refreshes left until the job finishes, `None` keeps it running forever.
    remaining_polls: Option<u32>,
    outcome: Result<Vec<Vec<String>>, JobError>,
    error: Option<JobError>,
}

#[derive(Debug)]
struct Inner {
    projects: Vec<ProjectInfo>,
    datasets: BTreeMap<String, BTreeMap<String, MemoryTable>>,
    jobs: HashMap<String, MemoryJob>,
    loads: Vec<LoadRequest>,
    calls: HashMap<Operation, u32>,
    failures: HashMap<Operation, VecDeque<WriterError>>,
    job_failures: VecDeque<JobError>,
    polls_until_done: Option<u32>,
    load_latency: Option<Duration>,
    loads_in_flight: u32,
    peak_loads_in_flight: u32,
}

impl Inner {
    /// Counts the call and returns the next scripted failure for it, if any.
    fn enter(&mut self, operation: Operation) -> WriterResult<()> {
        *self.calls.entry(operation).or_default() += 1;
        match self
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn dataset_mut(&mut self, dataset_id: &str) -> WriterResult<&mut BTreeMap<String, MemoryTable>> {
        match self.datasets.get_mut(dataset_id) {
            Some(tables) => Ok(tables),
            None => bail!(
                ErrorKind::DestinationNotFound,
                "BigQuery resource was not found",
                format!("Not found: Dataset {dataset_id}")
            ),
        }
    }

    fn finish_job(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        job.state = JobState::Done;

        let rows = match &job.outcome {
            Ok(rows) => rows.clone(),
            Err(error) => {
                job.error = Some(error.clone());
                return;
            }
        };
        let (dataset_id, table_id) = (job.dataset_id.clone(), job.table_id.clone());

        match self
            .datasets
            .get_mut(&dataset_id)
            .and_then(|tables| tables.get_mut(&table_id))
        {
            Some(table) => table.rows.extend(rows),
            None => {
                if let Some(job) = self.jobs.get_mut(job_id) {
                    job.error = Some(not_found_job_error(&dataset_id, &table_id));
                }
            }
        }
    }
}

/// In-memory warehouse for tests.
///
/// Load jobs parse the submitted file immediately and apply the rows when they finish, after
/// the configured number of refreshes. Any operation can be scripted to fail with
/// [`MemoryWarehouse::fail_next`].
#[derive(Debug, Clone)]
pub struct MemoryWarehouse {
    project_id: String,
    inner: Arc<Mutex<Inner>>,
}

impl MemoryWarehouse {
    /// Creates a warehouse whose credentials see only `project_id`.
    ///
    /// Jobs go through one `RUNNING` refresh before they are done.
    pub fn new(project_id: impl Into<String>) -> Self {
        let project_id = project_id.into();
        let inner = Inner {
            projects: vec![ProjectInfo {
                id: project_id.clone(),
                friendly_name: None,
            }],
            datasets: BTreeMap::new(),
            jobs: HashMap::new(),
            loads: Vec::new(),
            calls: HashMap::new(),
            failures: HashMap::new(),
            job_failures: VecDeque::new(),
            polls_until_done: Some(2),
            load_latency: None,
            loads_in_flight: 0,
            peak_loads_in_flight: 0,
        };

        Self {
            project_id,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Replaces the projects visible to the credentials.
    pub async fn set_projects(&self, projects: Vec<ProjectInfo>) {
        self.inner.lock().await.projects = projects;
    }

    /// Sets how many refreshes a job needs before it is done, `None` never finishes jobs.
    pub async fn set_polls_until_done(&self, polls: Option<u32>) {
        self.inner.lock().await.polls_until_done = polls;
    }

    /// Delays every load submission by `latency`, keeping it in flight meanwhile.
    pub async fn set_load_latency(&self, latency: Duration) {
        self.inner.lock().await.load_latency = Some(latency);
    }

    /// Highest number of load submissions that were in flight at the same time.
    pub async fn peak_loads_in_flight(&self) -> u32 {
        self.inner.lock().await.peak_loads_in_flight
    }

    /// Makes the next call of `operation` fail with `error`.
    pub async fn fail_next(&self, operation: Operation, error: WriterError) {
        self.inner
            .lock()
            .await
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Makes the next submitted job finish with `error`.
    pub async fn fail_next_job(&self, error: JobError) {
        self.inner.lock().await.job_failures.push_back(error);
    }

    /// Creates a dataset and table holding `rows`, bypassing call accounting.
    pub async fn insert_table(&self, dataset_id: &str, spec: TableSpec, rows: Vec<Vec<String>>) {
        let mut inner = self.inner.lock().await;
        inner
            .datasets
            .entry(dataset_id.to_owned())
            .or_default()
            .insert(spec.table_id.clone(), MemoryTable { spec, rows });
    }

    pub async fn calls(&self, operation: Operation) -> u32 {
        let inner = self.inner.lock().await;
        inner.calls.get(&operation).copied().unwrap_or_default()
    }

    /// Rows of a table in load order.
    pub async fn rows(&self, dataset_id: &str, table_id: &str) -> Option<Vec<Vec<String>>> {
        let inner = self.inner.lock().await;
        inner
            .datasets
            .get(dataset_id)?
            .get(table_id)
            .map(|table| table.rows.clone())
    }

    /// Definition a table was created with.
    pub async fn table_spec(&self, dataset_id: &str, table_id: &str) -> Option<TableSpec> {
        let inner = self.inner.lock().await;
        inner
            .datasets
            .get(dataset_id)?
            .get(table_id)
            .map(|table| table.spec.clone())
    }

    /// Every load request submitted so far.
    pub async fn loads(&self) -> Vec<LoadRequest> {
        self.inner.lock().await.loads.clone()
    }
}

impl Warehouse for MemoryWarehouse {
    fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn list_projects(&self) -> WriterResult<Vec<ProjectInfo>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::ListProjects)?;

        Ok(inner.projects.clone())
    }

    async fn list_datasets(&self, project_id: &str) -> WriterResult<Vec<DatasetInfo>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::ListDatasets)?;

        if project_id != self.project_id {
            return Ok(Vec::new());
        }

        Ok(inner
            .datasets
            .keys()
            .map(|dataset_id| self.dataset_info(dataset_id))
            .collect())
    }

    async fn get_dataset(&self, dataset_id: &str) -> WriterResult<Option<DatasetInfo>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::GetDataset)?;
        validate_dataset_id(dataset_id)?;

        Ok(inner
            .datasets
            .contains_key(dataset_id)
            .then(|| self.dataset_info(dataset_id)))
    }

    async fn create_dataset(&self, dataset_id: &str) -> WriterResult<DatasetInfo> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::CreateDataset)?;
        validate_dataset_id(dataset_id)?;

        if inner.datasets.contains_key(dataset_id) {
            bail!(
                ErrorKind::DestinationError,
                "BigQuery request failed",
                format!("Already Exists: Dataset {}:{dataset_id}", self.project_id)
            );
        }
        inner.datasets.insert(dataset_id.to_owned(), BTreeMap::new());
        info!(dataset_id, "created in-memory dataset");

        Ok(self.dataset_info(dataset_id))
    }

    async fn delete_dataset(&self, dataset_id: &str, delete_contents: bool) -> WriterResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DeleteDataset)?;

        let tables = inner.dataset_mut(dataset_id)?;
        if !tables.is_empty() && !delete_contents {
            bail!(
                ErrorKind::DestinationInvalidRequest,
                "BigQuery rejected the request",
                format!("Dataset {dataset_id} is still in use")
            );
        }
        inner.datasets.remove(dataset_id);

        Ok(())
    }

    async fn get_table(&self, dataset_id: &str, table_id: &str) -> WriterResult<Option<TableInfo>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::GetTable)?;

        Ok(inner
            .datasets
            .get(dataset_id)
            .and_then(|tables| tables.get(table_id))
            .map(|table| table.info(dataset_id)))
    }

    async fn create_table(&self, dataset_id: &str, spec: &TableSpec) -> WriterResult<TableInfo> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::CreateTable)?;

        let tables = inner.dataset_mut(dataset_id)?;
        if tables.contains_key(&spec.table_id) {
            bail!(
                ErrorKind::DestinationError,
                "BigQuery request failed",
                format!("Already Exists: Table {dataset_id}.{}", spec.table_id)
            );
        }
        let table = MemoryTable {
            spec: spec.clone(),
            rows: Vec::new(),
        };
        let info = table.info(dataset_id);
        tables.insert(spec.table_id.clone(), table);

        Ok(info)
    }

    async fn delete_table(&self, dataset_id: &str, table_id: &str) -> WriterResult<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DeleteTable)?;

        if inner.dataset_mut(dataset_id)?.remove(table_id).is_none() {
            bail!(
                ErrorKind::DestinationNotFound,
                "BigQuery resource was not found",
                format!("Not found: Table {dataset_id}.{table_id}")
            );
        }

        Ok(())
    }

    async fn query(&self, sql: &str) -> WriterResult<QueryResult> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::Query)?;

        let (count, reference) = parse_query(sql)?;
        let (dataset_id, table_id) = split_table_reference(reference)?;
        let Some(table) = inner
            .datasets
            .get(dataset_id)
            .and_then(|tables| tables.get(table_id))
        else {
            bail!(
                ErrorKind::DestinationNotFound,
                "BigQuery resource was not found",
                format!("Not found: Table {}:{dataset_id}.{table_id}", self.project_id)
            );
        };

        if count {
            return Ok(QueryResult {
                columns: vec!["f0_".to_owned()],
                rows: vec![vec![Some(table.rows.len().to_string())]],
            });
        }

        Ok(QueryResult {
            columns: table.spec.schema.iter().map(|field| field.name.clone()).collect(),
            rows: table
                .rows
                .iter()
                .map(|row| row.iter().cloned().map(Some).collect())
                .collect(),
        })
    }

    async fn submit_load(&self, request: &LoadRequest) -> WriterResult<LoadJob> {
        let latency = {
            let mut inner = self.inner.lock().await;
            inner.loads_in_flight += 1;
            inner.peak_loads_in_flight = inner.peak_loads_in_flight.max(inner.loads_in_flight);
            inner.load_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let result = self.accept_load(request).await;
        self.inner.lock().await.loads_in_flight -= 1;

        result
    }

    async fn refresh_job(&self, job: &LoadJob) -> WriterResult<LoadJob> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::RefreshJob)?;

        let Some(memory_job) = inner.jobs.get_mut(&job.job_id) else {
            bail!(
                ErrorKind::DestinationNotFound,
                "BigQuery resource was not found",
                format!("Not found: Job {}:{}", self.project_id, job.job_id)
            );
        };

        let mut finished = false;
        if memory_job.state != JobState::Done {
            if let Some(remaining) = memory_job.remaining_polls.as_mut() {
                *remaining = remaining.saturating_sub(1);
                finished = *remaining == 0;
            }
            memory_job.state = JobState::Running;
        }
        if finished {
            inner.finish_job(&job.job_id);
        }

        Ok(self.job_handle(&inner, &job.job_id))
    }
}

impl MemoryWarehouse {
    async fn accept_load(&self, request: &LoadRequest) -> WriterResult<LoadJob> {
        // Chunk files are removed right after submission, read them before returning.
        let contents = tokio::fs::read(&request.path).await?;

        let mut inner = self.inner.lock().await;
        inner.enter(Operation::SubmitLoad)?;
        inner.loads.push(request.clone());

        let table_exists = inner
            .datasets
            .get(&request.dataset_id)
            .is_some_and(|tables| tables.contains_key(&request.table_id));
        let outcome = match inner.job_failures.pop_front() {
            Some(error) => Err(error),
            None if !table_exists => Err(not_found_job_error(&request.dataset_id, &request.table_id)),
            None => parse_rows(&contents, request),
        };

        let job_id = format!("memory_{}", Uuid::new_v4().simple());
        let polls = inner.polls_until_done;
        inner.jobs.insert(
            job_id.clone(),
            MemoryJob {
                dataset_id: request.dataset_id.clone(),
                table_id: request.table_id.clone(),
                state: JobState::Pending,
                remaining_polls: polls,
                outcome,
                error: None,
            },
        );
        if polls == Some(0) {
            inner.finish_job(&job_id);
        }

        Ok(self.job_handle(&inner, &job_id))
    }

    fn dataset_info(&self, dataset_id: &str) -> DatasetInfo {
        DatasetInfo {
            project_id: self.project_id.clone(),
            dataset_id: dataset_id.to_owned(),
            location: None,
        }
    }

    fn job_handle(&self, inner: &Inner, job_id: &str) -> LoadJob {
        let job = &inner.jobs[job_id];
        LoadJob {
            job_id: job_id.to_owned(),
            location: None,
            state: job.state,
            error: job.error.clone(),
        }
    }
}

fn validate_dataset_id(dataset_id: &str) -> WriterResult<()> {
    let valid = !dataset_id.is_empty()
        && dataset_id.len() <= MAX_DATASET_ID_LENGTH
        && dataset_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!(
            ErrorKind::DestinationInvalidRequest,
            "BigQuery rejected the request",
            format!(
                "Invalid dataset ID \"{dataset_id}\". Dataset IDs must be alphanumeric (plus underscores) and must be at most 1024 characters long."
            )
        );
    }

    Ok(())
}

fn not_found_job_error(dataset_id: &str, table_id: &str) -> JobError {
    JobError {
        reason: Some("notFound".to_owned()),
        message: format!("Not found: Table {dataset_id}.{table_id}"),
        details: Vec::new(),
    }
}

fn invalid_data(detail: String) -> JobError {
    JobError {
        reason: Some("invalid".to_owned()),
        message: "Error while reading data, error message: CSV table encountered too many errors, giving up. Rows: 1; errors: 1. Please look into the errors[] collection for more details.".to_owned(),
        details: vec![format!("Error while reading data, error message: {detail}")],
    }
}

/// Parses the rows a load would write, mimicking how BigQuery rejects malformed lines.
fn parse_rows(contents: &[u8], request: &LoadRequest) -> Result<Vec<Vec<String>>, JobError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(contents);

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let line = index + 1;
        let record = record.map_err(|err| invalid_data(format!("{err} Line: {line}")))?;
        if index < request.skip_leading_rows as usize {
            continue;
        }
        // A trailing empty line is not a row.
        if record.len() == 1 && record[0].is_empty() && request.schema.len() > 1 {
            continue;
        }

        check_record(&record, &request.schema, line)?;
        rows.push(record.iter().map(str::to_owned).collect());
    }

    Ok(rows)
}

fn check_record(record: &csv::StringRecord, schema: &ColumnSchema, line: usize) -> Result<(), JobError> {
    if record.len() > schema.len() {
        return Err(invalid_data(format!("Too many values in line. Line: {line}")));
    }
    if record.len() < schema.len() {
        return Err(invalid_data(format!("Too few columns in line. Line: {line}")));
    }

    for (position, (value, field)) in record.iter().zip(schema).enumerate() {
        if value.is_empty() {
            continue;
        }
        let parses = match field.field_type {
            FieldType::Integer => value.parse::<i64>().is_ok(),
            FieldType::Float => value.parse::<f64>().is_ok(),
            FieldType::Boolean => matches!(
                value.to_ascii_lowercase().as_str(),
                "true" | "false" | "1" | "0"
            ),
            _ => true,
        };
        if !parses {
            return Err(invalid_data(format!(
                "Could not parse '{value}' as {} for field {} (position {position}). Line: {line}",
                field.field_type, field.name
            )));
        }
    }

    Ok(())
}

/// Accepts `SELECT COUNT(*) FROM <table>` and `SELECT * FROM <table>`.
fn parse_query(sql: &str) -> WriterResult<(bool, &str)> {
    let sql = sql.trim().trim_end_matches(';').trim();
    let upper = sql.to_ascii_uppercase();
    for (prefix, count) in [("SELECT COUNT(*) FROM ", true), ("SELECT * FROM ", false)] {
        if upper.starts_with(prefix) {
            return Ok((count, sql[prefix.len()..].trim()));
        }
    }

    bail!(
        ErrorKind::DestinationInvalidRequest,
        "BigQuery rejected the request",
        format!("Unsupported query: {sql}")
    );
}

fn split_table_reference(reference: &str) -> WriterResult<(&str, &str)> {
    let reference = reference.trim_matches('`');
    let mut parts = reference.rsplit('.');
    match (parts.next(), parts.next()) {
        (Some(table_id), Some(dataset_id)) => Ok((dataset_id, table_id)),
        _ => bail!(
            ErrorKind::DestinationInvalidRequest,
            "BigQuery rejected the request",
            format!("Table name \"{reference}\" missing dataset while no default dataset is set in the request.")
        ),
    }
}

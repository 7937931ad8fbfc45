use std::future::Future;

use crate::error::WriterResult;
use crate::warehouse::{
    DatasetInfo, LoadJob, LoadRequest, ProjectInfo, QueryResult, TableInfo, TableSpec,
};

/// Remote operations the writer needs from BigQuery.
///
/// A [`Warehouse`] is bound to one project and one location. Implementations classify every
/// failure through [`crate::error::ErrorKind`] so that callers can decide what to retry: missing
/// resources are reported as `None` by the `get_*` methods instead of an error.
///
/// Implementations are shared between upload workers, hence every call takes `&self` and the
/// returned futures are [`Send`].
pub trait Warehouse {
    /// Project all dataset and table operations are scoped to.
    fn project_id(&self) -> &str;

    /// Lists every project visible to the credentials.
    fn list_projects(&self) -> impl Future<Output = WriterResult<Vec<ProjectInfo>>> + Send;

    /// Lists every dataset of `project_id`.
    fn list_datasets(
        &self,
        project_id: &str,
    ) -> impl Future<Output = WriterResult<Vec<DatasetInfo>>> + Send;

    fn get_dataset(
        &self,
        dataset_id: &str,
    ) -> impl Future<Output = WriterResult<Option<DatasetInfo>>> + Send;

    /// Creates a dataset in the location the warehouse is bound to.
    fn create_dataset(
        &self,
        dataset_id: &str,
    ) -> impl Future<Output = WriterResult<DatasetInfo>> + Send;

    /// Deletes a dataset, together with its tables when `delete_contents` is set.
    fn delete_dataset(
        &self,
        dataset_id: &str,
        delete_contents: bool,
    ) -> impl Future<Output = WriterResult<()>> + Send;

    fn get_table(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> impl Future<Output = WriterResult<Option<TableInfo>>> + Send;

    fn create_table(
        &self,
        dataset_id: &str,
        spec: &TableSpec,
    ) -> impl Future<Output = WriterResult<TableInfo>> + Send;

    fn delete_table(
        &self,
        dataset_id: &str,
        table_id: &str,
    ) -> impl Future<Output = WriterResult<()>> + Send;

    /// Runs a query and waits for its rows.
    ///
    /// Only used to verify loaded data.
    fn query(&self, sql: &str) -> impl Future<Output = WriterResult<QueryResult>> + Send;

    /// Starts an asynchronous load job reading the local file described by `request`.
    fn submit_load(
        &self,
        request: &LoadRequest,
    ) -> impl Future<Output = WriterResult<LoadJob>> + Send;

    /// Fetches the current state of a load job.
    fn refresh_job(&self, job: &LoadJob) -> impl Future<Output = WriterResult<LoadJob>> + Send;
}

mod base;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;
mod types;

pub use base::Warehouse;
pub use types::{
    DatasetInfo, JobError, JobState, LoadJob, LoadRequest, ProjectInfo, QueryResult, TableInfo,
    TableSpec,
};

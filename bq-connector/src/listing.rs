//! Project and dataset listings printed by the `list` actions.

use bq_writer::error::WriterResult;
use bq_writer::retry::RetryPolicy;
use bq_writer::warehouse::{DatasetInfo, ProjectInfo, Warehouse};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Only filled in by the nested listing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Vec<DatasetEntry>>,
}

impl From<ProjectInfo> for ProjectEntry {
    fn from(project: ProjectInfo) -> Self {
        Self {
            id: project.id,
            name: project.friendly_name,
            datasets: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl From<DatasetInfo> for DatasetEntry {
    fn from(dataset: DatasetInfo) -> Self {
        Self {
            id: dataset.dataset_id,
            location: dataset.location,
        }
    }
}

/// Projects visible to the credentials.
pub async fn list_projects<W: Warehouse>(warehouse: &W) -> WriterResult<Vec<ProjectEntry>> {
    let projects = RetryPolicy::listing()
        .run("list_projects", move || warehouse.list_projects())
        .await?;

    Ok(projects.into_iter().map(ProjectEntry::from).collect())
}

/// Datasets of `project_id`.
pub async fn list_datasets<W: Warehouse>(
    warehouse: &W,
    project_id: &str,
) -> WriterResult<Vec<DatasetEntry>> {
    let datasets = RetryPolicy::transient()
        .run("list_datasets", move || warehouse.list_datasets(project_id))
        .await?;

    Ok(datasets.into_iter().map(DatasetEntry::from).collect())
}

/// Projects visible to the credentials, each with its datasets.
pub async fn list_projects_with_datasets<W: Warehouse>(
    warehouse: &W,
) -> WriterResult<Vec<ProjectEntry>> {
    let mut projects = list_projects(warehouse).await?;
    for project in &mut projects {
        project.datasets = Some(list_datasets(warehouse, &project.id).await?);
    }

    Ok(projects)
}

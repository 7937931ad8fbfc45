use std::fmt;
use std::str::FromStr;

use crate::ValidationError;

/// Action requested by the platform for this job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    /// Write every exported table. Used when `action` is unset.
    #[default]
    Run,
    /// Projects with their datasets.
    List,
    /// Legacy listing of projects only.
    ListProjects,
    /// Legacy listing of datasets in the configured project.
    ListDatasets,
}

impl Action {
    /// Resolves the optional `action` value of the configuration.
    pub fn from_config(value: Option<&str>) -> Result<Self, ValidationError> {
        match value {
            None | Some("") => Ok(Action::Run),
            Some(value) => value.parse(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Run => "run",
            Action::List => "list",
            Action::ListProjects => "listProjects",
            Action::ListDatasets => "listDatasets",
        }
    }
}

impl FromStr for Action {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run" => Ok(Action::Run),
            "list" => Ok(Action::List),
            "listProjects" => Ok(Action::ListProjects),
            "listDatasets" => Ok(Action::ListDatasets),
            other => Err(ValidationError::UnknownAction(other.to_owned())),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use secrecy::SecretString;
use serde::Deserialize;

use crate::credentials::{Credentials, OAuthCredentials, ServiceAccountCredentials};
use crate::{Action, TableDefinition, ValidationError};

/// Job configuration handed over by the platform in `config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub parameters: Parameters,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub authorization: Option<Authorization>,
}

/// User supplied job parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Parameters {
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub dataset: Option<String>,
    /// Location used for new datasets and job lookups.
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub tables: Option<Vec<TableDefinition>>,
    #[serde(default)]
    pub service_account: Option<ServiceAccountParameters>,
}

impl Parameters {
    pub fn is_empty(&self) -> bool {
        self.project.is_none()
            && self.dataset.is_none()
            && self.location.is_none()
            && self.tables.is_none()
            && self.service_account.is_none()
    }
}

/// Service account key embedded in the parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceAccountParameters {
    #[serde(rename = "#private_key", alias = "private_key", default)]
    pub private_key: Option<SecretString>,
    #[serde(default)]
    pub client_email: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ServiceAccountParameters {
    fn is_empty(&self) -> bool {
        self.private_key.is_none() && self.client_email.is_none()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Storage {
    #[serde(default)]
    pub input: StorageInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageInput {
    #[serde(default)]
    pub tables: Vec<InputMapping>,
}

/// Binds a platform table id to a CSV file under `in/tables`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InputMapping {
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Authorization {
    #[serde(default)]
    pub oauth_api: Option<OAuthApi>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthApi {
    #[serde(default)]
    pub credentials: Option<OAuthApiCredentials>,
}

/// Credentials block filled in by the platform OAuth broker.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OAuthApiCredentials {
    #[serde(rename = "appKey", default)]
    pub app_key: Option<String>,
    #[serde(rename = "#appSecret", default)]
    pub app_secret: Option<SecretString>,
    /// JSON document with `access_token` and `refresh_token`.
    #[serde(rename = "#data", default)]
    pub data: Option<SecretString>,
}

impl Configuration {
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn input_tables(&self) -> &[InputMapping] {
        &self.storage.input.tables
    }

    pub fn action(&self) -> Result<Action, ValidationError> {
        Action::from_config(self.action.as_deref())
    }

    fn oauth_api_credentials(&self) -> Option<&OAuthApiCredentials> {
        self.authorization
            .as_ref()
            .and_then(|authorization| authorization.oauth_api.as_ref())
            .and_then(|oauth_api| oauth_api.credentials.as_ref())
    }

    pub fn oauth_api_data(&self) -> Option<&SecretString> {
        self.oauth_api_credentials()
            .and_then(|credentials| credentials.data.as_ref())
    }

    pub fn oauth_api_app_key(&self) -> Option<&str> {
        self.oauth_api_credentials()
            .and_then(|credentials| credentials.app_key.as_deref())
    }

    pub fn oauth_api_app_secret(&self) -> Option<&SecretString> {
        self.oauth_api_credentials()
            .and_then(|credentials| credentials.app_secret.as_ref())
    }

    /// Destination dataset, trimmed and non-empty.
    pub fn dataset(&self) -> Result<&str, ValidationError> {
        match self.parameters.dataset.as_deref().map(str::trim) {
            Some(dataset) if !dataset.is_empty() => Ok(dataset),
            _ => Err(ValidationError::EmptyDataset),
        }
    }

    pub fn location(&self) -> Option<&str> {
        self.parameters
            .location
            .as_deref()
            .map(str::trim)
            .filter(|location| !location.is_empty())
    }

    /// Project from the parameters, falling back to the service account's own project.
    pub fn project_id(&self) -> Result<String, ValidationError> {
        let from_parameters = self
            .parameters
            .project
            .as_deref()
            .map(str::trim)
            .filter(|project| !project.is_empty());
        let from_service_account = self
            .parameters
            .service_account
            .as_ref()
            .and_then(|account| account.project_id.as_deref())
            .map(str::trim)
            .filter(|project| !project.is_empty());

        from_parameters
            .or(from_service_account)
            .map(str::to_owned)
            .ok_or(ValidationError::MissingProject)
    }

    pub fn tables(&self) -> Result<&[TableDefinition], ValidationError> {
        self.parameters
            .tables
            .as_deref()
            .ok_or(ValidationError::MissingTables)
    }

    pub fn credentials(&self) -> Result<Credentials, ValidationError> {
        if let Some(account) = self
            .parameters
            .service_account
            .as_ref()
            .filter(|account| !account.is_empty())
        {
            return ServiceAccountCredentials::from_parameters(account)
                .map(Credentials::ServiceAccount);
        }

        match self.oauth_api_credentials() {
            Some(credentials) => {
                OAuthCredentials::from_api_credentials(credentials).map(Credentials::OAuth)
            }
            None => Err(ValidationError::MissingAuthorization),
        }
    }

    /// Checks everything that does not need a network round trip.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.parameters.is_empty() {
            return Err(ValidationError::EmptyParameters);
        }

        let action = self.action()?;
        if action == Action::Run {
            for table in self.tables()? {
                table.validate()?;
            }
        }

        self.dataset()?;
        self.project_id()?;
        self.credentials()?;

        Ok(())
    }
}

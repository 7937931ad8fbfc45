use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::ValidationError;
use crate::configuration::{OAuthApiCredentials, ServiceAccountParameters};

/// Google OAuth 2.0 token endpoint used for refresh-token exchanges.
pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// Credentials used to authenticate against BigQuery.
///
/// Selected once while reading the configuration. The service account block in the parameters
/// takes precedence over the platform OAuth authorization.
#[derive(Debug, Clone)]
pub enum Credentials {
    OAuth(OAuthCredentials),
    ServiceAccount(ServiceAccountCredentials),
}

/// Refresh-token credentials granted through the platform OAuth broker.
#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    pub access_token: SecretString,
    pub refresh_token: SecretString,
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_uri: String,
}

/// Google service account key.
#[derive(Debug, Clone)]
pub struct ServiceAccountCredentials {
    /// PEM encoded RSA private key.
    pub private_key: SecretString,
    pub client_email: String,
    pub token_uri: String,
    pub project_id: Option<String>,
}

/// Token pair stored in the OAuth `#data` blob.
#[derive(Deserialize)]
struct OAuthData {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn non_empty(value: Option<&str>, field: &'static str) -> Result<String, ValidationError> {
    match value.map(str::trim) {
        Some(value) if !value.is_empty() => Ok(value.to_owned()),
        _ => Err(ValidationError::MissingCredentialField(field)),
    }
}

fn non_empty_secret(
    value: Option<&SecretString>,
    field: &'static str,
) -> Result<SecretString, ValidationError> {
    match value {
        Some(secret) if !secret.expose_secret().trim().is_empty() => Ok(secret.clone()),
        _ => Err(ValidationError::MissingCredentialField(field)),
    }
}

impl ServiceAccountCredentials {
    pub(crate) fn from_parameters(
        parameters: &ServiceAccountParameters,
    ) -> Result<Self, ValidationError> {
        let private_key = non_empty_secret(parameters.private_key.as_ref(), "#private_key")?;
        let client_email = non_empty(parameters.client_email.as_deref(), "client_email")?;
        let token_uri = parameters
            .token_uri
            .as_deref()
            .map(str::trim)
            .filter(|uri| !uri.is_empty())
            .unwrap_or(GOOGLE_TOKEN_URI)
            .to_owned();

        Ok(ServiceAccountCredentials {
            private_key,
            client_email,
            token_uri,
            project_id: parameters
                .project_id
                .clone()
                .filter(|project| !project.is_empty()),
        })
    }
}

impl OAuthCredentials {
    pub(crate) fn from_api_credentials(
        credentials: &OAuthApiCredentials,
    ) -> Result<Self, ValidationError> {
        let client_id = non_empty(credentials.app_key.as_deref(), "appKey")?;
        let client_secret = non_empty_secret(credentials.app_secret.as_ref(), "#appSecret")?;
        let data = non_empty_secret(credentials.data.as_ref(), "#data")?;

        let data: OAuthData = serde_json::from_str(data.expose_secret())
            .map_err(|err| ValidationError::InvalidOAuthData(err.to_string()))?;
        let access_token = non_empty(data.access_token.as_deref(), "access_token")?;
        let refresh_token = non_empty(data.refresh_token.as_deref(), "refresh_token")?;

        Ok(OAuthCredentials {
            access_token: SecretString::new(access_token),
            refresh_token: SecretString::new(refresh_token),
            client_id,
            client_secret,
            token_uri: GOOGLE_TOKEN_URI.to_owned(),
        })
    }
}

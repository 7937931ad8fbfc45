//! Builds a BigQuery client from validated credentials.

use std::sync::Arc;
use std::time::Duration;

use bq_config::Credentials;
use tracing::debug;

use crate::bail;
use crate::bigquery::{BigQueryClient, OAuthTokenProvider, ServiceAccountTokenProvider, TokenProvider};
use crate::error::{ErrorKind, WriterResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("bigquery-writer/", env!("CARGO_PKG_VERSION"));

/// Creates a client bound to `project_id` and, when given, a dataset location.
///
/// No request is sent: credentials are first exchanged by the first API call. Service account
/// keys are parsed here so that a malformed key is reported as a configuration error.
pub fn create_client(
    project_id: &str,
    credentials: &Credentials,
    location: Option<&str>,
) -> WriterResult<BigQueryClient> {
    let project_id = project_id.trim();
    if project_id.is_empty() {
        bail!(
            ErrorKind::ConfigError,
            "Project is missing",
            "Google Cloud project must be specified."
        );
    }

    let http = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(USER_AGENT)
        .build()?;

    let token_provider: Arc<dyn TokenProvider> = match credentials {
        Credentials::OAuth(credentials) => {
            debug!(client_id = %credentials.client_id, "using oauth credentials");
            Arc::new(OAuthTokenProvider::new(http.clone(), credentials.clone()))
        }
        Credentials::ServiceAccount(credentials) => {
            debug!(client_email = %credentials.client_email, "using service account credentials");
            Arc::new(ServiceAccountTokenProvider::new(credentials)?)
        }
    };

    let location = location
        .map(str::trim)
        .filter(|location| !location.is_empty())
        .map(str::to_owned);

    Ok(BigQueryClient::new(http, token_provider, project_id, location))
}

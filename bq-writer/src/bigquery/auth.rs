use std::error::Error as _;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bq_config::{OAuthCredentials, ServiceAccountCredentials};
use gcp_auth::{CustomServiceAccount, TokenProvider as _};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::bigquery::model::{TokenErrorResponse, TokenResponse};
use crate::error::{ErrorKind, WriterError, WriterResult};
use crate::{bail, writer_error};

/// OAuth scope granting read and write access to BigQuery.
pub const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";

const OAUTH_FAILURE: &str = "Cannot connect to BigQuery. Check your access token or refresh token.";

const SERVICE_ACCOUNT_FAILURE: &str =
    "Cannot connect to BigQuery. Check your service account credentials.";

/// OAuth tokens are refreshed this long before they expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Source of bearer tokens for BigQuery requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a valid access token, exchanging credentials when the cached one expired.
    async fn access_token(&self) -> WriterResult<String>;

    /// Drops the cached token after BigQuery rejected it.
    async fn invalidate(&self);
}

struct CachedToken {
    value: SecretString,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn new(value: String, expires_in: Option<u64>) -> Self {
        Self {
            value: SecretString::new(value),
            expires_at: expires_in.map(|seconds| Instant::now() + Duration::from_secs(seconds)),
        }
    }

    fn is_fresh(&self) -> bool {
        self.expires_at
            .is_none_or(|expires_at| Instant::now() + EXPIRY_MARGIN < expires_at)
    }
}

/// Sends a form to a token endpoint and parses the granted token.
///
/// Only a 4xx answer means the credentials were refused. Transport failures and 5xx answers
/// are classified as transient so that callers retry them.
async fn request_token(
    http: &reqwest::Client,
    token_uri: &str,
    form: &[(&str, &str)],
    failure_message: &'static str,
) -> WriterResult<TokenResponse> {
    let response = http.post(token_uri).form(form).send().await?;

    let status = response.status();
    if status.is_server_error() {
        bail!(
            ErrorKind::DestinationUnavailable,
            "Token endpoint is unavailable",
            format!("Token endpoint {token_uri} answered with {status}.")
        );
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<TokenErrorResponse>(&body)
            .map(|error| match error.error_description {
                Some(description) => format!("{}: {description}", error.error),
                None => error.error,
            })
            .unwrap_or(body);
        bail!(
            ErrorKind::AuthenticationError,
            "Token request was rejected",
            format!("{failure_message} ({status}: {reason})")
        );
    }

    Ok(response.json::<TokenResponse>().await?)
}

/// Exchanges a refresh token granted through the platform OAuth broker.
///
/// The access token handed over with the refresh token is used until BigQuery rejects it.
pub struct OAuthTokenProvider {
    http: reqwest::Client,
    credentials: OAuthCredentials,
    cache: Mutex<Option<CachedToken>>,
}

impl OAuthTokenProvider {
    pub fn new(http: reqwest::Client, credentials: OAuthCredentials) -> Self {
        let initial = CachedToken {
            value: credentials.access_token.clone(),
            expires_at: None,
        };

        Self {
            http,
            credentials,
            cache: Mutex::new(Some(initial)),
        }
    }
}

impl fmt::Debug for OAuthTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokenProvider")
            .field("client_id", &self.credentials.client_id)
            .field("token_uri", &self.credentials.token_uri)
            .finish()
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn access_token(&self) -> WriterResult<String> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref().filter(|token| token.is_fresh()) {
            return Ok(token.value.expose_secret().clone());
        }

        debug!(token_uri = %self.credentials.token_uri, "refreshing oauth access token");
        let token = request_token(
            &self.http,
            &self.credentials.token_uri,
            &[
                ("grant_type", "refresh_token"),
                (
                    "refresh_token",
                    self.credentials.refresh_token.expose_secret(),
                ),
                ("client_id", &self.credentials.client_id),
                (
                    "client_secret",
                    self.credentials.client_secret.expose_secret(),
                ),
            ],
            OAUTH_FAILURE,
        )
        .await?;

        let access_token = token.access_token.clone();
        *cache = Some(CachedToken::new(token.access_token, token.expires_in));

        Ok(access_token)
    }

    async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}

/// Exchanges a service account key for access tokens through [`gcp_auth`].
///
/// `gcp_auth` caches granted tokens internally. Dropping a rejected token therefore means
/// replacing the whole account, which is rebuilt from the key.
pub struct ServiceAccountTokenProvider {
    key: SecretString,
    client_email: String,
    token_uri: String,
    account: Mutex<Arc<CustomServiceAccount>>,
}

impl ServiceAccountTokenProvider {
    /// Parses the private key up front so that a malformed key fails before any request.
    pub fn new(credentials: &ServiceAccountCredentials) -> WriterResult<Self> {
        let key = SecretString::new(service_account_key_json(credentials));
        let account = load_account(&key)?;

        Ok(Self {
            key,
            client_email: credentials.client_email.clone(),
            token_uri: credentials.token_uri.clone(),
            account: Mutex::new(Arc::new(account)),
        })
    }
}

impl fmt::Debug for ServiceAccountTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountTokenProvider")
            .field("client_email", &self.client_email)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

#[async_trait]
impl TokenProvider for ServiceAccountTokenProvider {
    async fn access_token(&self) -> WriterResult<String> {
        let account = Arc::clone(&*self.account.lock().await);
        debug!(client_email = %self.client_email, "requesting service account access token");
        let token = account
            .token(&[BIGQUERY_SCOPE])
            .await
            .map_err(service_account_token_error)?;

        Ok(token.as_str().to_owned())
    }

    async fn invalidate(&self) {
        match load_account(&self.key) {
            Ok(account) => *self.account.lock().await = Arc::new(account),
            Err(err) => warn!(error = %err, "cannot reload service account key"),
        }
    }
}

/// Key file in the layout Google issues for service accounts.
fn service_account_key_json(credentials: &ServiceAccountCredentials) -> String {
    serde_json::json!({
        "type": "service_account",
        "project_id": credentials.project_id,
        "private_key": credentials.private_key.expose_secret(),
        "client_email": credentials.client_email,
        "token_uri": credentials.token_uri,
    })
    .to_string()
}

fn load_account(key: &SecretString) -> WriterResult<CustomServiceAccount> {
    CustomServiceAccount::from_json(key.expose_secret()).map_err(|err| {
        writer_error!(
            ErrorKind::ConfigError,
            "Invalid service account key",
            format!("Service account private key is not a valid RSA key: {err}"),
            source: err
        )
    })
}

/// Failures that reached no token endpoint are transient, anything else refused the key.
fn service_account_token_error(err: gcp_auth::Error) -> WriterError {
    if caused_by_io(&err) {
        return writer_error!(
            ErrorKind::DestinationIoError,
            "Token endpoint is unreachable",
            format!("Requesting a service account token failed: {err}"),
            source: err
        );
    }

    writer_error!(
        ErrorKind::AuthenticationError,
        "Token request was rejected",
        format!("{SERVICE_ACCOUNT_FAILURE} ({err})"),
        source: err
    )
}

fn caused_by_io(err: &gcp_auth::Error) -> bool {
    let mut cause = err.source();
    while let Some(inner) = cause {
        if inner.is::<std::io::Error>() {
            return true;
        }
        cause = inner.source();
    }

    false
}

#[cfg(test)]
mod tests {
    use bq_config::GOOGLE_TOKEN_URI;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::test_utils::TEST_PRIVATE_KEY;

    /// Nothing listens on port 1.
    const CLOSED_TOKEN_URI: &str = "http://127.0.0.1:1/token";

    fn oauth_credentials(token_uri: String) -> OAuthCredentials {
        OAuthCredentials {
            access_token: SecretString::new("initial".to_owned()),
            refresh_token: SecretString::new("refresh".to_owned()),
            client_id: "client".to_owned(),
            client_secret: SecretString::new("secret".to_owned()),
            token_uri,
        }
    }

    #[tokio::test]
    async fn oauth_uses_initial_token_then_refreshes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "refreshed",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = OAuthTokenProvider::new(
            reqwest::Client::new(),
            oauth_credentials(format!("{}/token", server.uri())),
        );

        assert_eq!(provider.access_token().await.unwrap(), "initial");
        provider.invalidate().await;
        assert_eq!(provider.access_token().await.unwrap(), "refreshed");
        assert_eq!(provider.access_token().await.unwrap(), "refreshed");
    }

    #[tokio::test]
    async fn rejected_refresh_token_is_an_authentication_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;

        let provider = OAuthTokenProvider::new(
            reqwest::Client::new(),
            oauth_credentials(format!("{}/token", server.uri())),
        );
        provider.invalidate().await;

        let err = provider.access_token().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationError);
        assert!(err.is_user_error());
        assert!(
            err.message()
                .starts_with("Cannot connect to BigQuery. Check your access token or refresh token.")
        );
        assert!(err.message().contains("invalid_grant"));
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_is_transient() {
        let provider = OAuthTokenProvider::new(
            reqwest::Client::new(),
            oauth_credentials(CLOSED_TOKEN_URI.to_owned()),
        );
        provider.invalidate().await;

        let err = provider.access_token().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationIoError);
        assert!(err.kind().is_transient());
    }

    #[tokio::test]
    async fn token_endpoint_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = OAuthTokenProvider::new(
            reqwest::Client::new(),
            oauth_credentials(format!("{}/token", server.uri())),
        );
        provider.invalidate().await;

        let err = provider.access_token().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationUnavailable);
        assert!(err.kind().is_transient());
    }

    fn service_account(token_uri: String) -> ServiceAccountCredentials {
        ServiceAccountCredentials {
            private_key: SecretString::new(TEST_PRIVATE_KEY.to_owned()),
            client_email: "writer@project.iam.gserviceaccount.com".to_owned(),
            token_uri,
            project_id: Some("project".to_owned()),
        }
    }

    #[tokio::test]
    async fn service_account_exchanges_signed_assertion() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"))
            .and(body_string_contains("assertion=ey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "sa-token",
                "expires_in": 3600
            })))
            .expect(2)
            .mount(&server)
            .await;

        let provider =
            ServiceAccountTokenProvider::new(&service_account(format!("{}/token", server.uri())))
                .unwrap();

        assert_eq!(provider.access_token().await.unwrap(), "sa-token");
        assert_eq!(provider.access_token().await.unwrap(), "sa-token");
        provider.invalidate().await;
        assert_eq!(provider.access_token().await.unwrap(), "sa-token");
    }

    #[tokio::test]
    async fn unreachable_service_account_token_endpoint_is_transient() {
        let provider =
            ServiceAccountTokenProvider::new(&service_account(CLOSED_TOKEN_URI.to_owned())).unwrap();

        let err = provider.access_token().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DestinationIoError, "{}", err.message());
        assert!(err.kind().is_transient());
    }

    #[test]
    fn malformed_private_key_is_a_configuration_error() {
        let mut credentials = service_account(GOOGLE_TOKEN_URI.to_owned());
        credentials.private_key = SecretString::new("not a key".to_owned());

        let err = ServiceAccountTokenProvider::new(&credentials).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(err.is_user_error());
    }
}

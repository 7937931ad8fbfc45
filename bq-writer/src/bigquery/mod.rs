//! BigQuery REST API implementation of [`crate::warehouse::Warehouse`].

mod auth;
mod client;
mod model;

pub use auth::{BIGQUERY_SCOPE, OAuthTokenProvider, ServiceAccountTokenProvider, TokenProvider};
pub use client::{BIGQUERY_BASE_URL, BIGQUERY_UPLOAD_URL, BigQueryClient};

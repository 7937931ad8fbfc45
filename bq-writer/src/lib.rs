//! Loads CSV tables into Google BigQuery.
//!
//! [`writer::TableWriter`] drives a single table through project verification, dataset and
//! table reconciliation, optional chunking and load job polling against any
//! [`warehouse::Warehouse`]. [`bigquery::BigQueryClient`] is the production warehouse, built by
//! [`factory::create_client`] from OAuth or service account credentials.

pub mod bigquery;
pub mod error;
pub mod factory;
mod macros;
pub mod retry;
pub mod schema;
pub mod split;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod warehouse;
pub mod writer;

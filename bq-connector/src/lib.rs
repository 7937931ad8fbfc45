//! Application driver of the BigQuery writer.
//!
//! [`app::App`] validates the platform job configuration, resolves the input CSV of every
//! configured table and either loads the tables or prints project and dataset listings.

pub mod app;
pub mod error;
pub mod listing;

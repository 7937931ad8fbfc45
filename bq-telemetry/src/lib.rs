//! Tracing setup shared by the writer binaries.

mod tracing;

pub use crate::tracing::{DEFAULT_LOG_FILTER, init_test_tracing, init_tracing};

//! Error types and result definitions for writer operations.
//!
//! [`WriterError`] carries a classification ([`ErrorKind`]), a static description, optional
//! dynamic detail, an optional source error and the callsite where it was created. The kind
//! decides whether the failure is something the user can fix ([`ErrorKind::is_user_error`]) and
//! whether a network call is worth retrying.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::panic::Location;
use std::sync::Arc;

/// Convenient result type for writer operations using [`WriterError`] as the error type.
pub type WriterResult<T> = Result<T, WriterError>;

/// Main error type for writer operations.
#[derive(Debug, Clone)]
pub struct WriterError {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Categories of failures surfaced by the writer.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Configuration & Schema Errors
    ConfigError,
    SchemaError,
    ColumnOrderMismatch,
    InvalidFieldType,
    InvalidCsv,

    // Destination Errors
    ProjectNotFound,
    DestinationNotFound,
    DestinationInvalidRequest,
    DestinationPermissionDenied,
    DestinationRateLimited,
    DestinationUnavailable,
    DestinationIoError,
    DestinationError,
    AuthenticationError,

    // Load Errors
    LoadJobFailed,
    LoadJobTimeout,
    SplitFailed,

    // IO & Serialization Errors
    IoError,
    SerializationError,
    DeserializationError,

    // State Errors
    InvalidState,
    UploadWorkerPanic,

    // Unknown / Uncategorized
    Unknown,
}

impl ErrorKind {
    /// Returns `true` when the user can fix the failure by changing configuration, data or
    /// credentials.
    pub fn is_user_error(&self) -> bool {
        !matches!(
            self,
            ErrorKind::IoError
                | ErrorKind::SerializationError
                | ErrorKind::DeserializationError
                | ErrorKind::InvalidState
                | ErrorKind::UploadWorkerPanic
                | ErrorKind::Unknown
        )
    }

    /// Returns `true` for conditions that usually go away when the request is repeated.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::DestinationIoError
                | ErrorKind::DestinationUnavailable
                | ErrorKind::DestinationRateLimited
        )
    }
}

impl WriterError {
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    /// Returns the message shown to the user: the detail when present, the description otherwise.
    pub fn message(&self) -> &str {
        self.detail().unwrap_or(self.description.as_ref())
    }

    pub fn is_user_error(&self) -> bool {
        self.kind.is_user_error()
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// Replaces the dynamic detail, keeping kind, description, source and location.
    pub fn with_detail(mut self, detail: impl Into<Cow<'static, str>>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attaches an originating [`error::Error`] to this error and returns the modified instance.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        self.source = Some(Arc::new(source));
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        WriterError {
            kind,
            description,
            detail,
            source,
            location: Location::caller(),
            backtrace: Arc::new(Backtrace::capture()),
        }
    }
}

impl PartialEq for WriterError {
    fn eq(&self, other: &WriterError) -> bool {
        self.kind == other.kind
    }
}

impl fmt::Display for WriterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:?}] {} @ {}:{}:{}",
            self.kind,
            self.description,
            self.location.file(),
            self.location.line(),
            self.location.column()
        )?;

        if let Some(detail) = self.detail.as_deref() {
            write!(f, "\n  Detail:")?;
            for line in detail.lines() {
                write!(f, "\n    {line}")?;
            }
        }

        if self.backtrace.status() == BacktraceStatus::Captured {
            write!(f, "\n  Backtrace:")?;
            for line in self.backtrace.to_string().lines() {
                write!(f, "\n    {line}")?;
            }
        }

        Ok(())
    }
}

impl error::Error for WriterError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn error::Error + 'static))
    }
}

/// Creates a [`WriterError`] from an error kind and static description.
impl From<(ErrorKind, &'static str)> for WriterError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> WriterError {
        WriterError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

/// Creates a [`WriterError`] from an error kind, static description, and dynamic detail.
impl<D> From<(ErrorKind, &'static str, D)> for WriterError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> WriterError {
        WriterError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

impl From<std::io::Error> for WriterError {
    #[track_caller]
    fn from(err: std::io::Error) -> WriterError {
        let detail = err.to_string();
        WriterError::from_components(
            ErrorKind::IoError,
            Cow::Borrowed("I/O operation failed"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<serde_json::Error> for WriterError {
    #[track_caller]
    fn from(err: serde_json::Error) -> WriterError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => (
                ErrorKind::DeserializationError,
                "JSON deserialization failed",
            ),
        };
        let detail = err.to_string();
        WriterError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<csv::Error> for WriterError {
    #[track_caller]
    fn from(err: csv::Error) -> WriterError {
        let (kind, description) = if err.is_io_error() {
            (ErrorKind::IoError, "Reading CSV file failed")
        } else {
            (ErrorKind::InvalidCsv, "CSV file is malformed")
        };
        let detail = err.to_string();
        WriterError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

/// Maps transport level failures of the HTTP client.
///
/// Failures with a response status are classified by the BigQuery client itself, so only
/// connection, timeout and body problems are expected here.
impl From<reqwest::Error> for WriterError {
    #[track_caller]
    fn from(err: reqwest::Error) -> WriterError {
        let (kind, description) = if err.is_decode() {
            (
                ErrorKind::DeserializationError,
                "BigQuery response could not be decoded",
            )
        } else if err.is_builder() {
            (ErrorKind::InvalidState, "BigQuery request could not be built")
        } else {
            (ErrorKind::DestinationIoError, "BigQuery request failed")
        };
        let detail = err.to_string();
        WriterError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<tokio::task::JoinError> for WriterError {
    #[track_caller]
    fn from(err: tokio::task::JoinError) -> WriterError {
        let detail = err.to_string();
        WriterError::from_components(
            ErrorKind::UploadWorkerPanic,
            Cow::Borrowed("Upload worker terminated unexpectedly"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl From<bq_config::ValidationError> for WriterError {
    #[track_caller]
    fn from(err: bq_config::ValidationError) -> WriterError {
        let detail = err.to_string();
        WriterError::from_components(
            ErrorKind::ConfigError,
            Cow::Borrowed("Invalid configuration"),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bail, writer_error};

    #[test]
    fn message_prefers_detail() {
        let err = writer_error!(
            ErrorKind::ProjectNotFound,
            "Project not found",
            "Project p was not found."
        );
        assert_eq!(err.message(), "Project p was not found.");
        assert_eq!(err.description(), "Project not found");

        let err = writer_error!(ErrorKind::SchemaError, "Table has no columns");
        assert_eq!(err.message(), "Table has no columns");
    }

    #[test]
    fn display_contains_kind_and_location() {
        let err = writer_error!(ErrorKind::LoadJobFailed, "Load job failed", "bad row");
        let rendered = err.to_string();

        assert!(rendered.starts_with("[LoadJobFailed] Load job failed @ "));
        assert!(rendered.contains(file!()));
        assert!(rendered.contains("Detail:\n    bad row"));
    }

    #[test]
    fn user_errors_are_classified() {
        assert!(ErrorKind::ColumnOrderMismatch.is_user_error());
        assert!(ErrorKind::LoadJobTimeout.is_user_error());
        assert!(ErrorKind::DestinationRateLimited.is_user_error());
        assert!(!ErrorKind::IoError.is_user_error());
        assert!(!ErrorKind::UploadWorkerPanic.is_user_error());
    }

    #[test]
    fn source_is_exposed() {
        let io = std::io::Error::other("disk gone");
        let err = WriterError::from(io);

        assert_eq!(err.kind(), ErrorKind::IoError);
        assert_eq!(
            error::Error::source(&err).map(ToString::to_string),
            Some("disk gone".to_owned())
        );
    }

    #[test]
    fn bail_returns_error() {
        fn check(value: u32) -> WriterResult<u32> {
            if value == 0 {
                bail!(ErrorKind::ConfigError, "Value cannot be zero");
            }
            Ok(value)
        }

        assert_eq!(check(1).unwrap(), 1);
        assert_eq!(check(0).unwrap_err().kind(), ErrorKind::ConfigError);
    }
}

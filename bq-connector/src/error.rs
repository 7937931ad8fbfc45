use std::io;

use bq_config::{LoadConfigError, ValidationError};
use bq_writer::error::WriterError;
use thiserror::Error;

/// Result type for connector operations.
pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Process exit code for user fixable failures.
pub const USER_ERROR_EXIT_CODE: u8 = 1;

/// Process exit code for failures the user cannot fix.
pub const APPLICATION_ERROR_EXIT_CODE: u8 = 2;

/// Process exit code after a panic.
pub const UNHANDLED_ERROR_EXIT_CODE: u8 = 3;

/// Error ending a connector run.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// Loading or writing a table failed.
    #[error("{}", .0.message())]
    Writer(#[from] WriterError),

    /// `config.json` or the writer settings could not be loaded.
    #[error(transparent)]
    Load(#[from] LoadConfigError),

    /// The job configuration is incomplete or inconsistent.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A table cannot be written as configured.
    #[error("{0}")]
    User(String),

    /// Progress or listing output could not be written.
    #[error("cannot write output: {0}")]
    Output(#[from] io::Error),

    /// Listing output could not be serialized.
    #[error("cannot serialize output: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConnectorError {
    pub fn is_user_error(&self) -> bool {
        match self {
            ConnectorError::Writer(err) => err.is_user_error(),
            ConnectorError::Load(_) | ConnectorError::Validation(_) | ConnectorError::User(_) => {
                true
            }
            ConnectorError::Output(_) | ConnectorError::Serialization(_) => false,
        }
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_user_error() {
            USER_ERROR_EXIT_CODE
        } else {
            APPLICATION_ERROR_EXIT_CODE
        }
    }

    /// Returns a short category label for this error.
    pub fn category(&self) -> &'static str {
        if self.is_user_error() {
            "user error"
        } else {
            "application error"
        }
    }

    /// Renders the report printed to stderr before exiting.
    ///
    /// Application errors include the full writer error with its location and backtrace.
    pub fn render_report(&self) -> String {
        let mut out = format!("{}: {self}\n", self.category());
        if let ConnectorError::Writer(err) = self
            && !err.is_user_error()
        {
            out.push_str(&format!("{err}\n"));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use bq_writer::error::ErrorKind;
    use bq_writer::writer_error;

    use super::*;

    #[test]
    fn user_errors_exit_with_one() {
        let err = ConnectorError::from(writer_error!(
            ErrorKind::ColumnOrderMismatch,
            "Column order mismatch",
            "Column order mismatch. Actual configuration: a. Expected csv: b."
        ));
        assert_eq!(err.exit_code(), USER_ERROR_EXIT_CODE);
        assert_eq!(
            err.to_string(),
            "Column order mismatch. Actual configuration: a. Expected csv: b."
        );

        let err = ConnectorError::from(ValidationError::MissingTables);
        assert_eq!(err.exit_code(), USER_ERROR_EXIT_CODE);
        assert_eq!(
            err.to_string(),
            "There are no tables specified in the configuration."
        );
    }

    #[test]
    fn application_errors_exit_with_two() {
        let err = ConnectorError::from(writer_error!(
            ErrorKind::InvalidState,
            "Upload pool was closed"
        ));
        assert_eq!(err.exit_code(), APPLICATION_ERROR_EXIT_CODE);
        assert!(err.render_report().starts_with("application error: Upload pool was closed\n"));

        let err = ConnectorError::from(io::Error::other("broken pipe"));
        assert_eq!(err.exit_code(), APPLICATION_ERROR_EXIT_CODE);
    }
}

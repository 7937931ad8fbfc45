//! `writer_error!` and `bail!`.

/// Builds a [`crate::error::WriterError`].
///
/// The second argument is the fixed description of the failure. An optional third argument
/// becomes the message shown to the user, and `source:` attaches the error that caused it.
///
/// ```ignore
/// writer_error!(ErrorKind::SplitFailed, "Split failed", format!("{chunks} chunks"), source: err)
/// ```
#[macro_export]
macro_rules! writer_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::WriterError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $message:expr $(, source: $source:expr)?) => {
        $crate::error::WriterError::from((
            $kind,
            $desc,
            ::std::string::ToString::to_string(&$message),
        ))
        $(.with_source($source))?
    };
}

/// Returns a [`crate::error::WriterError`] built from the same arguments as [`writer_error!`].
#[macro_export]
macro_rules! bail {
    ($($arg:tt)+) => {
        return ::core::result::Result::Err($crate::writer_error!($($arg)+))
    };
}

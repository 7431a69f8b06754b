use std::fmt;
use std::io;

use thiserror::Error;

/// Closed set of failure kinds a record can report as its last error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorKind {
    #[default]
    NoError,
    /// The record could not be created.
    Create,
    /// A step of the activation sequence failed; everything was rolled back.
    Redirect,
    /// A step of the deactivation sequence failed; the record is now invalid.
    Unredirect,
    /// The reader thread hit an OS failure and tore the redirection down itself.
    Thread,
    /// The operation named a record that does not exist.
    NullPtr,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NoError => "NO_ERROR",
            ErrorKind::Create => "ERROR_CREATE",
            ErrorKind::Redirect => "ERROR_REDIRECT",
            ErrorKind::Unredirect => "ERROR_UNREDIRECT",
            ErrorKind::Thread => "ERROR_THREAD",
            ErrorKind::NullPtr => "ERROR_NULLPTR",
        }
    }

    pub fn is_error(self) -> bool {
        self != ErrorKind::NoError
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum RedirectError {
    #[error("cannot create redirection for {stream}: {reason}")]
    Create { stream: String, reason: String },

    #[error("cannot redirect {stream} ({step}): {source}")]
    Redirect {
        stream: String,
        step: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("cannot restore {stream}: {reason}")]
    Unredirect { stream: String, reason: String },

    #[error("reader thread for {stream} failed: {source}")]
    Thread {
        stream: String,
        #[source]
        source: io::Error,
    },

    #[error("no redirection record exists for {stream}")]
    NullPtr { stream: String },
}

impl RedirectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RedirectError::Create { .. } => ErrorKind::Create,
            RedirectError::Redirect { .. } => ErrorKind::Redirect,
            RedirectError::Unredirect { .. } => ErrorKind::Unredirect,
            RedirectError::Thread { .. } => ErrorKind::Thread,
            RedirectError::NullPtr { .. } => ErrorKind::NullPtr,
        }
    }

    pub(crate) fn redirect(stream: &str, step: &'static str, source: io::Error) -> Self {
        RedirectError::Redirect {
            stream: stream.to_string(),
            step,
            source,
        }
    }

    pub(crate) fn thread(stream: &str, source: io::Error) -> Self {
        RedirectError::Thread {
            stream: stream.to_string(),
            source,
        }
    }

    pub(crate) fn unredirect(stream: &str, reason: impl Into<String>) -> Self {
        RedirectError::Unredirect {
            stream: stream.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RedirectError>;

/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::fmt::Display;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Canonical failure kinds. Every failing operation selects exactly one kind
/// and wraps the underlying cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Exists,
    Invalid,
    TooLarge,
    Malicious,
    Locked,
    StaleLock,
    Timeout,
    Cancelled,
    Unsupported,
    NotImplemented,
    Undefined,
    Forbidden,
    Eof,
    Empty,
    InvalidDestination,
    Unexpected,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::Exists => "already exists",
            ErrorKind::Invalid => "invalid",
            ErrorKind::TooLarge => "too large",
            ErrorKind::Malicious => "malicious",
            ErrorKind::Locked => "locked",
            ErrorKind::StaleLock => "stale lock",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::Undefined => "undefined",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Eof => "end of file",
            ErrorKind::Empty => "empty",
            ErrorKind::InvalidDestination => "invalid destination",
            ErrorKind::Unexpected => "unexpected",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn wrap(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Error {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// True if the error matches any of the given kinds.
    pub fn any(&self, kinds: &[ErrorKind]) -> bool {
        kinds.contains(&self.kind)
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stable error for operations on a handle after `close`.
    pub fn closed_file(path: impl Display) -> Self {
        Error::new(ErrorKind::Invalid, format!("file already closed: '{}'", path))
    }

    /// Stable error for mutating operations on read-only filesystems.
    pub fn read_only(operation: &str) -> Self {
        Error::new(
            ErrorKind::Forbidden,
            format!("operation not permitted on read-only filesystem: {}", operation),
        )
    }

    pub fn not_implemented(operation: &str) -> Self {
        Error::new(
            ErrorKind::NotImplemented,
            format!("operation not implemented by this filesystem: {}", operation),
        )
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        let kind = match error.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => ErrorKind::Exists,
            io::ErrorKind::PermissionDenied => ErrorKind::Forbidden,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::UnexpectedEof => ErrorKind::Eof,
            io::ErrorKind::InvalidInput => ErrorKind::Invalid,
            io::ErrorKind::WriteZero => ErrorKind::Unexpected,
            _ => ErrorKind::Undefined,
        };
        Error {
            kind,
            message: error.to_string(),
            source: Some(Box::new(error)),
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(error: zip::result::ZipError) -> Self {
        use zip::result::ZipError;
        match error {
            ZipError::InvalidArchive(_) => {
                Error::wrap(ErrorKind::Invalid, "invalid zip archive", error)
            }
            ZipError::UnsupportedArchive(_) => {
                Error::wrap(ErrorKind::Unsupported, "unsupported zip archive", error)
            }
            ZipError::FileNotFound => {
                Error::wrap(ErrorKind::NotFound, "zip entry not found", error)
            }
            ZipError::Io(io_error) => Error::from(io_error),
            _ => Error::wrap(ErrorKind::Undefined, "zip archive failure", error),
        }
    }
}

impl From<regex::Error> for Error {
    fn from(error: regex::Error) -> Self {
        Error::wrap(ErrorKind::Invalid, "invalid exclusion pattern", error)
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use super::*;

    #[test]
    fn test_kind_query() {
        let err = Error::new(ErrorKind::NotFound, "no such file '/missing'");
        assert!(err.is(ErrorKind::NotFound));
        assert!(!err.is(ErrorKind::Exists));
        assert!(err.any(&[ErrorKind::TooLarge, ErrorKind::NotFound]));
        assert!(!err.any(&[ErrorKind::TooLarge, ErrorKind::Unsupported]));
    }

    #[test]
    fn test_display_includes_kind_and_message() {
        let err = Error::new(ErrorKind::TooLarge, "archive exceeds 10 bytes");
        assert_eq!("too large: archive exceeds 10 bytes", err.to_string());
    }

    #[test]
    fn test_wrapped_source_is_reachable() {
        let cause = io::Error::new(io::ErrorKind::Other, "disk on fire");
        let err = Error::wrap(ErrorKind::Undefined, "copy failed", cause);
        assert!(err.source().unwrap().to_string().contains("disk on fire"));
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert_eq!(ErrorKind::NotFound, err.kind());
    }

    #[test]
    fn test_io_already_exists_maps_to_exists() {
        let err = Error::from(io::Error::new(io::ErrorKind::AlreadyExists, "there"));
        assert_eq!(ErrorKind::Exists, err.kind());
    }

    #[test]
    fn test_io_eof_maps_to_eof() {
        let err = Error::from(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert_eq!(ErrorKind::Eof, err.kind());
    }

    #[test]
    fn test_closed_file_is_stable() {
        let first = Error::closed_file("/tmp/a");
        let second = Error::closed_file("/tmp/a");
        assert_eq!(first.kind(), second.kind());
        assert_eq!(first.to_string(), second.to_string());
    }
}

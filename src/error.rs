//! # Error Kinds
//!
//! Every fallible operation in this crate returns `eyre::Result`. Failures that
//! callers need to branch on carry a [`StorageError`] somewhere in the report's
//! context chain, and [`error_kind`] recovers its [`ErrorKind`]:
//!
//! ```ignore
//! match factory.open(path, false) {
//!     Err(err) if mapstore::is_not_found(&err) => { /* start a new member */ }
//!     other => other?,
//! }
//! ```
//!
//! Plain OS failures are not re-wrapped; `error_kind` classifies them by
//! downcasting to `std::io::Error`.

use std::fmt;
use std::io;

use eyre::Report;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad offset, length, whence or path.
    InvalidArgument,
    StorageClosed,
    /// Write or grow through a read-only handle.
    ReadOnlyViolation,
    /// No archive member or file matches the request.
    NotFound,
    Unsupported,
    Io,
    /// Corrupt tar header, truncated gzip stream or oversized member.
    Format,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::StorageClosed => "storage closed",
            ErrorKind::ReadOnlyViolation => "read-only violation",
            ErrorKind::NotFound => "not found",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Io => "i/o error",
            ErrorKind::Format => "format error",
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            ErrorKind::InvalidArgument => io::ErrorKind::InvalidInput,
            ErrorKind::ReadOnlyViolation => io::ErrorKind::PermissionDenied,
            ErrorKind::NotFound => io::ErrorKind::NotFound,
            ErrorKind::Unsupported => io::ErrorKind::Unsupported,
            ErrorKind::Format => io::ErrorKind::InvalidData,
            ErrorKind::StorageClosed | ErrorKind::Io => io::ErrorKind::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageError {
    kind: ErrorKind,
    message: String,
}

impl StorageError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// `backend` prefixes the message, e.g. "file storage: storage is closed".
    pub fn closed(backend: &str) -> Self {
        Self::new(
            ErrorKind::StorageClosed,
            format!("{}: storage is closed", backend),
        )
    }

    pub fn read_only(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReadOnlyViolation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Converts into an `io::Error` for the `Read`/`Write`/`Seek` views.
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(self.kind.io_kind(), self)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StorageError {}

/// Classifies a report by the innermost-known error it carries.
///
/// A `StorageError` anywhere in the context chain wins. Otherwise an
/// `io::Error` decides between `NotFound` and `Io`, including an `io::Error`
/// that itself wraps a `StorageError` (as produced by the stream views).
pub fn error_kind(err: &Report) -> ErrorKind {
    if let Some(storage) = err.downcast_ref::<StorageError>() {
        return storage.kind();
    }

    for cause in err.chain() {
        if let Some(storage) = cause.downcast_ref::<StorageError>() {
            return storage.kind();
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return classify_io(io_err);
        }
    }

    if let Some(io_err) = err.downcast_ref::<io::Error>() {
        return classify_io(io_err);
    }

    ErrorKind::Io
}

pub fn is_not_found(err: &Report) -> bool {
    error_kind(err) == ErrorKind::NotFound
}

fn classify_io(err: &io::Error) -> ErrorKind {
    if let Some(storage) = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<StorageError>())
    {
        return storage.kind();
    }

    match err.kind() {
        io::ErrorKind::NotFound => ErrorKind::NotFound,
        _ => ErrorKind::Io,
    }
}

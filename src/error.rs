//! Error kinds and Result alias
//!
//! Errors are values: every operation returns an explicit status, and each
//! failure condition maps to exactly one [`ErrorKind`]. Internal helpers
//! surface the first non-success status to the caller via `?`.

use std::fmt;
use std::io;

/// The complete error taxonomy returned at the API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ErrorKind {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("invalid file header")]
    InvalidFileHeader,
    #[error("invalid file version")]
    InvalidFileVersion,
    #[error("invalid page size")]
    InvalidPageSize,
    #[error("invalid key size")]
    InvalidKeySize,
    #[error("invalid record size")]
    InvalidRecordSize,
    #[error("out of memory")]
    OutOfMemory,
    #[error("key not found")]
    KeyNotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("integrity violated")]
    IntegrityViolated,
    #[error("internal error")]
    InternalError,
    #[error("database is write protected")]
    WriteProtected,
    #[error("i/o error")]
    IoError,
    #[error("operation not implemented")]
    NotImplemented,
    #[error("file not found")]
    FileNotFound,
    #[error("operation would block")]
    WouldBlock,
    #[error("object is not ready")]
    NotReady,
    #[error("limits reached")]
    LimitsReached,
    #[error("object was already initialized")]
    AlreadyInitialized,
    #[error("environment needs recovery")]
    NeedRecovery,
    #[error("cursor must be closed first")]
    CursorStillOpen,
    #[error("record filter not found")]
    FilterNotFound,
    #[error("transaction conflict")]
    TxnConflict,
    #[error("transaction is still open")]
    TxnStillOpen,
    #[error("cursor points to nil")]
    CursorIsNil,
    #[error("database not found")]
    DatabaseNotFound,
    #[error("database already exists")]
    DatabaseAlreadyExists,
    #[error("database already open")]
    DatabaseAlreadyOpen,
    #[error("environment already open")]
    EnvironmentAlreadyOpen,
    #[error("invalid journal file header")]
    LogInvalidFileHeader,
    #[error("network error")]
    NetworkError,
}

/// An error status plus optional context.
#[derive(Debug, thiserror::Error)]
pub struct Error {
    kind: ErrorKind,
    detail: Option<String>,
    #[source]
    source: Option<io::Error>,
}

impl Error {
    /// Create an error from a bare kind.
    pub fn new(kind: ErrorKind) -> Self {
        Error { kind, detail: None, source: None }
    }

    /// Create an error with a human-readable detail string.
    pub fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Error { kind, detail: Some(detail.into()), source: None }
    }

    /// The kind this error maps to.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind, detail),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            io::ErrorKind::PermissionDenied => ErrorKind::WriteProtected,
            io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
            _ => ErrorKind::IoError,
        };
        Error { kind, detail: None, source: Some(err) }
    }
}

impl PartialEq<ErrorKind> for Error {
    fn eq(&self, other: &ErrorKind) -> bool {
        self.kind == *other
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let err: Error = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind(), ErrorKind::FileNotFound);

        let err: Error = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert_eq!(err.kind(), ErrorKind::IoError);
    }

    #[test]
    fn test_detail_display() {
        let err = Error::with_detail(ErrorKind::InvalidPageSize, "got 1000");
        assert_eq!(err.to_string(), "invalid page size: got 1000");
        assert_eq!(Error::new(ErrorKind::KeyNotFound).to_string(), "key not found");
    }
}

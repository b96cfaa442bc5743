use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Index engine errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The operation was pre-empted (typically a background compaction that
    /// lost its slot) and may be retried later.
    Aborted(String),
    /// Malformed input from the caller: bad memory spec, non-increasing
    /// version, invalid descriptor edit.
    InvalidArgument(String),
    /// On-disk data failed validation: checksum mismatch, bad magic,
    /// unsupported format version.
    Corruption(String),
    /// A file expected at a known path is missing.
    NotFound(String),
    /// A key being inserted already exists.
    AlreadyExists(String),
    /// An IO error propagated from the filesystem.
    IO(String),
    /// A memory tracker refused an allocation.
    MemLimitExceeded(String),
    /// A write was attempted against a sealed structure.
    ReadOnly,
    /// An internal invariant was violated.
    Internal(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Aborted(msg) => write!(f, "aborted: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::NotFound(msg) => write!(f, "not found: {msg}"),
            Error::AlreadyExists(msg) => write!(f, "already exists: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::MemLimitExceeded(msg) => write!(f, "memory limit exceeded: {msg}"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

/// Constructs an Error::Corruption for the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// Constructs an Error::InvalidArgument for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidArgument(format!($($args)*)) };
}

/// A Result returning the crate Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(err.to_string()),
            _ => Error::IO(err.to_string()),
        }
    }
}

impl From<Box<bincode::ErrorKind>> for Error {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        Error::Corruption(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::Internal(err.to_string())
    }
}

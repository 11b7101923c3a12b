//! Crate-wide error taxonomy.
//!
//! Every layer (blob store, catalog, diff cache, service facade) returns
//! `Result<T>` from this module. The HTTP layer is the only place that knows
//! about status codes; see `api::types::ApiError` for the mapping.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Duplicate (channel, version) on insert. Mapped to HTTP 403, not 409,
    /// for compatibility with existing publishing clients (see SPEC_FULL.md
    /// open question on `AlreadyExists`).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("too many requests")]
    TooManyRequests,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Internal(format!("io error: {e}"))
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(e: tokio_postgres::Error) -> Self {
        if let Some(code) = e.code() {
            if *code == tokio_postgres::error::SqlState::UNIQUE_VIOLATION {
                return Error::AlreadyExists(e.to_string());
            }
        }
        Error::Internal(format!("database error: {e}"))
    }
}

impl From<bb8::RunError<tokio_postgres::Error>> for Error {
    fn from(e: bb8::RunError<tokio_postgres::Error>) -> Self {
        Error::Internal(format!("pool error: {e}"))
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Internal(format!("zip error: {e}"))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::DeadlineExceeded
    }
}

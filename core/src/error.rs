//! Error types for the document engine
//!
//! This module provides the public error taxonomy of the engine, plus the
//! low-level classification of PostgreSQL errors done at the storage adapter
//! boundary.

use thiserror::Error;
use tokio_postgres::error::SqlState;

/// Result type for the core crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds exposed by the document engine.
///
/// The `Display` implementation yields the wire-level identifier used in the
/// `error` field of JSON error bodies (CouchDB convention), except for
/// `Internal` which carries the underlying failure text.
#[derive(Debug, Error)]
pub enum Error {
    /// The request body could not be parsed
    #[error("bad_request")]
    BadRequest,

    /// The database name does not follow the naming rules
    #[error("illegal_database_name")]
    IllegalDatabaseName,

    /// The database or document does not exist
    #[error("not_found")]
    NotFound,

    /// The document exists but is tombstoned
    #[error("deleted")]
    Deleted,

    /// Revision mismatch or key collision
    #[error("conflict")]
    Conflict,

    /// The database already exists (CouchDB reports this as `file_exists`)
    #[error("file_exists")]
    DatabaseExists,

    /// The operation is not supported by this implementation
    #[error("not_implemented")]
    NotImplemented,

    /// Unexpected engine failure
    #[error("{0}")]
    Internal(String),
}

/// Low-level classification of PostgreSQL errors.
///
/// Produced exactly once, where SQL is executed; the engine translates these
/// into [`Error`] kinds according to context (a unique violation is a
/// `conflict` for a document write but `file_exists` for a database
/// creation).
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing table does not exist (SQLSTATE 42P01)
    #[error("undefined table")]
    UndefinedTable,

    /// Primary key or unique constraint collision (SQLSTATE 23505)
    #[error("unique violation")]
    UniqueViolation,

    /// A query expected to return a row returned none
    #[error("no rows in result")]
    NoRows,

    /// Any other PostgreSQL error
    #[error("postgres: {0}")]
    Pg(tokio_postgres::Error),
}

impl From<tokio_postgres::Error> for StorageError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            if db_err.code() == &SqlState::UNDEFINED_TABLE {
                return StorageError::UndefinedTable;
            }
            if db_err.code() == &SqlState::UNIQUE_VIOLATION {
                return StorageError::UniqueViolation;
            }
        }
        StorageError::Pg(err)
    }
}

impl From<StorageError> for Error {
    /// The default mapping from storage errors to engine errors: a missing
    /// table or row means the database (or document) does not exist, and a
    /// key collision is a conflict. Call sites needing a different reading
    /// match on the variant before falling back to this.
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UndefinedTable | StorageError::NoRows => Error::NotFound,
            StorageError::UniqueViolation => Error::Conflict,
            StorageError::Pg(e) => Error::Internal(e.to_string()),
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(err: tokio_postgres::Error) -> Self {
        Error::from(StorageError::from(err))
    }
}

//! # sofadb core
//!
//! The document engine of sofadb: a CouchDB-compatible data model (databases,
//! documents, revisions, changes feed) mapped onto rows of generic PostgreSQL
//! tables. This crate owns the storage adapter, the transactional write
//! protocol, and the query surfaces (`_all_docs`, `_changes`, `_find`). The
//! HTTP layer lives in the `sofadb-server` crate.

#![forbid(unsafe_code)]

pub mod all_docs;
pub mod changes;
pub mod design;
pub mod document;
pub mod error;
pub mod mango;
pub mod operator;
pub mod pool;
pub mod queries;
pub mod tx;

/// Re-export common types for ease of use
pub use all_docs::{AllDocsParams, AllDocsResponse};
pub use changes::{ChangesParams, ChangesResponse};
pub use error::{Error, Result, StorageError};
pub use mango::{MangoParams, MangoResponse};
pub use operator::{parse_database_name, Operator};
pub use pool::{Pool, PoolConfig};
pub use queries::RowKind;

/// Version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! HTTP adapter for sofadb
//!
//! This crate exposes the document engine over the CouchDB HTTP API: the
//! route table, JSON encoding, request-id propagation, and the translation
//! of engine error kinds to HTTP statuses. The engine itself lives in
//! `sofadb-core`.

#![forbid(unsafe_code)]

pub mod config;
pub mod router;

pub use config::ServerConfig;
pub use router::{app, AppState};

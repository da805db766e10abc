/// sofadb - A CouchDB-compatible document database backed by PostgreSQL
///
/// This is the root crate that provides workspace-level documentation.
/// Actual implementation is in the subcrates:
/// - `sofadb-core`: the document engine (databases, documents, revisions,
///   changes feed, listings and Mango queries over a PostgreSQL pool)
/// - `sofadb-server`: the HTTP adapter exposing the CouchDB API

/// Returns the version of the package.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

//! Database-level operations
//!
//! The [`Operator`] is the entry point of the engine: one is built per
//! request, around the shared connection pool and the request id used for
//! log correlation. This module holds the database manager (create, get,
//! delete, list); the document operations live in the sibling modules.

use log::debug;
use serde_json::{json, Map, Value};

use crate::all_docs::AllDocsParams;
use crate::error::{Error, Result, StorageError};
use crate::pool::Pool;
use crate::queries::RowKind;
use crate::tx;

/// Executes engine operations against the storage layer.
pub struct Operator {
    pub(crate) pool: Pool,
    req_id: String,
}

impl Operator {
    /// Create an operator for one request. The request id only serves log
    /// correlation and may be empty.
    pub fn new(pool: Pool, req_id: impl Into<String>) -> Self {
        Self {
            pool,
            req_id: req_id.into(),
        }
    }

    /// Check that PostgreSQL answers queries.
    pub async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    pub(crate) fn log_sql(&self, sql: &str) {
        debug!(target: "sql", "req_id={} {}", self.req_id, sql);
    }

    /// Read the metadata row of a database (`doc_count`, `last_seq`).
    pub async fn get_database(&self, database_name: &str) -> Result<Map<String, Value>> {
        let (table, doctype) = parse_database_name(database_name)?;
        let mut conn = self.pool.get().await?;
        let tx = tx::read_only(&mut conn).await?;
        let info: Map<String, Value> = self
            .exec_get_row(&tx, &table, &doctype, RowKind::Doctype, &doctype)
            .await
            .map_err(Error::from)?;
        tx.commit().await?;
        Ok(info)
    }

    /// Create a database. The backing table and the `row_kind` enum are
    /// provisioned lazily, on the first database of a prefix.
    pub async fn create_database(&self, database_name: &str) -> Result<()> {
        let (table, doctype) = parse_database_name(database_name)?;
        match database_name.chars().next() {
            Some(c) if c.is_ascii_lowercase() => {}
            _ => return Err(Error::IllegalDatabaseName),
        }
        let blob = json!({"doc_count": 0, "last_seq": 0});

        // Happy path: the backing table already exists and we just insert
        // the doctype row.
        match self.insert_doctype_row(&table, &doctype, &blob).await {
            Err(Error::NotFound) => {}
            other => return other,
        }

        // The backing table is missing: provision the enum type and the
        // table, each in its own transaction, then retry the insert. Racing
        // creators are fine: only one insert can win, the others observe the
        // uniqueness violation and report `file_exists`.
        self.provision_table(&table).await;
        self.insert_doctype_row(&table, &doctype, &blob).await
    }

    async fn insert_doctype_row(&self, table: &str, doctype: &str, blob: &Value) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = tx::read_write(&mut conn).await?;
        let inserted = self
            .exec_insert_row(&tx, table, doctype, RowKind::Doctype, doctype, blob)
            .await
            .map_err(|err| match err {
                StorageError::UniqueViolation => Error::DatabaseExists,
                other => Error::from(other),
            })?;
        if !inserted {
            return Err(Error::Internal("doctype row was not inserted".to_string()));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn provision_table(&self, table: &str) {
        // Failures are deliberately dropped: with concurrent creators, both
        // DDL statements can fail for every creator but one.
        if let Err(err) = self.create_row_kind().await {
            debug!("cannot create the row_kind enum: {err}");
        }
        if let Err(err) = self.create_table(table).await {
            debug!("cannot create the table {table}: {err}");
        }
    }

    async fn create_row_kind(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = tx::read_write(&mut conn).await?;
        self.exec_create_row_kind(&tx).await.map_err(Error::from)?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_table(&self, table: &str) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = tx::read_write(&mut conn).await?;
        self.exec_create_table(&tx, table).await.map_err(Error::from)?;
        tx.commit().await?;
        Ok(())
    }

    /// Delete a database: every row of the doctype goes away, and the
    /// backing table itself is dropped once its last doctype is gone.
    pub async fn delete_database(&self, database_name: &str) -> Result<()> {
        let (table, doctype) = parse_database_name(database_name)?;
        let mut conn = self.pool.get().await?;
        let tx = tx::read_write(&mut conn).await?;
        let removed = self
            .exec_delete_doctype_rows(&tx, &table, &doctype)
            .await
            .map_err(Error::from)?;
        if removed == 0 {
            return Err(Error::NotFound);
        }
        if self
            .exec_check_table_empty(&tx, &table)
            .await
            .map_err(Error::from)?
        {
            self.exec_drop_table(&tx, &table).await.map_err(Error::from)?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// List the databases of one backing table, as `prefix/doctype` names.
    ///
    /// Both keys must address the same backing table: `startkey` selects the
    /// table by its part before the `/`, and `endkey` must start with that
    /// same prefix. Listing across tables is not supported.
    pub async fn get_all_databases(&self, params: &AllDocsParams) -> Result<Vec<String>> {
        let Some((table, _)) = params.start_key.split_once('/') else {
            return Err(Error::NotImplemented);
        };
        if table.is_empty() || !params.end_key.starts_with(table) {
            return Err(Error::NotImplemented);
        }
        if table.chars().any(invalid_char_for_database_name) {
            return Err(Error::IllegalDatabaseName);
        }

        let mut conn = self.pool.get().await?;
        let tx = tx::read_only(&mut conn).await?;
        let doctypes = self
            .exec_get_all_doctypes(&tx, table, params)
            .await
            .map_err(Error::from)?;
        tx.commit().await?;
        Ok(doctypes
            .into_iter()
            .map(|doctype| format!("{table}/{doctype}"))
            .collect())
    }
}

/// Split a database name (as in the CouchDB API) into the backing SQL table
/// name and the doctype. Names without a prefix go to the `noprefix` table.
///
/// The name arrives URL-decoded from the HTTP layer. The character set is
/// checked here, for every operation: table names are interpolated into SQL
/// text, so nothing outside the allowed set may pass.
pub fn parse_database_name(database_name: &str) -> Result<(String, String)> {
    if database_name.is_empty()
        || database_name
            .chars()
            .any(invalid_char_for_database_name)
    {
        return Err(Error::IllegalDatabaseName);
    }
    match database_name.split_once('/') {
        Some((table, doctype)) => {
            if table.is_empty() || doctype.is_empty() {
                return Err(Error::IllegalDatabaseName);
            }
            Ok((table.to_string(), doctype.to_string()))
        }
        None => Ok(("noprefix".to_string(), database_name.to_string())),
    }
}

fn invalid_char_for_database_name(c: char) -> bool {
    if c.is_ascii_lowercase() || c.is_ascii_digit() {
        return false;
    }
    !matches!(c, '_' | '$' | '(' | ')' | '+' | '-' | '/')
}

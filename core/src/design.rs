//! Design documents
//!
//! Design documents are stored like normal documents but in their own row
//! family, without a revision chain. Executing a view would require an
//! embedded JavaScript sandbox to run the design document's `map` function,
//! which this build does not carry: the view endpoint rejects with
//! `not_implemented`.

use serde_json::{Map, Value};

use crate::document::compute_revision_sum;
use crate::error::{Error, Result, StorageError};
use crate::operator::{parse_database_name, Operator};
use crate::queries::RowKind;
use crate::tx;

impl Operator {
    /// Store a design document (`PUT /{db}/_design/{ddoc}`). A `_rev` in the
    /// body is rejected, like for a normal document creation.
    pub async fn create_design_doc(
        &self,
        database_name: &str,
        doc_id: &str,
        body: &[u8],
    ) -> Result<Map<String, Value>> {
        let (table, doctype) = parse_database_name(database_name)?;

        let mut doc: Map<String, Value> =
            serde_json::from_slice(body).map_err(|_| Error::BadRequest)?;

        if doc.contains_key("_rev") {
            return Err(Error::Conflict);
        }

        let mut raw = body.to_vec();
        let existing_id = doc
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if existing_id.is_empty() {
            doc.insert("_id".to_string(), Value::String(doc_id.to_string()));
            raw = serde_json::to_vec(&doc).map_err(|e| Error::Internal(e.to_string()))?;
        }

        let rev_sum = compute_revision_sum(&raw);
        doc.insert("_rev".to_string(), Value::String(format!("1-{rev_sum}")));

        let mut conn = self.pool.get().await?;
        let tx = tx::read_write(&mut conn).await?;

        // Design documents are not part of the live document count, but
        // their creation still takes a sequence for the changes feed.
        let seq = self
            .exec_increment_last_seq(&tx, &table, &doctype)
            .await
            .map_err(Error::from)?;

        let inserted = self
            .exec_insert_row(&tx, &table, &doctype, RowKind::DesignDoc, doc_id, &doc)
            .await
            .map_err(|err| match err {
                StorageError::UniqueViolation => Error::Conflict,
                other => Error::from(other),
            })?;
        if !inserted {
            return Err(Error::Internal(
                "design document row was not inserted".to_string(),
            ));
        }

        let mut change = Map::new();
        if let Some(id) = doc.get("_id") {
            change.insert("id".to_string(), id.clone());
        }
        if let Some(rev) = doc.get("_rev") {
            change.insert("rev".to_string(), rev.clone());
        }
        let change_body =
            serde_json::to_vec(&change).map_err(|e| Error::Internal(e.to_string()))?;
        let change_sum = compute_revision_sum(&change_body);
        let change_id = format!("{seq:08}-{change_sum}");
        let inserted = self
            .exec_insert_row(&tx, &table, &doctype, RowKind::Change, &change_id, &change)
            .await
            .map_err(Error::from)?;
        if !inserted {
            return Err(Error::Internal("change row was not inserted".to_string()));
        }

        tx.commit().await?;
        Ok(doc)
    }

    /// Execute a view (`GET /{db}/_design/{ddoc}/_view/{view}`).
    ///
    /// Not available: views are JavaScript `map` functions and this build
    /// embeds no interpreter.
    pub async fn get_view(
        &self,
        database_name: &str,
        _doc_id: &str,
        _view_name: &str,
    ) -> Result<()> {
        parse_database_name(database_name)?;
        Err(Error::NotImplemented)
    }
}

//! Storage adapter
//!
//! The narrow SQL vocabulary of the engine: primitive row operations against
//! the generic per-prefix tables. Table names and row kinds are interpolated
//! into the SQL text (kinds come from a closed enum, table names are
//! validated by `parse_database_name` before they can reach a query); every
//! user-supplied value is bound as a parameter.
//!
//! All operations run inside a caller-supplied transaction. PostgreSQL
//! errors are classified into [`StorageError`] here and nowhere else.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tokio_postgres::types::Json;
use tokio_postgres::Transaction;

use crate::all_docs::AllDocsParams;
use crate::error::StorageError;
use crate::operator::Operator;

/// Discriminator for the rows stored in a backing table.
///
/// One table holds six kinds of rows, so that a single transaction can touch
/// the document, its revision chain, the changes feed, and the database
/// counters atomically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    /// Metadata row of a logical database: `{doc_count, last_seq}`
    Doctype,
    /// A user document (or its tombstone)
    NormalDoc,
    /// A design document
    DesignDoc,
    /// A local, non-replicated document
    LocalDoc,
    /// The revision chain of a document: `{start, ids}`
    Revisions,
    /// An entry of the changes feed, keyed by the padded sequence
    Change,
}

impl RowKind {
    /// The value of the `row_kind` SQL enum for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            RowKind::Doctype => "doctype",
            RowKind::NormalDoc => "normal_doc",
            RowKind::DesignDoc => "design_doc",
            RowKind::LocalDoc => "local_doc",
            RowKind::Revisions => "revisions",
            RowKind::Change => "change",
        }
    }
}

/// Documents are listed up to this key when no end key is given.
pub(crate) const HIGH_KEY_SENTINEL: &str = "\u{ffff}";

const CREATE_ROW_KIND_SQL: &str = "
DO $$
BEGIN
  IF NOT EXISTS (SELECT 1 FROM pg_type WHERE typname = 'row_kind') THEN
    CREATE TYPE row_kind AS ENUM ('doctype', 'normal_doc', 'design_doc', 'local_doc', 'revisions', 'change');
  END IF;
END
$$ LANGUAGE plpgsql;
";

/// A change row as stored: the padded sequence key and the blob.
#[derive(Debug)]
pub(crate) struct ChangeRow {
    pub seq: String,
    pub blob: Map<String, Value>,
}

/// Strip the newlines from a SQL string, so that it fits on one log line.
fn flatten(sql: &str) -> String {
    sql.replace('\n', " ")
}

type StorageResult<T> = std::result::Result<T, StorageError>;

impl Operator {
    /// Create the `row_kind` enum type. Idempotent: the guarded DO block is a
    /// no-op when the type already exists.
    pub(crate) async fn exec_create_row_kind(&self, tx: &Transaction<'_>) -> StorageResult<()> {
        let sql = flatten(CREATE_ROW_KIND_SQL);
        self.log_sql(&sql);
        tx.batch_execute(sql.as_str()).await?;
        Ok(())
    }

    /// Create a backing table with the generic layout and its composite
    /// primary key.
    pub(crate) async fn exec_create_table(
        &self,
        tx: &Transaction<'_>,
        table: &str,
    ) -> StorageResult<()> {
        let sql = flatten(&format!(
            "
CREATE TABLE {table} (
  doctype VARCHAR(255),
  row_id  VARCHAR(255),
  kind    row_kind,
  blob    JSONB,
  PRIMARY KEY (doctype, kind, row_id)
);
"
        ));
        self.log_sql(&sql);
        tx.batch_execute(sql.as_str()).await?;
        Ok(())
    }

    /// Insert a row. Returns true when exactly one row was inserted.
    pub(crate) async fn exec_insert_row<T>(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        kind: RowKind,
        id: &str,
        blob: &T,
    ) -> StorageResult<bool>
    where
        T: serde::Serialize + std::fmt::Debug + Sync,
    {
        let sql = flatten(&format!(
            "INSERT INTO {table}(doctype, row_id, kind, blob) VALUES ($1, $2, '{}', $3);",
            kind.as_str()
        ));
        self.log_sql(&sql);
        let affected = tx
            .execute(sql.as_str(), &[&doctype, &id, &Json(blob)])
            .await?;
        Ok(affected == 1)
    }

    /// Read the blob of a row, deserialized into `T`.
    pub(crate) async fn exec_get_row<T>(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        kind: RowKind,
        id: &str,
    ) -> StorageResult<T>
    where
        T: DeserializeOwned,
    {
        let sql = flatten(&format!(
            "SELECT blob FROM {table} WHERE doctype = $1 AND row_id = $2 AND kind = '{}';",
            kind.as_str()
        ));
        self.log_sql(&sql);
        let row = tx
            .query_opt(sql.as_str(), &[&doctype, &id])
            .await?
            .ok_or(StorageError::NoRows)?;
        let Json(blob) = row.try_get::<_, Json<T>>(0)?;
        Ok(blob)
    }

    /// Replace the blob of a row. Returns true when exactly one row was
    /// updated.
    pub(crate) async fn exec_update_row<T>(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        kind: RowKind,
        id: &str,
        blob: &T,
    ) -> StorageResult<bool>
    where
        T: serde::Serialize + std::fmt::Debug + Sync,
    {
        let sql = flatten(&format!(
            "UPDATE {table} SET blob = $1 WHERE kind = '{}' AND doctype = $2 AND row_id = $3;",
            kind.as_str()
        ));
        self.log_sql(&sql);
        let affected = tx
            .execute(sql.as_str(), &[&Json(blob), &doctype, &id])
            .await?;
        Ok(affected == 1)
    }

    /// Replace a document blob, conditionally on its current revision. This
    /// is the optimistic concurrency primitive: false means either the row is
    /// missing or the revision does not match, and the caller probes with
    /// [`Operator::exec_get_row`] to tell the two apart.
    pub(crate) async fn exec_update_document<T>(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        kind: RowKind,
        doc_id: &str,
        rev: &str,
        blob: &T,
    ) -> StorageResult<bool>
    where
        T: serde::Serialize + std::fmt::Debug + Sync,
    {
        let sql = flatten(&format!(
            "UPDATE {table} SET blob = $1 WHERE kind = '{}' AND doctype = $2 AND row_id = $3 AND blob ->> '_rev' = $4;",
            kind.as_str()
        ));
        self.log_sql(&sql);
        let affected = tx
            .execute(sql.as_str(), &[&Json(blob), &doctype, &doc_id, &rev])
            .await?;
        Ok(affected == 1)
    }

    /// Delete a row. Returns true when exactly one row was deleted.
    pub(crate) async fn exec_delete_row(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        kind: RowKind,
        id: &str,
    ) -> StorageResult<bool> {
        let sql = flatten(&format!(
            "DELETE FROM {table} WHERE doctype = $1 AND row_id = $2 AND kind = '{}';",
            kind.as_str()
        ));
        self.log_sql(&sql);
        let affected = tx.execute(sql.as_str(), &[&doctype, &id]).await?;
        Ok(affected == 1)
    }

    /// Remove the change row that carries the given document id. The change
    /// log is compacted per document: at most one such row exists.
    pub(crate) async fn exec_delete_change_for_document(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        doc_id: &str,
    ) -> StorageResult<u64> {
        let sql = flatten(&format!(
            "DELETE FROM {table} WHERE doctype = $1 AND kind = 'change' AND blob ->> 'id' = $2;"
        ));
        self.log_sql(&sql);
        let affected = tx.execute(sql.as_str(), &[&doctype, &doc_id]).await?;
        Ok(affected)
    }

    /// Bump `doc_count` and `last_seq` on the doctype row, returning the new
    /// sequence value. `NoRows` means the database does not exist.
    pub(crate) async fn exec_increment_doc_count(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
    ) -> StorageResult<i64> {
        self.exec_update_counters(tx, table, doctype, '+').await
    }

    /// Decrement `doc_count` and bump `last_seq`, returning the new sequence
    /// value.
    pub(crate) async fn exec_decrement_doc_count(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
    ) -> StorageResult<i64> {
        self.exec_update_counters(tx, table, doctype, '-').await
    }

    async fn exec_update_counters(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        sign: char,
    ) -> StorageResult<i64> {
        // A single UPDATE statement reads and writes the counter row, so
        // concurrent writers on the same doctype serialise on it even at
        // read-committed isolation.
        let sql = flatten(&format!(
            "
UPDATE {table}
SET blob = jsonb_set(jsonb_set(blob, '{{doc_count}}', ((blob ->> 'doc_count')::bigint {sign} 1)::text::jsonb),
                     '{{last_seq}}', ((blob ->> 'last_seq')::bigint + 1)::text::jsonb)
WHERE kind = 'doctype'
AND doctype = $1
AND row_id = $1
RETURNING (blob ->> 'last_seq')::bigint;
"
        ));
        self.log_sql(&sql);
        let row = tx
            .query_opt(sql.as_str(), &[&doctype])
            .await?
            .ok_or(StorageError::NoRows)?;
        Ok(row.try_get(0)?)
    }

    /// Bump `last_seq` only, for writes that do not change the number of live
    /// documents (updates, tombstone creations, design documents). Returns
    /// the new sequence value.
    pub(crate) async fn exec_increment_last_seq(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
    ) -> StorageResult<i64> {
        let sql = flatten(&format!(
            "
UPDATE {table}
SET blob = jsonb_set(blob, '{{last_seq}}', ((blob ->> 'last_seq')::bigint + 1)::text::jsonb)
WHERE kind = 'doctype'
AND doctype = $1
AND row_id = $1
RETURNING (blob ->> 'last_seq')::bigint;
"
        ));
        self.log_sql(&sql);
        let row = tx
            .query_opt(sql.as_str(), &[&doctype])
            .await?
            .ok_or(StorageError::NoRows)?;
        Ok(row.try_get(0)?)
    }

    /// List the documents of a database, in key order, within an inclusive
    /// key range. Projects either the full blob or just `{_id, _rev}`.
    pub(crate) async fn exec_get_all_docs(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        params: &AllDocsParams,
    ) -> StorageResult<Vec<Value>> {
        let fields = if params.include_docs {
            "blob"
        } else {
            "jsonb_build_object('_id', blob ->> '_id', '_rev', blob ->> '_rev')"
        };
        let order = if params.descending { "DESC" } else { "ASC" };
        // BETWEEN wants low AND high: in descending order the start key is
        // the high bound, so the bounds are swapped before the defaults.
        let (from, mut to) = if params.descending {
            (params.end_key.clone(), params.start_key.clone())
        } else {
            (params.start_key.clone(), params.end_key.clone())
        };
        if to.is_empty() {
            to = HIGH_KEY_SENTINEL.to_string();
        }
        let limit: Option<i64> = if params.limit > 0 { Some(params.limit) } else { None };
        let skip: i64 = params.skip.max(0);

        let sql = flatten(&format!(
            "
SELECT {fields}
FROM {table}
WHERE doctype = $1
AND kind = 'normal_doc'
AND row_id BETWEEN $2 AND $3
ORDER BY row_id {order}
LIMIT $4
OFFSET $5;
"
        ));
        self.log_sql(&sql);
        let rows = tx
            .query(sql.as_str(), &[&doctype, &from, &to, &limit, &skip])
            .await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(doc) = row.try_get::<_, Json<Value>>(0)?;
            docs.push(doc);
        }
        Ok(docs)
    }

    /// List the doctypes of a backing table, as database names.
    pub(crate) async fn exec_get_all_doctypes(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        params: &AllDocsParams,
    ) -> StorageResult<Vec<String>> {
        let order = if params.descending { "DESC" } else { "ASC" };
        let limit: Option<i64> = if params.limit > 0 { Some(params.limit) } else { None };
        let skip: i64 = params.skip.max(0);
        let sql = flatten(&format!(
            "
SELECT row_id
FROM {table}
WHERE kind = 'doctype'
ORDER BY row_id {order}
LIMIT $1
OFFSET $2;
"
        ));
        self.log_sql(&sql);
        let rows = tx.query(sql.as_str(), &[&limit, &skip]).await?;
        let mut doctypes = Vec::with_capacity(rows.len());
        for row in rows {
            doctypes.push(row.try_get(0)?);
        }
        Ok(doctypes)
    }

    /// Read the changes feed after the given padded sequence, in sequence
    /// order. `None` as the limit means no limit.
    pub(crate) async fn exec_get_changes(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        since_padded: &str,
        limit: Option<i64>,
    ) -> StorageResult<Vec<ChangeRow>> {
        let sql = flatten(&format!(
            "
SELECT row_id, blob
FROM {table}
WHERE doctype = $1
AND kind = 'change'
AND row_id > $2
ORDER BY row_id ASC
LIMIT $3;
"
        ));
        self.log_sql(&sql);
        let rows = tx
            .query(sql.as_str(), &[&doctype, &since_padded, &limit])
            .await?;
        let mut changes = Vec::with_capacity(rows.len());
        for row in rows {
            let seq: String = row.try_get(0)?;
            let Json(blob) = row.try_get::<_, Json<Map<String, Value>>>(1)?;
            changes.push(ChangeRow { seq, blob });
        }
        Ok(changes)
    }

    /// Count the change rows after the given padded sequence. Used to fill
    /// `pending` when a limited read stopped early.
    pub(crate) async fn exec_count_pending_changes(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        after_seq: &str,
    ) -> StorageResult<i64> {
        let sql = flatten(&format!(
            "SELECT COUNT(*) FROM {table} WHERE doctype = $1 AND kind = 'change' AND row_id > $2;"
        ));
        self.log_sql(&sql);
        let row = tx
            .query_opt(sql.as_str(), &[&doctype, &after_seq])
            .await?
            .ok_or(StorageError::NoRows)?;
        Ok(row.try_get(0)?)
    }

    /// Remove every row of a doctype, returning how many rows went away.
    pub(crate) async fn exec_delete_doctype_rows(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
    ) -> StorageResult<u64> {
        let sql = flatten(&format!("DELETE FROM {table} WHERE doctype = $1;"));
        self.log_sql(&sql);
        Ok(tx.execute(sql.as_str(), &[&doctype]).await?)
    }

    /// Check whether a backing table holds no row at all.
    pub(crate) async fn exec_check_table_empty(
        &self,
        tx: &Transaction<'_>,
        table: &str,
    ) -> StorageResult<bool> {
        let sql = flatten(&format!("SELECT NOT EXISTS (SELECT 1 FROM {table} LIMIT 1);"));
        self.log_sql(&sql);
        let row = tx
            .query_opt(sql.as_str(), &[])
            .await?
            .ok_or(StorageError::NoRows)?;
        Ok(row.try_get(0)?)
    }

    /// Drop an empty backing table.
    pub(crate) async fn exec_drop_table(
        &self,
        tx: &Transaction<'_>,
        table: &str,
    ) -> StorageResult<()> {
        let sql = format!("DROP TABLE {table};");
        self.log_sql(&sql);
        tx.batch_execute(sql.as_str()).await?;
        Ok(())
    }

    /// Run a compiled Mango query: a projection and an ordering over the
    /// documents of a database.
    pub(crate) async fn exec_find_mango(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        doctype: &str,
        selected: &str,
        order_by: &str,
        limit: i64,
        skip: i64,
    ) -> StorageResult<Vec<Value>> {
        let sql = flatten(&format!(
            "
SELECT {selected}
FROM {table}
WHERE doctype = $1
AND kind = 'normal_doc'
ORDER BY {order_by}
LIMIT $2
OFFSET $3;
"
        ));
        self.log_sql(&sql);
        let rows = tx
            .query(sql.as_str(), &[&doctype, &limit, &skip])
            .await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(doc) = row.try_get::<_, Json<Value>>(0)?;
            docs.push(doc);
        }
        Ok(docs)
    }
}

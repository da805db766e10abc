//! Document operations
//!
//! Create, read, update and delete for user documents. Every write runs in
//! one read-write transaction and touches three row families atomically: the
//! document itself, its revision chain, and the change row keyed by the
//! sequence taken from the doctype counters.
//!
//! Revision identifiers are `{generation}-{digest}` where the digest is the
//! first 16 bytes of the SHA-256 of the document body at the moment of
//! write. The digest is computed over the request bytes as received; the
//! body is only re-serialised (with sorted keys) when the engine had to
//! inject `_id` or `_rev`, so identical inputs always produce identical
//! revisions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result, StorageError};
use crate::operator::{parse_database_name, Operator};
use crate::queries::RowKind;
use crate::tx;

/// Generate a short document id: a UUIDv7 with the dashes stripped.
pub fn short_uuid() -> String {
    Uuid::now_v7().simple().to_string()
}

/// The revision digest of a document body: the first 16 bytes of its
/// SHA-256, hex-encoded.
pub fn compute_revision_sum(body: &[u8]) -> String {
    let sum = Sha256::digest(body);
    hex::encode(&sum[..16])
}

/// Parse the generation number from a revision like `3-deadbeef`. Returns -1
/// when the revision does not start with an integer.
pub fn extract_generation(rev: &str) -> i64 {
    let gen = rev.split('-').next().unwrap_or(rev);
    gen.parse().unwrap_or(-1)
}

/// The revision chain of a document: digests from newest to oldest, with
/// `start` equal to the current generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revisions {
    pub start: i64,
    pub ids: Vec<String>,
}

impl Operator {
    /// Create a document (`POST /{db}`). A missing `_id` is generated; a
    /// `_rev` in the body is rejected, even for a document that does not
    /// exist yet.
    pub async fn create_document(
        &self,
        database_name: &str,
        body: &[u8],
    ) -> Result<Map<String, Value>> {
        let (table, doctype) = parse_database_name(database_name)?;

        let mut doc: Map<String, Value> =
            serde_json::from_slice(body).map_err(|_| Error::BadRequest)?;

        let mut raw = body.to_vec();
        let existing_id = doc
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let doc_id = if existing_id.is_empty() {
            let id = short_uuid();
            doc.insert("_id".to_string(), Value::String(id.clone()));
            raw = to_vec(&doc)?;
            id
        } else {
            existing_id
        };

        if doc.contains_key("_rev") {
            return Err(Error::Conflict);
        }

        if doc.get("_deleted") == Some(&Value::Bool(true)) {
            return self.do_create_deleted_document(&table, &doctype, &doc_id).await;
        }

        let rev_sum = compute_revision_sum(&raw);
        doc.insert("_rev".to_string(), Value::String(format!("1-{rev_sum}")));

        self.do_create_document(&table, &doctype, &doc_id, &rev_sum, doc)
            .await
    }

    /// Create a document or a new revision of one (`PUT /{db}/{docid}`).
    ///
    /// `current_rev` comes from the `rev` query parameter or the `If-Match`
    /// header and may be empty. It is reconciled with the `_rev` of the
    /// body: a mismatch, an empty body `_rev`, or a malformed generation are
    /// all conflicts.
    pub async fn put_document(
        &self,
        database_name: &str,
        doc_id: &str,
        current_rev: &str,
        body: &[u8],
    ) -> Result<Map<String, Value>> {
        let (table, doctype) = parse_database_name(database_name)?;

        let mut doc: Map<String, Value> =
            serde_json::from_slice(body).map_err(|_| Error::BadRequest)?;

        let mut body_invalidated = false;
        let existing_id = doc
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if existing_id.is_empty() {
            doc.insert("_id".to_string(), Value::String(doc_id.to_string()));
            body_invalidated = true;
        }

        let mut rev = current_rev.to_string();
        if doc.contains_key("_rev") {
            rev = doc
                .get("_rev")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if rev.is_empty() {
                return Err(Error::Conflict);
            }
            if !current_rev.is_empty() && rev != current_rev {
                return Err(Error::Conflict);
            }
        } else if !current_rev.is_empty() {
            doc.insert("_rev".to_string(), Value::String(current_rev.to_string()));
            body_invalidated = true;
        }

        if doc.get("_deleted") == Some(&Value::Bool(true)) {
            if rev.is_empty() {
                return self.do_create_deleted_document(&table, &doctype, doc_id).await;
            }
            return self.do_delete_document(&table, &doctype, doc_id, &rev).await;
        }

        let raw = if body_invalidated {
            to_vec(&doc)?
        } else {
            body.to_vec()
        };

        let mut gen = 0;
        if !rev.is_empty() {
            gen = extract_generation(&rev);
            if gen <= 0 {
                return Err(Error::Conflict);
            }
        }
        let rev_sum = compute_revision_sum(&raw);
        let new_rev = format!("{}-{}", gen + 1, rev_sum);
        doc.insert("_rev".to_string(), Value::String(new_rev));

        if gen == 0 {
            self.do_create_document(&table, &doctype, doc_id, &rev_sum, doc)
                .await
        } else {
            self.do_update_document(&table, &doctype, doc_id, current_rev, &rev_sum, doc)
                .await
        }
    }

    /// Read a document. A tombstoned document reads as deleted, which the
    /// HTTP layer reports as 404 with the `deleted` reason. With
    /// `with_revisions`, the revision chain is merged under `_revisions`.
    pub async fn get_document(
        &self,
        database_name: &str,
        doc_id: &str,
        with_revisions: bool,
    ) -> Result<Map<String, Value>> {
        let (table, doctype) = parse_database_name(database_name)?;

        let mut conn = self.pool.get().await?;
        let tx = tx::read_only(&mut conn).await?;
        let mut doc: Map<String, Value> = self
            .exec_get_row(&tx, &table, &doctype, RowKind::NormalDoc, doc_id)
            .await
            .map_err(Error::from)?;
        if doc.get("_deleted") == Some(&Value::Bool(true)) {
            return Err(Error::Deleted);
        }

        if with_revisions {
            let revisions: Value = self
                .exec_get_row(&tx, &table, &doctype, RowKind::Revisions, doc_id)
                .await
                .map_err(Error::from)?;
            doc.insert("_revisions".to_string(), revisions);
        }
        tx.commit().await?;
        Ok(doc)
    }

    /// Tombstone a document (`DELETE /{db}/{docid}`). The revision is
    /// required; the document row stays as a tombstone, the revision chain
    /// goes away, the change row reports `deleted: true`.
    pub async fn delete_document(
        &self,
        database_name: &str,
        doc_id: &str,
        current_rev: &str,
    ) -> Result<Map<String, Value>> {
        let (table, doctype) = parse_database_name(database_name)?;
        self.do_delete_document(&table, &doctype, doc_id, current_rev)
            .await
    }

    async fn do_create_document(
        &self,
        table: &str,
        doctype: &str,
        doc_id: &str,
        rev_sum: &str,
        doc: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut conn = self.pool.get().await?;
        let tx = tx::read_write(&mut conn).await?;

        let seq = self
            .exec_increment_doc_count(&tx, table, doctype)
            .await
            .map_err(Error::from)?;

        let inserted = self
            .exec_insert_row(&tx, table, doctype, RowKind::NormalDoc, doc_id, &doc)
            .await
            .map_err(conflict_on_unique)?;
        if !inserted {
            return Err(Error::Internal("document row was not inserted".to_string()));
        }

        let revisions = Revisions {
            start: 1,
            ids: vec![rev_sum.to_string()],
        };
        let inserted = self
            .exec_insert_row(&tx, table, doctype, RowKind::Revisions, doc_id, &revisions)
            .await
            .map_err(conflict_on_unique)?;
        if !inserted {
            return Err(Error::Internal("revisions row was not inserted".to_string()));
        }

        self.insert_change_row(&tx, table, doctype, seq, &doc, false)
            .await?;

        tx.commit().await?;
        Ok(doc)
    }

    async fn do_create_deleted_document(
        &self,
        table: &str,
        doctype: &str,
        doc_id: &str,
    ) -> Result<Map<String, Value>> {
        let mut doc = Map::new();
        doc.insert("_id".to_string(), Value::String(doc_id.to_string()));
        doc.insert("_deleted".to_string(), Value::Bool(true));
        let raw = to_vec(&doc)?;
        let rev_sum = compute_revision_sum(&raw);
        doc.insert("_rev".to_string(), Value::String(format!("1-{rev_sum}")));

        let mut conn = self.pool.get().await?;
        let tx = tx::read_write(&mut conn).await?;

        // A tombstone creation produces a sequence but no live document, so
        // only last_seq moves.
        let seq = self
            .exec_increment_last_seq(&tx, table, doctype)
            .await
            .map_err(Error::from)?;

        let inserted = self
            .exec_insert_row(&tx, table, doctype, RowKind::NormalDoc, doc_id, &doc)
            .await
            .map_err(conflict_on_unique)?;
        if !inserted {
            return Err(Error::Internal("document row was not inserted".to_string()));
        }

        let revisions = Revisions {
            start: 1,
            ids: vec![rev_sum.clone()],
        };
        let inserted = self
            .exec_insert_row(&tx, table, doctype, RowKind::Revisions, doc_id, &revisions)
            .await
            .map_err(conflict_on_unique)?;
        if !inserted {
            return Err(Error::Internal("revisions row was not inserted".to_string()));
        }

        self.insert_change_row(&tx, table, doctype, seq, &doc, true)
            .await?;

        tx.commit().await?;
        Ok(doc)
    }

    async fn do_update_document(
        &self,
        table: &str,
        doctype: &str,
        doc_id: &str,
        current_rev: &str,
        rev_sum: &str,
        doc: Map<String, Value>,
    ) -> Result<Map<String, Value>> {
        let mut conn = self.pool.get().await?;
        let tx = tx::read_write(&mut conn).await?;

        let seq = self
            .exec_increment_last_seq(&tx, table, doctype)
            .await
            .map_err(Error::from)?;

        let updated = self
            .exec_update_document(
                &tx,
                table,
                doctype,
                RowKind::NormalDoc,
                doc_id,
                current_rev,
                &doc,
            )
            .await
            .map_err(conflict_on_unique)?;
        if !updated {
            // Probe to tell a missing document from a revision mismatch.
            return match self
                .exec_get_row::<Value>(&tx, table, doctype, RowKind::NormalDoc, doc_id)
                .await
            {
                Ok(_) => Err(Error::Conflict),
                Err(_) => Err(Error::NotFound),
            };
        }

        let mut revisions: Revisions = self
            .exec_get_row(&tx, table, doctype, RowKind::Revisions, doc_id)
            .await
            .map_err(Error::from)?;
        revisions.start += 1;
        revisions.ids.insert(0, rev_sum.to_string());
        let updated = self
            .exec_update_row(&tx, table, doctype, RowKind::Revisions, doc_id, &revisions)
            .await
            .map_err(conflict_on_unique)?;
        if !updated {
            return Err(Error::Internal("revisions row was not updated".to_string()));
        }

        self.exec_delete_change_for_document(&tx, table, doctype, doc_id)
            .await
            .map_err(Error::from)?;
        self.insert_change_row(&tx, table, doctype, seq, &doc, false)
            .await?;

        tx.commit().await?;
        Ok(doc)
    }

    async fn do_delete_document(
        &self,
        table: &str,
        doctype: &str,
        doc_id: &str,
        current_rev: &str,
    ) -> Result<Map<String, Value>> {
        let gen = extract_generation(current_rev);
        if gen <= 0 {
            return Err(Error::Conflict);
        }

        let mut doc = Map::new();
        doc.insert("_id".to_string(), Value::String(doc_id.to_string()));
        doc.insert("_rev".to_string(), Value::String(current_rev.to_string()));
        doc.insert("_deleted".to_string(), Value::Bool(true));
        let raw = to_vec(&doc)?;
        let rev_sum = compute_revision_sum(&raw);
        let new_rev = format!("{}-{}", gen + 1, rev_sum);
        doc.insert("_rev".to_string(), Value::String(new_rev));

        let mut conn = self.pool.get().await?;
        let tx = tx::read_write(&mut conn).await?;

        let seq = self
            .exec_decrement_doc_count(&tx, table, doctype)
            .await
            .map_err(Error::from)?;

        let updated = self
            .exec_update_document(
                &tx,
                table,
                doctype,
                RowKind::NormalDoc,
                doc_id,
                current_rev,
                &doc,
            )
            .await
            .map_err(conflict_on_unique)?;
        if !updated {
            // Probe to tell a missing document from a revision mismatch.
            return match self
                .exec_get_row::<Value>(&tx, table, doctype, RowKind::NormalDoc, doc_id)
                .await
            {
                Ok(_) => Err(Error::Conflict),
                Err(_) => Err(Error::NotFound),
            };
        }

        let deleted = self
            .exec_delete_row(&tx, table, doctype, RowKind::Revisions, doc_id)
            .await
            .map_err(Error::from)?;
        if !deleted {
            return Err(Error::Internal("revisions row was not deleted".to_string()));
        }

        self.exec_delete_change_for_document(&tx, table, doctype, doc_id)
            .await
            .map_err(Error::from)?;
        self.insert_change_row(&tx, table, doctype, seq, &doc, true)
            .await?;

        tx.commit().await?;
        Ok(doc)
    }

    /// Insert the change row for a write: key `{seq:08}-{digest}` where the
    /// digest is the revision sum of the serialised change blob.
    async fn insert_change_row(
        &self,
        tx: &tokio_postgres::Transaction<'_>,
        table: &str,
        doctype: &str,
        seq: i64,
        doc: &Map<String, Value>,
        deleted: bool,
    ) -> Result<()> {
        let mut change = Map::new();
        if let Some(id) = doc.get("_id") {
            change.insert("id".to_string(), id.clone());
        }
        if let Some(rev) = doc.get("_rev") {
            change.insert("rev".to_string(), rev.clone());
        }
        if deleted {
            change.insert("deleted".to_string(), Value::Bool(true));
        }
        let body = to_vec(&change)?;
        let change_sum = compute_revision_sum(&body);
        let change_id = format!("{seq:08}-{change_sum}");
        let inserted = self
            .exec_insert_row(tx, table, doctype, RowKind::Change, &change_id, &change)
            .await
            .map_err(Error::from)?;
        if !inserted {
            return Err(Error::Internal("change row was not inserted".to_string()));
        }
        Ok(())
    }
}

fn conflict_on_unique(err: StorageError) -> Error {
    match err {
        StorageError::UniqueViolation => Error::Conflict,
        other => Error::from(other),
    }
}

fn to_vec(value: &Map<String, Value>) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::Internal(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_uuid() {
        let id = short_uuid();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert!(!id.contains('-'));
        assert_ne!(id, short_uuid());
    }

    #[test]
    fn test_compute_revision_sum() {
        // First 16 bytes of well-known SHA-256 digests
        assert_eq!(
            compute_revision_sum(b""),
            "e3b0c44298fc1c149afbf4c8996fb924"
        );
        assert_eq!(
            compute_revision_sum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223"
        );
        // Deterministic, and 32 hex chars long
        let sum = compute_revision_sum(b"{\"foo\":\"bar\"}");
        assert_eq!(sum, compute_revision_sum(b"{\"foo\":\"bar\"}"));
        assert_eq!(sum.len(), 32);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_extract_generation() {
        assert_eq!(extract_generation("1-e3b0c44298fc1c149afbf4c8996fb924"), 1);
        assert_eq!(extract_generation("42-abc"), 42);
        assert_eq!(extract_generation("7"), 7);
        assert_eq!(extract_generation(""), -1);
        assert_eq!(extract_generation("-abc"), -1);
        assert_eq!(extract_generation("x-abc"), -1);
        assert_eq!(extract_generation("1.5-abc"), -1);
    }

    #[test]
    fn test_revision_format() {
        // The first revision of a body is "1-" followed by 32 hex chars
        let rev = format!("1-{}", compute_revision_sum(b"{\"foo\":\"bar\"}"));
        assert_eq!(rev.len(), 34);
        let (gen, sum) = rev.split_once('-').unwrap();
        assert!(gen.parse::<u64>().unwrap() >= 1);
        assert!(!gen.starts_with('0'));
        assert_eq!(sum.len(), 32);
        assert!(sum.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_reserialisation_is_deterministic() {
        // serde_json maps are sorted, so injecting _id and serialising twice
        // yields the same bytes and therefore the same revision
        let mut doc: Map<String, serde_json::Value> =
            serde_json::from_str(r#"{"zeta": 1, "alpha": 2}"#).unwrap();
        doc.insert("_id".to_string(), serde_json::Value::String("myid".to_string()));
        let one = serde_json::to_vec(&doc).unwrap();
        let two = serde_json::to_vec(&doc).unwrap();
        assert_eq!(one, two);
        assert_eq!(
            String::from_utf8(one).unwrap(),
            r#"{"_id":"myid","alpha":2,"zeta":1}"#
        );
    }
}

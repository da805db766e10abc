//! Changes feed
//!
//! Ordered slices of the per-database change log. Change rows are keyed by
//! the sequence number padded with zeros to 8 digits, so that the string
//! order of the keys matches the numeric order of the sequences; the wire
//! API uses the unpadded form.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::operator::{parse_database_name, Operator};
use crate::queries::ChangeRow;
use crate::tx;

/// Parameters for a changes feed read.
#[derive(Debug, Clone)]
pub struct ChangesParams {
    /// Maximum number of results; a negative number means no limit
    pub limit: i64,
    /// Only return changes after this sequence (wire form, maybe empty)
    pub since: String,
}

impl Default for ChangesParams {
    fn default() -> Self {
        Self {
            limit: -1,
            since: String::new(),
        }
    }
}

/// A slice of the changes feed.
#[derive(Debug, Serialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeResult>,
    pub last_seq: String,
    pub pending: i64,
}

/// One entry of the changes feed.
#[derive(Debug, Serialize)]
pub struct ChangeResult {
    pub id: Value,
    pub seq: String,
    pub changes: Vec<ChangeRev>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<Value>,
}

/// The revision recorded by a change.
#[derive(Debug, Serialize)]
pub struct ChangeRev {
    pub rev: Value,
}

impl Operator {
    /// Read a slice of the changes feed of a database, ordered by sequence.
    pub async fn get_changes(
        &self,
        database_name: &str,
        params: &ChangesParams,
    ) -> Result<ChangesResponse> {
        let (table, doctype) = parse_database_name(database_name)?;

        let mut response = ChangesResponse {
            results: Vec::new(),
            last_seq: "0".to_string(),
            pending: 0,
        };
        if !params.since.is_empty() {
            response.last_seq = params.since.clone();
        }

        let since_padded = pad_seq(&params.since);
        let limit = if params.limit < 0 {
            None
        } else {
            Some(params.limit)
        };

        let mut conn = self.pool.get().await?;
        let tx = tx::read_only(&mut conn).await?;
        let rows = self
            .exec_get_changes(&tx, &table, &doctype, &since_padded, limit)
            .await
            .map_err(Error::from)?;

        let mut last_padded_seq = since_padded;
        for row in rows {
            last_padded_seq = row.seq.clone();
            response.results.push(change_to_result(row));
        }
        if !response.results.is_empty() {
            response.last_seq = unpad_seq(&last_padded_seq);
        }

        // `pending` only matters when the read was truncated by the limit.
        if params.limit >= 0 && response.results.len() as i64 == params.limit {
            response.pending = self
                .exec_count_pending_changes(&tx, &table, &doctype, &last_padded_seq)
                .await
                .map_err(Error::from)?;
        }
        tx.commit().await?;
        Ok(response)
    }
}

/// Pad the number part of a sequence with zeros to 8 digits.
///
/// On the wire a sequence looks like `42-abcdef`; in the database it is
/// stored as `00000042-abcdef` so that sorting on strings follows the
/// sequence number (`99-` comes before `100-`). An empty sequence pads to
/// all zeros, which sorts before every change.
pub fn pad_seq(seq: &str) -> String {
    if seq.is_empty() {
        return "0".repeat(8);
    }
    match seq.find('-') {
        Some(index) if index < 8 => format!("{}{}", "0".repeat(8 - index), seq),
        _ => seq.to_string(),
    }
}

/// Strip the zero padding (at most 8 leading zeros) from a stored sequence.
pub fn unpad_seq(seq: &str) -> String {
    let mut stripped = seq;
    for _ in 0..8 {
        match stripped.strip_prefix('0') {
            Some(rest) => stripped = rest,
            None => break,
        }
    }
    stripped.to_string()
}

fn change_to_result(change: ChangeRow) -> ChangeResult {
    let mut blob = change.blob;
    ChangeResult {
        id: blob.remove("id").unwrap_or(Value::Null),
        seq: unpad_seq(&change.seq),
        changes: vec![ChangeRev {
            rev: blob.remove("rev").unwrap_or(Value::Null),
        }],
        deleted: blob.remove("deleted"),
    }
}

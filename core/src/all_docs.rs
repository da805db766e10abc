//! The `_all_docs` listing
//!
//! Lists the documents of a database in key order, with optional inclusive
//! key range, pagination, and full-document projection. `total_rows` comes
//! from the doctype counter, not from counting rows.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::operator::{parse_database_name, Operator};
use crate::queries::RowKind;
use crate::tx;

/// Parameters for `_all_docs` (also used for the `_all_dbs` listing).
#[derive(Debug, Clone, Default)]
pub struct AllDocsParams {
    /// Include the full documents in the rows
    pub include_docs: bool,
    /// Reverse the key order
    pub descending: bool,
    /// Maximum number of rows; 0 means no limit
    pub limit: i64,
    /// Number of rows to skip
    pub skip: i64,
    /// First key of the range (inclusive), empty means unbounded
    pub start_key: String,
    /// Last key of the range (inclusive), empty means unbounded
    pub end_key: String,
}

/// The response of `_all_docs`.
#[derive(Debug, Serialize)]
pub struct AllDocsResponse {
    pub offset: i64,
    pub total_rows: i64,
    pub rows: Vec<AllDocsRow>,
}

/// One row of an `_all_docs` response.
#[derive(Debug, Serialize)]
pub struct AllDocsRow {
    pub id: String,
    pub key: String,
    pub value: AllDocsValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

/// The value of an `_all_docs` row: the current revision.
#[derive(Debug, Serialize)]
pub struct AllDocsValue {
    pub rev: String,
}

#[derive(Debug, Deserialize)]
struct JustDocCount {
    doc_count: i64,
}

impl Operator {
    /// List the documents of a database.
    pub async fn get_all_docs(
        &self,
        database_name: &str,
        params: &AllDocsParams,
    ) -> Result<AllDocsResponse> {
        let (table, doctype) = parse_database_name(database_name)?;

        let mut response = AllDocsResponse {
            offset: params.skip,
            total_rows: 0,
            rows: Vec::new(),
        };

        let mut conn = self.pool.get().await?;
        let tx = tx::read_only(&mut conn).await?;
        let db: JustDocCount = self
            .exec_get_row(&tx, &table, &doctype, RowKind::Doctype, &doctype)
            .await
            .map_err(Error::from)?;
        response.total_rows = db.doc_count;
        if db.doc_count == 0 {
            tx.commit().await?;
            return Ok(response);
        }

        let docs = self
            .exec_get_all_docs(&tx, &table, &doctype, params)
            .await
            .map_err(Error::from)?;
        for doc in docs {
            let id = doc
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let rev = doc
                .get("_rev")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            response.rows.push(AllDocsRow {
                id: id.clone(),
                key: id,
                value: AllDocsValue { rev },
                doc: params.include_docs.then_some(doc),
            });
        }
        tx.commit().await?;
        Ok(response)
    }
}

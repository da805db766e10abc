//! Mango queries (`_find`)
//!
//! Compiles the declarative query parameters into SQL over the generic
//! table: the `fields` projection becomes a `jsonb_build_object` tree, the
//! `sort` becomes an `ORDER BY` on JSON extractions. Field names are user
//! input that ends up in SQL text, so they are rejected when empty or when
//! they contain a single quote.
//!
//! Selectors are parsed but not evaluated: a non-empty selector is rejected
//! with `not_implemented` rather than silently returning unfiltered rows.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::operator::{parse_database_name, Operator};
use crate::tx;

/// Parameters for a `_find` query, as posted by the client.
#[derive(Debug, Default, Deserialize)]
pub struct MangoParams {
    /// Filtering selector; only the empty selector is supported
    #[serde(default)]
    pub selector: Map<String, Value>,
    /// Fields to project, dotted paths allowed; empty means whole documents
    #[serde(default)]
    pub fields: Vec<String>,
    /// Sort specification: field names or `{field: "asc"|"desc"}` objects
    #[serde(default)]
    pub sort: Vec<Value>,
    /// Maximum number of documents; 0 means the default of 25
    #[serde(default)]
    pub limit: i64,
    /// Number of documents to skip
    #[serde(default)]
    pub skip: i64,
}

/// The response of a `_find` query.
#[derive(Debug, Serialize)]
pub struct MangoResponse {
    pub docs: Vec<Value>,
}

impl Operator {
    /// Find documents with projection, sort and pagination.
    pub async fn find_mango(
        &self,
        database_name: &str,
        params: &MangoParams,
    ) -> Result<MangoResponse> {
        let (table, doctype) = parse_database_name(database_name)?;

        if !params.selector.is_empty() {
            return Err(Error::NotImplemented);
        }

        let limit = if params.limit == 0 { 25 } else { params.limit };
        let selected = mango_fields_to_sql(&params.fields)?;
        let order_by = mango_sort_to_sql(&params.sort)?;

        let mut conn = self.pool.get().await?;
        let tx = tx::read_only(&mut conn).await?;
        let docs = self
            .exec_find_mango(&tx, &table, &doctype, &selected, &order_by, limit, params.skip)
            .await
            .map_err(Error::from)?;
        tx.commit().await?;
        Ok(MangoResponse { docs })
    }
}

/// Compile the `fields` projection to a SQL expression. Dotted paths share
/// prefixes; a field that already exists as a leaf absorbs any longer path
/// below it. Documents missing a projected path get `null` leaves.
fn mango_fields_to_sql(fields: &[String]) -> Result<String> {
    if fields.is_empty() {
        return Ok("blob".to_string());
    }
    let mut fields = fields.to_vec();
    fields.sort();
    let parsed = parse_mango_fields(&fields)?;
    Ok(parsed.to_sql(""))
}

fn parse_mango_fields(fields: &[String]) -> Result<MangoField> {
    let mut parsed = MangoField::default();
    for field in fields {
        if field.is_empty() || field.contains('\'') {
            return Err(Error::BadRequest);
        }
        let parts: Vec<&str> = field.split('.').collect();
        add_field_to_mango_fields(&mut parsed, &parts);
    }
    Ok(parsed)
}

fn add_field_to_mango_fields(node: &mut MangoField, parts: &[&str]) {
    let Some((first, rest)) = parts.split_first() else {
        return;
    };
    match node.sub_keys.iter_mut().find(|sub| sub.key == *first) {
        Some(sub) => {
            if sub.sub_keys.is_empty() {
                // An existing leaf wins over a longer path below it
                return;
            }
            add_field_to_mango_fields(sub, rest);
        }
        None => {
            let mut sub = MangoField {
                key: first.to_string(),
                sub_keys: Vec::new(),
            };
            add_field_chain(&mut sub, rest);
            node.sub_keys.push(sub);
        }
    }
}

fn add_field_chain(node: &mut MangoField, parts: &[&str]) {
    if let Some((first, rest)) = parts.split_first() {
        let mut sub = MangoField {
            key: first.to_string(),
            sub_keys: Vec::new(),
        };
        add_field_chain(&mut sub, rest);
        node.sub_keys.push(sub);
    }
}

#[derive(Debug, Default)]
struct MangoField {
    key: String,
    sub_keys: Vec<MangoField>,
}

impl MangoField {
    fn to_sql(&self, path: &str) -> String {
        let mut sql = String::from("jsonb_build_object(");
        for (i, sub) in self.sub_keys.iter().enumerate() {
            if i > 0 {
                sql.push_str(", ");
            }
            let value = if !sub.sub_keys.is_empty() {
                sub.to_sql(&format!("{path}{},", sub.key))
            } else if path.is_empty() {
                format!("blob -> '{}'", sub.key)
            } else {
                format!("blob #> '{{{path}{}}}'", sub.key)
            };
            sql.push_str(&format!("'{}', {value}", sub.key));
        }
        sql.push(')');
        sql
    }
}

/// Compile the `sort` specification to an `ORDER BY` expression. An empty
/// sort falls back to the physical insertion order. The `->` and `#>`
/// operators extract JSON values, so numbers compare numerically.
fn mango_sort_to_sql(sort: &[Value]) -> Result<String> {
    if sort.is_empty() {
        return Ok("row_id ASC".to_string());
    }

    let mut order_by = String::new();
    for (i, item) in sort.iter().enumerate() {
        let (field, way) = match item {
            Value::String(field) => (field.clone(), "ASC".to_string()),
            Value::Object(map) => {
                if map.len() != 1 {
                    return Err(Error::BadRequest);
                }
                let Some((key, value)) = map.iter().next() else {
                    return Err(Error::BadRequest);
                };
                let Some(way) = value.as_str() else {
                    return Err(Error::BadRequest);
                };
                (key.clone(), way.to_uppercase())
            }
            _ => return Err(Error::BadRequest),
        };

        if field.is_empty() || field.contains('\'') {
            return Err(Error::BadRequest);
        }
        if way != "ASC" && way != "DESC" {
            return Err(Error::BadRequest);
        }
        if i > 0 {
            order_by.push_str(", ");
        }
        if field.contains('.') {
            let replaced = field.replace('.', ",");
            order_by.push_str(&format!("blob #> '{{{replaced}}}' {way}"));
        } else {
            order_by.push_str(&format!("blob -> '{field}' {way}"));
        }
    }
    Ok(order_by)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_mango_fields_to_sql() {
        let result = mango_fields_to_sql(&[]).unwrap();
        assert_eq!(result, "blob");

        let result = mango_fields_to_sql(&fields(&["one"])).unwrap();
        assert_eq!(result, "jsonb_build_object('one', blob -> 'one')");

        let result = mango_fields_to_sql(&fields(&["one", "two", "three"])).unwrap();
        assert_eq!(
            result,
            "jsonb_build_object('one', blob -> 'one', 'three', blob -> 'three', 'two', blob -> 'two')"
        );

        let result = mango_fields_to_sql(&fields(&["nested.sub.subsub"])).unwrap();
        assert_eq!(
            result,
            "jsonb_build_object('nested', jsonb_build_object('sub', jsonb_build_object('subsub', blob #> '{nested,sub,subsub}')))"
        );

        let result =
            mango_fields_to_sql(&fields(&["nested.sub.a", "nested.sub.b", "nested.c", "nested.c.d"]))
                .unwrap();
        assert_eq!(
            result,
            "jsonb_build_object('nested', jsonb_build_object('c', blob #> '{nested,c}', 'sub', jsonb_build_object('a', blob #> '{nested,sub,a}', 'b', blob #> '{nested,sub,b}')))"
        );

        assert!(mango_fields_to_sql(&fields(&["SQL injection '; DROP TABLE ..."])).is_err());
        assert!(mango_fields_to_sql(&fields(&[""])).is_err());
    }

    #[test]
    fn test_parse_mango_fields() {
        let result = parse_mango_fields(&fields(&["a", "b", "c"])).unwrap();
        assert_eq!(result.sub_keys.len(), 3);
        for (i, expected) in ["a", "b", "c"].iter().enumerate() {
            assert_eq!(result.sub_keys[i].key, *expected);
            assert!(result.sub_keys[i].sub_keys.is_empty());
        }

        // A shorter leaf absorbs the longer path
        let result = parse_mango_fields(&fields(&["a", "a.b"])).unwrap();
        assert_eq!(result.sub_keys.len(), 1);
        assert_eq!(result.sub_keys[0].key, "a");
        assert!(result.sub_keys[0].sub_keys.is_empty());

        let result = parse_mango_fields(&fields(&["nested.sub.subsub", "nested.sub.xtra"])).unwrap();
        assert_eq!(result.sub_keys.len(), 1);
        let nested = &result.sub_keys[0];
        assert_eq!(nested.key, "nested");
        assert_eq!(nested.sub_keys.len(), 1);
        let sub = &nested.sub_keys[0];
        assert_eq!(sub.key, "sub");
        assert_eq!(sub.sub_keys.len(), 2);
        assert_eq!(sub.sub_keys[0].key, "subsub");
        assert!(sub.sub_keys[0].sub_keys.is_empty());
        assert_eq!(sub.sub_keys[1].key, "xtra");
        assert!(sub.sub_keys[1].sub_keys.is_empty());
    }

    #[test]
    fn test_mango_field_to_sql() {
        let field = MangoField {
            key: String::new(),
            sub_keys: vec![
                MangoField { key: "a".to_string(), sub_keys: vec![] },
                MangoField { key: "b".to_string(), sub_keys: vec![] },
                MangoField { key: "c".to_string(), sub_keys: vec![] },
            ],
        };
        assert_eq!(
            field.to_sql(""),
            "jsonb_build_object('a', blob -> 'a', 'b', blob -> 'b', 'c', blob -> 'c')"
        );

        let field = MangoField {
            key: String::new(),
            sub_keys: vec![MangoField {
                key: "nested".to_string(),
                sub_keys: vec![MangoField {
                    key: "sub".to_string(),
                    sub_keys: vec![MangoField {
                        key: "subsub".to_string(),
                        sub_keys: vec![],
                    }],
                }],
            }],
        };
        assert_eq!(
            field.to_sql(""),
            "jsonb_build_object('nested', jsonb_build_object('sub', jsonb_build_object('subsub', blob #> '{nested,sub,subsub}')))"
        );
    }

    #[test]
    fn test_mango_sort_to_sql() {
        let result = mango_sort_to_sql(&[]).unwrap();
        assert_eq!(result, "row_id ASC");

        let result = mango_sort_to_sql(&[json!("one"), json!("two")]).unwrap();
        assert_eq!(result, "blob -> 'one' ASC, blob -> 'two' ASC");

        let result = mango_sort_to_sql(&[json!({"one": "desc"}), json!({"two": "desc"})]).unwrap();
        assert_eq!(result, "blob -> 'one' DESC, blob -> 'two' DESC");

        let result = mango_sort_to_sql(&[json!("nested.sub.subsub")]).unwrap();
        assert_eq!(result, "blob #> '{nested,sub,subsub}' ASC");

        assert!(mango_sort_to_sql(&[json!(1)]).is_err());
        assert!(mango_sort_to_sql(&[json!("SQL injection '; DROP TABLE...")]).is_err());
        assert!(mango_sort_to_sql(&[json!({"one": "invalid"})]).is_err());
        assert!(mango_sort_to_sql(&[json!({"one": "desc", "two": "desc"})]).is_err());
        assert!(mango_sort_to_sql(&[json!({"one": 1})]).is_err());
        assert!(mango_sort_to_sql(&[json!("")]).is_err());
    }

    #[test]
    fn test_mango_sort_direction_is_case_insensitive() {
        let result = mango_sort_to_sql(&[json!({"one": "Desc"})]).unwrap();
        assert_eq!(result, "blob -> 'one' DESC");
        let result = mango_sort_to_sql(&[json!({"one": "asc"})]).unwrap();
        assert_eq!(result, "blob -> 'one' ASC");
    }
}

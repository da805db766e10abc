//! HTTP routes and handlers
//!
//! The CouchDB API surface: databases, documents, `_all_docs`, `_changes`,
//! `_find`, design documents. Handlers translate the engine's error kinds
//! into HTTP statuses, with JSON bodies of the form `{error, reason}`.
//!
//! The `{db}` path segment arrives percent-encoded (`prefix%2Fdoctype`) and
//! is decoded by the router before it reaches the engine.

use std::panic::AssertUnwindSafe;

use axum::body::Bytes;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Router};
use futures::FutureExt;
use log::{error, info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use sofadb_core::all_docs::AllDocsParams;
use sofadb_core::changes::ChangesParams;
use sofadb_core::mango::MangoParams;
use sofadb_core::{Error, Operator, Pool};

const REASON_MISSING: &str = "missing";
const REASON_DELETED: &str = "deleted";
const REASON_NO_DATABASE: &str = "Database does not exist.";
const REASON_CONFLICT: &str = "Document update conflict.";
const REASON_BAD_JSON: &str = "invalid UTF-8 JSON";
const REASON_DATABASE_EXISTS: &str =
    "The database could not be created, the file already exists.";
const REASON_ILLEGAL_NAME: &str = "Name: '_db'. Only lowercase characters (a-z), digits (0-9), \
    and any of the characters _, $, (, ), +, -, and / are allowed. Must begin with a letter.";

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// The PostgreSQL connection pool
    pub pool: Pool,
}

impl AppState {
    fn operator(&self, req_id: &RequestId) -> Operator {
        Operator::new(self.pool.clone(), req_id.0.clone())
    }
}

/// Identifier of a request, taken from the incoming headers or generated,
/// used for log correlation.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Build the router for the CouchDB API.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/_all_dbs", get(get_all_databases))
        .route(
            "/:db",
            get(get_database)
                .put(create_database)
                .delete(delete_database)
                .post(create_document),
        )
        .route("/:db/_all_docs", get(get_all_docs))
        .route("/:db/_changes", get(get_changes))
        .route("/:db/_find", post(find_mango))
        .route("/:db/_design/:ddoc", put(create_design_doc))
        .route("/:db/_design/:ddoc/_view/:view", get(get_view))
        .route(
            "/:db/:docid",
            get(get_document).put(put_document).delete(delete_document),
        )
        .layer(middleware::from_fn(catch_panics))
        .layer(middleware::from_fn(log_requests))
        .layer(middleware::from_fn(request_id))
        .with_state(state)
}

/// Pick the request id from the incoming headers, or generate one, and echo
/// it in the response.
async fn request_id(mut request: Request, next: Next) -> Response {
    let headers = request.headers();
    let req_id = ["x-request-id", "x-request-uid", "x-haproxy-unique-id"]
        .iter()
        .find_map(|name| {
            headers
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    request.extensions_mut().insert(RequestId(req_id.clone()));
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&req_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let req_id = request
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let response = next.run(request).await;
    if uri.path() != "/status" {
        info!(target: "http",
            "{method} {uri} {} req_id={req_id}",
            response.status().as_u16()
        );
    }
    response
}

async fn catch_panics(request: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let detail = panic_message(panic);
            error!("handler panicked: {detail}");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_server_error",
                &detail,
            )
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

/// Handler for GET/HEAD /status. It responds with the status of the
/// service: 200 when PostgreSQL answers, 500 otherwise.
async fn status(State(state): State<AppState>, Extension(req_id): Extension<RequestId>) -> Response {
    let op = state.operator(&req_id);
    match op.ping().await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "OK"}))).into_response(),
        Err(err) => {
            warn!("cannot ping PostgreSQL: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "KO"})),
            )
                .into_response()
        }
    }
}

/// Handler for GET /_all_dbs. It returns the list of the databases within
/// one backing table, selected by the key range.
async fn get_all_databases(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Query(query): Query<ListQuery>,
) -> Response {
    let op = state.operator(&req_id);
    let params = match all_docs_params(&query) {
        Ok(params) => params,
        Err(response) => return response,
    };
    match op.get_all_databases(&params).await {
        Ok(names) => (StatusCode::OK, Json(names)).into_response(),
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_MISSING),
        Err(Error::NotImplemented) => json_error(
            StatusCode::NOT_IMPLEMENTED,
            "not_implemented",
            "not_implemented",
        ),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for GET/HEAD /:db. It returns information about the given
/// database (number of documents, last sequence).
async fn get_database(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(db): Path<String>,
) -> Response {
    let op = state.operator(&req_id);
    match op.get_database(&db).await {
        Ok(info) => (StatusCode::OK, Json(Value::Object(info))).into_response(),
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_NO_DATABASE),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for PUT /:db. It creates a database (in the CouchDB meaning, not
/// a PostgreSQL database).
async fn create_database(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(db): Path<String>,
) -> Response {
    let op = state.operator(&req_id);
    match op.create_database(&db).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({"ok": true}))).into_response(),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(Error::DatabaseExists) => json_error(
            StatusCode::PRECONDITION_FAILED,
            "file_exists",
            REASON_DATABASE_EXISTS,
        ),
        Err(err) => internal_error(&err),
    }
}

/// Handler for DELETE /:db. It deletes a database and every document in it.
async fn delete_database(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(db): Path<String>,
) -> Response {
    let op = state.operator(&req_id);
    match op.delete_database(&db).await {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))).into_response(),
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_NO_DATABASE),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for GET /:db/_all_docs. It lists the documents of the database.
async fn get_all_docs(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(db): Path<String>,
    Query(query): Query<ListQuery>,
) -> Response {
    let op = state.operator(&req_id);
    let params = match all_docs_params(&query) {
        Ok(params) => params,
        Err(response) => return response,
    };
    match op.get_all_docs(&db, &params).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_MISSING),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for GET /:db/_changes. It returns a sorted list of the changes
/// made to the documents of the database.
async fn get_changes(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(db): Path<String>,
    Query(query): Query<ChangesQuery>,
) -> Response {
    let op = state.operator(&req_id);
    let mut params = ChangesParams {
        limit: -1,
        since: query.since.clone().unwrap_or_default(),
    };
    if let Some(raw) = non_empty(&query.limit) {
        params.limit = match decode_int(raw) {
            Ok(limit) => limit,
            Err(response) => return response,
        };
    }
    match op.get_changes(&db, &params).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_MISSING),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for POST /:db. It creates a document in the given database.
async fn create_document(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(db): Path<String>,
    body: Bytes,
) -> Response {
    let op = state.operator(&req_id);
    match op.create_document(&db, &body).await {
        Ok(doc) => created_response(&doc),
        Err(Error::BadRequest) => {
            json_error(StatusCode::BAD_REQUEST, "bad_request", REASON_BAD_JSON)
        }
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_NO_DATABASE),
        Err(Error::Conflict) => json_error(StatusCode::CONFLICT, "conflict", REASON_CONFLICT),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for GET/HEAD /:db/:docid. It returns the given document, with
/// the current revision in the ETag header. With `?revs=true`, the revision
/// chain is included under `_revisions`.
async fn get_document(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path((db, docid)): Path<(String, String)>,
    Query(query): Query<DocQuery>,
) -> Response {
    let op = state.operator(&req_id);
    let with_revisions = query.revs.as_deref() == Some("true");
    match op.get_document(&db, &docid, with_revisions).await {
        Ok(doc) => {
            let rev = doc
                .get("_rev")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let response = (StatusCode::OK, Json(Value::Object(doc))).into_response();
            with_etag(response, &rev)
        }
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_MISSING),
        Err(Error::Deleted) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_DELETED),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for PUT /:db/:docid. It creates a new document or a new revision
/// of an existing document. The expected revision comes from the `rev`
/// query parameter or the `If-Match` header.
async fn put_document(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path((db, docid)): Path<(String, String)>,
    Query(query): Query<DocQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let op = state.operator(&req_id);
    let rev = expected_rev(&query, &headers);
    match op.put_document(&db, &docid, &rev, &body).await {
        Ok(doc) => created_response(&doc),
        Err(Error::BadRequest) => {
            json_error(StatusCode::BAD_REQUEST, "bad_request", REASON_BAD_JSON)
        }
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_NO_DATABASE),
        Err(Error::Conflict) => json_error(StatusCode::CONFLICT, "conflict", REASON_CONFLICT),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for DELETE /:db/:docid. It marks the given document as deleted.
async fn delete_document(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path((db, docid)): Path<(String, String)>,
    Query(query): Query<DocQuery>,
    headers: HeaderMap,
) -> Response {
    let op = state.operator(&req_id);
    let rev = expected_rev(&query, &headers);
    match op.delete_document(&db, &docid, &rev).await {
        Ok(doc) => {
            let rev = doc
                .get("_rev")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let response = (
                StatusCode::OK,
                Json(json!({"ok": true, "id": docid, "rev": rev})),
            )
                .into_response();
            with_etag(response, &rev)
        }
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_MISSING),
        Err(Error::Conflict) => json_error(StatusCode::CONFLICT, "conflict", REASON_CONFLICT),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for POST /:db/_find. It finds documents using a declarative JSON
/// querying syntax.
async fn find_mango(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path(db): Path<String>,
    body: Bytes,
) -> Response {
    let op = state.operator(&req_id);
    let params: MangoParams = match serde_json::from_slice(&body) {
        Ok(params) => params,
        Err(err) => return json_error(StatusCode::BAD_REQUEST, &err.to_string(), REASON_BAD_JSON),
    };
    match op.find_mango(&db, &params).await {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_MISSING),
        Err(Error::BadRequest) => json_error(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "Invalid fields or sort parameter.",
        ),
        Err(Error::NotImplemented) => json_error(
            StatusCode::NOT_IMPLEMENTED,
            "not_implemented",
            "Non-empty selectors are not supported.",
        ),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for PUT /:db/_design/:ddoc. It stores a design document in the
/// given database.
async fn create_design_doc(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path((db, ddoc)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let op = state.operator(&req_id);
    let doc_id = format!("_design/{ddoc}");
    match op.create_design_doc(&db, &doc_id, &body).await {
        Ok(doc) => created_response(&doc),
        Err(Error::BadRequest) => {
            json_error(StatusCode::BAD_REQUEST, "bad_request", REASON_BAD_JSON)
        }
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_NO_DATABASE),
        Err(Error::Conflict) => json_error(StatusCode::CONFLICT, "conflict", REASON_CONFLICT),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

/// Handler for GET /:db/_design/:ddoc/_view/:view. Views are not available
/// in this build.
async fn get_view(
    State(state): State<AppState>,
    Extension(req_id): Extension<RequestId>,
    Path((db, ddoc, view)): Path<(String, String, String)>,
) -> Response {
    let op = state.operator(&req_id);
    let doc_id = format!("_design/{ddoc}");
    match op.get_view(&db, &doc_id, &view).await {
        Ok(()) => (StatusCode::OK, Json(json!({}))).into_response(),
        Err(Error::NotFound) => json_error(StatusCode::NOT_FOUND, "not_found", REASON_MISSING),
        Err(Error::NotImplemented) => json_error(
            StatusCode::NOT_IMPLEMENTED,
            "not_implemented",
            "Views are not supported.",
        ),
        Err(Error::IllegalDatabaseName) => illegal_name(),
        Err(err) => internal_error(&err),
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListQuery {
    include_docs: Option<String>,
    descending: Option<String>,
    startkey: Option<String>,
    start_key: Option<String>,
    endkey: Option<String>,
    end_key: Option<String>,
    limit: Option<String>,
    skip: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChangesQuery {
    since: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DocQuery {
    rev: Option<String>,
    revs: Option<String>,
}

fn all_docs_params(query: &ListQuery) -> Result<AllDocsParams, Response> {
    let mut params = AllDocsParams {
        include_docs: query.include_docs.as_deref() == Some("true"),
        descending: query.descending.as_deref() == Some("true"),
        ..Default::default()
    };
    for raw in [&query.startkey, &query.start_key] {
        if let Some(raw) = non_empty(raw) {
            params.start_key = decode_key(raw)?;
        }
    }
    for raw in [&query.endkey, &query.end_key] {
        if let Some(raw) = non_empty(raw) {
            params.end_key = decode_key(raw)?;
        }
    }
    if let Some(raw) = non_empty(&query.limit) {
        params.limit = decode_int(raw)?;
    }
    if let Some(raw) = non_empty(&query.skip) {
        params.skip = decode_int(raw)?;
    }
    Ok(params)
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}

/// Keys are JSON-encoded strings in the query string.
fn decode_key(raw: &str) -> Result<String, Response> {
    serde_json::from_str::<String>(raw)
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, "bad_request", &err.to_string()))
}

fn decode_int(raw: &str) -> Result<i64, Response> {
    raw.parse::<i64>()
        .map_err(|err| json_error(StatusCode::BAD_REQUEST, "query_parse_error", &err.to_string()))
}

fn expected_rev(query: &DocQuery, headers: &HeaderMap) -> String {
    if let Some(rev) = non_empty(&query.rev) {
        return rev.to_string();
    }
    headers
        .get(header::IF_MATCH)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

fn created_response(doc: &serde_json::Map<String, Value>) -> Response {
    let id = doc.get("_id").cloned().unwrap_or(Value::Null);
    let rev_value = doc.get("_rev").cloned().unwrap_or(Value::Null);
    let rev = rev_value.as_str().unwrap_or_default().to_string();
    let response = (
        StatusCode::CREATED,
        Json(json!({"ok": true, "id": id, "rev": rev_value})),
    )
        .into_response();
    with_etag(response, &rev)
}

fn with_etag(mut response: Response, rev: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(rev) {
        response.headers_mut().insert(header::ETAG, value);
    }
    response
}

fn json_error(status: StatusCode, error: &str, reason: &str) -> Response {
    (status, Json(json!({"error": error, "reason": reason}))).into_response()
}

fn illegal_name() -> Response {
    json_error(
        StatusCode::BAD_REQUEST,
        "illegal_database_name",
        REASON_ILLEGAL_NAME,
    )
}

fn internal_error(err: &Error) -> Response {
    error!("internal_server_error: {err}");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal_server_error",
        &err.to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_docs_params_defaults() {
        let params = all_docs_params(&ListQuery::default()).unwrap();
        assert!(!params.include_docs);
        assert!(!params.descending);
        assert_eq!(params.limit, 0);
        assert_eq!(params.skip, 0);
        assert_eq!(params.start_key, "");
        assert_eq!(params.end_key, "");
    }

    #[test]
    fn test_all_docs_params_parsing() {
        let query = ListQuery {
            include_docs: Some("true".to_string()),
            descending: Some("false".to_string()),
            startkey: Some("\"aaa\"".to_string()),
            end_key: Some("\"zzz\"".to_string()),
            limit: Some("10".to_string()),
            skip: Some("3".to_string()),
            ..Default::default()
        };
        let params = all_docs_params(&query).unwrap();
        assert!(params.include_docs);
        assert!(!params.descending);
        assert_eq!(params.start_key, "aaa");
        assert_eq!(params.end_key, "zzz");
        assert_eq!(params.limit, 10);
        assert_eq!(params.skip, 3);
    }

    #[test]
    fn test_all_docs_params_rejects_bad_input() {
        // Keys must be JSON-encoded strings
        let query = ListQuery {
            startkey: Some("not json".to_string()),
            ..Default::default()
        };
        assert!(all_docs_params(&query).is_err());

        let query = ListQuery {
            limit: Some("ten".to_string()),
            ..Default::default()
        };
        assert!(all_docs_params(&query).is_err());
    }

    #[test]
    fn test_all_docs_params_ignores_empty_values() {
        let query = ListQuery {
            limit: Some(String::new()),
            startkey: Some(String::new()),
            ..Default::default()
        };
        let params = all_docs_params(&query).unwrap();
        assert_eq!(params.limit, 0);
        assert_eq!(params.start_key, "");
    }

    #[test]
    fn test_expected_rev() {
        let query = DocQuery {
            rev: Some("1-abc".to_string()),
            revs: None,
        };
        assert_eq!(expected_rev(&query, &HeaderMap::new()), "1-abc");

        let mut headers = HeaderMap::new();
        headers.insert(header::IF_MATCH, HeaderValue::from_static("2-def"));
        assert_eq!(expected_rev(&DocQuery::default(), &headers), "2-def");

        // The query parameter wins over the header
        assert_eq!(expected_rev(&query, &headers), "1-abc");
        assert_eq!(expected_rev(&DocQuery::default(), &HeaderMap::new()), "");
    }
}

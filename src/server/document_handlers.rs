//! Database and document HTTP handlers
//!
//! CouchDB-compatible endpoints for database lifecycle, document CRUD,
//! bulk operations, views and attachments. Every handler follows the
//! same mapping rule: a store success becomes 200/201 with the
//! engine's result body, a store failure forwards the engine's error
//! payload verbatim under the operation's failure status code.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::error::Error;
use crate::server::middleware::{Normalized, Payload};
use crate::server::AppState;
use crate::store::{param_str, Database, MapExpr, ViewQuery};

/// Structural sub-routes live under these prefixes; the generic
/// document and attachment handlers must not swallow them.
pub(crate) fn is_reserved_doc_id(id: &str) -> bool {
    id == "_design" || id == "_local"
}

fn missing() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": 404, "error": "not_found", "reason": "missing" })),
    )
        .into_response()
}

fn store_error(status: StatusCode, err: &Error) -> Response {
    (status, Json(err.to_body())).into_response()
}

/// Resolve the database segment of a request path, answering for the
/// caller on failure: 404 `no_db_file` when nothing exists on disk,
/// 412 when the engine refused to open.
pub(crate) async fn resolve_db(
    state: &AppState,
    name: &str,
) -> Result<Arc<dyn Database>, Response> {
    match state.registry.resolve(name).await {
        Ok(db) => Ok(db),
        Err(Error::NotFound(reason)) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "status": 404, "error": "not_found", "reason": reason })),
        )
            .into_response()),
        Err(e) => Err(store_error(StatusCode::PRECONDITION_FAILED, &e)),
    }
}

/// Absolute URL for a Location header, built from the request scheme
/// and host. Off-loopback hosts get their subdomain labels (reversed)
/// joined back in front of the host, matching the reference server's
/// URL construction.
pub(crate) fn location_url(headers: &HeaderMap, path: &str) -> String {
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http");
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let hostname = host.split(':').next().unwrap_or(host);

    if hostname == "127.0.0.1" {
        return format!("{scheme}://{hostname}{path}");
    }
    let labels: Vec<&str> = hostname.split('.').collect();
    let subdomains: Vec<&str> = labels[..labels.len().saturating_sub(2)]
        .iter()
        .rev()
        .copied()
        .collect();
    format!("{scheme}://{}.{hostname}{path}", subdomains.join("."))
}

// ===== Database lifecycle =====

/// Create a database
///
/// PUT /:db
#[instrument(skip(state, headers))]
pub async fn create_db(
    Extension(state): Extension<Arc<AppState>>,
    Path(db): Path<String>,
    headers: HeaderMap,
) -> Response {
    info!(db = %db, "Creating database");
    match state.registry.create(&db).await {
        Ok(_) => {
            let location = location_url(&headers, &format!("/{db}"));
            (
                StatusCode::CREATED,
                [(header::LOCATION, location)],
                Json(json!({ "ok": true })),
            )
                .into_response()
        }
        Err(e) => store_error(StatusCode::PRECONDITION_FAILED, &e),
    }
}

/// Delete a database
///
/// DELETE /:db
#[instrument(skip(state))]
pub async fn delete_db(
    Extension(state): Extension<Arc<AppState>>,
    Path(db): Path<String>,
) -> Response {
    info!(db = %db, "Deleting database");
    match state.registry.destroy(&db).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => store_error(StatusCode::NOT_FOUND, &e),
    }
}

/// Get database information
///
/// GET /:db
#[instrument(skip(state))]
pub async fn db_info(
    Extension(state): Extension<Arc<AppState>>,
    Path(db): Path<String>,
) -> Response {
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };
    match db.info().await {
        Ok(info) => Json(info).into_response(),
        Err(e) => store_error(StatusCode::NOT_FOUND, &e),
    }
}

// ===== Bulk and listing operations =====

/// Bulk document operations
///
/// POST /:db/_bulk_docs
#[instrument(skip(state, norm))]
pub async fn bulk_docs(
    Extension(state): Extension<Arc<AppState>>,
    Path(db): Path<String>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };
    let new_edits = norm
        .body
        .as_object()
        .and_then(|body| body.get("new_edits"))
        .and_then(Value::as_bool);
    match db.bulk_docs(norm.body.to_value(), new_edits).await {
        Ok(results) => (StatusCode::CREATED, Json(results)).into_response(),
        Err(e) => store_error(StatusCode::BAD_REQUEST, &e),
    }
}

/// List documents
///
/// GET|POST /:db/_all_docs
#[instrument(skip(state, norm))]
pub async fn all_docs(
    Extension(state): Extension<Arc<AppState>>,
    Path(db): Path<String>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };

    // A body, when present, must be a JSON object; its fields merge
    // into the query with the query taking precedence.
    let mut params = norm.query.clone();
    match &norm.body {
        Payload::Empty => {}
        Payload::Json(Value::Object(body)) => {
            for (key, value) in body {
                params.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        _ => {
            return store_error(
                StatusCode::BAD_REQUEST,
                &Error::BadRequest("invalid_json".to_string()),
            );
        }
    }

    match db.all_docs(&params).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => store_error(StatusCode::BAD_REQUEST, &e),
    }
}

/// Compact a database
///
/// POST /:db/_compact
#[instrument(skip(state))]
pub async fn compact_db(
    Extension(state): Extension<Arc<AppState>>,
    Path(db): Path<String>,
) -> Response {
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };
    match db.compact().await {
        Ok(result) => Json(result).into_response(),
        Err(e) => store_error(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

/// Revision difference
///
/// POST /:db/_revs_diff
#[instrument(skip(state, norm))]
pub async fn revs_diff(
    Extension(state): Extension<Arc<AppState>>,
    Path(db): Path<String>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };
    let revs = match &norm.body {
        Payload::Empty => json!({}),
        other => other.to_value(),
    };
    match db.revs_diff(revs).await {
        Ok(diffs) => Json(diffs).into_response(),
        Err(e) => store_error(StatusCode::BAD_REQUEST, &e),
    }
}

// ===== Views =====

/// Ad hoc view query
///
/// POST /:db/_temp_view
#[instrument(skip(state, norm))]
pub async fn temp_view(
    Extension(state): Extension<Arc<AppState>>,
    Path(db): Path<String>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };
    let Some(body) = norm.body.as_object() else {
        return store_error(
            StatusCode::BAD_REQUEST,
            &Error::BadRequest("invalid_json".to_string()),
        );
    };

    // The map source must compile before the query runs.
    let map = match body.get("map").and_then(Value::as_str) {
        Some(source) => match MapExpr::compile(source) {
            Ok(expr) => Some(expr),
            Err(e) => return store_error(StatusCode::BAD_REQUEST, &e),
        },
        None => None,
    };
    let reduce = body
        .get("reduce")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut params = norm.query.clone();
    params.insert("conflicts".to_string(), json!(true));

    match db.query(ViewQuery::Temp { map, reduce }, &params).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => store_error(StatusCode::BAD_REQUEST, &e),
    }
}

/// Stored view query
///
/// GET /:db/_design/:id/_view/:view
#[instrument(skip(state, norm))]
pub async fn design_view(
    Extension(state): Extension<Arc<AppState>>,
    Path((db, id, view)): Path<(String, String, String)>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };
    let name = format!("{id}/{view}");
    match db.query(ViewQuery::Named(name), &norm.query).await {
        Ok(results) => Json(results).into_response(),
        Err(e) => store_error(StatusCode::NOT_FOUND, &e),
    }
}

// ===== Attachments =====

/// Store a document attachment
///
/// PUT /:db/:id/*attachment
#[instrument(skip(state, norm, headers))]
pub async fn put_attachment(
    Extension(state): Extension<Arc<AppState>>,
    Path((db, id, attachment)): Path<(String, String, String)>,
    headers: HeaderMap,
    Extension(norm): Extension<Normalized>,
) -> Response {
    if is_reserved_doc_id(&id) {
        return missing();
    }
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };

    let rev = param_str(&norm.query, "rev");
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");
    let data = norm.body.attachment_bytes();

    match db
        .put_attachment(&id, &attachment, rev.as_deref(), data, content_type)
        .await
    {
        Ok(result) => Json(result).into_response(),
        Err(e) => store_error(StatusCode::CONFLICT, &e),
    }
}

/// Retrieve a document attachment
///
/// GET /:db/:id/*attachment
#[instrument(skip(state, norm))]
pub async fn get_attachment(
    Extension(state): Extension<Arc<AppState>>,
    Path((db, id, attachment)): Path<(String, String, String)>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    if is_reserved_doc_id(&id) {
        return missing();
    }
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };

    // The declared content type lives on the owning document, so
    // fetch that first and only then the bytes.
    let doc = match db.get(&id, &norm.query).await {
        Ok(doc) => doc,
        Err(e) => return store_error(StatusCode::NOT_FOUND, &e),
    };
    let Some(entry) = doc.get("_attachments").and_then(|a| a.get(&attachment)) else {
        return missing();
    };
    let content_type = entry
        .get("content_type")
        .and_then(Value::as_str)
        .unwrap_or("application/octet-stream")
        .to_string();

    match db.get_attachment(&id, &attachment).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type)],
            bytes,
        )
            .into_response(),
        Err(e) => store_error(StatusCode::CONFLICT, &e),
    }
}

/// Delete a document attachment
///
/// DELETE /:db/:id/*attachment
#[instrument(skip(state, norm))]
pub async fn delete_attachment(
    Extension(state): Extension<Arc<AppState>>,
    Path((db, id, attachment)): Path<(String, String, String)>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    if is_reserved_doc_id(&id) {
        return missing();
    }
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };

    let rev = param_str(&norm.query, "rev").unwrap_or_default();
    match db.remove_attachment(&id, &attachment, &rev).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => store_error(StatusCode::CONFLICT, &e),
    }
}

// ===== Documents =====

/// Create or update a document with an id
///
/// PUT /:db/:id
#[instrument(skip(state, norm, headers))]
pub async fn put_doc(
    Extension(state): Extension<Arc<AppState>>,
    Path((db_name, id)): Path<(String, String)>,
    headers: HeaderMap,
    Extension(norm): Extension<Normalized>,
) -> Response {
    if is_reserved_doc_id(&id) {
        return missing();
    }
    let db = match resolve_db(&state, &db_name).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };
    let Some(body) = norm.body.as_object() else {
        return store_error(
            StatusCode::CONFLICT,
            &Error::BadRequest("Document must be a JSON object".to_string()),
        );
    };

    // Id priority: body `_id`, then `id` query parameter, then the
    // path segment unless it is the literal string "null".
    let mut doc = body.clone();
    if !doc.contains_key("_id") {
        if let Some(query_id) = param_str(&norm.query, "id") {
            doc.insert("_id".to_string(), json!(query_id));
        } else if id != "null" {
            doc.insert("_id".to_string(), json!(id));
        }
    }
    let doc_id = doc
        .get("_id")
        .and_then(Value::as_str)
        .unwrap_or(&id)
        .to_string();

    match db.put(Value::Object(doc), &norm.query).await {
        Ok(result) => {
            let location = location_url(&headers, &format!("/{db_name}/{doc_id}"));
            (
                StatusCode::CREATED,
                [(header::LOCATION, location)],
                Json(result),
            )
                .into_response()
        }
        Err(e) => store_error(StatusCode::CONFLICT, &e),
    }
}

/// Create a document with an engine-assigned id
///
/// POST /:db
#[instrument(skip(state, norm))]
pub async fn post_doc(
    Extension(state): Extension<Arc<AppState>>,
    Path(db): Path<String>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };
    match db.post(norm.body.to_value(), &norm.query).await {
        Ok(result) => (StatusCode::CREATED, Json(result)).into_response(),
        Err(e) => store_error(StatusCode::CONFLICT, &e),
    }
}

/// Retrieve a document
///
/// GET /:db/:id
#[instrument(skip(state, norm))]
pub async fn get_doc(
    Extension(state): Extension<Arc<AppState>>,
    Path((db, id)): Path<(String, String)>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    if is_reserved_doc_id(&id) {
        return missing();
    }
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };
    match db.get(&id, &norm.query).await {
        Ok(doc) => Json(doc).into_response(),
        Err(e) => store_error(StatusCode::NOT_FOUND, &e),
    }
}

/// Delete a document
///
/// DELETE /:db/:id
#[instrument(skip(state, norm))]
pub async fn delete_doc(
    Extension(state): Extension<Arc<AppState>>,
    Path((db, id)): Path<(String, String)>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    if is_reserved_doc_id(&id) {
        return missing();
    }
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };
    if param_str(&norm.query, "rev").is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not_found", "reason": "missing rev" })),
        )
            .into_response();
    }

    // Two-step: fetch the revision named by the caller, then remove
    // it. Either step failing reports 404.
    let doc = match db.get(&id, &norm.query).await {
        Ok(doc) => doc,
        Err(e) => return store_error(StatusCode::NOT_FOUND, &e),
    };
    match db.remove(&doc).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => store_error(StatusCode::NOT_FOUND, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_doc_ids() {
        assert!(is_reserved_doc_id("_design"));
        assert!(is_reserved_doc_id("_local"));
        assert!(!is_reserved_doc_id("_designer"));
        assert!(!is_reserved_doc_id("plain"));
    }

    #[test]
    fn test_location_url_loopback_is_bare() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "127.0.0.1:5984".parse().unwrap());
        assert_eq!(
            location_url(&headers, "/pets"),
            "http://127.0.0.1/pets"
        );
    }

    #[test]
    fn test_location_url_prefixes_subdomains() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "db.example.com".parse().unwrap());
        assert_eq!(
            location_url(&headers, "/pets"),
            "http://db.db.example.com/pets"
        );
    }

    #[test]
    fn test_location_url_respects_forwarded_proto() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "127.0.0.1".parse().unwrap());
        headers.insert("x-forwarded-proto", "https".parse().unwrap());
        assert_eq!(
            location_url(&headers, "/pets/doc"),
            "https://127.0.0.1/pets/doc"
        );
    }
}

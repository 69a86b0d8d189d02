//! Server-level HTTP handlers
//!
//! Endpoints that do not address a single database: the welcome
//! banner, UUID minting, the database listing and the replication
//! trigger.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use tracing::{error, info, instrument};

use crate::server::middleware::Normalized;
use crate::server::AppState;
use crate::store::ReplicationOptions;
use crate::VERSION;

/// Welcome banner
///
/// GET /
#[instrument]
pub async fn welcome() -> Response {
    Json(json!({ "futondb": "Welcome!", "version": VERSION })).into_response()
}

/// Mint UUIDs
///
/// GET /_uuids
#[instrument(skip(state, norm))]
pub async fn uuids(
    Extension(state): Extension<Arc<AppState>>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    let count = norm
        .query
        .get("count")
        .and_then(Value::as_u64)
        .filter(|&n| n > 0)
        .unwrap_or(1);
    let uuids: Vec<String> = (0..count).map(|_| state.engine.generate_uuid()).collect();
    Json(json!({ "uuids": uuids })).into_response()
}

/// List all databases
///
/// GET /_all_dbs
#[instrument(skip(state))]
pub async fn all_dbs(Extension(state): Extension<Arc<AppState>>) -> Response {
    match state.engine.list_databases().await {
        Ok(names) => Json(names).into_response(),
        Err(e) => {
            error!(error = %e, "Database listing failed");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(e.to_body())).into_response()
        }
    }
}

/// Trigger a replication job
///
/// POST /_replicate
#[instrument(skip(state, norm))]
pub async fn replicate(
    Extension(state): Extension<Arc<AppState>>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    let Some(body) = norm.body.as_object() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "bad_request", "reason": "invalid_json" })),
        )
            .into_response();
    };
    let (Some(source), Some(target)) = (
        body.get("source").and_then(Value::as_str),
        body.get("target").and_then(Value::as_str),
    ) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "bad_request",
                "reason": "source and target are required",
            })),
        )
            .into_response();
    };

    let opts = ReplicationOptions {
        continuous: body
            .get("continuous")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        filter: body
            .get("filter")
            .and_then(Value::as_str)
            .map(str::to_string),
        query_params: body.get("query_params").cloned(),
    };

    // A continuous job into a known local target never finishes, so
    // it is detached and acknowledged immediately. Every other shape
    // is awaited and answered exactly once.
    if opts.continuous && state.registry.contains(target).await {
        let engine = state.engine.clone();
        let source = source.to_string();
        let target = target.to_string();
        tokio::spawn(async move {
            if let Err(e) = engine.replicate(&source, &target, opts).await {
                error!(source = %source, target = %target, error = %e, "Continuous replication stopped");
            }
        });
        return Json(json!({ "ok": true })).into_response();
    }

    info!(source = %source, target = %target, "Replication triggered");
    match state.engine.replicate(source, target, opts).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, Json(e.to_body())).into_response(),
    }
}

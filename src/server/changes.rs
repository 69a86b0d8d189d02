//! Changes feed handler
//!
//! Three response shapes share one endpoint. Without a `feed`
//! parameter the handler answers with the current batch. With
//! `feed=longpoll` an empty batch parks the request on a live
//! subscription and answers once with the first event. With
//! `feed=continuous` the response body is an endless stream of
//! newline-delimited JSON events; dropping the connection drops the
//! subscription, which is the unsubscribe.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Extension, Path},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use futures_util::stream;
use serde_json::json;
use tracing::instrument;

use crate::server::document_handlers::resolve_db;
use crate::server::middleware::Normalized;
use crate::server::AppState;
use crate::store::{param_str, ChangeEvent, ChangesOptions, ChangesSubscription};

fn batch_response(results: Vec<ChangeEvent>) -> Response {
    let last_seq = results.iter().map(|c| c.seq).max().unwrap_or(0);
    Json(json!({ "results": results, "last_seq": last_seq })).into_response()
}

fn continuous_response(sub: ChangesSubscription) -> Response {
    let body = stream::unfold(sub, |mut sub| async move {
        let event = sub.recv().await?;
        let mut line = serde_json::to_vec(&event).unwrap_or_default();
        line.push(b'\n');
        Some((Ok::<Bytes, std::convert::Infallible>(Bytes::from(line)), sub))
    });
    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(body),
    )
        .into_response()
}

fn changes_error(e: crate::error::Error) -> Response {
    (StatusCode::CONFLICT, Json(e.to_body())).into_response()
}

/// Changes feed
///
/// GET /:db/_changes
#[instrument(skip(state, norm))]
pub async fn db_changes(
    Extension(state): Extension<Arc<AppState>>,
    Path(db): Path<String>,
    Extension(norm): Extension<Normalized>,
) -> Response {
    let db = match resolve_db(&state, &db).await {
        Ok(db) => db,
        Err(resp) => return resp,
    };

    // Filtered feeds always carry the document and conflict info so
    // the filter has the full document to look at.
    let mut params = norm.query.clone();
    if params.contains_key("filter") {
        params.insert("conflicts".to_string(), json!(true));
        params.insert("include_docs".to_string(), json!(true));
    }
    let opts = ChangesOptions::from_params(&params);
    let feed = param_str(&params, "feed");

    let Some(feed) = feed else {
        return match db.fetch_changes(&opts).await {
            Ok(results) => batch_response(results),
            Err(e) => changes_error(e),
        };
    };

    // Subscribe before the catch-up fetch, so an event arriving in
    // between lands in the subscription instead of being lost.
    let mut sub = match db.subscribe_changes(&opts).await {
        Ok(sub) => sub,
        Err(e) => return changes_error(e),
    };
    let results = match db.fetch_changes(&opts).await {
        Ok(results) => results,
        Err(e) => return changes_error(e),
    };

    if !results.is_empty() {
        return batch_response(results);
    }
    if feed == "continuous" {
        return continuous_response(sub);
    }

    // Longpoll: answer once with the first live event. A closed
    // database side degrades to an empty batch.
    match sub.recv().await {
        Some(event) => Json(event).into_response(),
        None => batch_response(Vec::new()),
    }
}

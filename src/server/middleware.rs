//! HTTP middleware
//!
//! Every request is normalized exactly once before dispatch: query
//! string values are coerced through an attempted JSON parse and the
//! body is buffered and parsed the same way. Malformed JSON is never
//! rejected here; individual handlers decide what a raw body means.

use axum::{
    body::{to_bytes, Body},
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde_json::Value;
use tracing::{info, Span};

use crate::store::QueryParams;

/// A buffered request payload.
#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    /// Body parsed as JSON.
    Json(Value),
    /// Body kept verbatim because it did not parse as JSON.
    Raw(Bytes),
}

impl Payload {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&serde_json::Map<String, Value>> {
        self.as_json().and_then(Value::as_object)
    }

    /// The payload as a JSON value, keeping raw bodies as strings.
    pub fn to_value(&self) -> Value {
        match self {
            Payload::Empty => Value::Null,
            Payload::Json(v) => v.clone(),
            Payload::Raw(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    /// Bytes to store for an attachment write: absent bodies default
    /// to empty, string bodies are taken verbatim, any other JSON
    /// body is serialized back to its JSON text.
    pub fn attachment_bytes(&self) -> Bytes {
        match self {
            Payload::Empty => Bytes::new(),
            Payload::Raw(bytes) => bytes.clone(),
            Payload::Json(Value::String(s)) => Bytes::from(s.clone().into_bytes()),
            Payload::Json(other) => {
                Bytes::from(serde_json::to_vec(other).unwrap_or_default())
            }
        }
    }
}

/// The normalized view of a request, inserted into extensions by
/// [`normalize`] and consumed by every handler.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub query: QueryParams,
    pub body: Payload,
}

/// Query/body normalization middleware. Runs once per request, before
/// any handler.
pub async fn normalize(
    State(body_limit): State<usize>,
    req: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = req.into_parts();

    let mut query = QueryParams::new();
    if let Ok(Query(pairs)) = Query::<Vec<(String, String)>>::try_from_uri(&parts.uri) {
        for (key, raw) in pairs {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            query.insert(key, value);
        }
    }

    let bytes = match to_bytes(body, body_limit).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                axum::Json(serde_json::json!({
                    "error": "bad_request",
                    "reason": "request body too large",
                })),
            )
                .into_response();
        }
    };
    let body = if bytes.is_empty() {
        Payload::Empty
    } else {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Raw(bytes),
        }
    };

    parts.extensions.insert(Normalized { query, body });
    next.run(Request::from_parts(parts, Body::empty())).await
}

/// Request logging middleware
pub async fn log_request(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let span = Span::current();

    span.record("method", method.as_str());
    span.record("uri", uri.path());

    let response = next.run(req).await;

    info!(
        method = %method,
        uri = %uri.path(),
        status = response.status().as_u16(),
        "Request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_attachment_bytes_shapes() {
        assert_eq!(Payload::Empty.attachment_bytes(), Bytes::new());
        assert_eq!(
            Payload::Raw(Bytes::from_static(b"\x00\x01")).attachment_bytes(),
            Bytes::from_static(b"\x00\x01")
        );
        assert_eq!(
            Payload::Json(json!("plain text")).attachment_bytes(),
            Bytes::from_static(b"plain text")
        );
        assert_eq!(
            Payload::Json(json!({"a": 1})).attachment_bytes(),
            Bytes::from_static(b"{\"a\":1}")
        );
    }
}

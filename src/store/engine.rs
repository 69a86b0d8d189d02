//! Document store traits
//!
//! The HTTP adapter is written against these traits only. A store
//! engine owns database lifecycle (open, destroy, listing) and
//! replication; a [`Database`] handle serves document, attachment,
//! view and changes operations for one logical database.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Normalized query parameters: every value that JSON-parses is kept
/// as its parsed type, everything else stays a string.
pub type QueryParams = Map<String, Value>;

/// Read a parameter as a string, stringifying non-string scalars.
pub fn param_str(params: &QueryParams, key: &str) -> Option<String> {
    params.get(key).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// May `name` be joined to a storage directory as a single path
/// segment? Separators and parent references would resolve outside
/// the data dir.
pub fn valid_database_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

/// Read a parameter as a boolean flag.
pub fn param_bool(params: &QueryParams, key: &str) -> bool {
    params
        .get(key)
        .map(|v| match v {
            Value::Bool(b) => *b,
            Value::String(s) => s == "true",
            _ => false,
        })
        .unwrap_or(false)
}

/// One revision reference inside a change event.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RevRef {
    pub rev: String,
}

/// A single entry of a changes feed, ordered by `seq`.
#[derive(Debug, Clone, Serialize)]
pub struct ChangeEvent {
    pub seq: u64,
    pub id: String,
    pub changes: Vec<RevRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,
}

/// Options for a changes request, one-shot or subscribed.
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    pub since: u64,
    pub limit: Option<usize>,
    pub include_docs: bool,
    pub conflicts: bool,
    pub filter: Option<String>,
    /// Full normalized query, re-applied server-side for live updates.
    pub query_params: QueryParams,
}

impl ChangesOptions {
    /// Build changes options from the normalized query string. The
    /// entire parameter map is embedded as `query_params` so the
    /// engine can evaluate the same filter for live events.
    pub fn from_params(params: &QueryParams) -> Self {
        Self {
            since: params.get("since").and_then(Value::as_u64).unwrap_or(0),
            limit: params
                .get("limit")
                .and_then(Value::as_u64)
                .map(|n| n as usize),
            include_docs: param_bool(params, "include_docs"),
            conflicts: param_bool(params, "conflicts"),
            filter: param_str(params, "filter"),
            query_params: params.clone(),
        }
    }
}

/// A live changes subscription. Dropping the subscription is the
/// unsubscribe operation: the engine prunes the sender on the next
/// failed delivery, so a subscription never outlives its connection.
pub struct ChangesSubscription {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl ChangesSubscription {
    pub fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next change event. Returns `None` once the
    /// database side has gone away.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

/// Options for a replication job.
#[derive(Debug, Clone, Default)]
pub struct ReplicationOptions {
    pub continuous: bool,
    pub filter: Option<String>,
    pub query_params: Option<Value>,
}

/// A compiled map expression for temp and design-document views.
///
/// This is deliberately not an arbitrary-code evaluator. The accepted
/// source forms are a bare field path (`doc.a.b`) or an emit call
/// (`emit(doc.a.b)`, `emit(doc.a, doc.b)`, `emit(doc.a, null)`).
/// Documents lacking the key path emit no row.
#[derive(Debug, Clone)]
pub struct MapExpr {
    key: Vec<String>,
    value: Option<Vec<String>>,
}

impl MapExpr {
    /// Compile a map expression from its source text.
    pub fn compile(source: &str) -> Result<Self> {
        let src = source.trim();
        let (key_src, value_src) = if let Some(inner) = src
            .strip_prefix("emit(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            match inner.split_once(',') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (inner.trim(), None),
            }
        } else {
            (src, None)
        };

        let key = Self::parse_path(key_src)?;
        let value = match value_src {
            None | Some("null") => None,
            Some(v) => Some(Self::parse_path(v)?),
        };
        Ok(Self { key, value })
    }

    fn parse_path(expr: &str) -> Result<Vec<String>> {
        if expr == "doc" {
            return Ok(Vec::new());
        }
        let path = expr
            .strip_prefix("doc.")
            .ok_or_else(|| Error::BadRequest(format!("invalid map expression: {expr}")))?;
        if path.is_empty() || path.split('.').any(str::is_empty) {
            return Err(Error::BadRequest(format!("invalid map expression: {expr}")));
        }
        Ok(path.split('.').map(str::to_string).collect())
    }

    fn resolve(doc: &Value, path: &[String]) -> Option<Value> {
        let mut cur = doc;
        for segment in path {
            cur = cur.get(segment)?;
        }
        Some(cur.clone())
    }

    /// Evaluate against one document, yielding `(key, value)` or
    /// nothing when the key path is absent.
    pub fn eval(&self, doc: &Value) -> Option<(Value, Value)> {
        let key = Self::resolve(doc, &self.key)?;
        let value = self
            .value
            .as_ref()
            .and_then(|path| Self::resolve(doc, path))
            .unwrap_or(Value::Null);
        Some((key, value))
    }
}

/// A view query: either a stored design-document view addressed as
/// `"<design>/<view>"`, or an ad hoc temp view compiled from source.
#[derive(Debug, Clone)]
pub enum ViewQuery {
    Named(String),
    Temp {
        map: Option<MapExpr>,
        reduce: Option<String>,
    },
}

/// Total order over JSON values used for view row collation:
/// null < bool < number < string < array < object.
pub fn collate(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xi, yi) in x.iter().zip(y.iter()) {
                let ord = collate(xi, yi);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Store engine: database lifecycle and cross-database operations.
#[async_trait]
pub trait StoreEngine: Send + Sync {
    /// Open a database, creating its storage on first use.
    async fn open(&self, name: &str) -> Result<Arc<dyn Database>>;

    /// Delete a database and its storage.
    async fn destroy(&self, name: &str) -> Result<()>;

    /// List every database known to persisted storage.
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// On-disk location for a database name. The registry probes this
    /// path to lazily rediscover databases after a restart.
    fn database_path(&self, name: &str) -> PathBuf;

    /// Generate a fresh UUID string.
    fn generate_uuid(&self) -> String;

    /// Run a replication job from `source` to `target`.
    async fn replicate(
        &self,
        source: &str,
        target: &str,
        opts: ReplicationOptions,
    ) -> Result<Value>;
}

/// One open database handle. Handles may serve concurrent requests;
/// any ordering between them is the engine's own contract.
#[async_trait]
pub trait Database: Send + Sync {
    async fn info(&self) -> Result<Value>;

    async fn get(&self, id: &str, params: &QueryParams) -> Result<Value>;

    async fn put(&self, doc: Value, params: &QueryParams) -> Result<Value>;

    async fn post(&self, doc: Value, params: &QueryParams) -> Result<Value>;

    async fn remove(&self, doc: &Value) -> Result<Value>;

    /// `new_edits: Some(false)` installs the supplied revisions
    /// verbatim (the replication path); `None` uses the engine
    /// default.
    async fn bulk_docs(&self, body: Value, new_edits: Option<bool>) -> Result<Value>;

    async fn all_docs(&self, params: &QueryParams) -> Result<Value>;

    /// Fetch a single batch of changes.
    async fn fetch_changes(&self, opts: &ChangesOptions) -> Result<Vec<ChangeEvent>>;

    /// Register a live subscription for changes after the current
    /// sequence. See [`ChangesSubscription`] for cancellation.
    async fn subscribe_changes(&self, opts: &ChangesOptions) -> Result<ChangesSubscription>;

    async fn compact(&self) -> Result<Value>;

    async fn revs_diff(&self, revs: Value) -> Result<Value>;

    async fn query(&self, view: ViewQuery, params: &QueryParams) -> Result<Value>;

    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        rev: Option<&str>,
        data: Bytes,
        content_type: &str,
    ) -> Result<Value>;

    /// Raw attachment bytes. The declared content type lives on the
    /// owning document's `_attachments` entry.
    async fn get_attachment(&self, id: &str, name: &str) -> Result<Bytes>;

    async fn remove_attachment(&self, id: &str, name: &str, rev: &str) -> Result<Value>;
}

impl std::fmt::Debug for dyn Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Database")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_map_expr_bare_path() {
        let expr = MapExpr::compile("doc.name").unwrap();
        let doc = json!({"_id": "a", "name": "ada"});
        assert_eq!(
            expr.eval(&doc),
            Some((json!("ada"), Value::Null))
        );
    }

    #[test]
    fn test_map_expr_emit_key_value() {
        let expr = MapExpr::compile("emit(doc.type, doc.count)").unwrap();
        let doc = json!({"type": "fruit", "count": 3});
        assert_eq!(expr.eval(&doc), Some((json!("fruit"), json!(3))));
    }

    #[test]
    fn test_map_expr_missing_key_emits_nothing() {
        let expr = MapExpr::compile("emit(doc.type, null)").unwrap();
        assert_eq!(expr.eval(&json!({"other": 1})), None);
    }

    #[test]
    fn test_map_expr_rejects_arbitrary_code() {
        assert!(MapExpr::compile("function(doc) { emit(doc._id); }").is_err());
        assert!(MapExpr::compile("doc.").is_err());
        assert!(MapExpr::compile("").is_err());
    }

    #[test]
    fn test_collate_type_order() {
        use std::cmp::Ordering;
        assert_eq!(collate(&json!(null), &json!(false)), Ordering::Less);
        assert_eq!(collate(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(collate(&json!("z"), &json!([])), Ordering::Less);
        assert_eq!(collate(&json!("a"), &json!("b")), Ordering::Less);
    }

    #[test]
    fn test_changes_options_embed_query() {
        let mut params = QueryParams::new();
        params.insert("since".into(), json!(4));
        params.insert("filter".into(), json!("app/important"));
        let opts = ChangesOptions::from_params(&params);
        assert_eq!(opts.since, 4);
        assert_eq!(opts.filter.as_deref(), Some("app/important"));
        assert_eq!(opts.query_params.len(), 2);
    }
}

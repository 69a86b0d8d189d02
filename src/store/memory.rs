//! In-memory reference engine
//!
//! A complete [`StoreEngine`]/[`Database`] implementation backed by
//! process memory. Databases leave a directory marker under the data
//! dir so the registry's on-disk presence probe and lazy rediscovery
//! keep working across a restart, but document state itself is not
//! persisted.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::engine::{
    collate, param_bool, param_str, valid_database_name, ChangeEvent, ChangesOptions,
    ChangesSubscription, Database, QueryParams, ReplicationOptions, RevRef, StoreEngine, ViewQuery,
};
use crate::store::MapExpr;

/// In-memory store engine.
pub struct MemoryEngine {
    data_dir: PathBuf,
    dbs: DashMap<String, Arc<MemoryDatabase>>,
}

impl MemoryEngine {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            dbs: DashMap::new(),
        }
    }

    async fn open_mem(&self, name: &str) -> Result<Arc<MemoryDatabase>> {
        Self::check_name(name)?;
        let path = self.database_path(name);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| Error::Unknown(format!("could not create storage for '{name}': {e}")))?;
        let db = self
            .dbs
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryDatabase::new(name)))
            .clone();
        Ok(db)
    }

    // Names reach the filesystem as path segments, so anything that
    // could traverse out of the data dir is refused up front.
    fn check_name(name: &str) -> Result<()> {
        if valid_database_name(name) {
            Ok(())
        } else {
            Err(Error::BadRequest(format!("illegal database name '{name}'")))
        }
    }
}

#[async_trait]
impl StoreEngine for MemoryEngine {
    async fn open(&self, name: &str) -> Result<Arc<dyn Database>> {
        Ok(self.open_mem(name).await?)
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        Self::check_name(name)?;
        let path = self.database_path(name);
        if tokio::fs::metadata(&path).await.is_err() {
            return Err(Error::NotFound("missing".to_string()));
        }
        tokio::fs::remove_dir_all(&path)
            .await
            .map_err(|e| Error::Unknown(format!("could not destroy '{name}': {e}")))?;
        self.dbs.remove(name);
        Ok(())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(names),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            if is_dir {
                if let Ok(name) = entry.file_name().into_string() {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn database_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name)
    }

    fn generate_uuid(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    async fn replicate(
        &self,
        source: &str,
        target: &str,
        opts: ReplicationOptions,
    ) -> Result<Value> {
        if source.contains("://") || target.contains("://") {
            return Err(Error::BadRequest(
                "remote replication endpoints are not supported by this engine".to_string(),
            ));
        }

        let source_db = self.open_mem(source).await?;
        let target_db = self.open_mem(target).await?;

        let (docs, caught_up_seq) = source_db.export_all();
        let mut docs_written = 0u64;
        for doc in docs {
            if target_db.install(doc)? {
                docs_written += 1;
            }
        }

        if opts.continuous {
            // Forward live source changes for the life of the process.
            let sub_opts = ChangesOptions {
                since: caught_up_seq,
                include_docs: true,
                ..ChangesOptions::default()
            };
            let mut sub = source_db.subscribe(&sub_opts);
            let target_db = target_db.clone();
            let source_name = source.to_string();
            let target_name = target.to_string();
            tokio::spawn(async move {
                while let Some(event) = sub.recv().await {
                    let doc = match (&event.doc, event.deleted) {
                        (_, Some(true)) => json!({
                            "_id": event.id,
                            "_rev": event.changes.first().map(|r| r.rev.clone()),
                            "_deleted": true,
                        }),
                        (Some(doc), _) => doc.clone(),
                        (None, _) => continue,
                    };
                    if let Err(e) = target_db.install(doc) {
                        warn!(
                            source = %source_name,
                            target = %target_name,
                            error = %e,
                            "continuous replication write failed"
                        );
                    }
                }
                debug!(source = %source_name, target = %target_name, "continuous replication ended");
            });
        }

        Ok(json!({ "ok": true, "docs_written": docs_written }))
    }
}

struct AttachmentRecord {
    content_type: String,
    data: Bytes,
    revpos: u64,
}

struct DocRecord {
    rev: String,
    seq: u64,
    deleted: bool,
    body: Map<String, Value>,
    attachments: BTreeMap<String, AttachmentRecord>,
}

struct Subscriber {
    opts: ChangesOptions,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

#[derive(Default)]
struct DbInner {
    docs: BTreeMap<String, DocRecord>,
    update_seq: u64,
    changes: Vec<ChangeEvent>,
    subscribers: Vec<Subscriber>,
}

/// One in-memory database.
pub struct MemoryDatabase {
    name: String,
    created_at: DateTime<Utc>,
    inner: RwLock<DbInner>,
}

fn generation(rev: &str) -> u64 {
    rev.split('-')
        .next()
        .and_then(|g| g.parse().ok())
        .unwrap_or(0)
}

fn next_rev(prev: Option<&str>) -> String {
    let gen = prev.map(generation).unwrap_or(0) + 1;
    format!("{}-{}", gen, Uuid::new_v4().simple())
}

fn as_object(doc: Value) -> Result<Map<String, Value>> {
    match doc {
        Value::Object(map) => Ok(map),
        _ => Err(Error::BadRequest(
            "Document must be a JSON object".to_string(),
        )),
    }
}

/// Does a change event pass the subscriber's filter? Only the
/// `_doc_ids` filter is evaluated here; unknown filters pass
/// everything through.
fn passes_filter(opts: &ChangesOptions, event: &ChangeEvent) -> bool {
    if opts.filter.as_deref() != Some("_doc_ids") {
        return true;
    }
    opts.query_params
        .get("doc_ids")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().any(|v| v.as_str() == Some(&event.id)))
        .unwrap_or(true)
}

impl MemoryDatabase {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            created_at: Utc::now(),
            inner: RwLock::new(DbInner::default()),
        }
    }

    fn build_doc(rec: &DocRecord, id: &str, with_data: bool) -> Value {
        let mut doc = rec.body.clone();
        doc.insert("_id".to_string(), json!(id));
        doc.insert("_rev".to_string(), json!(rec.rev));
        if !rec.attachments.is_empty() {
            let mut atts = Map::new();
            for (name, att) in &rec.attachments {
                let mut entry = json!({
                    "content_type": att.content_type,
                    "revpos": att.revpos,
                    "length": att.data.len(),
                });
                if with_data {
                    entry["data"] = json!(BASE64.encode(&att.data));
                } else {
                    entry["stub"] = json!(true);
                }
                atts.insert(name.clone(), entry);
            }
            doc.insert("_attachments".to_string(), Value::Object(atts));
        }
        Value::Object(doc)
    }

    /// Record a committed write: advance the sequence, append to the
    /// change log and fan out to live subscribers. Subscribers whose
    /// receiver has gone away are pruned here.
    fn record_change(inner: &mut DbInner, id: &str, rev: &str, deleted: bool) -> u64 {
        inner.update_seq += 1;
        let seq = inner.update_seq;
        let event = ChangeEvent {
            seq,
            id: id.to_string(),
            changes: vec![RevRef {
                rev: rev.to_string(),
            }],
            deleted: deleted.then_some(true),
            doc: None,
        };

        let doc = if deleted {
            None
        } else {
            inner
                .docs
                .get(id)
                .map(|rec| Self::build_doc(rec, id, false))
        };

        inner.changes.push(event.clone());
        inner.subscribers.retain(|sub| {
            if !passes_filter(&sub.opts, &event) {
                return !sub.tx.is_closed();
            }
            let mut delivered = event.clone();
            if sub.opts.include_docs {
                delivered.doc = doc.clone();
            }
            sub.tx.send(delivered).is_ok()
        });
        seq
    }

    /// Decode inline `_attachments`, preserving stubs from the
    /// previous revision.
    fn merge_attachments(
        previous: Option<&DocRecord>,
        declared: Option<&Value>,
        new_gen: u64,
    ) -> Result<BTreeMap<String, AttachmentRecord>> {
        let mut merged = BTreeMap::new();
        let Some(Value::Object(entries)) = declared else {
            // No `_attachments` in the body keeps the existing set.
            if let Some(prev) = previous {
                for (name, att) in &prev.attachments {
                    merged.insert(
                        name.clone(),
                        AttachmentRecord {
                            content_type: att.content_type.clone(),
                            data: att.data.clone(),
                            revpos: att.revpos,
                        },
                    );
                }
            }
            return Ok(merged);
        };

        for (name, entry) in entries {
            if entry.get("stub").and_then(Value::as_bool) == Some(true) {
                if let Some(att) = previous.and_then(|p| p.attachments.get(name)) {
                    merged.insert(
                        name.clone(),
                        AttachmentRecord {
                            content_type: att.content_type.clone(),
                            data: att.data.clone(),
                            revpos: att.revpos,
                        },
                    );
                }
                continue;
            }
            let data = entry
                .get("data")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::BadRequest(format!("attachment '{name}' has no data")))?;
            let bytes = BASE64
                .decode(data)
                .map_err(|_| Error::BadRequest(format!("attachment '{name}' is not base64")))?;
            merged.insert(
                name.clone(),
                AttachmentRecord {
                    content_type: entry
                        .get("content_type")
                        .and_then(Value::as_str)
                        .unwrap_or("application/octet-stream")
                        .to_string(),
                    data: Bytes::from(bytes),
                    revpos: new_gen,
                },
            );
        }
        Ok(merged)
    }

    fn apply_put(
        inner: &mut DbInner,
        mut doc: Map<String, Value>,
        param_rev: Option<String>,
    ) -> Result<(String, String)> {
        let id = doc
            .get("_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::BadRequest("_id is required for puts".to_string()))?
            .to_string();
        let supplied_rev = doc
            .get("_rev")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or(param_rev);
        let deleted = doc.get("_deleted").and_then(Value::as_bool) == Some(true);

        let previous = inner.docs.get(&id);
        let current_live = previous.filter(|rec| !rec.deleted);
        match (current_live, supplied_rev.as_deref()) {
            (Some(rec), Some(rev)) if rec.rev == rev => {}
            (Some(_), _) => {
                return Err(Error::Conflict("Document update conflict".to_string()));
            }
            // New documents and resurrections of deleted ones take no rev.
            (None, _) => {}
        }

        let new_rev = next_rev(current_live.map(|rec| rec.rev.as_str()));
        let attachments = Self::merge_attachments(
            current_live,
            doc.get("_attachments"),
            generation(&new_rev),
        )?;

        for field in ["_id", "_rev", "_attachments", "_deleted"] {
            doc.remove(field);
        }

        inner.docs.insert(
            id.clone(),
            DocRecord {
                rev: new_rev.clone(),
                seq: 0,
                deleted,
                body: if deleted { Map::new() } else { doc },
                attachments: if deleted { BTreeMap::new() } else { attachments },
            },
        );
        let seq = Self::record_change(inner, &id, &new_rev, deleted);
        if let Some(rec) = inner.docs.get_mut(&id) {
            rec.seq = seq;
        }
        Ok((id, new_rev))
    }

    /// Install a replicated document, keeping the supplied revision
    /// verbatim (`new_edits=false`). The winner between an existing
    /// revision and the incoming one is picked deterministically by
    /// generation, then by revision string. Returns whether the
    /// incoming revision was installed.
    fn install(&self, doc: Value) -> Result<bool> {
        let mut doc = as_object(doc)?;
        let id = doc
            .get("_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::BadRequest("_id is required".to_string()))?
            .to_string();
        let rev = doc
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadRequest("_rev is required with new_edits=false".to_string()))?
            .to_string();
        let deleted = doc.get("_deleted").and_then(Value::as_bool) == Some(true);

        let mut inner = self.inner.write();
        if let Some(existing) = inner.docs.get(&id) {
            let incoming = (generation(&rev), rev.as_str());
            let current = (generation(&existing.rev), existing.rev.as_str());
            if incoming <= current {
                return Ok(false);
            }
        }

        let attachments = Self::merge_attachments(
            inner.docs.get(&id),
            doc.get("_attachments"),
            generation(&rev),
        )?;
        for field in ["_id", "_rev", "_attachments", "_deleted"] {
            doc.remove(field);
        }
        inner.docs.insert(
            id.clone(),
            DocRecord {
                rev: rev.clone(),
                seq: 0,
                deleted,
                body: if deleted { Map::new() } else { doc },
                attachments,
            },
        );
        let seq = Self::record_change(&mut inner, &id, &rev, deleted);
        if let Some(rec) = inner.docs.get_mut(&id) {
            rec.seq = seq;
        }
        Ok(true)
    }

    /// Snapshot every current revision (with attachment data inline)
    /// plus the sequence the snapshot is caught up to.
    fn export_all(&self) -> (Vec<Value>, u64) {
        let inner = self.inner.read();
        let docs = inner
            .docs
            .iter()
            .map(|(id, rec)| {
                if rec.deleted {
                    json!({ "_id": id, "_rev": rec.rev, "_deleted": true })
                } else {
                    Self::build_doc(rec, id, true)
                }
            })
            .collect();
        (docs, inner.update_seq)
    }

    fn subscribe(&self, opts: &ChangesOptions) -> ChangesSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.write().subscribers.push(Subscriber {
            opts: opts.clone(),
            tx,
        });
        ChangesSubscription::new(rx)
    }

    fn run_view(&self, map: &MapExpr, params: &QueryParams) -> Value {
        let inner = self.inner.read();
        let include_docs = param_bool(params, "include_docs");
        let mut rows: Vec<(Value, Value)> = Vec::new();
        let mut emitted: Vec<Value> = Vec::new();

        for (id, rec) in &inner.docs {
            if rec.deleted || id.starts_with("_design/") {
                continue;
            }
            let doc = Self::build_doc(rec, id, false);
            if let Some((key, value)) = map.eval(&doc) {
                let mut row = json!({ "id": id, "key": key, "value": value });
                if include_docs {
                    row["doc"] = doc;
                }
                rows.push((key_of(&row), row));
            }
        }
        let total_rows = rows.len();
        rows.sort_by(|(ka, a), (kb, b)| {
            collate(ka, kb).then_with(|| collate(&a["id"], &b["id"]))
        });

        if let Some(key) = params.get("key") {
            rows.retain(|(k, _)| collate(k, key) == std::cmp::Ordering::Equal);
        }
        if param_bool(params, "descending") {
            rows.reverse();
        }
        let skip = params.get("skip").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(usize::MAX);
        for (_, row) in rows.into_iter().skip(skip).take(limit) {
            emitted.push(row);
        }

        json!({ "total_rows": total_rows, "offset": skip, "rows": emitted })
    }
}

fn key_of(row: &Value) -> Value {
    row.get("key").cloned().unwrap_or(Value::Null)
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn info(&self) -> Result<Value> {
        let inner = self.inner.read();
        let doc_count = inner.docs.values().filter(|rec| !rec.deleted).count();
        Ok(json!({
            "db_name": self.name,
            "doc_count": doc_count,
            "update_seq": inner.update_seq,
            "instance_start_time": self.created_at.timestamp_micros().to_string(),
        }))
    }

    async fn get(&self, id: &str, params: &QueryParams) -> Result<Value> {
        let inner = self.inner.read();
        let rec = inner
            .docs
            .get(id)
            .ok_or_else(|| Error::NotFound("missing".to_string()))?;
        if rec.deleted {
            return Err(Error::NotFound("deleted".to_string()));
        }
        if let Some(rev) = param_str(params, "rev") {
            // Only the current revision is retained in memory.
            if rev != rec.rev {
                return Err(Error::NotFound("missing".to_string()));
            }
        }
        Ok(Self::build_doc(rec, id, param_bool(params, "attachments")))
    }

    async fn put(&self, doc: Value, params: &QueryParams) -> Result<Value> {
        let doc = as_object(doc)?;
        let mut inner = self.inner.write();
        let (id, rev) = Self::apply_put(&mut inner, doc, param_str(params, "rev"))?;
        Ok(json!({ "ok": true, "id": id, "rev": rev }))
    }

    async fn post(&self, doc: Value, params: &QueryParams) -> Result<Value> {
        let mut doc = as_object(doc)?;
        if !doc.contains_key("_id") {
            doc.insert(
                "_id".to_string(),
                json!(Uuid::new_v4().simple().to_string()),
            );
        }
        let mut inner = self.inner.write();
        let (id, rev) = Self::apply_put(&mut inner, doc, param_str(params, "rev"))?;
        Ok(json!({ "ok": true, "id": id, "rev": rev }))
    }

    async fn remove(&self, doc: &Value) -> Result<Value> {
        let id = doc
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::BadRequest("_id is required".to_string()))?
            .to_string();
        let rev = doc
            .get("_rev")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Conflict("Document update conflict".to_string()))?
            .to_string();

        let mut inner = self.inner.write();
        let rec = inner
            .docs
            .get(&id)
            .filter(|rec| !rec.deleted)
            .ok_or_else(|| Error::NotFound("missing".to_string()))?;
        if rec.rev != rev {
            return Err(Error::Conflict("Document update conflict".to_string()));
        }
        let new_rev = next_rev(Some(&rev));
        inner.docs.insert(
            id.clone(),
            DocRecord {
                rev: new_rev.clone(),
                seq: 0,
                deleted: true,
                body: Map::new(),
                attachments: BTreeMap::new(),
            },
        );
        let seq = Self::record_change(&mut inner, &id, &new_rev, true);
        if let Some(rec) = inner.docs.get_mut(&id) {
            rec.seq = seq;
        }
        Ok(json!({ "ok": true, "id": id, "rev": new_rev }))
    }

    async fn bulk_docs(&self, body: Value, new_edits: Option<bool>) -> Result<Value> {
        let docs = body
            .get("docs")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::BadRequest("Missing JSON list of 'docs'".to_string()))?
            .clone();

        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            if new_edits == Some(false) {
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
                match self.install(doc) {
                    Ok(_) => results.push(json!({ "ok": true, "id": id, "rev": rev })),
                    Err(e) => results.push(json!({
                        "id": id,
                        "error": e.couch_name(),
                        "reason": e.reason(),
                    })),
                }
                continue;
            }

            let mut doc = match doc {
                Value::Object(map) => map,
                _ => {
                    results.push(json!({
                        "error": "bad_request",
                        "reason": "Document must be a JSON object",
                    }));
                    continue;
                }
            };
            if !doc.contains_key("_id") {
                doc.insert(
                    "_id".to_string(),
                    json!(Uuid::new_v4().simple().to_string()),
                );
            }
            let id = doc
                .get("_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let mut inner = self.inner.write();
            match Self::apply_put(&mut inner, doc, None) {
                Ok((id, rev)) => results.push(json!({ "ok": true, "id": id, "rev": rev })),
                Err(e) => results.push(json!({
                    "id": id,
                    "error": e.couch_name(),
                    "reason": e.reason(),
                })),
            }
        }
        Ok(Value::Array(results))
    }

    async fn all_docs(&self, params: &QueryParams) -> Result<Value> {
        let inner = self.inner.read();
        let include_docs = param_bool(params, "include_docs");
        let total_rows = inner.docs.values().filter(|rec| !rec.deleted).count();

        let row_for = |id: &str, rec: &DocRecord| {
            let mut row = json!({ "id": id, "key": id, "value": { "rev": rec.rev } });
            if include_docs {
                row["doc"] = Self::build_doc(rec, id, false);
            }
            row
        };

        // Explicit key list keeps the caller's order and reports
        // missing entries inline.
        if let Some(keys) = params.get("keys").and_then(Value::as_array) {
            let rows: Vec<Value> = keys
                .iter()
                .map(|key| {
                    let id = key.as_str().unwrap_or_default();
                    match inner.docs.get(id).filter(|rec| !rec.deleted) {
                        Some(rec) => row_for(id, rec),
                        None => json!({ "key": key, "error": "not_found" }),
                    }
                })
                .collect();
            return Ok(json!({ "total_rows": total_rows, "offset": 0, "rows": rows }));
        }

        let startkey = param_str(params, "startkey");
        let endkey = param_str(params, "endkey");
        let key = param_str(params, "key");
        let mut rows: Vec<Value> = inner
            .docs
            .iter()
            .filter(|(_, rec)| !rec.deleted)
            .filter(|(id, _)| key.as_deref().map_or(true, |k| k == id.as_str()))
            .filter(|(id, _)| startkey.as_deref().map_or(true, |k| id.as_str() >= k))
            .filter(|(id, _)| endkey.as_deref().map_or(true, |k| id.as_str() <= k))
            .map(|(id, rec)| row_for(id, rec))
            .collect();
        if param_bool(params, "descending") {
            rows.reverse();
        }
        let skip = params.get("skip").and_then(Value::as_u64).unwrap_or(0) as usize;
        let limit = params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(usize::MAX);
        let rows: Vec<Value> = rows.into_iter().skip(skip).take(limit).collect();

        Ok(json!({ "total_rows": total_rows, "offset": skip, "rows": rows }))
    }

    async fn fetch_changes(&self, opts: &ChangesOptions) -> Result<Vec<ChangeEvent>> {
        let inner = self.inner.read();
        let mut results = Vec::new();
        for event in &inner.changes {
            if event.seq <= opts.since || !passes_filter(opts, event) {
                continue;
            }
            let mut event = event.clone();
            if opts.include_docs && event.deleted.is_none() {
                event.doc = inner
                    .docs
                    .get(&event.id)
                    .map(|rec| Self::build_doc(rec, &event.id, false));
            }
            results.push(event);
            if opts.limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
        }
        Ok(results)
    }

    async fn subscribe_changes(&self, opts: &ChangesOptions) -> Result<ChangesSubscription> {
        Ok(self.subscribe(opts))
    }

    async fn compact(&self) -> Result<Value> {
        let mut inner = self.inner.write();
        let live: std::collections::HashMap<String, u64> = inner
            .docs
            .iter()
            .map(|(id, rec)| (id.clone(), rec.seq))
            .collect();
        // Keep only the newest event per document.
        inner
            .changes
            .retain(|event| live.get(&event.id) == Some(&event.seq));
        Ok(json!({ "ok": true }))
    }

    async fn revs_diff(&self, revs: Value) -> Result<Value> {
        let map = match revs {
            Value::Object(map) => map,
            _ => {
                return Err(Error::BadRequest(
                    "Request body must be a JSON object".to_string(),
                ))
            }
        };
        let inner = self.inner.read();
        let mut diffs = Map::new();
        for (id, revs) in map {
            let revs = revs.as_array().cloned().unwrap_or_default();
            let current = inner.docs.get(&id).map(|rec| rec.rev.as_str());
            let missing: Vec<Value> = revs
                .into_iter()
                .filter(|rev| rev.as_str() != current)
                .collect();
            if !missing.is_empty() {
                diffs.insert(id, json!({ "missing": missing }));
            }
        }
        Ok(Value::Object(diffs))
    }

    async fn query(&self, view: ViewQuery, params: &QueryParams) -> Result<Value> {
        let map = match view {
            ViewQuery::Temp { map, .. } => {
                // A temp view without a map degenerates to keying by id.
                map.unwrap_or(MapExpr::compile("doc._id")?)
            }
            ViewQuery::Named(name) => {
                let (design, view_name) = name
                    .split_once('/')
                    .ok_or_else(|| Error::NotFound("missing".to_string()))?;
                let inner = self.inner.read();
                let rec = inner
                    .docs
                    .get(&format!("_design/{design}"))
                    .filter(|rec| !rec.deleted)
                    .ok_or_else(|| Error::NotFound("missing".to_string()))?;
                let source = rec
                    .body
                    .get("views")
                    .and_then(|views| views.get(view_name))
                    .and_then(|view| view.get("map"))
                    .and_then(Value::as_str)
                    .ok_or_else(|| Error::NotFound("missing_named_view".to_string()))?;
                MapExpr::compile(source)?
            }
        };
        Ok(self.run_view(&map, params))
    }

    async fn put_attachment(
        &self,
        id: &str,
        name: &str,
        rev: Option<&str>,
        data: Bytes,
        content_type: &str,
    ) -> Result<Value> {
        let mut inner = self.inner.write();
        let current = inner.docs.get(id).filter(|rec| !rec.deleted);
        match (current, rev.filter(|r| !r.is_empty())) {
            (Some(rec), Some(rev)) if rec.rev == rev => {}
            (None, None) => {}
            _ => return Err(Error::Conflict("Document update conflict".to_string())),
        }

        let new_rev = next_rev(current.map(|rec| rec.rev.as_str()));
        let mut attachments = match inner.docs.get(id).filter(|rec| !rec.deleted) {
            Some(rec) => rec
                .attachments
                .iter()
                .map(|(n, a)| {
                    (
                        n.clone(),
                        AttachmentRecord {
                            content_type: a.content_type.clone(),
                            data: a.data.clone(),
                            revpos: a.revpos,
                        },
                    )
                })
                .collect(),
            None => BTreeMap::new(),
        };
        attachments.insert(
            name.to_string(),
            AttachmentRecord {
                content_type: content_type.to_string(),
                data,
                revpos: generation(&new_rev),
            },
        );
        let body = inner
            .docs
            .get(id)
            .filter(|rec| !rec.deleted)
            .map(|rec| rec.body.clone())
            .unwrap_or_default();
        inner.docs.insert(
            id.to_string(),
            DocRecord {
                rev: new_rev.clone(),
                seq: 0,
                deleted: false,
                body,
                attachments,
            },
        );
        let seq = Self::record_change(&mut inner, id, &new_rev, false);
        if let Some(rec) = inner.docs.get_mut(id) {
            rec.seq = seq;
        }
        Ok(json!({ "ok": true, "id": id, "rev": new_rev }))
    }

    async fn get_attachment(&self, id: &str, name: &str) -> Result<Bytes> {
        let inner = self.inner.read();
        inner
            .docs
            .get(id)
            .filter(|rec| !rec.deleted)
            .and_then(|rec| rec.attachments.get(name))
            .map(|att| att.data.clone())
            .ok_or_else(|| Error::NotFound("missing".to_string()))
    }

    async fn remove_attachment(&self, id: &str, name: &str, rev: &str) -> Result<Value> {
        let mut inner = self.inner.write();
        let rec = inner
            .docs
            .get(id)
            .filter(|rec| !rec.deleted)
            .ok_or_else(|| Error::NotFound("missing".to_string()))?;
        if rec.rev != rev {
            return Err(Error::Conflict("Document update conflict".to_string()));
        }
        if !rec.attachments.contains_key(name) {
            return Err(Error::NotFound("missing".to_string()));
        }

        let new_rev = next_rev(Some(rev));
        if let Some(rec) = inner.docs.get_mut(id) {
            rec.attachments.remove(name);
            rec.rev = new_rev.clone();
        }
        let seq = Self::record_change(&mut inner, id, &new_rev, false);
        if let Some(rec) = inner.docs.get_mut(id) {
            rec.seq = seq;
        }
        Ok(json!({ "ok": true, "id": id, "rev": new_rev }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> MemoryEngine {
        let dir = std::env::temp_dir().join(format!(
            "futondb_mem_test_{}_{}",
            std::process::id(),
            Uuid::new_v4().simple()
        ));
        MemoryEngine::new(dir)
    }

    #[tokio::test]
    async fn test_traversal_names_never_touch_the_filesystem() {
        let root = std::env::temp_dir().join(format!(
            "futondb_mem_test_{}_{}",
            std::process::id(),
            Uuid::new_v4().simple()
        ));
        let victim = root.join("victim");
        std::fs::create_dir_all(victim.join("precious")).unwrap();
        let engine = MemoryEngine::new(root.join("data"));

        // `../victim` would resolve to the sibling directory once
        // joined to the data dir; both lifecycle calls must refuse it
        // and leave the directory untouched.
        let err = engine.destroy("../victim").await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
        assert!(victim.join("precious").is_dir());

        assert!(engine.open("../victim").await.is_err());

        for name in ["a/b", "a\\b", "..", ""] {
            assert!(engine.open(name).await.is_err(), "open accepted {name:?}");
        }
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() -> Result<()> {
        let engine = test_engine();
        let db = engine.open("pets").await?;

        let res = db
            .put(json!({ "_id": "otto", "kind": "otter" }), &QueryParams::new())
            .await?;
        assert_eq!(res["ok"], true);
        let rev = res["rev"].as_str().unwrap().to_string();

        let doc = db.get("otto", &QueryParams::new()).await?;
        assert_eq!(doc["_id"], "otto");
        assert_eq!(doc["_rev"].as_str(), Some(rev.as_str()));
        assert_eq!(doc["kind"], "otter");
        Ok(())
    }

    #[tokio::test]
    async fn test_put_conflicts_on_stale_rev() -> Result<()> {
        let engine = test_engine();
        let db = engine.open("pets").await?;
        db.put(json!({ "_id": "a", "n": 1 }), &QueryParams::new())
            .await?;

        let err = db
            .put(
                json!({ "_id": "a", "_rev": "1-bogus", "n": 2 }),
                &QueryParams::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let err = db
            .put(json!({ "_id": "a", "n": 2 }), &QueryParams::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_requires_current_rev() -> Result<()> {
        let engine = test_engine();
        let db = engine.open("pets").await?;
        let res = db
            .put(json!({ "_id": "a" }), &QueryParams::new())
            .await?;
        let rev = res["rev"].as_str().unwrap();

        let err = db
            .remove(&json!({ "_id": "a", "_rev": "1-stale" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        db.remove(&json!({ "_id": "a", "_rev": rev })).await?;
        let err = db.get("a", &QueryParams::new()).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_changes_sequences_are_monotonic() -> Result<()> {
        let engine = test_engine();
        let db = engine.open("pets").await?;
        for i in 0..3 {
            db.put(json!({ "_id": format!("d{i}") }), &QueryParams::new())
                .await?;
        }

        let changes = db.fetch_changes(&ChangesOptions::default()).await?;
        assert_eq!(changes.len(), 3);
        let seqs: Vec<u64> = changes.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let since = db
            .fetch_changes(&ChangesOptions {
                since: 2,
                ..Default::default()
            })
            .await?;
        assert_eq!(since.len(), 1);
        assert_eq!(since[0].id, "d2");
        Ok(())
    }

    #[tokio::test]
    async fn test_subscription_receives_live_change() -> Result<()> {
        let engine = test_engine();
        let db = engine.open("pets").await?;
        let mut sub = db.subscribe_changes(&ChangesOptions::default()).await?;

        db.put(json!({ "_id": "live" }), &QueryParams::new()).await?;
        let event = sub.recv().await.expect("a live change");
        assert_eq!(event.id, "live");
        assert_eq!(event.seq, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_revs_diff_reports_missing() -> Result<()> {
        let engine = test_engine();
        let db = engine.open("pets").await?;
        let res = db
            .put(json!({ "_id": "a" }), &QueryParams::new())
            .await?;
        let rev = res["rev"].as_str().unwrap();

        let diffs = db
            .revs_diff(json!({
                "a": [rev, "2-unknown"],
                "b": ["1-unknown"],
            }))
            .await?;
        assert_eq!(diffs["a"]["missing"], json!(["2-unknown"]));
        assert_eq!(diffs["b"]["missing"], json!(["1-unknown"]));

        assert_eq!(db.revs_diff(json!({})).await?, json!({}));
        Ok(())
    }

    #[tokio::test]
    async fn test_attachment_lifecycle() -> Result<()> {
        let engine = test_engine();
        let db = engine.open("pets").await?;
        let res = db
            .put(json!({ "_id": "a" }), &QueryParams::new())
            .await?;
        let rev = res["rev"].as_str().unwrap();

        let res = db
            .put_attachment("a", "note.txt", Some(rev), Bytes::from("hello"), "text/plain")
            .await?;
        let rev = res["rev"].as_str().unwrap().to_string();

        let data = db.get_attachment("a", "note.txt").await?;
        assert_eq!(data, Bytes::from("hello"));

        let doc = db.get("a", &QueryParams::new()).await?;
        assert_eq!(doc["_attachments"]["note.txt"]["content_type"], "text/plain");
        assert_eq!(doc["_attachments"]["note.txt"]["stub"], true);

        db.remove_attachment("a", "note.txt", &rev).await?;
        let err = db.get_attachment("a", "note.txt").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_bulk_docs_new_edits_false_installs_revs() -> Result<()> {
        let engine = test_engine();
        let db = engine.open("pets").await?;
        let results = db
            .bulk_docs(
                json!({ "docs": [
                    { "_id": "a", "_rev": "3-abc", "n": 3 },
                    { "_id": "b", "_rev": "1-def", "n": 1 },
                ]}),
                Some(false),
            )
            .await?;
        assert_eq!(results.as_array().unwrap().len(), 2);

        let doc = db.get("a", &QueryParams::new()).await?;
        assert_eq!(doc["_rev"], "3-abc");
        Ok(())
    }

    #[tokio::test]
    async fn test_all_docs_options() -> Result<()> {
        let engine = test_engine();
        let db = engine.open("pets").await?;
        for id in ["c", "a", "b"] {
            db.put(json!({ "_id": id }), &QueryParams::new()).await?;
        }

        let res = db.all_docs(&QueryParams::new()).await?;
        assert_eq!(res["total_rows"], 3);
        let ids: Vec<&str> = res["rows"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let mut params = QueryParams::new();
        params.insert("limit".into(), json!(1));
        params.insert("descending".into(), json!(true));
        let res = db.all_docs(&params).await?;
        assert_eq!(res["rows"][0]["id"], "c");
        Ok(())
    }

    #[tokio::test]
    async fn test_design_view_query() -> Result<()> {
        let engine = test_engine();
        let db = engine.open("pets").await?;
        db.put(
            json!({
                "_id": "_design/app",
                "views": { "by_kind": { "map": "emit(doc.kind, null)" } },
            }),
            &QueryParams::new(),
        )
        .await?;
        db.put(json!({ "_id": "x", "kind": "otter" }), &QueryParams::new())
            .await?;
        db.put(json!({ "_id": "y", "kind": "badger" }), &QueryParams::new())
            .await?;

        let res = db
            .query(ViewQuery::Named("app/by_kind".to_string()), &QueryParams::new())
            .await?;
        let rows = res["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["key"], "badger");
        assert_eq!(rows[1]["key"], "otter");
        Ok(())
    }

    #[tokio::test]
    async fn test_replicate_copies_documents() -> Result<()> {
        let engine = test_engine();
        let src = engine.open("src").await?;
        src.put(json!({ "_id": "a", "n": 1 }), &QueryParams::new())
            .await?;
        src.put(json!({ "_id": "b", "n": 2 }), &QueryParams::new())
            .await?;

        let res = engine
            .replicate("src", "dst", ReplicationOptions::default())
            .await?;
        assert_eq!(res["ok"], true);
        assert_eq!(res["docs_written"], 2);

        let dst = engine.open("dst").await?;
        let doc = dst.get("a", &QueryParams::new()).await?;
        assert_eq!(doc["n"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_destroy_removes_marker() -> Result<()> {
        let engine = test_engine();
        engine.open("gone").await?;
        assert!(engine.list_databases().await?.contains(&"gone".to_string()));

        engine.destroy("gone").await?;
        assert!(!engine.list_databases().await?.contains(&"gone".to_string()));

        let err = engine.destroy("gone").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        Ok(())
    }
}

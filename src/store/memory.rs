//! In-process [`Store`] backend.
//!
//! One mutex guards documents, the commit sequence and the listener list, so
//! a batch is applied and fanned out to listeners before the next commit can
//! start. Listeners receive full re-sorted snapshots, never deltas.

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{lookup, DocPath, Document, Feed, FieldOp, Fields, Query, Store, Write, WriteBatch};
use crate::error::StoreError;

type Snapshot = Result<Vec<Document>, StoreError>;

struct Listener {
    query: Query,
    tx: mpsc::UnboundedSender<Snapshot>,
    // (id, updated_seq) of the last snapshot sent, to skip no-op re-sends
    last: Vec<(String, u64)>,
}

#[derive(Default)]
struct Inner {
    docs: BTreeMap<String, Document>,
    seq: u64,
    listeners: Vec<Listener>,
    blobs: HashMap<String, Vec<u8>>,
    offline: bool,
}

impl Inner {
    fn evaluate(&self, query: &Query) -> Vec<Document> {
        let prefix = format!("{}/", query.collection);
        let mut docs: Vec<Document> = self
            .docs
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter(|(_, doc)| query.matches(doc))
            .map(|(_, doc)| doc.clone())
            .collect();
        query.arrange(&mut docs);
        docs
    }

    fn notify(&mut self, touched: &HashSet<String>) {
        let mut listeners = std::mem::take(&mut self.listeners);
        for listener in listeners.iter_mut() {
            if !touched.contains(&listener.query.collection) {
                continue;
            }
            let snapshot = self.evaluate(&listener.query);
            let print = fingerprint(&snapshot);
            if print == listener.last {
                continue;
            }
            listener.last = print;
            if listener.tx.send(Ok(snapshot)).is_err() {
                debug!("Listener on {} went away", listener.query.collection);
            }
        }
        listeners.retain(|l| !l.tx.is_closed());
        self.listeners = listeners;
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

fn fingerprint(docs: &[Document]) -> Vec<(String, u64)> {
    docs.iter().map(|d| (d.id().to_string(), d.updated_seq)).collect()
}

fn apply_op(fields: &mut Fields, name: &str, op: FieldOp, seq: u64) {
    let mut parts: Vec<&str> = name.split('.').collect();
    let last = match parts.pop() {
        Some(last) => last,
        None => return,
    };

    let mut target = fields;
    for part in parts {
        let entry = target
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        target = match entry {
            Value::Object(map) => map,
            _ => return,
        };
    }

    match op {
        FieldOp::Set(value) => {
            target.insert(last.to_string(), value);
        }
        FieldOp::Increment(by) => {
            let current = target.get(last).and_then(Value::as_i64).unwrap_or(0);
            target.insert(last.to_string(), Value::from(current + by));
        }
        FieldOp::ArrayUnion(values) => {
            let entry = target
                .entry(last.to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            if !entry.is_array() {
                *entry = Value::Array(Vec::new());
            }
            if let Value::Array(items) = entry {
                for value in values {
                    if !items.contains(&value) {
                        items.push(value);
                    }
                }
            }
        }
        FieldOp::Delete => {
            target.remove(last);
        }
        FieldOp::StampSeq => {
            target.insert(last.to_string(), Value::from(seq));
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Simulate losing (or regaining) the backend. Going offline ends every
    /// open feed with an `Unavailable` item.
    pub fn set_offline(&self, offline: bool) {
        let mut inner = self.lock();
        inner.offline = offline;
        if offline {
            warn!("Memory store going offline, dropping {} listeners", inner.listeners.len());
            for listener in inner.listeners.drain(..) {
                let _ = listener
                    .tx
                    .send(Err(StoreError::Unavailable("connection lost".to_string())));
            }
        } else {
            info!("Memory store back online");
        }
    }

    /// Number of feeds still held by someone.
    pub fn active_listeners(&self) -> usize {
        let mut inner = self.lock();
        inner.listeners.retain(|l| !l.tx.is_closed());
        inner.listeners.len()
    }

    /// Bytes previously stored with `upload_blob`, looked up by the returned URL.
    pub fn blob(&self, url: &str) -> Option<Vec<u8>> {
        let path = url.strip_prefix("memory://")?;
        self.lock().blobs.get(path).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError> {
        let inner = self.lock();
        inner.ensure_online()?;
        Ok(inner.docs.get(path.as_str()).cloned())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        inner.ensure_online()?;

        // Stage every write first so a failing one leaves the store untouched
        let mut staged: BTreeMap<String, Document> = BTreeMap::new();
        let mut seq = inner.seq;
        for write in batch.writes {
            let key = write.path().as_str().to_string();
            let existing = staged
                .get(&key)
                .cloned()
                .or_else(|| inner.docs.get(&key).cloned());

            let doc = match write {
                Write::Create { path, data } => {
                    if existing.is_some() {
                        return Err(StoreError::AlreadyExists(path.to_string()));
                    }
                    seq += 1;
                    Document {
                        path,
                        created_seq: seq,
                        updated_seq: seq,
                        data,
                    }
                }
                Write::Set { path, data } => {
                    seq += 1;
                    Document {
                        created_seq: existing.map_or(seq, |d| d.created_seq),
                        path,
                        updated_seq: seq,
                        data,
                    }
                }
                Write::Update {
                    path,
                    patch,
                    precondition,
                } => {
                    let mut doc = existing.ok_or_else(|| StoreError::NotFound(path.to_string()))?;
                    if let Some(precondition) = precondition {
                        if lookup(&doc.data, &precondition.field) != Some(&precondition.equals) {
                            return Err(StoreError::PreconditionFailed {
                                path: path.to_string(),
                                field: precondition.field,
                            });
                        }
                    }
                    seq += 1;
                    for (field, op) in patch.ops {
                        apply_op(&mut doc.data, &field, op, seq);
                    }
                    doc.updated_seq = seq;
                    doc
                }
            };
            staged.insert(key, doc);
        }

        let touched: HashSet<String> = staged
            .values()
            .map(|d| d.path.collection().to_string())
            .collect();
        inner.seq = seq;
        inner.docs.extend(staged);
        inner.notify(&touched);
        Ok(seq)
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError> {
        let inner = self.lock();
        inner.ensure_online()?;
        Ok(inner.evaluate(query))
    }

    async fn subscribe(&self, query: Query) -> Result<Feed, StoreError> {
        let mut inner = self.lock();
        inner.ensure_online()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = inner.evaluate(&query);
        let last = fingerprint(&snapshot);
        let _ = tx.send(Ok(snapshot));
        debug!(
            "Listener opened on {} ({} active)",
            query.collection,
            inner.listeners.len() + 1
        );
        inner.listeners.push(Listener { query, tx, last });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn upload_blob(&self, path: &str, bytes: Vec<u8>) -> Result<String, StoreError> {
        let mut inner = self.lock();
        inner.ensure_online()?;
        debug!("Stored blob {} ({} bytes)", path, bytes.len());
        inner.blobs.insert(path.to_string(), bytes);
        Ok(format!("memory://{}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Direction, Filter, Patch, Precondition, TieBreak};
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_nothing_behind() {
        let store = MemoryStore::new();
        let batch = WriteBatch::new()
            .create(DocPath::new("chats/c1/messages", "m1"), fields(json!({ "content": "hi" })))
            .update(DocPath::new("chats", "missing"), Patch::new().set("lastMessage", "hi"));

        let err = store.commit(batch).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound("chats/missing".to_string()));
        assert!(store
            .get(&DocPath::new("chats/c1/messages", "m1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_stamp_seq_records_the_write() {
        let store = MemoryStore::new();
        let path = DocPath::new("chats", "c1");
        store.put(&path, fields(json!({ "lastMessage": "" }))).await.unwrap();

        let seq = store
            .commit(WriteBatch::new().update(path.clone(), Patch::new().stamp_seq("summarySeq")))
            .await
            .unwrap();
        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.field("summarySeq"), Some(&json!(seq)));
        assert_eq!(doc.updated_seq, seq);
    }

    #[tokio::test]
    async fn test_create_is_exclusive() {
        let store = MemoryStore::new();
        let path = DocPath::new("users", "alice");
        store
            .commit(WriteBatch::new().create(path.clone(), fields(json!({ "displayName": "A" }))))
            .await
            .unwrap();
        let second = store
            .commit(WriteBatch::new().create(path.clone(), fields(json!({ "displayName": "B" }))))
            .await;
        assert!(matches!(second, Err(StoreError::AlreadyExists(_))));

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.field("displayName"), Some(&json!("A")));
    }

    #[tokio::test]
    async fn test_precondition_guards_update() {
        let store = MemoryStore::new();
        let path = DocPath::new("chats/c1/messages", "m1");
        store
            .put(&path, fields(json!({ "deliveryStatus": "seen" })))
            .await
            .unwrap();

        let result = store
            .commit(WriteBatch::new().update_if(
                path.clone(),
                Patch::new().set("deliveryStatus", "delivered"),
                Precondition {
                    field: "deliveryStatus".into(),
                    equals: json!("sent"),
                },
            ))
            .await;
        assert!(matches!(result, Err(StoreError::PreconditionFailed { .. })));
        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.field("deliveryStatus"), Some(&json!("seen")));
    }

    #[tokio::test]
    async fn test_nested_increment_and_union() {
        let store = MemoryStore::new();
        let path = DocPath::new("chats", "c1");
        store.put(&path, fields(json!({ "viewers": ["a"] }))).await.unwrap();
        store
            .update(
                &path,
                Patch::new()
                    .increment("unread.bob", 1)
                    .increment("unread.bob", 2)
                    .array_union("viewers", vec![json!("a"), json!("b")]),
            )
            .await
            .unwrap();

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.field("unread.bob"), Some(&json!(3)));
        assert_eq!(doc.field("viewers"), Some(&json!(["a", "b"])));
    }

    #[tokio::test]
    async fn test_feed_gets_initial_and_updated_snapshots() {
        let store = MemoryStore::new();
        let query = Query::collection("chats/c1/messages").order_by("timestamp", Direction::Asc, TieBreak::Created);
        let mut feed = store.subscribe(query).await.unwrap();

        let initial = feed.next().await.unwrap().unwrap();
        assert!(initial.is_empty());

        store
            .put(&DocPath::new("chats/c1/messages", "m1"), fields(json!({ "timestamp": 5 })))
            .await
            .unwrap();
        // A write to another collection must not wake this feed
        store
            .put(&DocPath::new("chats/c2/messages", "m9"), fields(json!({ "timestamp": 1 })))
            .await
            .unwrap();
        store
            .put(&DocPath::new("chats/c1/messages", "m2"), fields(json!({ "timestamp": 5 })))
            .await
            .unwrap();

        let first = feed.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);
        let second = feed.next().await.unwrap().unwrap();
        let ids: Vec<&str> = second.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_offline_ends_feeds_and_rejects_writes() {
        let store = MemoryStore::new();
        let mut feed = store
            .subscribe(Query::collection("chats").filter(Filter::Eq("x".into(), json!(1))))
            .await
            .unwrap();
        let _ = feed.next().await;

        store.set_offline(true);
        assert!(matches!(feed.next().await, Some(Err(StoreError::Unavailable(_)))));
        assert!(feed.next().await.is_none());
        assert!(matches!(
            store.put(&DocPath::new("chats", "c1"), Fields::new()).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_offline(false);
        assert!(store.put(&DocPath::new("chats", "c1"), Fields::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_blob_round_trip() {
        let store = MemoryStore::new();
        let url = store.upload_blob("status/alice/1", vec![1, 2, 3]).await.unwrap();
        assert_eq!(store.blob(&url), Some(vec![1, 2, 3]));
        assert_eq!(store.blob("https://elsewhere/x"), None);
    }
}

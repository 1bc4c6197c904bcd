//! Boundary to the managed document store.
//!
//! Everything persistent goes through the [`Store`] trait: point reads,
//! atomic write batches, one-shot queries, live queries and blob uploads.
//! [`MemoryStore`] is the in-process backend used by the tests and the CLI.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

use crate::error::StoreError;

pub mod auth;
pub mod memory;
pub mod query;

pub use auth::{AuthProvider, AuthUser, StaticAuth};
pub use memory::MemoryStore;
pub use query::{Direction, Filter, OrderBy, Query, TieBreak};

/// Field map of a stored document
pub type Fields = Map<String, Value>;

/// Live snapshots of a query. An `Err` item ends the feed.
pub type Feed = BoxStream<'static, Result<Vec<Document>, StoreError>>;

/// Path of a single document: `<collection>/<id>`, where the collection may
/// itself be nested under a parent document (`chats/abc/messages`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocPath(String);

impl DocPath {
    pub fn new(collection: &str, id: &str) -> Self {
        DocPath(format!("{}/{}", collection.trim_end_matches('/'), id))
    }

    pub fn collection(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[..idx],
            None => "",
        }
    }

    pub fn id(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored document together with the store-assigned commit sequences.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: DocPath,
    /// Sequence of the write that created the document. Strictly increasing
    /// across the whole store, so it totally orders creations.
    pub created_seq: u64,
    /// Sequence of the most recent write that touched the document
    pub updated_seq: u64,
    pub data: Fields,
}

impl Document {
    pub fn id(&self) -> &str {
        self.path.id()
    }

    /// Look up a field, following dots into nested maps.
    pub fn field(&self, name: &str) -> Option<&Value> {
        lookup(&self.data, name)
    }

    /// Deserialize the field map into a record type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| StoreError::Malformed {
            path: self.path.to_string(),
            reason: e.to_string(),
        })
    }
}

pub(crate) fn lookup<'a>(fields: &'a Fields, name: &str) -> Option<&'a Value> {
    let mut parts = name.split('.');
    let mut current = fields.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Serialize a record into a field map.
pub fn to_fields<T: Serialize>(path: &DocPath, record: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Malformed {
            path: path.to_string(),
            reason: format!("expected an object, got {}", other),
        }),
        Err(e) => Err(StoreError::Malformed {
            path: path.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// One field-level operation of a partial update
#[derive(Debug, Clone, PartialEq)]
pub enum FieldOp {
    Set(Value),
    /// Numeric add; a missing field counts as zero
    Increment(i64),
    /// Append the values not already present in the array
    ArrayUnion(Vec<Value>),
    Delete,
    /// Set to the commit sequence of the write carrying this op
    StampSeq,
}

/// Partial update. Field names may be dotted to reach into nested maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    pub ops: Vec<(String, FieldOp)>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.ops.push((field.to_string(), FieldOp::Set(value.into())));
        self
    }

    pub fn increment(mut self, field: &str, by: i64) -> Self {
        self.ops.push((field.to_string(), FieldOp::Increment(by)));
        self
    }

    pub fn array_union(mut self, field: &str, values: Vec<Value>) -> Self {
        self.ops.push((field.to_string(), FieldOp::ArrayUnion(values)));
        self
    }

    pub fn delete(mut self, field: &str) -> Self {
        self.ops.push((field.to_string(), FieldOp::Delete));
        self
    }

    pub fn stamp_seq(mut self, field: &str) -> Self {
        self.ops.push((field.to_string(), FieldOp::StampSeq));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Guard on an update: the write only lands if `field` currently equals `equals`.
#[derive(Debug, Clone, PartialEq)]
pub struct Precondition {
    pub field: String,
    pub equals: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Create-if-absent; fails with `AlreadyExists`
    Create { path: DocPath, data: Fields },
    /// Full overwrite, creating if needed
    Set { path: DocPath, data: Fields },
    /// Partial update of an existing document; fails with `NotFound`
    Update {
        path: DocPath,
        patch: Patch,
        precondition: Option<Precondition>,
    },
}

impl Write {
    pub fn path(&self) -> &DocPath {
        match self {
            Write::Create { path, .. } | Write::Set { path, .. } | Write::Update { path, .. } => path,
        }
    }
}

/// Writes that commit together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub writes: Vec<Write>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(mut self, path: DocPath, data: Fields) -> Self {
        self.writes.push(Write::Create { path, data });
        self
    }

    pub fn set(mut self, path: DocPath, data: Fields) -> Self {
        self.writes.push(Write::Set { path, data });
        self
    }

    pub fn update(mut self, path: DocPath, patch: Patch) -> Self {
        self.writes.push(Write::Update { path, patch, precondition: None });
        self
    }

    pub fn update_if(mut self, path: DocPath, patch: Patch, precondition: Precondition) -> Self {
        self.writes.push(Write::Update {
            path,
            patch,
            precondition: Some(precondition),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Client of the managed document store.
///
/// Writes fail with [`StoreError::Unavailable`] on network loss. Callers
/// decide whether to retry; implementations must not retry writes on their
/// own.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>, StoreError>;

    /// Commit a batch atomically. Returns the sequence of the last write.
    async fn commit(&self, batch: WriteBatch) -> Result<u64, StoreError>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Open a live query. The first item is the current result set; every
    /// later item is the full re-sorted result after a relevant commit.
    async fn subscribe(&self, query: Query) -> Result<Feed, StoreError>;

    /// Store the bytes and return a durable, opaque URL.
    async fn upload_blob(&self, path: &str, bytes: Vec<u8>) -> Result<String, StoreError>;

    async fn put(&self, path: &DocPath, data: Fields) -> Result<(), StoreError> {
        self.commit(WriteBatch::new().set(path.clone(), data)).await.map(|_| ())
    }

    async fn update(&self, path: &DocPath, patch: Patch) -> Result<(), StoreError> {
        self.commit(WriteBatch::new().update(path.clone(), patch)).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_doc_path_parts() {
        let path = DocPath::new("chats/c1/messages", "m1");
        assert_eq!(path.as_str(), "chats/c1/messages/m1");
        assert_eq!(path.collection(), "chats/c1/messages");
        assert_eq!(path.id(), "m1");
    }

    #[test]
    fn test_nested_field_lookup() {
        let mut data = Fields::new();
        data.insert("unread".into(), json!({ "alice": 3 }));
        let doc = Document {
            path: DocPath::new("chats", "c1"),
            created_seq: 1,
            updated_seq: 1,
            data,
        };
        assert_eq!(doc.field("unread.alice"), Some(&json!(3)));
        assert_eq!(doc.field("unread.bob"), None);
        assert_eq!(doc.id(), "c1");
    }
}

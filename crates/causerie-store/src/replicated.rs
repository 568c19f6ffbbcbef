use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::StoreError;
use crate::path::KeyPath;

/// A mutation observed under a watched parent.  `key` is the direct child
/// that changed and `value` its full merged value after the write, or
/// `Null` when the child was removed.
#[derive(Debug, Clone)]
pub struct ChildEvent {
    pub parent: KeyPath,
    pub key: String,
    pub value: Value,
}

impl ChildEvent {
    pub fn path(&self) -> KeyPath {
        self.parent.child(self.key.clone())
    }
}

/// The replicated graph as the application sees it.
///
/// Two read modes mirror the two subscription styles of the backing store:
/// `snapshot`/`children` resolve the currently-known state once and stop,
/// `watch_children` replays the currently-known children and then fires on
/// every observed mutation beneath them.  Live delivery is at-least-once
/// and only ordered per key; the same value may be observed any number of
/// times.  Writes are asynchronous merges with no read-after-write
/// guarantee across parties.
#[async_trait]
pub trait ReplicatedStore: Send + Sync + 'static {
    /// Resolve the value at `path` once.
    async fn snapshot(&self, path: &KeyPath) -> Result<Option<Value>, StoreError>;

    /// Resolve every direct child of `path` once.
    async fn children(&self, path: &KeyPath) -> Result<Vec<(String, Value)>, StoreError>;

    /// Live subscription to the children of `path`.
    async fn watch_children(&self, path: &KeyPath) -> mpsc::UnboundedReceiver<ChildEvent>;

    /// Merge `value` into the node at `path`: object fields merge
    /// recursively, scalars replace, explicit nulls delete.
    async fn put(&self, path: &KeyPath, value: Value) -> Result<(), StoreError>;

    /// Delete the node at `path`.
    async fn remove(&self, path: &KeyPath) -> Result<(), StoreError>;

    /// Append `value` under `path` with a generated child id, returning
    /// the id.
    async fn append(&self, path: &KeyPath, value: Value) -> Result<String, StoreError> {
        let key = uuid::Uuid::new_v4().to_string();
        self.put(&path.child(key.clone()), value).await?;
        Ok(key)
    }
}

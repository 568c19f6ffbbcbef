use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};

use crate::error::StoreError;
use crate::path::KeyPath;
use crate::replicated::{ChildEvent, ReplicatedStore};

#[derive(Debug, Clone)]
enum Node {
    Leaf(Value),
    Branch(BTreeMap<String, Node>),
}

impl Node {
    fn branch() -> Self {
        Node::Branch(BTreeMap::new())
    }

    fn materialize(&self) -> Value {
        match self {
            Node::Leaf(v) => v.clone(),
            Node::Branch(children) => Value::Object(
                children
                    .iter()
                    .map(|(k, n)| (k.clone(), n.materialize()))
                    .collect(),
            ),
        }
    }
}

struct Watcher {
    parent: KeyPath,
    tx: mpsc::UnboundedSender<ChildEvent>,
}

#[derive(Default)]
struct Inner {
    root: BTreeMap<String, Node>,
    watchers: Vec<Watcher>,
}

/// In-process [`ReplicatedStore`] with the semantics of the replicated
/// graph: puts merge objects recursively, explicit nulls delete, a watch
/// replays every currently-known child before streaming new mutations, and
/// any write beneath a child re-fires that child with its full merged
/// value.  The re-fire rule makes this a deliberately duplicate-happy
/// event source, which is exactly what downstream handlers must survive.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReplicatedStore for MemoryStore {
    async fn snapshot(&self, path: &KeyPath) -> Result<Option<Value>, StoreError> {
        let inner = self.inner.read().await;
        Ok(lookup(&inner.root, path.segments()).map(Node::materialize))
    }

    async fn children(&self, path: &KeyPath) -> Result<Vec<(String, Value)>, StoreError> {
        let inner = self.inner.read().await;
        let listed = match lookup(&inner.root, path.segments()) {
            Some(Node::Branch(map)) => map
                .iter()
                .map(|(k, n)| (k.clone(), n.materialize()))
                .collect(),
            _ => Vec::new(),
        };
        Ok(listed)
    }

    async fn watch_children(&self, path: &KeyPath) -> mpsc::UnboundedReceiver<ChildEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.write().await;
        if let Some(Node::Branch(map)) = lookup(&inner.root, path.segments()) {
            for (key, node) in map {
                let _ = tx.send(ChildEvent {
                    parent: path.clone(),
                    key: key.clone(),
                    value: node.materialize(),
                });
            }
        }
        tracing::debug!(parent = %path, "live watch registered");
        inner.watchers.push(Watcher {
            parent: path.clone(),
            tx,
        });
        rx
    }

    async fn put(&self, path: &KeyPath, value: Value) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let Inner { root, watchers } = &mut *inner;
        merge_at(root, path.segments(), &value);
        notify_watchers(root, watchers, path, Some(&value));
        Ok(())
    }

    async fn remove(&self, path: &KeyPath) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let Inner { root, watchers } = &mut *inner;
        remove_at(root, path.segments());
        notify_watchers(root, watchers, path, None);
        Ok(())
    }
}

fn lookup<'a>(children: &'a BTreeMap<String, Node>, segments: &[String]) -> Option<&'a Node> {
    let (head, rest) = segments.split_first()?;
    let node = children.get(head)?;
    if rest.is_empty() {
        Some(node)
    } else {
        match node {
            Node::Branch(map) => lookup(map, rest),
            Node::Leaf(_) => None,
        }
    }
}

fn merge_at(children: &mut BTreeMap<String, Node>, segments: &[String], value: &Value) {
    match segments.split_first() {
        None => {}
        Some((head, rest)) if rest.is_empty() => merge_child(children, head, value),
        Some((head, rest)) => {
            let entry = children.entry(head.clone()).or_insert_with(Node::branch);
            if matches!(entry, Node::Leaf(_)) {
                *entry = Node::branch();
            }
            if let Node::Branch(map) = entry {
                merge_at(map, rest, value);
            }
        }
    }
}

fn merge_child(children: &mut BTreeMap<String, Node>, key: &str, value: &Value) {
    match value {
        Value::Null => {
            children.remove(key);
        }
        Value::Object(fields) => {
            let entry = children
                .entry(key.to_string())
                .or_insert_with(Node::branch);
            if matches!(entry, Node::Leaf(_)) {
                *entry = Node::branch();
            }
            if let Node::Branch(map) = entry {
                for (k, v) in fields {
                    merge_child(map, k, v);
                }
            }
        }
        scalar => {
            children.insert(key.to_string(), Node::Leaf(scalar.clone()));
        }
    }
}

fn remove_at(children: &mut BTreeMap<String, Node>, segments: &[String]) {
    match segments.split_first() {
        None => {}
        Some((head, rest)) if rest.is_empty() => {
            children.remove(head);
        }
        Some((head, rest)) => {
            if let Some(Node::Branch(map)) = children.get_mut(head) {
                remove_at(map, rest);
            }
        }
    }
}

/// Re-fire every watcher whose parent covers the written path, handing
/// each the affected child's full merged value.  Watchers with dropped
/// receivers are pruned on the way.
fn notify_watchers(
    root: &BTreeMap<String, Node>,
    watchers: &mut Vec<Watcher>,
    written: &KeyPath,
    written_value: Option<&Value>,
) {
    watchers.retain(|w| {
        let keys = affected_children(&w.parent, written, written_value);
        if keys.is_empty() {
            return !w.tx.is_closed();
        }
        for key in keys {
            let child_path = w.parent.child(key.clone());
            let value = lookup(root, child_path.segments())
                .map(Node::materialize)
                .unwrap_or(Value::Null);
            let event = ChildEvent {
                parent: w.parent.clone(),
                key,
                value,
            };
            if w.tx.send(event).is_err() {
                return false;
            }
        }
        true
    });
}

fn affected_children(
    parent: &KeyPath,
    written: &KeyPath,
    written_value: Option<&Value>,
) -> Vec<String> {
    if written.starts_with(parent) && written.len() > parent.len() {
        return vec![written.segments()[parent.len()].clone()];
    }
    // A whole object put directly at the watched parent touches each of
    // its top-level keys.
    if written == parent {
        if let Some(Value::Object(fields)) = written_value {
            return fields.keys().cloned().collect();
        }
    }
    Vec::new()
}

//! The shared keyed store, as seen by the session core.
//!
//! Value paths are last-write-wins; log paths are append-only and ordered by the
//! store. Listeners get the current snapshot first and then the latest one after
//! each change; a slow listener sees intermediate snapshots coalesced.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use shared::{LogEntry, PushId, Snapshot, StorePath};
use tokio::sync::watch;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} holds an append-only log and cannot be overwritten")]
    NotAValue(StorePath),
    #[error("{0} holds a value and cannot be appended to")]
    NotALog(StorePath),
    #[error("store connection is closed")]
    Disconnected,
    #[error("failed to encode record: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to encode packet: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("websocket error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Capability injected into publishers, subscribers and chat channels.
pub trait SessionStore: Send + Sync {
    fn write(&self, path: &StorePath, value: Value) -> Result<()>;

    fn append(&self, path: &StorePath, value: Value) -> Result<()>;

    fn subscribe(&self, path: &StorePath) -> Result<Subscription>;
}

/// Live listener on one path. Dropping it unsubscribes.
///
/// Only snapshots published after the receiver was last marked seen are
/// yielded, so store implementations call `mark_changed` when the current
/// value should be delivered first.
pub struct Subscription {
    path: StorePath,
    updates: watch::Receiver<Snapshot>,
    on_cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        path: StorePath,
        updates: watch::Receiver<Snapshot>,
        on_cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            path,
            updates,
            on_cancel: Some(Box::new(on_cancel)),
        }
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Latest unseen snapshot, or `None` once the store side has gone away.
    pub async fn next(&mut self) -> Option<Snapshot> {
        self.updates.changed().await.ok()?;
        Some(self.updates.borrow_and_update().clone())
    }

    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(on_cancel) = self.on_cancel.take() {
            on_cancel();
        }
    }
}

enum Node {
    Value(Value),
    Log(Vec<LogEntry>),
}

impl Node {
    fn snapshot(&self) -> Snapshot {
        match self {
            Node::Value(value) => Snapshot::Value(value.clone()),
            Node::Log(entries) => Snapshot::Log(entries.clone()),
        }
    }
}

struct Watcher {
    id: u64,
    tx: watch::Sender<Snapshot>,
}

#[derive(Default)]
struct MemoryInner {
    nodes: HashMap<StorePath, Node>,
    watchers: HashMap<StorePath, Vec<Watcher>>,
    next_watcher: u64,
    next_push: u64,
}

impl MemoryInner {
    fn notify(&mut self, path: &StorePath) {
        let Some(node) = self.nodes.get(path) else {
            return;
        };
        let snapshot = node.snapshot();
        if let Some(watchers) = self.watchers.get_mut(path) {
            watchers.retain(|w| w.tx.send(snapshot.clone()).is_ok());
        }
    }
}

/// In-process store. Cloning shares the same data.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, path: &StorePath) -> Snapshot {
        self.lock()
            .nodes
            .get(path)
            .map_or(Snapshot::Empty, Node::snapshot)
    }

    pub fn listener_count(&self, path: &StorePath) -> usize {
        self.lock().watchers.get(path).map_or(0, |w| {
            w.iter().filter(|watcher| !watcher.tx.is_closed()).count()
        })
    }
}

fn unregister(inner: &Weak<Mutex<MemoryInner>>, path: &StorePath, id: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(watchers) = inner.watchers.get_mut(path) {
        watchers.retain(|w| w.id != id);
        if watchers.is_empty() {
            inner.watchers.remove(path);
        }
    }
}

impl SessionStore for MemoryStore {
    fn write(&self, path: &StorePath, value: Value) -> Result<()> {
        let mut inner = self.lock();
        match inner.nodes.get_mut(path) {
            Some(Node::Log(_)) => return Err(StoreError::NotAValue(path.clone())),
            Some(Node::Value(current)) if *current == value => return Ok(()),
            Some(Node::Value(current)) => *current = value,
            None => {
                inner.nodes.insert(path.clone(), Node::Value(value));
            }
        }
        inner.notify(path);
        Ok(())
    }

    fn append(&self, path: &StorePath, value: Value) -> Result<()> {
        let mut inner = self.lock();
        let id = PushId(inner.next_push);
        match inner
            .nodes
            .entry(path.clone())
            .or_insert_with(|| Node::Log(Vec::new()))
        {
            Node::Log(entries) => entries.push(LogEntry { id, value }),
            Node::Value(_) => return Err(StoreError::NotALog(path.clone())),
        }
        inner.next_push += 1;
        inner.notify(path);
        Ok(())
    }

    fn subscribe(&self, path: &StorePath) -> Result<Subscription> {
        let mut inner = self.lock();
        let id = inner.next_watcher;
        inner.next_watcher += 1;

        let current = inner
            .nodes
            .get(path)
            .map_or(Snapshot::Empty, Node::snapshot);
        let (tx, mut rx) = watch::channel(current);
        rx.mark_changed();
        inner
            .watchers
            .entry(path.clone())
            .or_default()
            .push(Watcher { id, tx });
        drop(inner);

        let weak = Arc::downgrade(&self.inner);
        let owned = path.clone();
        Ok(Subscription::new(path.clone(), rx, move || {
            unregister(&weak, &owned, id)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn path(p: &str) -> StorePath {
        StorePath::new(p)
    }

    #[tokio::test]
    async fn subscribe_delivers_current_value_first() {
        let store = MemoryStore::new();
        store.write(&path("a"), json!(1)).unwrap();

        let mut sub = store.subscribe(&path("a")).unwrap();
        assert_eq!(sub.next().await, Some(Snapshot::Value(json!(1))));

        store.write(&path("a"), json!(2)).unwrap();
        assert_eq!(sub.next().await, Some(Snapshot::Value(json!(2))));
    }

    #[tokio::test]
    async fn empty_path_yields_empty_snapshot() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&path("nothing")).unwrap();
        assert_eq!(sub.next().await, Some(Snapshot::Empty));
    }

    #[tokio::test]
    async fn equal_write_does_not_notify() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&path("a")).unwrap();
        assert_eq!(sub.next().await, Some(Snapshot::Empty));

        store.write(&path("a"), json!({"x": 1})).unwrap();
        assert_eq!(sub.next().await, Some(Snapshot::Value(json!({"x": 1}))));

        store.write(&path("a"), json!({"x": 1})).unwrap();
        assert!(!sub.updates.has_changed().unwrap());

        store.write(&path("a"), json!({"x": 2})).unwrap();
        assert_eq!(sub.next().await, Some(Snapshot::Value(json!({"x": 2}))));
    }

    #[tokio::test]
    async fn slow_listener_sees_only_the_latest_value() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&path("a")).unwrap();
        for n in 0..1000 {
            store.write(&path("a"), json!(n)).unwrap();
        }

        assert_eq!(sub.next().await, Some(Snapshot::Value(json!(999))));
        assert!(!sub.updates.has_changed().unwrap());
    }

    #[tokio::test]
    async fn subscription_ends_when_the_store_is_gone() {
        let store = MemoryStore::new();
        let mut sub = store.subscribe(&path("a")).unwrap();
        assert_eq!(sub.next().await, Some(Snapshot::Empty));

        drop(store);
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn appends_keep_insertion_order() {
        let store = MemoryStore::new();
        let log = path("log");
        store.append(&log, json!("first")).unwrap();
        store.append(&log, json!("second")).unwrap();

        let Snapshot::Log(entries) = store.get(&log) else {
            panic!("expected a log");
        };
        let values: Vec<_> = entries.iter().map(|e| e.value.clone()).collect();
        assert_eq!(values, vec![json!("first"), json!("second")]);
        assert!(entries[0].id < entries[1].id);
    }

    #[test]
    fn value_and_log_paths_do_not_mix() {
        let store = MemoryStore::new();
        store.write(&path("v"), json!(1)).unwrap();
        store.append(&path("l"), json!(1)).unwrap();

        assert!(matches!(
            store.append(&path("v"), json!(2)),
            Err(StoreError::NotALog(_))
        ));
        assert!(matches!(
            store.write(&path("l"), json!(2)),
            Err(StoreError::NotAValue(_))
        ));
    }

    #[tokio::test]
    async fn dropping_a_subscription_unregisters_it() {
        let store = MemoryStore::new();
        let sub = store.subscribe(&path("a")).unwrap();
        let other = store.subscribe(&path("a")).unwrap();
        assert_eq!(store.listener_count(&path("a")), 2);

        sub.cancel();
        assert_eq!(store.listener_count(&path("a")), 1);
        drop(other);
        assert_eq!(store.listener_count(&path("a")), 0);

        store.write(&path("a"), json!(1)).unwrap();
    }
}

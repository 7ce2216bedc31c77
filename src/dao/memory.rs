//! In-process realtime store shared by several simulated clients.
//!
//! [`MemoryBackend`] owns the tree; each [`MemoryStore`] is one client's handle with its own
//! connectivity flag. Offline clients fail every operation with
//! [`StoreError::Disconnected`] and receive no listener deliveries until they come back
//! online, at which point their listeners are re-synced with the current tree.

use std::{
    collections::BTreeMap,
    io,
    sync::{
        Arc, PoisonError, RwLock, Weak,
        atomic::{AtomicU32, AtomicU64, Ordering},
    },
    time::Duration,
};

use dashmap::{DashMap, DashSet};
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use crate::{
    clock::Clock,
    dao::{
        realtime_store::{RealtimeStore, SERVER_VALUE_KEY, Subscription},
        storage::{StoreError, StoreResult},
    },
};

struct Listener {
    client: Uuid,
    path: Vec<String>,
    tx: mpsc::UnboundedSender<Option<Value>>,
    last: Option<Option<Value>>,
}

/// Shared tree plus listener registry.
pub struct MemoryBackend {
    tree: RwLock<Value>,
    listeners: DashMap<Uuid, Listener>,
    offline: DashSet<Uuid>,
    clock: Arc<dyn Clock>,
    failing_writes: AtomicU32,
    denied_updates: AtomicU32,
    latency_ms: AtomicU64,
    writes: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty tree whose server timestamps come from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            tree: RwLock::new(Value::Null),
            listeners: DashMap::new(),
            offline: DashSet::new(),
            clock,
            failing_writes: AtomicU32::new(0),
            denied_updates: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        })
    }

    /// Open a new client handle, initially online.
    pub fn client(self: &Arc<Self>) -> MemoryStore {
        let (online, _rx) = watch::channel(true);
        MemoryStore {
            backend: self.clone(),
            client_id: Uuid::new_v4(),
            online: Arc::new(online),
        }
    }

    /// Make the next `count` writes or updates fail with a transient error.
    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Reject the next `count` multi-path updates as if a security rule refused them.
    /// Single writes are unaffected.
    pub fn deny_next_updates(&self, count: u32) {
        self.denied_updates.store(count, Ordering::SeqCst);
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of successfully applied writes and updates.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Current value at `path`, bypassing connectivity.
    pub fn value_at(&self, path: &str) -> Option<Value> {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        get_at(&tree, &segments(path)).cloned()
    }

    /// Number of registered listeners across all clients.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    async fn simulate_latency(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn take_injected_failure(&self) -> Option<StoreError> {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .ok()
            .map(|_| {
                StoreError::unavailable(
                    "injected write failure".into(),
                    io::Error::other("injected write failure"),
                )
            })
    }

    fn take_denied_update(&self, paths: &[Vec<String>]) -> Option<StoreError> {
        self.denied_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .ok()
            .map(|_| StoreError::PermissionDenied {
                path: paths.first().map(|path| path.join("/")).unwrap_or_default(),
            })
    }

    fn apply(&self, updates: Vec<(Vec<String>, Value)>) {
        let now = self.clock.now_ms();
        {
            let mut tree = self.tree.write().unwrap_or_else(PoisonError::into_inner);
            for (path, value) in &updates {
                set_at(&mut tree, path, normalize(resolve_server_values(value.clone(), now)));
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);

        let changed: Vec<&[String]> = updates.iter().map(|(path, _)| path.as_slice()).collect();
        self.notify(|listener| changed.iter().any(|path| related(&listener.path, path)));
    }

    fn notify(&self, mut affected: impl FnMut(&Listener) -> bool) {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        for mut entry in self.listeners.iter_mut() {
            let listener = entry.value_mut();
            if self.offline.contains(&listener.client) || !affected(listener) {
                continue;
            }
            deliver(listener, &tree);
        }
    }

    fn resync_client(&self, client: Uuid) {
        let tree = self.tree.read().unwrap_or_else(PoisonError::into_inner);
        for mut entry in self.listeners.iter_mut() {
            let listener = entry.value_mut();
            if listener.client == client {
                deliver(listener, &tree);
            }
        }
    }
}

fn deliver(listener: &mut Listener, tree: &Value) {
    let current = get_at(tree, &listener.path).cloned();
    if listener.last.as_ref() == Some(&current) {
        return;
    }
    if listener.tx.send(current.clone()).is_ok() {
        listener.last = Some(current);
    }
}

/// One client's view of a [`MemoryBackend`].
#[derive(Clone)]
pub struct MemoryStore {
    backend: Arc<MemoryBackend>,
    client_id: Uuid,
    online: Arc<watch::Sender<bool>>,
}

impl MemoryStore {
    /// Flip this client's connectivity. Coming back online re-syncs its listeners.
    pub fn set_online(&self, online: bool) {
        if self.is_online() == online {
            return;
        }
        debug!(client = %self.client_id, online, "memory store connectivity changed");
        if online {
            self.backend.offline.remove(&self.client_id);
            self.backend.resync_client(self.client_id);
        } else {
            self.backend.offline.insert(self.client_id);
        }
        self.online.send_replace(online);
    }

    /// Whether this handle currently reaches the backend.
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Shared backend of this handle.
    pub fn backend(&self) -> &Arc<MemoryBackend> {
        &self.backend
    }

    fn ensure_online(&self) -> StoreResult<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(StoreError::Disconnected)
        }
    }
}

impl RealtimeStore for MemoryStore {
    fn read(&self, path: &str) -> BoxFuture<'static, StoreResult<Option<Value>>> {
        let this = self.clone();
        let path = segments(path);
        Box::pin(async move {
            this.ensure_online()?;
            this.backend.simulate_latency().await;
            this.ensure_online()?;
            let tree = this
                .backend
                .tree
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            Ok(get_at(&tree, &path).cloned())
        })
    }

    fn write(&self, path: &str, value: Value) -> BoxFuture<'static, StoreResult<()>> {
        let this = self.clone();
        let path = segments(path);
        Box::pin(async move {
            this.ensure_online()?;
            this.backend.simulate_latency().await;
            this.ensure_online()?;
            if let Some(err) = this.backend.take_injected_failure() {
                return Err(err);
            }
            this.backend.apply(vec![(path, value)]);
            Ok(())
        })
    }

    fn update(&self, updates: BTreeMap<String, Value>) -> BoxFuture<'static, StoreResult<()>> {
        let this = self.clone();
        let updates: Vec<_> = updates
            .into_iter()
            .map(|(path, value)| (segments(&path), value))
            .collect();
        Box::pin(async move {
            this.ensure_online()?;
            this.backend.simulate_latency().await;
            this.ensure_online()?;
            let paths: Vec<_> = updates.iter().map(|(path, _)| path.clone()).collect();
            if let Some(err) = this.backend.take_denied_update(&paths) {
                return Err(err);
            }
            if let Some(err) = this.backend.take_injected_failure() {
                return Err(err);
            }
            this.backend.apply(updates);
            Ok(())
        })
    }

    fn subscribe(&self, path: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.backend.listeners.insert(
            id,
            Listener {
                client: self.client_id,
                path: segments(path),
                tx,
                last: None,
            },
        );

        if self.is_online() {
            let tree = self
                .backend
                .tree
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(mut entry) = self.backend.listeners.get_mut(&id) {
                deliver(entry.value_mut(), &tree);
            }
        }

        let backend: Weak<MemoryBackend> = Arc::downgrade(&self.backend);
        Subscription::new(path, rx, move || {
            if let Some(backend) = backend.upgrade() {
                backend.listeners.remove(&id);
            }
        })
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }
}

fn segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect()
}

/// Whether one path is an ancestor of (or equal to) the other.
fn related(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

fn get_at<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut node = root;
    for segment in path {
        node = node.as_object()?.get(segment)?;
    }
    if node.is_null() { None } else { Some(node) }
}

fn set_at(root: &mut Value, path: &[String], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return;
    };

    if value.is_null() {
        remove_at(root, parents, last);
        return;
    }

    let mut node = root;
    for segment in parents {
        node = object_mut(node)
            .entry(segment.clone())
            .or_insert(Value::Null);
    }
    object_mut(node).insert(last.clone(), value);
}

fn remove_at(node: &mut Value, parents: &[String], last: &str) {
    let Some(object) = node.as_object_mut() else {
        return;
    };
    match parents.split_first() {
        None => {
            object.remove(last);
        }
        Some((head, rest)) => {
            if let Some(child) = object.get_mut(head) {
                remove_at(child, rest, last);
                if child.as_object().is_some_and(Map::is_empty) {
                    object.remove(head);
                }
            }
        }
    }
}

fn object_mut(node: &mut Value) -> &mut Map<String, Value> {
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    match node {
        Value::Object(map) => map,
        _ => unreachable!("node was just replaced by an object"),
    }
}

fn resolve_server_values(value: Value, now_ms: i64) -> Value {
    match value {
        Value::Object(map) if is_server_timestamp(&map) => Value::from(now_ms),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, child)| (key, resolve_server_values(child, now_ms)))
                .collect(),
        ),
        other => other,
    }
}

fn is_server_timestamp(map: &Map<String, Value>) -> bool {
    map.len() == 1 && map.get(SERVER_VALUE_KEY).and_then(Value::as_str) == Some("timestamp")
}

/// Drop null children and empty objects the way the realtime tree never stores them.
fn normalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let map: Map<String, Value> = map
                .into_iter()
                .map(|(key, child)| (key, normalize(child)))
                .filter(|(_, child)| !child.is_null())
                .collect();
            if map.is_empty() {
                Value::Null
            } else {
                Value::Object(map)
            }
        }
        other => other,
    }
}

//! Abstraction over the shared realtime tree every client reads from and writes to.

use std::collections::BTreeMap;

use futures::{Stream, future::BoxFuture};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};

use crate::dao::storage::{StoreError, StoreResult};

/// Key of the placeholder object the backend replaces with its own clock.
pub const SERVER_VALUE_KEY: &str = ".sv";

/// Shared key/value tree with subscribe/push semantics.
///
/// Paths are `/`-separated keys (`games/ABC123/rounds/round_1`). Writing `null` removes the
/// node. `update` applies every entry atomically: subscribers never observe half of it.
pub trait RealtimeStore: Send + Sync {
    /// Current value at `path`, `None` when the node does not exist.
    fn read(&self, path: &str) -> BoxFuture<'static, StoreResult<Option<Value>>>;
    /// Replace the node at `path`.
    fn write(&self, path: &str, value: Value) -> BoxFuture<'static, StoreResult<()>>;
    /// Write every `path → value` entry in one atomic step.
    fn update(&self, updates: BTreeMap<String, Value>) -> BoxFuture<'static, StoreResult<()>>;
    /// Register a listener; the current value is delivered first, then every change.
    fn subscribe(&self, path: &str) -> Subscription;
    /// Boolean connectivity signal of this client.
    fn connectivity(&self) -> watch::Receiver<bool>;

    /// Marker resolved to the backend's clock when the write is applied.
    fn server_timestamp(&self) -> Value {
        json!({ SERVER_VALUE_KEY: "timestamp" })
    }
}

/// Live listener registration. Dropping it unregisters the listener from the store.
pub struct Subscription {
    path: String,
    receiver: mpsc::UnboundedReceiver<Option<Value>>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Wrap a delivery channel together with the callback that unregisters it.
    pub fn new(
        path: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Option<Value>>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            path: path.into(),
            receiver,
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Path this subscription listens on.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Wait for the next snapshot. `Some(None)` means the node does not exist.
    pub async fn recv(&mut self) -> Option<Option<Value>> {
        self.receiver.recv().await
    }

    /// Next snapshot if one is already queued.
    pub fn try_recv(&mut self) -> Option<Option<Value>> {
        self.receiver.try_recv().ok()
    }

    /// Consume the subscription as a stream of snapshots; dropping the stream unsubscribes.
    pub fn into_stream(self) -> impl Stream<Item = Option<Value>> + Send {
        async_stream::stream! {
            let mut subscription = self;
            while let Some(snapshot) = subscription.recv().await {
                yield snapshot;
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Decode an optional snapshot into `T`, reporting the path on shape mismatches.
pub fn decode<T: DeserializeOwned>(path: &str, value: Option<Value>) -> StoreResult<Option<T>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|source| StoreError::decode(path, source)),
    }
}

/// Read `path` and decode it into `T`.
pub async fn read_typed<T: DeserializeOwned>(
    store: &dyn RealtimeStore,
    path: &str,
) -> StoreResult<Option<T>> {
    let value = store.read(path).await?;
    decode(path, value)
}

/// Durable per-device storage for the offline snapshot.
pub mod local_storage;
/// In-process realtime store.
pub mod memory;
/// Store node definitions.
pub mod models;
/// Store path layout.
pub mod paths;
/// Realtime store abstraction.
pub mod realtime_store;
/// Storage error taxonomy.
pub mod storage;

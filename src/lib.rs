//! tasksync
//!
//! Task store and remote synchronization core for a personal to-do app.
//! Both front ends (the terminal UI and the web dashboard) talk to one
//! [`TaskStore`]: an in-memory cache of every known task, reconciled with a
//! remote backend-of-record, either a spreadsheet (one row per task) or an
//! object store (one JSON document per task).
//!
//! Reads are served from the cache and never block on the network.
//! Reconciliation runs on startup, on an explicit [`TaskStore::refresh`],
//! or on a timer ([`store::spawn_sync_loop`]), and merges concurrent edits
//! field by field so neither side's changes are lost.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod reconcile;
pub mod snapshot;
pub mod store;

pub use backend::{BackendError, MemoryBackend, ObjectStoreBackend, RemoteBackend, SheetsBackend};
pub use cache::TaskSet;
pub use config::{BackendKind, Config, SyncConfig};
pub use error::StoreError;
pub use models::{
    NewTask, Priority, SortOrder, SourceRow, Status, Task, TaskFilter, TaskId, TaskPatch,
};
pub use reconcile::ReconcileReport;
pub use store::{CancelToken, Refresh, StoreEvent, SyncLoopHandle, TaskStore};

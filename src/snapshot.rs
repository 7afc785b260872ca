use crate::cache::TaskSet;
use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Bump when the on-disk shape changes. Unknown versions are rejected
/// rather than guessed at.
const FORMAT_VERSION: u32 = 1;

/// Self-describing snapshot of the whole `TaskSet`, revisions and sync
/// bookkeeping included, so restart-then-reconcile behaves exactly like
/// steady-state reconciliation.
#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    format_version: u32,
    saved_at: DateTime<Utc>,
    tasks: TaskSet,
}

pub fn save(path: &Path, tasks: &TaskSet) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StoreError::Snapshot(e.to_string()))?;
    }
    let file = SnapshotFile {
        format_version: FORMAT_VERSION,
        saved_at: Utc::now(),
        tasks: tasks.clone(),
    };
    let content =
        serde_json::to_string_pretty(&file).map_err(|e| StoreError::Snapshot(e.to_string()))?;
    fs::write(path, content).map_err(|e| StoreError::Snapshot(e.to_string()))?;
    tracing::debug!("saved snapshot of {} tasks to {path:?}", tasks.len());
    Ok(())
}

/// Missing file means a fresh start, not an error.
pub fn load(path: &Path) -> Result<TaskSet, StoreError> {
    if !path.exists() {
        return Ok(TaskSet::new());
    }
    let content = fs::read_to_string(path).map_err(|e| StoreError::Snapshot(e.to_string()))?;
    let file: SnapshotFile =
        serde_json::from_str(&content).map_err(|e| StoreError::Snapshot(e.to_string()))?;
    if file.format_version != FORMAT_VERSION {
        return Err(StoreError::Snapshot(format!(
            "unsupported snapshot format {}",
            file.format_version
        )));
    }
    Ok(file.tasks)
}

use crate::backend::{BackendError, PushItem, PushOutcome, RemoteBackend};
use crate::models::{SourceRow, Task, TaskId};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// In-process backend for tests and offline development. Behaves like a
/// remote: tasks fetched from it carry minted source rows, pushes check the
/// caller's base revision, and failures can be injected per call.
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    latency_ms: AtomicU64,
}

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<TaskId, Task>,
    next_row: u64,
    outage: bool,
    fail_next: u32,
    fail_auth: bool,
    conflict_next: u32,
    push_calls: u32,
    fetch_calls: u32,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call fails with `Unavailable` until switched off.
    pub fn set_outage(&self, outage: bool) {
        self.state.lock().expect("memory backend lock").outage = outage;
    }

    /// The next `n` calls fail with `Unavailable`, then service resumes.
    pub fn fail_next(&self, n: u32) {
        self.state.lock().expect("memory backend lock").fail_next = n;
    }

    /// Every call fails with `Auth` until switched off.
    pub fn set_auth_failure(&self, fail: bool) {
        self.state.lock().expect("memory backend lock").fail_auth = fail;
    }

    /// The next `n` push calls report every item as conflicting without
    /// writing anything, as if another process rewrote the rows in between.
    pub fn conflict_next(&self, n: u32) {
        self.state.lock().expect("memory backend lock").conflict_next = n;
    }

    /// Sleep this long at the start of every call, to widen the window in
    /// which the store runs without its lock.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    fn simulate_latency(&self) {
        let ms = self.latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }

    /// Put a task on the "remote" directly, as if another process pushed it.
    /// Mints a source row when the task has none.
    pub fn seed(&self, mut task: Task) {
        let mut state = self.state.lock().expect("memory backend lock");
        if task.source_row.is_none() {
            state.next_row += 1;
            task.source_row = Some(SourceRow(format!("mem:{}", state.next_row)));
        }
        state.tasks.insert(task.id, task);
    }

    /// Edit the remote copy in place, as another process would: the closure
    /// mutates the task, then revision and `updated_at` advance.
    pub fn edit_remote(&self, id: TaskId, edit: impl FnOnce(&mut Task)) {
        let mut state = self.state.lock().expect("memory backend lock");
        if let Some(task) = state.tasks.get_mut(&id) {
            edit(task);
            task.touch(chrono::Utc::now());
        }
    }

    pub fn remote_task(&self, id: TaskId) -> Option<Task> {
        self.state
            .lock()
            .expect("memory backend lock")
            .tasks
            .get(&id)
            .cloned()
    }

    pub fn remote_tasks(&self) -> Vec<Task> {
        let state = self.state.lock().expect("memory backend lock");
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn push_calls(&self) -> u32 {
        self.state.lock().expect("memory backend lock").push_calls
    }

    pub fn fetch_calls(&self) -> u32 {
        self.state.lock().expect("memory backend lock").fetch_calls
    }

    fn gate(state: &mut MemoryState) -> Result<(), BackendError> {
        if state.fail_auth {
            return Err(BackendError::Auth("injected auth failure".to_string()));
        }
        if state.outage {
            return Err(BackendError::Unavailable("injected outage".to_string()));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(BackendError::Unavailable(
                "injected transient failure".to_string(),
            ));
        }
        Ok(())
    }
}

impl RemoteBackend for MemoryBackend {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn fetch_all(&self) -> Result<Vec<Task>, BackendError> {
        self.simulate_latency();
        let mut state = self.state.lock().expect("memory backend lock");
        state.fetch_calls += 1;
        Self::gate(&mut state)?;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    fn push(&self, batch: &[PushItem]) -> Result<PushOutcome, BackendError> {
        self.simulate_latency();
        let mut state = self.state.lock().expect("memory backend lock");
        state.push_calls += 1;
        Self::gate(&mut state)?;

        if state.conflict_next > 0 {
            state.conflict_next -= 1;
            return Ok(PushOutcome {
                written: Vec::new(),
                conflicts: batch.iter().map(|item| item.task.id).collect(),
            });
        }

        let mut outcome = PushOutcome::default();
        for item in batch {
            let stored_revision = state.tasks.get(&item.task.id).map(|t| t.revision);
            match (item.base_revision, stored_revision) {
                // Create: nothing must exist yet.
                (None, None) => {
                    state.next_row += 1;
                    let source_row = SourceRow(format!("mem:{}", state.next_row));
                    let mut task = item.task.clone();
                    task.source_row = Some(source_row.clone());
                    state.tasks.insert(task.id, task);
                    outcome.written.push((item.task.id, source_row));
                }
                // Update against the revision the caller last read.
                (Some(base), Some(current)) if base == current => {
                    let source_row = item
                        .task
                        .source_row
                        .clone()
                        .unwrap_or_else(|| SourceRow(format!("mem:{}", item.task.id)));
                    let mut task = item.task.clone();
                    task.source_row = Some(source_row.clone());
                    state.tasks.insert(task.id, task);
                    outcome.written.push((item.task.id, source_row));
                }
                // Stale base, vanished row, or duplicate create.
                _ => outcome.conflicts.push(item.task.id),
            }
        }
        Ok(outcome)
    }

    fn delete(&self, id: TaskId, _source_row: &SourceRow) -> Result<(), BackendError> {
        self.simulate_latency();
        let mut state = self.state.lock().expect("memory backend lock");
        Self::gate(&mut state)?;
        if state.tasks.remove(&id).is_none() {
            return Err(BackendError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, Status};
    use chrono::Utc;

    fn task(title: &str) -> Task {
        let now = Utc::now();
        Task {
            id: TaskId::new(),
            title: title.to_string(),
            description: String::new(),
            category: None,
            status: Status::Pending,
            priority: Priority::Medium,
            due_at: None,
            created_at: now,
            updated_at: now,
            revision: 0,
            source_row: None,
        }
    }

    #[test]
    fn create_then_fetch_roundtrip() {
        let backend = MemoryBackend::new();
        let task = task("a");
        let outcome = backend
            .push(&[PushItem {
                task: task.clone(),
                base_revision: None,
            }])
            .expect("push");
        assert_eq!(outcome.written.len(), 1);
        assert!(outcome.conflicts.is_empty());

        let fetched = backend.fetch_all().expect("fetch");
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].id, task.id);
        assert!(fetched[0].source_row.is_some());
    }

    #[test]
    fn stale_base_revision_conflicts() {
        let backend = MemoryBackend::new();
        let mut task = task("a");
        backend.seed(task.clone());
        backend.edit_remote(task.id, |t| t.title = "edited elsewhere".to_string());

        task.touch(Utc::now());
        let outcome = backend
            .push(&[PushItem {
                task: task.clone(),
                base_revision: Some(0),
            }])
            .expect("push call itself succeeds");
        assert_eq!(outcome.conflicts, vec![task.id]);
        assert!(outcome.written.is_empty());
    }

    #[test]
    fn injected_outage_clears_after_fail_next() {
        let backend = MemoryBackend::new();
        backend.fail_next(1);
        assert!(backend.fetch_all().is_err());
        assert!(backend.fetch_all().is_ok());
    }

    #[test]
    fn delete_unknown_is_not_found() {
        let backend = MemoryBackend::new();
        let id = TaskId::new();
        let err = backend
            .delete(id, &SourceRow("mem:1".to_string()))
            .expect_err("nothing to delete");
        assert!(matches!(err, BackendError::NotFound(_)));
    }
}

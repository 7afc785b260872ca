use crate::backend::{with_backoff, PushItem, RemoteBackend, RetryPolicy};
use crate::cache::TaskSet;
use crate::config::SyncConfig;
use crate::error::StoreError;
use crate::models::{
    NewTask, SortOrder, SourceRow, Status, Task, TaskFilter, TaskId, TaskPatch,
};
use crate::reconcile::{merge_fields, plan_merge, PlannedPush, ReconcileReport};
use crate::snapshot;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Emitted after each successful mutation or reconciliation. Front ends
/// subscribe and re-poll `list()` instead of watching state directly.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Mutated(TaskId),
    Removed(TaskId),
    Reconciled(ReconcileReport),
}

/// Outcome of a `refresh` call.
#[derive(Debug)]
pub enum Refresh {
    Completed(ReconcileReport),
    /// Another reconciliation was already in flight; this trigger coalesced
    /// into it. Callers must not assume their queued mutations were
    /// included in that pass.
    AlreadyRunning,
    Cancelled,
}

const CANCEL_IDLE: u8 = 0;
const CANCEL_REQUESTED: u8 = 1;
const CANCEL_PUSHING: u8 = 2;

/// Cooperative cancellation for one refresh. Cancelling succeeds only
/// before the push phase starts; once rows are being written the pass runs
/// to completion so no batch is left unconfirmed.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<AtomicU8>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Returns `false` when refused because the push
    /// phase already began.
    pub fn cancel(&self) -> bool {
        match self.state.compare_exchange(
            CANCEL_IDLE,
            CANCEL_REQUESTED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => true,
            Err(current) => current == CANCEL_REQUESTED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCEL_REQUESTED
    }

    fn begin_push(&self) -> bool {
        self.state
            .compare_exchange(
                CANCEL_IDLE,
                CANCEL_PUSHING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

struct StoreState {
    cache: TaskSet,
    reconciling: bool,
    last_reconciled_at: Option<DateTime<Utc>>,
}

/// The single entry point used by both front ends.
///
/// One coarse lock guards the cache; every operation holds it for the
/// duration of one logical step and never across network I/O. The
/// reconciliation pass snapshots the cache, works against the backend with
/// the lock released, then reacquires it and applies the merge, checking
/// per task that no local mutation slipped in between.
pub struct TaskStore {
    backend: Box<dyn RemoteBackend>,
    retry: RetryPolicy,
    conflict_retry_attempts: u32,
    state: Mutex<StoreState>,
    subscribers: Mutex<Vec<Sender<StoreEvent>>>,
}

/// A push that succeeded remotely, ready to fold back into the cache.
struct AppliedPush {
    task: Task,
    source_row: SourceRow,
    local_seq: u64,
    merged: bool,
    created: bool,
}

/// Everything the network phase produced; applied under the lock afterwards.
struct PassResult {
    fetched: usize,
    adopts: Vec<Task>,
    removes: Vec<TaskId>,
    recreated: usize,
    written: Vec<AppliedPush>,
    conflicts: Vec<TaskId>,
}

impl TaskStore {
    /// An explicitly constructed store with an injected backend. There is
    /// no process-wide instance; both front ends share one `Arc<TaskStore>`.
    pub fn new(backend: Box<dyn RemoteBackend>, sync: &SyncConfig) -> Self {
        Self {
            backend,
            retry: sync.retry_policy(),
            conflict_retry_attempts: sync.conflict_retry_attempts.max(1),
            state: Mutex::new(StoreState {
                cache: TaskSet::new(),
                reconciling: false,
                last_reconciled_at: None,
            }),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        if new.title.trim().is_empty() {
            return Err(StoreError::EmptyTitle);
        }
        let now = Utc::now();
        let task = Task {
            id: TaskId::new(),
            title: new.title,
            description: new.description,
            category: new.category,
            status: Status::Pending,
            priority: new.priority,
            due_at: new.due_at,
            created_at: now,
            updated_at: now,
            revision: 0,
            source_row: None,
        };
        self.lock_state().cache.insert_local(task.clone());
        self.emit(StoreEvent::Mutated(task.id));
        Ok(task)
    }

    pub fn update(&self, id: TaskId, patch: TaskPatch) -> Result<Task, StoreError> {
        let task = {
            let mut state = self.lock_state();
            let Some(current) = state.cache.get(id).cloned() else {
                return Err(StoreError::NotFound(id));
            };
            if patch.is_empty() {
                return Ok(current);
            }
            if let Some(title) = &patch.title
                && title.trim().is_empty()
            {
                return Err(StoreError::EmptyTitle);
            }
            if let Some(status) = patch.status
                && !current.status.can_transition(status)
            {
                return Err(StoreError::InvalidTransition {
                    from: current.status,
                    to: status,
                });
            }

            let mut task = current.clone();
            if let Some(title) = patch.title {
                task.title = title;
            }
            if let Some(description) = patch.description {
                task.description = description;
            }
            if let Some(category) = patch.category {
                task.category = category;
            }
            if let Some(priority) = patch.priority {
                task.priority = priority;
            }
            if let Some(due_at) = patch.due_at {
                task.due_at = due_at;
            }
            if let Some(status) = patch.status {
                task.status = status;
            }
            if task == current {
                return Ok(current);
            }

            task.touch(Utc::now());
            state.cache.insert_local(task.clone());
            task
        };
        self.emit(StoreEvent::Mutated(id));
        Ok(task)
    }

    pub fn set_status(&self, id: TaskId, status: Status) -> Result<Task, StoreError> {
        self.update(
            id,
            TaskPatch {
                status: Some(status),
                ..TaskPatch::default()
            },
        )
    }

    /// Soft delete: the task stays in the cache and on the backend, out of
    /// default listings.
    pub fn archive(&self, id: TaskId) -> Result<Task, StoreError> {
        self.set_status(id, Status::Archived)
    }

    /// Hard delete: removes the remote row/object, then the cache entry.
    /// A task that was never pushed is removed locally without any backend
    /// call.
    pub fn delete(&self, id: TaskId) -> Result<(), StoreError> {
        let source_row = {
            let mut state = self.lock_state();
            let Some(task) = state.cache.get(id) else {
                return Err(StoreError::NotFound(id));
            };
            match task.source_row.clone() {
                Some(row) => row,
                None => {
                    state.cache.remove(id);
                    drop(state);
                    self.emit(StoreEvent::Removed(id));
                    return Ok(());
                }
            }
        };

        // Network phase, lock released.
        let result = with_backoff(&self.retry, "delete", || {
            self.backend.delete(id, &source_row)
        });
        match result {
            Ok(()) => {}
            // Already gone remotely; removing locally is the right end state.
            Err(crate::backend::BackendError::NotFound(_)) => {
                tracing::debug!("delete {id}: remote copy was already gone");
            }
            Err(err) => return Err(err.into()),
        }

        self.lock_state().cache.remove(id);
        self.emit(StoreEvent::Removed(id));
        Ok(())
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock_state().cache.get(id).cloned()
    }

    /// Non-blocking read of the cache; never touches the network.
    pub fn list(&self, filter: &TaskFilter, order: SortOrder) -> Vec<Task> {
        self.lock_state().cache.list(filter, order, Utc::now())
    }

    pub fn last_reconciled_at(&self) -> Option<DateTime<Utc>> {
        self.lock_state().last_reconciled_at
    }

    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .push(tx);
        rx
    }

    pub fn refresh(&self) -> Result<Refresh, StoreError> {
        self.refresh_with(&CancelToken::new())
    }

    /// Run one reconciliation pass: fetch, merge, push, apply.
    pub fn refresh_with(&self, cancel: &CancelToken) -> Result<Refresh, StoreError> {
        let snapshot = {
            let mut state = self.lock_state();
            if state.reconciling {
                return Ok(Refresh::AlreadyRunning);
            }
            state.reconciling = true;
            state.cache.clone()
        };

        let outcome = self.reconcile_pass(&snapshot, cancel);

        let mut state = self.lock_state();
        state.reconciling = false;
        let pass = match outcome {
            Ok(Some(pass)) => pass,
            Ok(None) => return Ok(Refresh::Cancelled),
            Err(err) => return Err(err),
        };

        let mut report = ReconcileReport {
            fetched: pass.fetched,
            recreated: pass.recreated,
            conflicts: pass.conflicts,
            ..ReconcileReport::default()
        };
        let mut skipped = 0usize;

        for task in pass.adopts {
            if state.cache.local_seq(task.id) != snapshot.local_seq(task.id) {
                skipped += 1;
                continue;
            }
            state.cache.apply_synced(task);
            report.adopted += 1;
        }
        for id in pass.removes {
            if state.cache.local_seq(id) != snapshot.local_seq(id) {
                skipped += 1;
                continue;
            }
            state.cache.remove(id);
            report.removed += 1;
        }
        for applied in pass.written {
            if state.cache.local_seq(applied.task.id) != applied.local_seq {
                skipped += 1;
                continue;
            }
            let mut task = applied.task;
            task.source_row = Some(applied.source_row);
            state.cache.apply_synced(task);
            if applied.created {
                report.created += 1;
            } else {
                report.pushed += 1;
            }
            if applied.merged {
                report.merged += 1;
            }
        }
        state.last_reconciled_at = Some(Utc::now());
        drop(state);

        if skipped > 0 {
            tracing::debug!(
                "reconcile: {skipped} tasks mutated mid-pass, left dirty for the next one"
            );
        }
        tracing::info!("reconciled with {}: {}", self.backend.describe(), report);
        self.emit(StoreEvent::Reconciled(report.clone()));
        Ok(Refresh::Completed(report))
    }

    /// Everything that runs without the store lock. `Ok(None)` means the
    /// pass was cancelled before the push phase.
    fn reconcile_pass(
        &self,
        snapshot: &TaskSet,
        cancel: &CancelToken,
    ) -> Result<Option<PassResult>, StoreError> {
        let remote = with_backoff(&self.retry, "fetch_all", || self.backend.fetch_all())?;
        if cancel.is_cancelled() {
            return Ok(None);
        }

        let plan = plan_merge(snapshot, &remote);
        let mut result = PassResult {
            fetched: remote.len(),
            adopts: plan.adopt,
            removes: plan.remove,
            recreated: plan.recreated.len(),
            written: Vec::new(),
            conflicts: Vec::new(),
        };

        if plan.pushes.is_empty() {
            return Ok(Some(result));
        }
        if !cancel.begin_push() {
            return Ok(None);
        }

        let items: Vec<PushItem> = plan.pushes.iter().map(|p| p.item.clone()).collect();
        let outcome = with_backoff(&self.retry, "push", || self.backend.push(&items))?;

        for (id, source_row) in outcome.written {
            let Some(planned) = plan.pushes.iter().find(|p| p.item.task.id == id) else {
                continue;
            };
            result.written.push(AppliedPush {
                task: planned.item.task.clone(),
                source_row,
                local_seq: planned.local_seq,
                merged: planned.merged,
                created: planned.item.base_revision.is_none(),
            });
        }

        for id in outcome.conflicts {
            let Some(planned) = plan.pushes.iter().find(|p| p.item.task.id == id) else {
                continue;
            };
            match self.re_merge_one(snapshot, planned)? {
                Some(applied) => result.written.push(applied),
                None => result.conflicts.push(id),
            }
        }

        Ok(Some(result))
    }

    /// Targeted re-merge after a push conflict: re-fetch the task's current
    /// remote state, merge again, push again. Bounded; other tasks in the
    /// batch are unaffected either way.
    fn re_merge_one(
        &self,
        snapshot: &TaskSet,
        planned: &PlannedPush,
    ) -> Result<Option<AppliedPush>, StoreError> {
        let id = planned.item.task.id;
        let base = snapshot.entry(id).and_then(|e| e.synced_copy.clone());
        let mut attempt = planned.item.task.clone();
        let mut merged_flag = planned.merged;

        for round in 1..=self.conflict_retry_attempts {
            let remote = with_backoff(&self.retry, "re-fetch", || self.backend.fetch_all())?;
            let item = match remote.into_iter().find(|t| t.id == id) {
                Some(remote_task) => {
                    let base_revision = remote_task.revision;
                    attempt = merge_fields(base.as_ref(), &attempt, &remote_task);
                    merged_flag = true;
                    PushItem {
                        task: attempt.clone(),
                        base_revision: Some(base_revision),
                    }
                }
                None => {
                    let mut task = attempt.clone();
                    task.source_row = None;
                    PushItem {
                        task,
                        base_revision: None,
                    }
                }
            };

            let outcome =
                with_backoff(&self.retry, "push retry", || {
                    self.backend.push(std::slice::from_ref(&item))
                })?;
            if let Some((_, source_row)) = outcome.written.into_iter().next() {
                return Ok(Some(AppliedPush {
                    task: item.task,
                    source_row,
                    local_seq: planned.local_seq,
                    merged: merged_flag,
                    created: item.base_revision.is_none(),
                }));
            }
            tracing::warn!(
                "push conflict for {id} (round {round}/{})",
                self.conflict_retry_attempts
            );
        }
        Ok(None)
    }

    /// Replace the cache with a previously saved snapshot. Meant for
    /// startup, before the first reconciliation; dirty entries in the
    /// snapshot are pushed by the next pass exactly as if the process had
    /// never restarted.
    pub fn load_snapshot(&self, path: &Path) -> Result<usize, StoreError> {
        let loaded = snapshot::load(path)?;
        let count = loaded.len();
        self.lock_state().cache = loaded;
        Ok(count)
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), StoreError> {
        let cache = self.lock_state().cache.clone();
        snapshot::save(path, &cache)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("store lock poisoned")
    }

    fn emit(&self, event: StoreEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Handle for the timed reconciliation thread. Dropping it stops the loop.
pub struct SyncLoopHandle {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl SyncLoopHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SyncLoopHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Reconcile on a timer until the handle is dropped. Failures are logged
/// and the loop keeps going; the cache stays serving its last-known-good
/// view throughout.
pub fn spawn_sync_loop(store: Arc<TaskStore>, interval: Duration) -> SyncLoopHandle {
    let (tx, rx) = mpsc::channel();
    let thread = std::thread::spawn(move || {
        loop {
            match rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                Err(RecvTimeoutError::Timeout) => match store.refresh() {
                    Ok(Refresh::Completed(report)) => {
                        tracing::debug!("timed reconcile: {report}");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("timed reconcile failed: {err}");
                    }
                },
            }
        }
    });
    SyncLoopHandle {
        stop: tx,
        thread: Some(thread),
    }
}

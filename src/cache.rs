use crate::models::{SortOrder, Task, TaskFilter, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One cached task plus its synchronization bookkeeping.
///
/// `synced_copy` is the task exactly as of the last successful
/// reconciliation; the merge uses it as the three-way base so concurrent
/// edits to different fields can both survive. `local_seq` counts local
/// mutations and lets the store detect edits that happened while the
/// reconcile lock was released.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub task: Task,
    pub dirty: bool,
    pub last_synced_revision: Option<u64>,
    pub synced_copy: Option<Task>,
    #[serde(skip)]
    pub local_seq: u64,
}

/// The Local Cache: every known task keyed by id. Pure in-memory structure,
/// no network access; the store serializes access to it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSet {
    entries: HashMap<TaskId, CacheEntry>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.entries.get(&id).map(|entry| &entry.task)
    }

    pub fn entry(&self, id: TaskId) -> Option<&CacheEntry> {
        self.entries.get(&id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    /// Record a local mutation (create or edit). Marks the entry dirty and
    /// bumps its mutation sequence; sync bookkeeping is preserved.
    pub fn insert_local(&mut self, task: Task) {
        match self.entries.get_mut(&task.id) {
            Some(entry) => {
                entry.task = task;
                entry.dirty = true;
                entry.local_seq += 1;
            }
            None => {
                self.entries.insert(
                    task.id,
                    CacheEntry {
                        task,
                        dirty: true,
                        last_synced_revision: None,
                        synced_copy: None,
                        local_seq: 1,
                    },
                );
            }
        }
    }

    /// Record the reconciled state of a task: adopted remote copy, pushed
    /// local copy, or field merge result. Never marks dirty.
    pub fn apply_synced(&mut self, task: Task) {
        let revision = task.revision;
        match self.entries.get_mut(&task.id) {
            Some(entry) => {
                entry.synced_copy = Some(task.clone());
                entry.task = task;
                entry.dirty = false;
                entry.last_synced_revision = Some(revision);
            }
            None => {
                self.entries.insert(
                    task.id,
                    CacheEntry {
                        synced_copy: Some(task.clone()),
                        task,
                        dirty: false,
                        last_synced_revision: Some(revision),
                        local_seq: 0,
                    },
                );
            }
        }
    }

    pub fn remove(&mut self, id: TaskId) -> Option<Task> {
        self.entries.remove(&id).map(|entry| entry.task)
    }

    pub fn dirty_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .entries
            .values()
            .filter(|entry| entry.dirty)
            .map(|entry| entry.task.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn local_seq(&self, id: TaskId) -> u64 {
        self.entries.get(&id).map_or(0, |entry| entry.local_seq)
    }

    /// Filtered, ordered view of the cache. Deterministic for identical
    /// inputs: every order ends in a `created_at`-then-id tie-break.
    pub fn list(&self, filter: &TaskFilter, order: SortOrder, now: DateTime<Utc>) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .entries
            .values()
            .filter(|entry| filter.matches(&entry.task, now))
            .map(|entry| entry.task.clone())
            .collect();
        tasks.sort_by(|a, b| order.compare(a, b, now));
        tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, Status};
    use chrono::{Duration, TimeZone};

    fn task(title: &str, minute: u32) -> Task {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 10, minute, 0).unwrap();
        Task {
            id: TaskId::new(),
            title: title.to_string(),
            description: String::new(),
            category: None,
            status: Status::Pending,
            priority: Priority::Medium,
            due_at: None,
            created_at: created,
            updated_at: created,
            revision: 0,
            source_row: None,
        }
    }

    #[test]
    fn insert_local_marks_dirty_and_apply_synced_clears_it() {
        let mut set = TaskSet::new();
        let mut task = task("a", 0);
        set.insert_local(task.clone());
        assert_eq!(set.dirty_ids(), vec![task.id]);
        assert_eq!(set.local_seq(task.id), 1);

        task.touch(Utc::now());
        set.apply_synced(task.clone());
        assert!(set.dirty_ids().is_empty());
        let entry = set.entry(task.id).expect("entry");
        assert_eq!(entry.last_synced_revision, Some(1));
        assert_eq!(
            entry.synced_copy.as_ref().map(|t| t.revision),
            Some(1),
            "synced copy is the merge base"
        );
        // Sequence survives the sync; only local mutations bump it.
        assert_eq!(entry.local_seq, 1);
    }

    #[test]
    fn exactly_one_entry_per_id() {
        let mut set = TaskSet::new();
        let mut task = task("a", 0);
        set.insert_local(task.clone());
        task.title = "b".to_string();
        set.insert_local(task.clone());
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(task.id).expect("task").title, "b");
        assert_eq!(set.local_seq(task.id), 2);
    }

    #[test]
    fn list_applies_filter_and_default_order() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let mut set = TaskSet::new();

        let mut a = task("overdue high", 0);
        a.priority = Priority::High;
        a.due_at = Some(now - Duration::hours(1));
        let mut b = task("future high", 1);
        b.priority = Priority::High;
        let mut c = task("overdue low", 2);
        c.priority = Priority::Low;
        c.due_at = Some(now - Duration::hours(2));
        let mut archived = task("gone", 3);
        archived.status = Status::Archived;

        for t in [&a, &b, &c, &archived] {
            set.insert_local(t.clone());
        }

        let listed = set.list(&TaskFilter::default(), SortOrder::Smart, now);
        let titles: Vec<&str> = listed.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["overdue high", "overdue low", "future high"]);
    }

    #[test]
    fn list_is_deterministic_for_identical_inputs() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let mut set = TaskSet::new();
        // Same created_at and priority: the id tie-break decides.
        for _ in 0..5 {
            set.insert_local(task("same", 0));
        }
        let first = set.list(&TaskFilter::default(), SortOrder::Smart, now);
        let second = set.list(&TaskFilter::default(), SortOrder::Smart, now);
        let ids =
            |tasks: &[Task]| tasks.iter().map(|t| t.id).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }
}

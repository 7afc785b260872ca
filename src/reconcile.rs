use crate::backend::PushItem;
use crate::cache::TaskSet;
use crate::models::{Task, TaskId};
use std::fmt;

/// One task queued for pushing, with the cache state needed to apply the
/// result safely afterwards.
#[derive(Debug, Clone)]
pub struct PlannedPush {
    pub item: PushItem,
    /// Mutation sequence of the cache entry when the plan was computed.
    /// Application is skipped if the entry moved on in the meantime.
    pub local_seq: u64,
    /// Whether a field-level merge against the remote copy happened.
    pub merged: bool,
}

/// Output of `plan_merge`: what to adopt, push, and drop. Computed without
/// holding any lock and without network access.
#[derive(Debug, Default)]
pub struct MergePlan {
    /// Remote copies adopted verbatim (clean local entries and new remote
    /// ids). Remote is authoritative for unmodified tasks.
    pub adopt: Vec<Task>,
    pub pushes: Vec<PlannedPush>,
    /// Clean local tasks whose remote row vanished: the deletion is adopted.
    pub remove: Vec<TaskId>,
    /// Dirty local tasks whose remote row vanished: re-created remotely so
    /// the local edit is not silently dropped.
    pub recreated: Vec<TaskId>,
}

impl MergePlan {
    pub fn is_noop(&self) -> bool {
        self.adopt.is_empty() && self.pushes.is_empty() && self.remove.is_empty()
    }
}

/// Counters for one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub fetched: usize,
    pub adopted: usize,
    pub pushed: usize,
    pub created: usize,
    pub merged: usize,
    pub removed: usize,
    pub recreated: usize,
    /// Tasks still conflicting after the bounded re-merge attempts. They
    /// stay dirty; everything else in the pass is unaffected.
    pub conflicts: Vec<TaskId>,
}

impl ReconcileReport {
    pub fn summary(&self) -> String {
        format!(
            "tasks +{} ~{} <-{} -{} | merged {} | conflicts {}",
            self.created,
            self.pushed,
            self.adopted,
            self.removed,
            self.merged,
            self.conflicts.len()
        )
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

/// Merge a freshly fetched remote snapshot against the local cache.
///
/// - id in both, local clean: adopt the remote copy outright.
/// - id in both, local dirty, remote unchanged since last sync: the local
///   edit wins whole-record and is queued for push.
/// - id in both, local dirty, remote advanced: field-level merge (see
///   `merge_fields`), queued for push.
/// - id only local without a source row: queued for creation.
/// - id only local with a source row: the remote row vanished; clean
///   entries follow the deletion, dirty entries are re-created.
/// - id only remote: adopted as a new clean task.
pub fn plan_merge(local: &TaskSet, remote: &[Task]) -> MergePlan {
    let mut plan = MergePlan::default();
    let mut seen_locally: Vec<TaskId> = Vec::new();

    for entry in local.entries() {
        let id = entry.task.id;
        seen_locally.push(id);
        let remote_task = remote.iter().find(|t| t.id == id);

        match remote_task {
            Some(remote_task) => {
                if !entry.dirty {
                    if entry.task != *remote_task {
                        plan.adopt.push(remote_task.clone());
                    }
                    continue;
                }
                if entry.last_synced_revision == Some(remote_task.revision) {
                    // Remote has not moved; local edit wins whole-record.
                    let mut task = entry.task.clone();
                    task.source_row = remote_task.source_row.clone();
                    plan.pushes.push(PlannedPush {
                        item: PushItem {
                            task,
                            base_revision: Some(remote_task.revision),
                        },
                        local_seq: entry.local_seq,
                        merged: false,
                    });
                } else {
                    let merged =
                        merge_fields(entry.synced_copy.as_ref(), &entry.task, remote_task);
                    plan.pushes.push(PlannedPush {
                        item: PushItem {
                            task: merged,
                            base_revision: Some(remote_task.revision),
                        },
                        local_seq: entry.local_seq,
                        merged: true,
                    });
                }
            }
            None => {
                if entry.task.source_row.is_none() {
                    // Never pushed: create.
                    plan.pushes.push(PlannedPush {
                        item: PushItem {
                            task: entry.task.clone(),
                            base_revision: None,
                        },
                        local_seq: entry.local_seq,
                        merged: false,
                    });
                } else if entry.dirty {
                    let mut task = entry.task.clone();
                    task.source_row = None;
                    plan.recreated.push(id);
                    plan.pushes.push(PlannedPush {
                        item: PushItem {
                            task,
                            base_revision: None,
                        },
                        local_seq: entry.local_seq,
                        merged: false,
                    });
                } else {
                    plan.remove.push(id);
                }
            }
        }
    }

    for remote_task in remote {
        if !seen_locally.contains(&remote_task.id) {
            plan.adopt.push(remote_task.clone());
        }
    }

    plan
}

/// Field-level last-writer-wins against the last-synced copy as base.
///
/// A field changed on only one side keeps that side's value, so concurrent
/// edits to different fields both survive. When both sides changed the same
/// field, the record with the later `updated_at` wins, ties going to local
/// (the user at this keyboard is the one actively editing).
pub fn merge_fields(base: Option<&Task>, local: &Task, remote: &Task) -> Task {
    let local_wins = local.updated_at >= remote.updated_at;

    fn pick<T: PartialEq + Clone>(
        base: Option<&T>,
        local: &T,
        remote: &T,
        local_wins: bool,
    ) -> T {
        if local == remote {
            return local.clone();
        }
        match base {
            Some(base) if local == base => remote.clone(),
            Some(base) if remote == base => local.clone(),
            _ => {
                if local_wins {
                    local.clone()
                } else {
                    remote.clone()
                }
            }
        }
    }

    Task {
        id: local.id,
        title: pick(base.map(|b| &b.title), &local.title, &remote.title, local_wins),
        description: pick(
            base.map(|b| &b.description),
            &local.description,
            &remote.description,
            local_wins,
        ),
        category: pick(
            base.map(|b| &b.category),
            &local.category,
            &remote.category,
            local_wins,
        ),
        status: pick(
            base.map(|b| &b.status),
            &local.status,
            &remote.status,
            local_wins,
        ),
        priority: pick(
            base.map(|b| &b.priority),
            &local.priority,
            &remote.priority,
            local_wins,
        ),
        due_at: pick(
            base.map(|b| &b.due_at),
            &local.due_at,
            &remote.due_at,
            local_wins,
        ),
        created_at: local.created_at,
        // The merge is itself one applied mutation on top of whichever side
        // ran ahead, so the timestamp moves strictly forward too.
        updated_at: local.updated_at.max(remote.updated_at) + chrono::Duration::milliseconds(1),
        revision: local.revision.max(remote.revision) + 1,
        source_row: remote.source_row.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Priority, SourceRow, Status};
    use chrono::{Duration, TimeZone, Utc};

    fn task(title: &str) -> Task {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
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

    fn synced_set(tasks: &[Task]) -> TaskSet {
        let mut set = TaskSet::new();
        for task in tasks {
            set.apply_synced(task.clone());
        }
        set
    }

    fn with_row(mut task: Task, row: &str) -> Task {
        task.source_row = Some(SourceRow(row.to_string()));
        task
    }

    #[test]
    fn synced_state_plans_nothing() {
        let remote = vec![with_row(task("a"), "1"), with_row(task("b"), "2")];
        let local = synced_set(&remote);
        let plan = plan_merge(&local, &remote);
        assert!(plan.is_noop(), "unexpected plan: {plan:?}");
    }

    #[test]
    fn clean_local_adopts_remote_change() {
        let original = with_row(task("a"), "1");
        let local = synced_set(std::slice::from_ref(&original));

        let mut remote = original.clone();
        remote.title = "renamed remotely".to_string();
        remote.touch(Utc::now());

        let plan = plan_merge(&local, &[remote.clone()]);
        assert_eq!(plan.adopt, vec![remote]);
        assert!(plan.pushes.is_empty());
    }

    #[test]
    fn local_only_task_is_queued_for_creation() {
        let mut local = TaskSet::new();
        local.insert_local(task("new"));
        let plan = plan_merge(&local, &[]);
        assert_eq!(plan.pushes.len(), 1);
        assert!(plan.pushes[0].item.base_revision.is_none());
        assert!(!plan.pushes[0].merged);
    }

    #[test]
    fn dirty_local_with_unmoved_remote_wins_whole_record() {
        let original = with_row(task("a"), "1");
        let mut local = synced_set(std::slice::from_ref(&original));

        let mut edited = original.clone();
        edited.title = "edited locally".to_string();
        edited.touch(Utc::now());
        local.insert_local(edited.clone());

        let plan = plan_merge(&local, &[original.clone()]);
        assert_eq!(plan.pushes.len(), 1);
        let push = &plan.pushes[0];
        assert_eq!(push.item.task.title, "edited locally");
        assert_eq!(push.item.base_revision, Some(original.revision));
        assert!(!push.merged);
    }

    #[test]
    fn concurrent_edits_to_different_fields_both_survive() {
        // Local edits title at T1; remote edits priority at T2 > T1, both
        // from the same base revision. Neither edit may be lost.
        let base = with_row(task("report"), "1");
        let mut local = synced_set(std::slice::from_ref(&base));

        let t1 = base.updated_at + Duration::minutes(1);
        let t2 = base.updated_at + Duration::minutes(2);

        let mut local_edit = base.clone();
        local_edit.title = "quarterly report".to_string();
        local_edit.touch(t1);
        local.insert_local(local_edit);

        let mut remote_edit = base.clone();
        remote_edit.priority = Priority::High;
        remote_edit.touch(t2);

        let plan = plan_merge(&local, &[remote_edit.clone()]);
        assert_eq!(plan.pushes.len(), 1);
        let push = &plan.pushes[0];
        assert!(push.merged);
        assert_eq!(push.item.task.title, "quarterly report");
        assert_eq!(push.item.task.priority, Priority::High);
        assert_eq!(push.item.base_revision, Some(remote_edit.revision));
        assert_eq!(
            push.item.task.revision,
            remote_edit.revision.max(1) + 1,
            "merge counts as one mutation past the leader"
        );
    }

    #[test]
    fn same_field_conflict_goes_to_the_later_writer() {
        let base = with_row(task("report"), "1");
        let t_early = base.updated_at + Duration::minutes(1);
        let t_late = base.updated_at + Duration::minutes(5);

        let mut local_edit = base.clone();
        local_edit.title = "local title".to_string();
        local_edit.touch(t_early);

        let mut remote_edit = base.clone();
        remote_edit.title = "remote title".to_string();
        remote_edit.touch(t_late);

        let merged = merge_fields(Some(&base), &local_edit, &remote_edit);
        assert_eq!(merged.title, "remote title");

        // Tie on updated_at: local wins, the user is actively editing.
        let mut remote_tie = base.clone();
        remote_tie.title = "remote title".to_string();
        remote_tie.touch(t_early);
        let merged = merge_fields(Some(&base), &local_edit, &remote_tie);
        assert_eq!(merged.title, "local title");
    }

    #[test]
    fn vanished_remote_row_drops_clean_and_recreates_dirty() {
        let kept = with_row(task("kept clean"), "1");
        let edited = with_row(task("edited"), "2");
        let mut local = synced_set(&[kept.clone(), edited.clone()]);

        let mut change = edited.clone();
        change.description = "still matters".to_string();
        change.touch(Utc::now());
        local.insert_local(change);

        let plan = plan_merge(&local, &[]);
        assert_eq!(plan.remove, vec![kept.id]);
        assert_eq!(plan.recreated, vec![edited.id]);
        assert_eq!(plan.pushes.len(), 1);
        assert!(plan.pushes[0].item.base_revision.is_none());
        assert!(
            plan.pushes[0].item.task.source_row.is_none(),
            "stale locator must not leak into the recreate"
        );
    }

    #[test]
    fn remote_only_task_is_adopted() {
        let local = TaskSet::new();
        let remote = with_row(task("from elsewhere"), "9");
        let plan = plan_merge(&local, std::slice::from_ref(&remote));
        assert_eq!(plan.adopt, vec![remote]);
    }

    #[test]
    fn report_summary_reads_like_a_sync_line() {
        let report = ReconcileReport {
            fetched: 10,
            adopted: 2,
            pushed: 3,
            created: 1,
            merged: 1,
            removed: 0,
            recreated: 0,
            conflicts: vec![],
        };
        assert_eq!(report.summary(), "tasks +1 ~3 <-2 -0 | merged 1 | conflicts 0");
    }
}

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Stable task identifier. Assigned once at creation, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Backend-specific locator for where a task lives remotely (a spreadsheet
/// row index, an object key). Opaque to the store; only the backend that
/// issued it may interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRow(pub String);

impl SourceRow {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Task status.
///
/// Legal transitions:
/// - Pending -> InProgress
/// - Pending -> Archived (cancel)
/// - InProgress -> Done
/// - InProgress -> Archived (cancel)
/// - Done -> Archived
/// - Done -> Pending (reopen)
///
/// Everything else is rejected, notably InProgress -> Pending and any
/// transition out of Archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Done,
    Archived,
}

impl Status {
    pub fn all() -> [Status; 4] {
        [
            Status::Pending,
            Status::InProgress,
            Status::Done,
            Status::Archived,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Done => "done",
            Status::Archived => "archived",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Status::Pending),
            "in_progress" => Some(Status::InProgress),
            "done" => Some(Status::Done),
            "archived" => Some(Status::Archived),
            _ => None,
        }
    }

    /// Whether moving from `self` to `to` is a legal transition.
    /// Staying on the same status is treated as a no-op, not a transition.
    pub fn can_transition(self, to: Status) -> bool {
        if self == to {
            return true;
        }
        matches!(
            (self, to),
            (Status::Pending, Status::InProgress)
                | (Status::Pending, Status::Archived)
                | (Status::InProgress, Status::Done)
                | (Status::InProgress, Status::Archived)
                | (Status::Done, Status::Archived)
                | (Status::Done, Status::Pending)
        )
    }

    /// Open tasks count toward overdue checks; Done and Archived do not.
    pub fn is_open(self) -> bool {
        matches!(self, Status::Pending | Status::InProgress)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task priority, ordered Low < Medium < High.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Priority::Low),
            "medium" => Some(Priority::Medium),
            "high" => Some(Priority::High),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    pub status: Status,
    pub priority: Priority,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
    #[serde(default)]
    pub source_row: Option<SourceRow>,
}

impl Task {
    /// Record one applied mutation: bump the revision and advance
    /// `updated_at`. The timestamp is clamped so it stays strictly
    /// monotonic even if the wall clock stepped backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        let floor = self.updated_at + Duration::milliseconds(1);
        self.updated_at = now.max(floor);
        self.revision += 1;
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open() && self.due_at.is_some_and(|due| due < now)
    }
}

/// Input for creating a task. The store assigns id, timestamps and revision.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub category: Option<String>,
    pub priority: Priority,
    pub due_at: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }
}

/// Partial update. `None` leaves a field untouched; the double-`Option`
/// fields distinguish "leave as is" from "clear".
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub category: Option<Option<String>>,
    pub priority: Option<Priority>,
    pub due_at: Option<Option<DateTime<Utc>>>,
    pub status: Option<Status>,
}

impl TaskPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.category.is_none()
            && self.priority.is_none()
            && self.due_at.is_none()
            && self.status.is_none()
    }
}

/// Predicate for `list`. Empty `statuses` means "anything except Archived"
/// unless `include_archived` is set.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub statuses: Vec<Status>,
    pub min_priority: Option<Priority>,
    pub due_before: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub include_archived: bool,
}

impl TaskFilter {
    pub fn matches(&self, task: &Task, _now: DateTime<Utc>) -> bool {
        if self.statuses.is_empty() {
            if task.status == Status::Archived && !self.include_archived {
                return false;
            }
        } else if !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(min) = self.min_priority
            && task.priority < min
        {
            return false;
        }
        if let Some(cutoff) = self.due_before {
            match task.due_at {
                Some(due) if due <= cutoff => {}
                _ => return false,
            }
        }
        if let Some(category) = &self.category
            && task.category.as_deref() != Some(category.as_str())
        {
            return false;
        }
        true
    }
}

/// Orderings for `list`. `Smart` is the user-facing default: overdue tasks
/// first, then priority descending, then due date ascending (no due date
/// sorts last), then creation order. The final id tie-break keeps the
/// ordering deterministic for identical inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Smart,
    CreatedAt,
    DueDate,
}

impl SortOrder {
    pub fn compare(self, a: &Task, b: &Task, now: DateTime<Utc>) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        let tail = |a: &Task, b: &Task| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        };
        match self {
            SortOrder::Smart => b
                .is_overdue(now)
                .cmp(&a.is_overdue(now))
                .then_with(|| b.priority.cmp(&a.priority))
                .then_with(|| cmp_due(a.due_at, b.due_at))
                .then_with(|| tail(a, b)),
            SortOrder::CreatedAt => tail(a, b),
            SortOrder::DueDate => cmp_due(a.due_at, b.due_at).then_with(|| tail(a, b)),
        }
    }
}

// Ascending by due date, tasks without one last.
fn cmp_due(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> std::cmp::Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task_at(hour: u32) -> Task {
        let created = Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap();
        Task {
            id: TaskId::new(),
            title: "test".to_string(),
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
    fn transition_table_is_exhaustive() {
        assert!(Status::Pending.can_transition(Status::InProgress));
        assert!(Status::Pending.can_transition(Status::Archived));
        assert!(Status::InProgress.can_transition(Status::Done));
        assert!(Status::InProgress.can_transition(Status::Archived));
        assert!(Status::Done.can_transition(Status::Archived));
        assert!(Status::Done.can_transition(Status::Pending));

        assert!(!Status::InProgress.can_transition(Status::Pending));
        assert!(!Status::Done.can_transition(Status::InProgress));
        assert!(!Status::Pending.can_transition(Status::Done));
        assert!(!Status::Archived.can_transition(Status::Pending));
        assert!(!Status::Archived.can_transition(Status::Done));
    }

    #[test]
    fn touch_is_strictly_monotonic_under_clock_regression() {
        let mut task = task_at(12);
        let before = task.updated_at;
        // Simulate the wall clock stepping backwards.
        task.touch(before - Duration::minutes(5));
        assert!(task.updated_at > before);
        assert_eq!(task.revision, 1);
        let mid = task.updated_at;
        task.touch(mid - Duration::seconds(1));
        assert!(task.updated_at > mid);
        assert_eq!(task.revision, 2);
    }

    #[test]
    fn overdue_only_applies_to_open_tasks() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let mut task = task_at(9);
        task.due_at = Some(now - Duration::hours(2));
        assert!(task.is_overdue(now));
        task.status = Status::Done;
        assert!(!task.is_overdue(now));
        task.status = Status::Archived;
        assert!(!task.is_overdue(now));
    }

    #[test]
    fn smart_sort_orders_overdue_then_priority_then_due() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let mut a = task_at(9);
        a.priority = Priority::High;
        a.due_at = Some(now - Duration::hours(1));
        let mut b = task_at(10);
        b.priority = Priority::High;
        let mut c = task_at(11);
        c.priority = Priority::Low;
        c.due_at = Some(now - Duration::hours(3));

        let mut tasks = vec![b.clone(), c.clone(), a.clone()];
        tasks.sort_by(|x, y| SortOrder::Smart.compare(x, y, now));
        let ids: Vec<TaskId> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![a.id, c.id, b.id]);
    }

    #[test]
    fn filter_hides_archived_unless_requested() {
        let now = Utc::now();
        let mut task = task_at(9);
        task.status = Status::Archived;
        assert!(!TaskFilter::default().matches(&task, now));

        let filter = TaskFilter {
            include_archived: true,
            ..TaskFilter::default()
        };
        assert!(filter.matches(&task, now));

        let filter = TaskFilter {
            statuses: vec![Status::Archived],
            ..TaskFilter::default()
        };
        assert!(filter.matches(&task, now));
    }

    #[test]
    fn filter_on_priority_and_due_window() {
        let now = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let mut task = task_at(9);
        task.priority = Priority::Low;
        let filter = TaskFilter {
            min_priority: Some(Priority::Medium),
            ..TaskFilter::default()
        };
        assert!(!filter.matches(&task, now));

        task.priority = Priority::High;
        assert!(filter.matches(&task, now));

        let filter = TaskFilter {
            due_before: Some(now),
            ..TaskFilter::default()
        };
        assert!(!filter.matches(&task, now), "no due date never matches a due window");
        task.due_at = Some(now - Duration::hours(1));
        assert!(filter.matches(&task, now));
    }
}

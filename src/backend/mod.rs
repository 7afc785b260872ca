use crate::models::{SourceRow, Task, TaskId};
use rand::Rng;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod object;
pub mod sheets;

pub use memory::MemoryBackend;
pub use object::ObjectStoreBackend;
pub use sheets::SheetsBackend;

/// One task queued for a remote write. `base_revision` is the remote revision
/// the caller last read for this task (`None` = create a new row/object).
/// The backend reports a conflict when the remote side no longer matches it.
#[derive(Debug, Clone)]
pub struct PushItem {
    pub task: Task,
    pub base_revision: Option<u64>,
}

/// Result of one push batch. Tasks succeed or conflict independently; a
/// whole-batch failure (network, auth) is an `Err` on the call instead.
#[derive(Debug, Default)]
pub struct PushOutcome {
    pub written: Vec<(TaskId, SourceRow)>,
    pub conflicts: Vec<TaskId>,
}

#[derive(Debug, Error)]
pub enum BackendError {
    /// Network failure or server-side error. Worth retrying with backoff.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// Rejected credentials. Never retried.
    #[error("backend authentication failed: {0}")]
    Auth(String),

    #[error("remote copy of {0} not found")]
    NotFound(TaskId),

    /// The remote payload could not be decoded into tasks.
    #[error("malformed remote data: {0}")]
    Malformed(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Uniform interface over the spreadsheet and object-storage backends.
///
/// Implementations normalize their wire shape to `Task` and hide any
/// per-call batching limits by chunking internally. `SourceRow` values are
/// minted here and must never be interpreted by callers.
pub trait RemoteBackend: Send + Sync {
    /// Short human-readable label for logs.
    fn describe(&self) -> String;

    fn fetch_all(&self) -> Result<Vec<Task>, BackendError>;

    fn push(&self, batch: &[PushItem]) -> Result<PushOutcome, BackendError>;

    fn delete(&self, id: TaskId, source_row: &SourceRow) -> Result<(), BackendError>;
}

impl<B: RemoteBackend + ?Sized> RemoteBackend for std::sync::Arc<B> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn fetch_all(&self) -> Result<Vec<Task>, BackendError> {
        (**self).fetch_all()
    }

    fn push(&self, batch: &[PushItem]) -> Result<PushOutcome, BackendError> {
        (**self).push(batch)
    }

    fn delete(&self, id: TaskId, source_row: &SourceRow) -> Result<(), BackendError> {
        (**self).delete(id, source_row)
    }
}

/// Retry schedule for transient backend failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-indexed), with up to 20%
    /// random jitter so two processes sharing a backend don't retry in
    /// lockstep.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let exact = base * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let jitter = rand::thread_rng().gen_range(0.0..=0.2);
        Duration::from_secs_f64(exact * (1.0 + jitter))
    }
}

/// Run `op`, retrying transient failures per `policy`. Auth and data errors
/// propagate immediately.
pub fn with_backoff<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut() -> Result<T, BackendError>,
) -> Result<T, BackendError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    "{label}: attempt {attempt}/{} failed ({err}), retrying in {:?}",
                    policy.max_attempts,
                    delay
                );
                std::thread::sleep(delay);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
        }
    }

    #[test]
    fn backoff_delays_grow_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
        };
        // Jitter adds at most 20%, so the bands never overlap.
        let d1 = policy.delay_for(1);
        let d2 = policy.delay_for(2);
        let d3 = policy.delay_for(3);
        assert!(d1 >= Duration::from_millis(500) && d1 <= Duration::from_millis(600));
        assert!(d2 >= Duration::from_millis(1000) && d2 <= Duration::from_millis(1200));
        assert!(d3 >= Duration::from_millis(2000) && d3 <= Duration::from_millis(2400));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0u32);
        let result = with_backoff(&fast_policy(), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(BackendError::Unavailable("flaky".to_string()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.expect("succeeds on third attempt"), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = with_backoff(&fast_policy(), "test", || {
            calls.set(calls.get() + 1);
            Err(BackendError::Unavailable("down".to_string()))
        });
        assert!(matches!(result, Err(BackendError::Unavailable(_))));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn auth_errors_are_not_retried() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = with_backoff(&fast_policy(), "test", || {
            calls.set(calls.get() + 1);
            Err(BackendError::Auth("expired token".to_string()))
        });
        assert!(matches!(result, Err(BackendError::Auth(_))));
        assert_eq!(calls.get(), 1);
    }
}

use crate::backend::BackendError;
use crate::models::{Status, TaskId};
use thiserror::Error;

/// Errors surfaced by the task store to its front ends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no task with id {0}")]
    NotFound(TaskId),

    #[error("illegal status change {from} -> {to}")]
    InvalidTransition { from: Status, to: Status },

    #[error("task title must not be empty")]
    EmptyTitle,

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl From<BackendError> for StoreError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotFound(id) => StoreError::NotFound(id),
            other => StoreError::BackendUnavailable(other.to_string()),
        }
    }
}

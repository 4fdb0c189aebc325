use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("scheduler is closed")]
    Closed,
    #[error("reconcile cancelled before stale workers exited")]
    Cancelled,
    #[error("reconcile deadline of {0:?} exceeded before stale workers exited")]
    DeadlineExceeded(Duration),
}

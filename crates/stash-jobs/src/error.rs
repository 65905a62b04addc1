use std::fmt;

/// Errors produced by the job scheduler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler saturated: {pending} jobs pending (limit {limit})")]
    Saturated { pending: usize, limit: usize },

    #[error("scheduler is stopped")]
    Stopped,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

/// A job the scheduler refused, returned to the caller untouched.
pub struct Rejected<F> {
    reason: SchedulerError,
    job: F,
}

impl<F> Rejected<F> {
    pub(crate) fn new(reason: SchedulerError, job: F) -> Self {
        Self { reason, job }
    }

    pub fn reason(&self) -> &SchedulerError {
        &self.reason
    }

    /// Take the job back, e.g. to run it inline.
    pub fn into_job(self) -> F {
        self.job
    }
}

impl<F> fmt::Debug for Rejected<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<F> fmt::Display for Rejected<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job rejected: {}", self.reason)
    }
}

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard upper bound on queued plus running jobs.
pub const DEFAULT_MAX_PENDING: usize = 200_000;

/// Configuration for the [`JobScheduler`](crate::JobScheduler).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker thread count. `None` picks [`default_worker_count`].
    pub workers: Option<usize>,
    /// Maximum number of pending jobs before enqueue is refused.
    pub max_pending: usize,
    /// How long an idle worker sleeps on the queue signal before rechecking.
    pub idle_wait_ms: u64,
    /// How long `stop` waits for each worker before abandoning it.
    pub join_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: None,
            max_pending: DEFAULT_MAX_PENDING,
            idle_wait_ms: 50,
            join_timeout_ms: 1_000,
        }
    }
}

impl SchedulerConfig {
    /// The number of workers that will actually be started (at least one).
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_worker_count).max(1)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

/// One worker per spare core, leaving a core for the simulation thread,
/// never fewer than one and never more than eight.
pub fn default_worker_count() -> usize {
    let cpus = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus.saturating_sub(1).clamp(1, 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = SchedulerConfig::default();
        assert_eq!(c.max_pending, 200_000);
        assert_eq!(c.idle_wait(), Duration::from_millis(50));
        assert!(c.workers.is_none());
    }

    #[test]
    fn default_worker_count_is_bounded() {
        let n = default_worker_count();
        assert!((1..=8).contains(&n));
    }

    #[test]
    fn explicit_zero_workers_still_starts_one() {
        let c = SchedulerConfig {
            workers: Some(0),
            ..Default::default()
        };
        assert_eq!(c.worker_count(), 1);
    }
}

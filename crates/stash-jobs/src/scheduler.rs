use std::any::Any;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{Rejected, SchedulerError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Poll interval used while waiting for workers to finish.
const JOIN_POLL: Duration = Duration::from_millis(1);

/// State shared between the scheduler handle and its workers.
struct Shared {
    queue: Mutex<VecDeque<Job>>,
    signal: Condvar,
    /// Queued plus currently executing jobs.
    pending: AtomicUsize,
    running: AtomicBool,
    max_pending: usize,
    idle_wait: Duration,
    executed: AtomicU64,
    panicked: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time counters for a [`JobScheduler`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub workers: usize,
    pub pending: usize,
    pub executed: u64,
    pub panicked: u64,
    pub rejected: u64,
}

/// Bounded pool of persistent worker threads for fire-and-forget jobs.
///
/// - `try_enqueue` never blocks; above `max_pending` the job is returned.
/// - A panicking job is logged and swallowed; the worker keeps running.
/// - There is no per-job cancellation. `stop` shuts the whole pool down,
///   waiting a bounded time for each worker and abandoning stragglers.
pub struct JobScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    join_timeout: Duration,
}

impl JobScheduler {
    /// Start the pool described by `config`.
    pub fn new(config: &SchedulerConfig) -> Result<Self, SchedulerError> {
        let worker_count = config.worker_count();
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
            pending: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            max_pending: config.max_pending,
            idle_wait: config.idle_wait(),
            executed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        });

        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("stash-job-{index}"))
                .spawn(move || worker_loop(worker_shared, index));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Tear down whatever did start before reporting.
                    shared.running.store(false, Ordering::Release);
                    shared.signal.notify_all();
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(SchedulerError::Spawn(e.to_string()));
                }
            }
        }

        info!(
            workers = worker_count,
            max_pending = config.max_pending,
            "job scheduler started"
        );

        Ok(Self {
            shared,
            workers: Mutex::new(handles),
            worker_count,
            join_timeout: config.join_timeout(),
        })
    }

    /// Queue `job` for background execution.
    ///
    /// Returns the job inside [`Rejected`] when the pool is stopped or the
    /// pending bound would be exceeded. The caller decides whether to run it
    /// inline or skip it.
    pub fn try_enqueue<F>(&self, job: F) -> Result<(), Rejected<F>>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(Rejected::new(SchedulerError::Stopped, job));
        }

        let pending = self.shared.pending.fetch_add(1, Ordering::AcqRel) + 1;
        if pending > self.shared.max_pending {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            self.shared.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                pending = pending - 1,
                limit = self.shared.max_pending,
                "job scheduler saturated"
            );
            return Err(Rejected::new(
                SchedulerError::Saturated {
                    pending: pending - 1,
                    limit: self.shared.max_pending,
                },
                job,
            ));
        }

        let mut queue = self
            .shared
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // `stop` drains the queue under this lock after clearing `running`,
        // so a job pushed here is either drained or runs.
        if !self.shared.running.load(Ordering::Acquire) {
            drop(queue);
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Rejected::new(SchedulerError::Stopped, job));
        }
        queue.push_back(Box::new(job));
        drop(queue);
        self.shared.signal.notify_one();
        Ok(())
    }

    /// Jobs queued or currently executing.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            workers: self.worker_count,
            pending: self.pending(),
            executed: self.shared.executed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
        }
    }

    /// Wait until every pending job has finished, up to `timeout`.
    ///
    /// Returns `true` if the pool went idle in time.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(JOIN_POLL);
        }
        true
    }

    /// Stop the pool.
    ///
    /// Workers finish the job they are running, if any; queued jobs are
    /// dropped. Each worker gets `join_timeout` to exit before it is
    /// abandoned. Calling `stop` more than once is harmless.
    pub fn stop(&self) {
        let was_running = self.shared.running.swap(false, Ordering::AcqRel);
        self.shared.signal.notify_all();

        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if !was_running && handles.is_empty() {
            return;
        }

        let mut abandoned = 0usize;
        for handle in handles {
            let deadline = Instant::now() + self.join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                self.shared.signal.notify_all();
                thread::sleep(JOIN_POLL);
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                abandoned += 1;
            }
        }

        let dropped = {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            self.shared.pending.fetch_sub(dropped, Ordering::AcqRel);
        }

        if abandoned > 0 {
            warn!(abandoned, dropped, "job scheduler stopped with unjoined workers");
        } else {
            info!(dropped, "job scheduler stopped");
        }
    }
}

impl Drop for JobScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for JobScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobScheduler")
            .field("workers", &self.worker_count)
            .field("pending", &self.pending())
            .field("running", &self.is_running())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "job worker started");

    while shared.running.load(Ordering::Acquire) {
        let job = {
            let mut queue = shared.queue.lock().unwrap_or_else(PoisonError::into_inner);
            match queue.pop_front() {
                Some(job) => Some(job),
                None => {
                    let (mut queue, _) = shared
                        .signal
                        .wait_timeout(queue, shared.idle_wait)
                        .unwrap_or_else(PoisonError::into_inner);
                    if shared.running.load(Ordering::Acquire) {
                        queue.pop_front()
                    } else {
                        None
                    }
                }
            }
        };

        let Some(job) = job else {
            continue;
        };

        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => {
                shared.executed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                shared.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    worker = index,
                    panic = %panic_message(payload.as_ref()),
                    "background job panicked"
                );
            }
        }
        shared.pending.fetch_sub(1, Ordering::AcqRel);
    }

    debug!(worker = index, "job worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

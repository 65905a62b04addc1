//! Claim checks: whether a buffered stack is reserved by a live task.
//!
//! The overflow cycle and worker extraction both skip stacks a worker has
//! claimed. A claim only counts while the claiming task is still the
//! worker's current task or sits in its queue; anything else is a stale
//! reservation and does not protect the stack.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use stash_types::{ItemHandle, TaskId, WorkerId};

/// Host-supplied view of item reservations.
pub trait TaskClaimChecker {
    /// True if `item` is reserved by a task that is still current or queued.
    fn is_still_claimed(&self, item: ItemHandle) -> bool;
}

/// Checker for hosts without reservations: nothing is ever claimed.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoClaims;

impl TaskClaimChecker for NoClaims {
    fn is_still_claimed(&self, _item: ItemHandle) -> bool {
        false
    }
}

impl<F> TaskClaimChecker for F
where
    F: Fn(ItemHandle) -> bool,
{
    fn is_still_claimed(&self, item: ItemHandle) -> bool {
        self(item)
    }
}

/// A reservation held on one item.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub worker: WorkerId,
    pub task: TaskId,
}

#[derive(Debug, Default)]
struct WorkerTasks {
    current: Option<TaskId>,
    queued: VecDeque<TaskId>,
}

impl WorkerTasks {
    fn holds(&self, task: TaskId) -> bool {
        self.current == Some(task) || self.queued.contains(&task)
    }
}

/// In-memory reservation table usable as a [`TaskClaimChecker`].
///
/// Tracks which worker reserved which item for which task, and each
/// worker's current and queued tasks.
#[derive(Debug, Default)]
pub struct ReservationBook {
    reservations: HashMap<ItemHandle, Reservation>,
    workers: HashMap<WorkerId, WorkerTasks>,
}

impl ReservationBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `item` for `task`. Returns the reservation it replaced.
    pub fn reserve(
        &mut self,
        item: ItemHandle,
        worker: WorkerId,
        task: TaskId,
    ) -> Option<Reservation> {
        self.reservations.insert(item, Reservation { worker, task })
    }

    pub fn release(&mut self, item: ItemHandle) -> Option<Reservation> {
        self.reservations.remove(&item)
    }

    /// Drop every reservation held for `task`. Returns how many were dropped.
    pub fn release_task(&mut self, task: TaskId) -> usize {
        let before = self.reservations.len();
        self.reservations.retain(|_, r| r.task != task);
        before - self.reservations.len()
    }

    pub fn reservation(&self, item: ItemHandle) -> Option<Reservation> {
        self.reservations.get(&item).copied()
    }

    pub fn set_current_task(&mut self, worker: WorkerId, task: Option<TaskId>) {
        self.workers.entry(worker).or_default().current = task;
    }

    pub fn enqueue_task(&mut self, worker: WorkerId, task: TaskId) {
        self.workers.entry(worker).or_default().queued.push_back(task);
    }

    /// Mark `task` finished for `worker` and release its reservations.
    ///
    /// If it was the current task the next queued task becomes current.
    pub fn finish_task(&mut self, worker: WorkerId, task: TaskId) -> usize {
        if let Some(tasks) = self.workers.get_mut(&worker) {
            if tasks.current == Some(task) {
                tasks.current = tasks.queued.pop_front();
            } else {
                tasks.queued.retain(|t| *t != task);
            }
        }
        self.release_task(task)
    }

    pub fn current_task(&self, worker: WorkerId) -> Option<TaskId> {
        self.workers.get(&worker).and_then(|t| t.current)
    }

    /// Drop reservations whose task is neither current nor queued.
    pub fn prune_stale(&mut self) -> usize {
        let workers = &self.workers;
        let before = self.reservations.len();
        self.reservations.retain(|_, r| {
            workers
                .get(&r.worker)
                .is_some_and(|tasks| tasks.holds(r.task))
        });
        let pruned = before - self.reservations.len();
        if pruned > 0 {
            debug!(pruned, "pruned stale reservations");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }
}

impl TaskClaimChecker for ReservationBook {
    fn is_still_claimed(&self, item: ItemHandle) -> bool {
        let Some(r) = self.reservations.get(&item) else {
            return false;
        };
        self.workers
            .get(&r.worker)
            .is_some_and(|tasks| tasks.holds(r.task))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: WorkerId = WorkerId(1);

    #[test]
    fn no_claims_and_closures() {
        assert!(!NoClaims.is_still_claimed(ItemHandle(1)));
        let only_seven = |h: ItemHandle| h == ItemHandle(7);
        assert!(only_seven.is_still_claimed(ItemHandle(7)));
        assert!(!only_seven.is_still_claimed(ItemHandle(8)));
    }

    #[test]
    fn claim_holds_for_current_and_queued_tasks() {
        let mut book = ReservationBook::new();
        book.set_current_task(W, Some(TaskId(10)));
        book.enqueue_task(W, TaskId(11));
        book.reserve(ItemHandle(1), W, TaskId(10));
        book.reserve(ItemHandle(2), W, TaskId(11));

        assert!(book.is_still_claimed(ItemHandle(1)));
        assert!(book.is_still_claimed(ItemHandle(2)));
        assert!(!book.is_still_claimed(ItemHandle(3)));
    }

    #[test]
    fn stale_reservation_does_not_protect() {
        let mut book = ReservationBook::new();
        book.set_current_task(W, Some(TaskId(10)));
        book.reserve(ItemHandle(1), W, TaskId(10));

        // The worker moved on without releasing.
        book.set_current_task(W, Some(TaskId(20)));
        assert!(book.reservation(ItemHandle(1)).is_some());
        assert!(!book.is_still_claimed(ItemHandle(1)));

        assert_eq!(book.prune_stale(), 1);
        assert!(book.is_empty());
    }

    #[test]
    fn unknown_worker_never_claims() {
        let mut book = ReservationBook::new();
        book.reserve(ItemHandle(1), WorkerId(99), TaskId(1));
        assert!(!book.is_still_claimed(ItemHandle(1)));
    }

    #[test]
    fn finishing_promotes_the_next_task() {
        let mut book = ReservationBook::new();
        book.set_current_task(W, Some(TaskId(1)));
        book.enqueue_task(W, TaskId(2));
        book.reserve(ItemHandle(1), W, TaskId(1));
        book.reserve(ItemHandle(2), W, TaskId(2));

        assert_eq!(book.finish_task(W, TaskId(1)), 1);
        assert_eq!(book.current_task(W), Some(TaskId(2)));
        assert!(book.is_still_claimed(ItemHandle(2)));
        assert_eq!(book.len(), 1);

        book.enqueue_task(W, TaskId(3));
        book.finish_task(W, TaskId(3));
        assert_eq!(book.current_task(W), Some(TaskId(2)));
    }
}

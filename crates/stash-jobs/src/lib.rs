//! Background job execution for stash.
//!
//! The scheduler is a fixed pool of persistent worker threads draining a
//! shared queue. It knows nothing about ledgers or items: callers hand it
//! closures and, when they need results back on their own thread, a
//! [`CommitQueue`] to push them into.
//!
//! Enqueueing never blocks. Once the pending bound is reached the job is
//! handed back inside a [`Rejected`] so the caller can run it inline or
//! defer it.

pub mod config;
pub mod error;
pub mod handoff;
pub mod scheduler;

pub use config::{default_worker_count, SchedulerConfig};
pub use error::{Rejected, SchedulerError};
pub use handoff::CommitQueue;
pub use scheduler::{JobScheduler, SchedulerStats};

//! Virtual ledger for stash.
//!
//! A ledger replaces real item stacks with aggregate records: one record per
//! identity group, holding a quantity, an averaged durability, and (for
//! materials with quality) the worst tier merged into it. This crate provides:
//! - [`AggregateRecord`] and the merge rule between batches and records
//! - [`VirtualLedger`] with insert / extract / deduct / query operations
//! - Group-based capacity with attachable expansion modules
//! - [`LedgerSnapshot`] save layout and index-rebuilding restore

pub mod config;
pub mod error;
pub mod ledger;
pub mod record;
pub mod snapshot;

pub use config::{LedgerConfig, QualityMerge};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{InsertOutcome, VirtualLedger};
pub use record::AggregateRecord;
pub use snapshot::{LedgerSnapshot, Recovery, RecordState, RestoreReport};

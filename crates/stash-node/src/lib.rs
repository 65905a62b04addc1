//! Storage nodes for stash.
//!
//! A [`StorageNode`] pairs a [`stash_ledger::VirtualLedger`] with a small
//! [`PhysicalBuffer`] of real stacks that workers can walk up to and grab.
//! This crate provides:
//! - Top-up and overflow cycles that keep the buffer near its per-group
//!   target ([`ReservedBufferManager`])
//! - Overflow planning that can run on a [`stash_jobs::JobScheduler`]
//!   worker and is committed on the owning thread ([`DemotionPlan`])
//! - Buffer-first withdrawals with per-task tracking of ledger units
//!   ([`ExtractionProtocol`])
//! - Claim checks with a stale-reservation rule ([`TaskClaimChecker`],
//!   [`ReservationBook`])
//! - Node save files in JSON or bincode ([`NodeSave`])

pub mod buffer;
pub mod claims;
pub mod config;
pub mod demotion;
pub mod error;
pub mod extraction;
pub mod node;
pub mod persist;
pub mod reserved;

pub use buffer::{HandleAllocator, ItemStack, PhysicalBuffer};
pub use claims::{NoClaims, Reservation, ReservationBook, TaskClaimChecker};
pub use config::NodeConfig;
pub use demotion::{plan_demotion, DemotionEntry, DemotionPlan, StackSnapshot, StackTake};
pub use error::{NodeError, NodeResult};
pub use extraction::{CancelReport, ExtractionProtocol, Withdrawal};
pub use node::{Decommissioned, StorageNode};
pub use persist::NodeSave;
pub use reserved::{
    CycleReport, DemotionReport, NodeStock, OverflowScan, ReservedBufferManager, ReservedStats,
    TopUpReport,
};

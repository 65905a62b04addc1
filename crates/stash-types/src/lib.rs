//! Foundation types for stash.
//!
//! This crate provides the vocabulary shared by every other stash crate:
//! what a material is, how item identities are formed, and the batch type
//! that moves between the physical world and the virtual ledger.
//!
//! # Key Types
//!
//! - [`MaterialId`]: Host-defined material identifier (a def name)
//! - [`QualityTier`]: Ordered quality grade; merging degrades to the lower tier
//! - [`MaterialDef`] / [`MaterialCatalog`]: Per-material stacking and quality traits
//! - [`ItemKey`]: Identity of a stack: (material, sub-material, quality)
//! - [`ItemFilter`]: Wildcard-capable selector over item identities
//! - [`ItemBatch`]: A counted quantity of one identity with averaged durability
//! - [`BatchSource`]: Whether a materialized batch came from the buffer or a ledger
//! - [`NodeId`], [`RegionId`], [`TaskId`], [`WorkerId`], [`ItemHandle`]: Identifiers

pub mod error;
pub mod ids;
pub mod item;
pub mod material;

pub use error::TypeError;
pub use ids::{ItemHandle, NodeId, RegionId, TaskId, WorkerId};
pub use item::{weighted_durability, BatchSource, ItemBatch, ItemFilter, ItemKey};
pub use material::{MaterialCatalog, MaterialDef, MaterialId, QualityTier, DEFAULT_STACK_LIMIT};

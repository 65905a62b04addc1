use thiserror::Error;

use crate::item::ItemKey;

/// Errors produced by type operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypeError {
    #[error("unknown quality tier: {0}")]
    UnknownQuality(String),

    #[error("cannot merge {found} into {expected}")]
    IdentityMismatch { expected: ItemKey, found: ItemKey },

    #[error("cannot split {requested} units from a batch of {available}")]
    InvalidSplit { requested: u32, available: u32 },

    #[error("invalid material definition for {material}: {reason}")]
    InvalidDefinition { material: String, reason: String },
}

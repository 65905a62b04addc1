/// Errors produced by ledger operations.
///
/// None of these are fatal: every caller has a defined fallback (leave the
/// item where it is, fail the task and retry later, and so on).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient stock for {filter}: requested {requested}, largest matching record holds {largest}")]
    InsufficientStock {
        filter: String,
        requested: u32,
        largest: u64,
    },

    #[error("capacity exceeded: {records} groups stored, capacity {capacity}")]
    CapacityExceeded { records: usize, capacity: usize },

    #[error("batch is empty")]
    EmptyBatch,

    #[error("expansion module not attached: {0}")]
    UnknownExpansion(String),
}

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;

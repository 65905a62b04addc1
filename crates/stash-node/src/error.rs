use stash_ledger::LedgerError;
use stash_types::{NodeId, TypeError};

/// Errors produced by storage node operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Neither the buffer nor the ledger can satisfy the request for a
    /// single identity. The caller's task simply does not start.
    #[error("no supply for {filter}: requested {requested}")]
    NoSupply { filter: String, requested: u32 },

    #[error("node {0} is inactive")]
    Inactive(NodeId),

    #[error("requested zero units")]
    EmptyRequest,

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

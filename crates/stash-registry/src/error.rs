use stash_types::{NodeId, RegionId};

/// Errors produced by the registry and configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("node {node} is registered in {registered}, not {requested}")]
    RegionConflict {
        node: NodeId,
        registered: RegionId,
        requested: RegionId,
    },

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("invalid config: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config encoding error: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

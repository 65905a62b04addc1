//! Network-wide view of stash storage nodes.
//!
//! [`StorageNetworkRegistry`] tracks which nodes exist in which region and
//! answers "who can supply this" across them. It is an ordinary value owned
//! by the host, shared by reference; there is no global instance.
//!
//! [`StashConfig`] gathers the scheduler, node, and registry settings plus the
//! material catalog into one TOML-loadable document.

pub mod config;
pub mod error;
pub mod registry;

pub use config::{RegistryConfig, StashConfig};
pub use error::{RegistryError, RegistryResult};
pub use registry::{read_node, write_node, NetworkTick, NodeRef, StorageNetworkRegistry};

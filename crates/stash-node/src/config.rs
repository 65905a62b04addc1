use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use stash_ledger::LedgerConfig;
use stash_types::MaterialId;

/// Configuration shared by every storage node.
///
/// Intervals are in simulation ticks (60 ticks per simulated second).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub ledger: LedgerConfig,
    /// Real units of each identity to keep near the node.
    pub reserved_target: u32,
    /// Per-material replacements for `reserved_target`.
    pub target_overrides: BTreeMap<MaterialId, u32>,
    /// Ticks between top-up cycles.
    pub topup_interval: u64,
    /// Ticks between overflow cycles.
    pub overflow_interval: u64,
    /// Buffers with more stacks than this are scanned on the job scheduler.
    pub inline_demotion_limit: usize,
    /// Log per-cycle summaries at info level.
    pub diagnostics: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            reserved_target: 75,
            target_overrides: BTreeMap::new(),
            topup_interval: 60,
            overflow_interval: 300,
            inline_demotion_limit: 32,
            diagnostics: false,
        }
    }
}

impl NodeConfig {
    pub fn target_for(&self, material: &MaterialId) -> u32 {
        self.target_overrides
            .get(material)
            .copied()
            .unwrap_or(self.reserved_target)
    }
}

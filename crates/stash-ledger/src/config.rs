use serde::{Deserialize, Serialize};

/// How quality tiers are treated when batches of one kind meet in the ledger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMerge {
    /// Different tiers share one group; the group keeps the lowest tier.
    #[default]
    DegradeToLowest,
    /// Each tier is its own group.
    Strict,
}

/// Configuration for a [`VirtualLedger`](crate::VirtualLedger).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Groups a ledger can hold before any expansion module is attached.
    pub base_capacity: usize,
    pub quality_merge: QualityMerge,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_capacity: 100,
            quality_merge: QualityMerge::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let c = LedgerConfig::default();
        assert_eq!(c.base_capacity, 100);
        assert_eq!(c.quality_merge, QualityMerge::DegradeToLowest);
    }

    #[test]
    fn quality_merge_uses_snake_case() {
        let json = serde_json::to_string(&QualityMerge::DegradeToLowest).unwrap();
        assert_eq!(json, "\"degrade_to_lowest\"");
    }
}

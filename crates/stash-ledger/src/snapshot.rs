use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use stash_types::{ItemKey, MaterialId, QualityTier};

use crate::config::LedgerConfig;
use crate::ledger::VirtualLedger;
use crate::record::AggregateRecord;

/// Saved form of one record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordState {
    pub material: MaterialId,
    #[serde(default)]
    pub stuff: Option<MaterialId>,
    #[serde(default)]
    pub quality: Option<QualityTier>,
    pub quantity: u64,
    #[serde(default)]
    pub durability: f32,
}

/// Saved form of a ledger.
///
/// Only the record list is authoritative. The group index is never saved;
/// restore rebuilds it from the records.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub records: Vec<RecordState>,
    #[serde(default)]
    pub expansions: BTreeMap<String, usize>,
}

/// Something restore had to repair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recovery {
    /// A saved record with zero quantity was dropped.
    DroppedEmptyRecord { key: ItemKey },
    /// Two saved records fall into the same group. Both are kept.
    DuplicateGroup { key: ItemKey },
    /// More groups were saved than capacity allows. All are kept; new groups
    /// are refused until the count drops.
    OverCapacity { records: usize, capacity: usize },
}

/// Outcome of [`VirtualLedger::restore`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: usize,
    pub recoveries: Vec<Recovery>,
}

impl RestoreReport {
    /// True when the saved state needed no repair.
    pub fn is_clean(&self) -> bool {
        self.recoveries.is_empty()
    }
}

impl VirtualLedger {
    /// Capture the record list and attached expansions.
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            records: self
                .records()
                .iter()
                .map(|r| RecordState {
                    material: r.key().material.clone(),
                    stuff: r.key().stuff.clone(),
                    quality: r.key().quality,
                    quantity: r.quantity(),
                    durability: r.durability(),
                })
                .collect(),
            expansions: self.expansions().clone(),
        }
    }

    /// Rebuild a ledger from a snapshot.
    ///
    /// Inconsistent saved state is repaired in place and reported rather
    /// than rejected: material is never discarded on load.
    pub fn restore(config: LedgerConfig, snapshot: LedgerSnapshot) -> (Self, RestoreReport) {
        let mut ledger = VirtualLedger::new(config);
        let mut report = RestoreReport::default();

        *ledger.expansions_mut() = snapshot.expansions;

        for state in snapshot.records {
            let key = ItemKey {
                material: state.material,
                stuff: state.stuff,
                quality: state.quality,
            };
            if state.quantity == 0 {
                report.recoveries.push(Recovery::DroppedEmptyRecord { key });
                continue;
            }
            ledger.push_restored(AggregateRecord::from_parts(
                key,
                state.quantity,
                state.durability,
            ));
            report.restored += 1;
        }

        for key in ledger.rebuild_index() {
            report.recoveries.push(Recovery::DuplicateGroup { key });
        }

        if ledger.record_count() > ledger.capacity() {
            report.recoveries.push(Recovery::OverCapacity {
                records: ledger.record_count(),
                capacity: ledger.capacity(),
            });
        }

        if !report.is_clean() {
            warn!(
                restored = report.restored,
                repairs = report.recoveries.len(),
                "recovered inconsistent ledger state on load"
            );
        }

        (ledger, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QualityMerge;
    use crate::error::LedgerError;
    use stash_types::{ItemBatch, ItemFilter};

    fn state(material: &str, quantity: u64) -> RecordState {
        RecordState {
            material: material.into(),
            stuff: None,
            quality: None,
            quantity,
            durability: 0.0,
        }
    }

    #[test]
    fn snapshot_restore_preserves_records() {
        let mut ledger = VirtualLedger::default();
        ledger
            .insert(ItemBatch::new(ItemKey::new("Steel"), 40))
            .unwrap();
        ledger
            .insert(
                ItemBatch::new(
                    ItemKey::new("Parka")
                        .with_stuff("Cloth")
                        .with_quality(QualityTier::Good),
                    2,
                )
                .with_durability(75.0),
            )
            .unwrap();
        ledger.attach_expansion("shelf", 10);

        let snapshot = ledger.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: LedgerSnapshot = serde_json::from_str(&json).unwrap();

        let (restored, report) = VirtualLedger::restore(LedgerConfig::default(), parsed);
        assert!(report.is_clean());
        assert_eq!(report.restored, 2);
        assert_eq!(restored.records(), ledger.records());
        assert_eq!(restored.capacity(), 110);
        assert_eq!(
            restored.group_quantity(&ItemKey::new("Parka").with_stuff("Cloth")),
            2
        );
    }

    #[test]
    fn restore_drops_empty_records_and_rebuilds_index() {
        let snapshot = LedgerSnapshot {
            records: vec![state("Wood", 0), state("Steel", 5)],
            expansions: BTreeMap::new(),
        };
        let (mut ledger, report) = VirtualLedger::restore(LedgerConfig::default(), snapshot);

        assert_eq!(
            report.recoveries,
            vec![Recovery::DroppedEmptyRecord {
                key: ItemKey::new("Wood")
            }]
        );
        assert_eq!(ledger.record_count(), 1);
        // The index must point at Steel's new position.
        assert_eq!(ledger.extract_exact(&ItemKey::new("Steel"), 5).unwrap().count, 5);
    }

    #[test]
    fn restore_keeps_duplicate_groups() {
        let snapshot = LedgerSnapshot {
            records: vec![state("Steel", 3), state("Steel", 4)],
            expansions: BTreeMap::new(),
        };
        let (mut ledger, report) = VirtualLedger::restore(
            LedgerConfig {
                base_capacity: 10,
                quality_merge: QualityMerge::Strict,
            },
            snapshot,
        );

        assert_eq!(
            report.recoveries,
            vec![Recovery::DuplicateGroup {
                key: ItemKey::new("Steel")
            }]
        );
        assert_eq!(ledger.query(&"Steel".into(), None), 7);
        // Single-record extraction cannot combine the two.
        assert!(ledger.extract(&ItemFilter::material("Steel"), 6).is_err());
        assert_eq!(ledger.extract(&ItemFilter::material("Steel"), 4).unwrap().count, 4);
    }

    #[test]
    fn exact_extract_reaches_past_a_short_duplicate() {
        let snapshot = LedgerSnapshot {
            records: vec![state("Steel", 3), state("Steel", 10)],
            expansions: BTreeMap::new(),
        };
        let (mut ledger, report) = VirtualLedger::restore(LedgerConfig::default(), snapshot);
        assert!(!report.is_clean());

        let steel = ItemKey::new("Steel");
        assert_eq!(ledger.largest_in_group(&steel), 10);
        assert_eq!(ledger.extract_exact(&steel, 5).unwrap().count, 5);
        assert_eq!(ledger.query(&"Steel".into(), None), 8);

        match ledger.extract_exact(&steel, 6) {
            Err(LedgerError::InsufficientStock { largest, .. }) => assert_eq!(largest, 5),
            other => panic!("expected insufficient stock, got {other:?}"),
        }
    }

    #[test]
    fn restore_reports_over_capacity_without_dropping() {
        let snapshot = LedgerSnapshot {
            records: vec![state("A", 1), state("B", 1), state("C", 1)],
            expansions: BTreeMap::new(),
        };
        let (ledger, report) = VirtualLedger::restore(
            LedgerConfig {
                base_capacity: 2,
                ..Default::default()
            },
            snapshot,
        );

        assert_eq!(
            report.recoveries,
            vec![Recovery::OverCapacity {
                records: 3,
                capacity: 2
            }]
        );
        assert_eq!(ledger.record_count(), 3);
        assert!(!ledger.accepts(&ItemBatch::new(ItemKey::new("D"), 1)));
        assert!(ledger.accepts(&ItemBatch::new(ItemKey::new("A"), 1)));
    }
}

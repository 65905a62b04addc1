//! Overflow planning.
//!
//! A plan is computed from an owned snapshot of a node's buffer, so it can
//! run on a background worker. It never touches the ledger or the buffer;
//! the owning node re-validates and applies it on the simulation thread.

use std::collections::{BTreeMap, HashMap};

use stash_types::{ItemHandle, ItemKey, NodeId};

/// One buffered stack as seen when the overflow scan started.
#[derive(Clone, Debug, PartialEq)]
pub struct StackSnapshot {
    pub handle: ItemHandle,
    pub key: ItemKey,
    /// Ledger group the stack would merge into.
    pub group: ItemKey,
    pub count: u32,
    /// Reserved by a live task at scan time.
    pub claimed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackTake {
    pub handle: ItemHandle,
    pub count: u32,
}

/// Units to move from the buffer into one ledger group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemotionEntry {
    pub group: ItemKey,
    pub takes: Vec<StackTake>,
}

impl DemotionEntry {
    pub fn units(&self) -> u64 {
        self.takes.iter().map(|t| u64::from(t.count)).sum()
    }
}

/// Result of an overflow scan, handed back to the owning node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DemotionPlan {
    pub node: NodeId,
    pub entries: Vec<DemotionEntry>,
}

impl DemotionPlan {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn units(&self) -> u64 {
        self.entries.iter().map(DemotionEntry::units).sum()
    }
}

/// Decide which unclaimed stacks to demote so each group drops to its target.
///
/// Claimed stacks count toward the physical total but are never taken.
/// Smaller stacks go first, then lower handles, so partially used stacks
/// are consolidated before full ones are touched.
pub fn plan_demotion(
    node: NodeId,
    stacks: Vec<StackSnapshot>,
    targets: &HashMap<ItemKey, u32>,
) -> DemotionPlan {
    let mut groups: BTreeMap<ItemKey, Vec<StackSnapshot>> = BTreeMap::new();
    for stack in stacks {
        groups.entry(stack.group.clone()).or_default().push(stack);
    }

    let mut entries = Vec::new();
    for (group, mut stacks) in groups {
        let physical: u64 = stacks.iter().map(|s| u64::from(s.count)).sum();
        let target = u64::from(targets.get(&group).copied().unwrap_or(0));
        let mut excess = physical.saturating_sub(target);
        if excess == 0 {
            continue;
        }

        stacks.retain(|s| !s.claimed && s.count > 0);
        stacks.sort_by_key(|s| (s.count, s.handle));

        let mut takes = Vec::new();
        for stack in stacks {
            if excess == 0 {
                break;
            }
            let count = u64::from(stack.count).min(excess) as u32;
            excess -= u64::from(count);
            takes.push(StackTake {
                handle: stack.handle,
                count,
            });
        }
        if !takes.is_empty() {
            entries.push(DemotionEntry { group, takes });
        }
    }

    DemotionPlan { node, entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn snap(handle: u64, material: &str, count: u32, claimed: bool) -> StackSnapshot {
        StackSnapshot {
            handle: ItemHandle(handle),
            key: ItemKey::new(material),
            group: ItemKey::new(material),
            count,
            claimed,
        }
    }

    fn targets(pairs: &[(&str, u32)]) -> HashMap<ItemKey, u32> {
        pairs
            .iter()
            .map(|(m, t)| (ItemKey::new(*m), *t))
            .collect()
    }

    #[test]
    fn demotes_only_the_excess() {
        let plan = plan_demotion(
            NodeId::new(),
            vec![snap(1, "Wood", 75, false), snap(2, "Wood", 75, false)],
            &targets(&[("Wood", 75)]),
        );
        assert_eq!(plan.units(), 75);
        assert_eq!(plan.entries[0].takes.len(), 1);
    }

    #[test]
    fn smallest_stacks_go_first() {
        let plan = plan_demotion(
            NodeId::new(),
            vec![
                snap(1, "Wood", 75, false),
                snap(2, "Wood", 10, false),
                snap(3, "Wood", 20, false),
            ],
            &targets(&[("Wood", 70)]),
        );
        let takes = &plan.entries[0].takes;
        assert_eq!(
            takes,
            &vec![
                StackTake {
                    handle: ItemHandle(2),
                    count: 10
                },
                StackTake {
                    handle: ItemHandle(3),
                    count: 20
                },
                StackTake {
                    handle: ItemHandle(1),
                    count: 5
                },
            ]
        );
    }

    #[test]
    fn claimed_stacks_count_but_stay() {
        let plan = plan_demotion(
            NodeId::new(),
            vec![snap(1, "Wood", 100, true), snap(2, "Wood", 30, false)],
            &targets(&[("Wood", 75)]),
        );
        // Excess is 55 but only 30 units are free to move.
        assert_eq!(plan.units(), 30);
        assert_eq!(plan.entries[0].takes[0].handle, ItemHandle(2));
    }

    #[test]
    fn groups_at_or_below_target_are_skipped() {
        let plan = plan_demotion(
            NodeId::new(),
            vec![snap(1, "Wood", 75, false), snap(2, "Steel", 10, false)],
            &targets(&[("Wood", 75), ("Steel", 75)]),
        );
        assert!(plan.is_empty());
    }

    proptest! {
        #[test]
        fn plan_never_overshoots_or_touches_claims(
            stacks in proptest::collection::vec((1u32..=75, any::<bool>()), 0..40),
            target in 0u32..300,
        ) {
            let snaps: Vec<StackSnapshot> = stacks
                .iter()
                .enumerate()
                .map(|(i, (count, claimed))| snap(i as u64, "Wood", *count, *claimed))
                .collect();
            let physical: u64 = snaps.iter().map(|s| u64::from(s.count)).sum();
            let free: u64 = snaps.iter().filter(|s| !s.claimed).map(|s| u64::from(s.count)).sum();

            let plan = plan_demotion(NodeId::new(), snaps.clone(), &targets(&[("Wood", target)]));
            let excess = physical.saturating_sub(u64::from(target));
            prop_assert_eq!(plan.units(), excess.min(free));

            for entry in &plan.entries {
                for take in &entry.takes {
                    let source = &snaps[take.handle.get() as usize];
                    prop_assert!(!source.claimed);
                    prop_assert!(take.count <= source.count);
                }
            }
        }
    }
}

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace};

use stash_types::{ItemBatch, ItemFilter, ItemKey, MaterialId};

use crate::config::{LedgerConfig, QualityMerge};
use crate::error::{LedgerError, LedgerResult};
use crate::record::AggregateRecord;

/// What an accepted insert did to the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Folded into an existing group; no capacity consumed.
    Merged { quantity: u64 },
    /// Started a new group.
    Created,
}

/// Aggregated item store for one storage node.
///
/// Records live in insertion order; `index` maps each identity group to the
/// position of its record so merges are O(1). The index is derived data and
/// is rebuilt from `records` whenever positions shift or state is restored.
///
/// Capacity is counted in groups, not units: merging into an existing group
/// is always allowed, a new group needs `record_count() < capacity()`.
#[derive(Clone, Debug)]
pub struct VirtualLedger {
    config: LedgerConfig,
    records: Vec<AggregateRecord>,
    index: HashMap<ItemKey, usize>,
    expansions: BTreeMap<String, usize>,
}

impl VirtualLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            config,
            records: Vec::new(),
            index: HashMap::new(),
            expansions: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// The group a key belongs to under the configured quality policy.
    pub fn group_key(&self, key: &ItemKey) -> ItemKey {
        match self.config.quality_merge {
            QualityMerge::DegradeToLowest if key.quality.is_some() => key.without_quality(),
            _ => key.clone(),
        }
    }

    // ---- Insert ----

    /// Store `batch`, merging into its group or opening a new one.
    pub fn insert(&mut self, batch: ItemBatch) -> LedgerResult<InsertOutcome> {
        if batch.is_empty() {
            return Err(LedgerError::EmptyBatch);
        }

        let group = self.group_key(&batch.key);
        if let Some(&pos) = self.index.get(&group) {
            let record = &mut self.records[pos];
            record.merge(&batch);
            trace!(key = %record.key(), added = batch.count, quantity = record.quantity(), "merged into ledger group");
            return Ok(InsertOutcome::Merged {
                quantity: record.quantity(),
            });
        }

        let capacity = self.capacity();
        if self.records.len() >= capacity {
            return Err(LedgerError::CapacityExceeded {
                records: self.records.len(),
                capacity,
            });
        }

        debug!(key = %batch.key, quantity = batch.count, "opened ledger group");
        self.index.insert(group, self.records.len());
        self.records.push(AggregateRecord::from_batch(batch));
        Ok(InsertOutcome::Created)
    }

    /// Whether `insert(batch)` would succeed.
    pub fn accepts(&self, batch: &ItemBatch) -> bool {
        !batch.is_empty()
            && (self.index.contains_key(&self.group_key(&batch.key))
                || self.records.len() < self.capacity())
    }

    // ---- Extract ----

    /// Take exactly `count` units from the first record matching `filter`
    /// that holds at least that many.
    ///
    /// Partial records are never combined: if no single record is large
    /// enough the call fails even when the matching total would suffice.
    ///
    /// A filter without a sub-material also matches records made from one,
    /// so `Chair` may return a `Chair[Wood]` record. Pass
    /// [`ItemFilter::without_stuff`] to take plain items only.
    pub fn extract(&mut self, filter: &ItemFilter, count: u32) -> LedgerResult<ItemBatch> {
        if count == 0 {
            return Err(LedgerError::EmptyBatch);
        }

        let needed = u64::from(count);
        let pos = self
            .records
            .iter()
            .position(|r| filter.matches(r.key()) && r.quantity() >= needed)
            .ok_or_else(|| LedgerError::InsufficientStock {
                filter: filter.to_string(),
                requested: count,
                largest: self.largest_matching(filter),
            })?;

        Ok(self.take_at(pos, count))
    }

    /// Take exactly `count` units from the group `key` belongs to.
    ///
    /// The indexed record is tried first. A restored ledger may hold more
    /// than one record per group, so the remaining records of the group are
    /// scanned in order before giving up.
    pub fn extract_exact(&mut self, key: &ItemKey, count: u32) -> LedgerResult<ItemBatch> {
        if count == 0 {
            return Err(LedgerError::EmptyBatch);
        }

        let group = self.group_key(key);
        let needed = u64::from(count);
        if let Some(&pos) = self.index.get(&group) {
            if self.records[pos].quantity() >= needed {
                return Ok(self.take_at(pos, count));
            }
        }

        let pos = self
            .records
            .iter()
            .position(|r| r.quantity() >= needed && self.group_key(r.key()) == group);
        match pos {
            Some(pos) => Ok(self.take_at(pos, count)),
            None => Err(LedgerError::InsufficientStock {
                filter: key.to_string(),
                requested: count,
                largest: self.largest_in_group(&group),
            }),
        }
    }

    /// Largest single record in the group `key` belongs to.
    pub fn largest_in_group(&self, key: &ItemKey) -> u64 {
        let group = self.group_key(key);
        self.records
            .iter()
            .filter(|r| self.group_key(r.key()) == group)
            .map(AggregateRecord::quantity)
            .max()
            .unwrap_or(0)
    }

    /// Best-effort removal of `count` units of `material`, ignoring
    /// sub-material and quality. Returns how many units were removed.
    pub fn deduct(&mut self, material: &MaterialId, count: u64) -> u64 {
        let mut remaining = count;
        for record in self.records.iter_mut() {
            if remaining == 0 {
                break;
            }
            if &record.key().material == material {
                remaining -= record.deduct(remaining);
            }
        }

        let deducted = count - remaining;
        if deducted > 0 {
            self.prune_empty();
            debug!(%material, requested = count, deducted, "deducted from ledger");
        }
        deducted
    }

    fn take_at(&mut self, pos: usize, count: u32) -> ItemBatch {
        let batch = self.records[pos].take(count);
        trace!(key = %batch.key, taken = count, remaining = self.records[pos].quantity(), "extracted from ledger");
        if self.records[pos].quantity() == 0 {
            debug!(key = %batch.key, "closed ledger group");
            self.records.remove(pos);
            self.rebuild_index();
        }
        batch
    }

    fn prune_empty(&mut self) {
        let before = self.records.len();
        self.records.retain(|r| r.quantity() > 0);
        if self.records.len() != before {
            self.rebuild_index();
        }
    }

    /// Recompute the group index from the record list.
    ///
    /// Returns the keys of records whose group was already claimed by an
    /// earlier record. Those duplicates stay in the list; the index points at
    /// the first one.
    pub(crate) fn rebuild_index(&mut self) -> Vec<ItemKey> {
        self.index.clear();
        let mut duplicates = Vec::new();
        for (pos, record) in self.records.iter().enumerate() {
            let group = self.group_key(record.key());
            if self.index.contains_key(&group) {
                duplicates.push(record.key().clone());
            } else {
                self.index.insert(group, pos);
            }
        }
        duplicates
    }

    pub(crate) fn push_restored(&mut self, record: AggregateRecord) {
        self.records.push(record);
    }

    // ---- Queries ----

    /// Total units of `material`, optionally restricted to one sub-material.
    pub fn query(&self, material: &MaterialId, stuff: Option<&MaterialId>) -> u64 {
        self.records
            .iter()
            .filter(|r| {
                &r.key().material == material
                    && stuff.map_or(true, |s| r.key().stuff.as_ref() == Some(s))
            })
            .map(AggregateRecord::quantity)
            .sum()
    }

    pub fn has_any(&self, material: &MaterialId, stuff: Option<&MaterialId>) -> bool {
        self.records.iter().any(|r| {
            &r.key().material == material
                && stuff.map_or(true, |s| r.key().stuff.as_ref() == Some(s))
        })
    }

    /// Total units across every record matching `filter`.
    pub fn count_matching(&self, filter: &ItemFilter) -> u64 {
        self.records
            .iter()
            .filter(|r| filter.matches(r.key()))
            .map(AggregateRecord::quantity)
            .sum()
    }

    /// Quantity of the largest single record matching `filter`.
    pub fn largest_matching(&self, filter: &ItemFilter) -> u64 {
        self.records
            .iter()
            .filter(|r| filter.matches(r.key()))
            .map(AggregateRecord::quantity)
            .max()
            .unwrap_or(0)
    }

    /// Quantity held by the group `key` belongs to.
    pub fn group_quantity(&self, key: &ItemKey) -> u64 {
        self.get(key).map_or(0, AggregateRecord::quantity)
    }

    /// The record for the group `key` belongs to.
    pub fn get(&self, key: &ItemKey) -> Option<&AggregateRecord> {
        self.index
            .get(&self.group_key(key))
            .map(|&pos| &self.records[pos])
    }

    pub fn records(&self) -> &[AggregateRecord] {
        &self.records
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_units(&self) -> u64 {
        self.records.iter().map(AggregateRecord::quantity).sum()
    }

    // ---- Capacity ----

    /// Base allowance plus every attached expansion module.
    pub fn capacity(&self) -> usize {
        self.config.base_capacity + self.expansions.values().sum::<usize>()
    }

    /// Attach (or resize) an expansion module. Returns its previous capacity.
    pub fn attach_expansion(&mut self, module: impl Into<String>, capacity: usize) -> Option<usize> {
        let module = module.into();
        debug!(%module, capacity, "attached expansion module");
        self.expansions.insert(module, capacity)
    }

    /// Detach an expansion module.
    ///
    /// Refused if the remaining capacity could no longer hold the groups
    /// already stored.
    pub fn detach_expansion(&mut self, module: &str) -> LedgerResult<usize> {
        let contributed = *self
            .expansions
            .get(module)
            .ok_or_else(|| LedgerError::UnknownExpansion(module.to_string()))?;
        let remaining = self.capacity() - contributed;
        if self.records.len() > remaining {
            return Err(LedgerError::CapacityExceeded {
                records: self.records.len(),
                capacity: remaining,
            });
        }
        self.expansions.remove(module);
        debug!(%module, capacity = remaining, "detached expansion module");
        Ok(contributed)
    }

    pub fn expansions(&self) -> &BTreeMap<String, usize> {
        &self.expansions
    }

    pub(crate) fn expansions_mut(&mut self) -> &mut BTreeMap<String, usize> {
        &mut self.expansions
    }
}

impl Default for VirtualLedger {
    fn default() -> Self {
        Self::new(LedgerConfig::default())
    }
}

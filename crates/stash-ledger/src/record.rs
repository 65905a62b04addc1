use serde::{Deserialize, Serialize};

use stash_types::{weighted_durability, ItemBatch, ItemKey};

/// One ledger entry: an aggregated quantity of a single identity group.
///
/// A record never holds zero units; the ledger removes it the moment its
/// quantity reaches zero.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    key: ItemKey,
    quantity: u64,
    durability: f32,
}

impl AggregateRecord {
    pub(crate) fn from_batch(batch: ItemBatch) -> Self {
        Self {
            key: batch.key,
            quantity: u64::from(batch.count),
            durability: batch.durability,
        }
    }

    pub(crate) fn from_parts(key: ItemKey, quantity: u64, durability: f32) -> Self {
        Self {
            key,
            quantity,
            durability,
        }
    }

    pub fn key(&self) -> &ItemKey {
        &self.key
    }

    pub fn quantity(&self) -> u64 {
        self.quantity
    }

    /// Quantity-weighted mean durability; zero for materials without one.
    pub fn durability(&self) -> f32 {
        self.durability
    }

    /// Fold `batch` into this record.
    ///
    /// Quality degrades to the lower tier; durability is re-averaged by
    /// quantity. The caller has already established that the batch belongs
    /// to this record's group.
    pub(crate) fn merge(&mut self, batch: &ItemBatch) {
        self.durability = weighted_durability(
            self.durability,
            self.quantity,
            batch.durability,
            u64::from(batch.count),
        );
        if let (Some(mine), Some(theirs)) = (self.key.quality, batch.key.quality) {
            self.key.quality = Some(mine.reconcile(theirs));
        }
        self.quantity += u64::from(batch.count);
    }

    /// Remove `count` units and return them as a batch.
    pub(crate) fn take(&mut self, count: u32) -> ItemBatch {
        debug_assert!(u64::from(count) <= self.quantity);
        self.quantity -= u64::from(count);
        ItemBatch {
            key: self.key.clone(),
            count,
            durability: self.durability,
        }
    }

    /// Remove up to `count` units, returning how many were removed.
    pub(crate) fn deduct(&mut self, count: u64) -> u64 {
        let taken = count.min(self.quantity);
        self.quantity -= taken;
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_types::QualityTier;

    #[test]
    fn merge_sums_quantity_and_averages_durability() {
        let key = ItemKey::new("Parka").with_quality(QualityTier::Good);
        let mut record =
            AggregateRecord::from_batch(ItemBatch::new(key.clone(), 2).with_durability(80.0));
        record.merge(
            &ItemBatch::new(ItemKey::new("Parka").with_quality(QualityTier::Awful), 2)
                .with_durability(40.0),
        );

        assert_eq!(record.quantity(), 4);
        assert_eq!(record.durability(), 60.0);
        assert_eq!(record.key().quality, Some(QualityTier::Awful));
    }

    #[test]
    fn take_and_deduct_reduce_quantity() {
        let mut record = AggregateRecord::from_batch(ItemBatch::new(ItemKey::new("Steel"), 10));
        let taken = record.take(4);
        assert_eq!(taken.count, 4);
        assert_eq!(record.quantity(), 6);
        assert_eq!(record.deduct(100), 6);
        assert_eq!(record.quantity(), 0);
    }
}

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::ids::NodeId;
use crate::material::{MaterialId, QualityTier};

/// Identity of an item stack: material, optional sub-material, optional quality.
///
/// Two stacks with equal keys are interchangeable. The sub-material (`stuff`)
/// is what a crafted thing is made of, e.g. a chair made of wood.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub material: MaterialId,
    #[serde(default)]
    pub stuff: Option<MaterialId>,
    #[serde(default)]
    pub quality: Option<QualityTier>,
}

impl ItemKey {
    pub fn new(material: impl Into<MaterialId>) -> Self {
        Self {
            material: material.into(),
            stuff: None,
            quality: None,
        }
    }

    pub fn with_stuff(mut self, stuff: impl Into<MaterialId>) -> Self {
        self.stuff = Some(stuff.into());
        self
    }

    pub fn with_quality(mut self, quality: QualityTier) -> Self {
        self.quality = Some(quality);
        self
    }

    /// Same material and sub-material; quality is not compared.
    pub fn same_kind(&self, other: &ItemKey) -> bool {
        self.material == other.material && self.stuff == other.stuff
    }

    /// This key with the quality component removed.
    pub fn without_quality(&self) -> ItemKey {
        ItemKey {
            material: self.material.clone(),
            stuff: self.stuff.clone(),
            quality: None,
        }
    }
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.material)?;
        if let Some(stuff) = &self.stuff {
            write!(f, "[{stuff}]")?;
        }
        if let Some(quality) = &self.quality {
            write!(f, "@{quality}")?;
        }
        Ok(())
    }
}

/// Selector over item identities. `None` components match anything.
///
/// A `None` sub-material matches both plain items and items made from any
/// sub-material. Use [`ItemFilter::without_stuff`] to select only items
/// that carry no sub-material.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemFilter {
    pub material: MaterialId,
    #[serde(default)]
    pub stuff: Option<MaterialId>,
    #[serde(default)]
    pub quality: Option<QualityTier>,
    /// Only match keys with no sub-material. Ignored when `stuff` is set.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_stuff: bool,
}

impl ItemFilter {
    /// Match every item of `material`.
    pub fn material(material: impl Into<MaterialId>) -> Self {
        Self {
            material: material.into(),
            stuff: None,
            quality: None,
            no_stuff: false,
        }
    }

    /// Filter matching `key`'s components as given. A key without a
    /// sub-material only matches plain items; a key without quality still
    /// matches any tier.
    pub fn exact(key: &ItemKey) -> Self {
        let filter = Self {
            material: key.material.clone(),
            stuff: key.stuff.clone(),
            quality: key.quality,
            no_stuff: false,
        };
        if key.stuff.is_none() {
            filter.without_stuff()
        } else {
            filter
        }
    }

    pub fn stuff(mut self, stuff: impl Into<MaterialId>) -> Self {
        self.stuff = Some(stuff.into());
        self
    }

    pub fn quality(mut self, quality: QualityTier) -> Self {
        self.quality = Some(quality);
        self
    }

    pub fn without_stuff(mut self) -> Self {
        self.stuff = None;
        self.no_stuff = true;
        self
    }

    pub fn matches(&self, key: &ItemKey) -> bool {
        if self.material != key.material {
            return false;
        }
        match &self.stuff {
            Some(stuff) if key.stuff.as_ref() != Some(stuff) => return false,
            None if self.no_stuff && key.stuff.is_some() => return false,
            _ => {}
        }
        if let Some(quality) = self.quality {
            if key.quality != Some(quality) {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for ItemFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.material)?;
        match &self.stuff {
            Some(stuff) => write!(f, "[{stuff}]")?,
            None if self.no_stuff => write!(f, "[-]")?,
            None => write!(f, "[*]")?,
        }
        match &self.quality {
            Some(quality) => write!(f, "@{quality}"),
            None => write!(f, "@*"),
        }
    }
}

/// A counted quantity of one identity.
///
/// Durability is the average condition across all units in the batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemBatch {
    pub key: ItemKey,
    pub count: u32,
    #[serde(default)]
    pub durability: f32,
}

impl ItemBatch {
    pub fn new(key: ItemKey, count: u32) -> Self {
        Self {
            key,
            count,
            durability: 0.0,
        }
    }

    pub fn with_durability(mut self, durability: f32) -> Self {
        self.durability = durability;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Merge `other` into this batch.
    ///
    /// Both batches must share material and sub-material. Quality degrades to
    /// the lower tier and durability becomes the quantity-weighted mean.
    pub fn absorb(&mut self, other: ItemBatch) -> Result<(), TypeError> {
        if !self.key.same_kind(&other.key) {
            return Err(TypeError::IdentityMismatch {
                expected: self.key.clone(),
                found: other.key,
            });
        }
        self.key.quality = match (self.key.quality, other.key.quality) {
            (Some(a), Some(b)) => Some(a.reconcile(b)),
            (a, None) => a,
            (None, b) => b,
        };
        self.durability = weighted_durability(
            self.durability,
            u64::from(self.count),
            other.durability,
            u64::from(other.count),
        );
        self.count += other.count;
        Ok(())
    }

    /// Split `count` units off into a new batch with the same identity.
    pub fn split_off(&mut self, count: u32) -> Result<ItemBatch, TypeError> {
        if count == 0 || count > self.count {
            return Err(TypeError::InvalidSplit {
                requested: count,
                available: self.count,
            });
        }
        self.count -= count;
        Ok(ItemBatch {
            key: self.key.clone(),
            count,
            durability: self.durability,
        })
    }
}

/// Quantity-weighted mean of two durability values.
pub fn weighted_durability(a: f32, a_count: u64, b: f32, b_count: u64) -> f32 {
    let total = a_count + b_count;
    if total == 0 {
        return 0.0;
    }
    let sum = f64::from(a) * a_count as f64 + f64::from(b) * b_count as f64;
    (sum / total as f64) as f32
}

/// Where a materialized batch came from.
///
/// `Virtual` batches were pulled out of a ledger and stay tied to it until
/// the task that requested them completes or is cancelled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchSource {
    /// Pre-existing real stacks from the reserved buffer.
    Physical,
    /// Materialized out of `origin`'s ledger for the given identity.
    Virtual { origin: NodeId, key: ItemKey },
}

impl BatchSource {
    pub fn is_virtual(&self) -> bool {
        matches!(self, Self::Virtual { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn wood_chair(quality: QualityTier) -> ItemKey {
        ItemKey::new("Chair").with_stuff("Wood").with_quality(quality)
    }

    #[test]
    fn display_includes_optional_parts() {
        assert_eq!(ItemKey::new("Steel").to_string(), "Steel");
        assert_eq!(
            wood_chair(QualityTier::Good).to_string(),
            "Chair[Wood]@good"
        );
        assert_eq!(ItemFilter::material("Chair").to_string(), "Chair[*]@*");
    }

    #[test]
    fn filter_wildcards_match_any_component() {
        let key = wood_chair(QualityTier::Normal);
        assert!(ItemFilter::material("Chair").matches(&key));
        assert!(ItemFilter::material("Chair").stuff("Wood").matches(&key));
        assert!(!ItemFilter::material("Chair").stuff("Steel").matches(&key));
        assert!(!ItemFilter::material("Chair")
            .quality(QualityTier::Good)
            .matches(&key));
        assert!(!ItemFilter::material("Table").matches(&key));
    }

    #[test]
    fn without_stuff_excludes_items_made_from_a_material() {
        let plain = ItemKey::new("Chair");
        let wooden = wood_chair(QualityTier::Normal);

        // The default filter treats a missing sub-material as "any".
        assert!(ItemFilter::material("Chair").matches(&wooden));

        let bare = ItemFilter::material("Chair").without_stuff();
        assert!(bare.matches(&plain));
        assert!(!bare.matches(&wooden));
        assert_eq!(bare.to_string(), "Chair[-]@*");

        assert_eq!(ItemFilter::exact(&plain), bare);
        assert!(ItemFilter::exact(&wooden).matches(&wooden));
        assert!(!ItemFilter::exact(&wooden).matches(&plain));
    }

    #[test]
    fn filter_without_exactness_flag_deserializes_as_wildcard() {
        let filter: ItemFilter =
            serde_json::from_str(r#"{"material":"Chair","stuff":null,"quality":null}"#).unwrap();
        assert!(!filter.no_stuff);
        assert_eq!(filter, ItemFilter::material("Chair"));
    }

    #[test]
    fn filter_with_stuff_rejects_stuffless_key() {
        assert!(!ItemFilter::material("Steel")
            .stuff("Iron")
            .matches(&ItemKey::new("Steel")));
    }

    #[test]
    fn absorb_degrades_quality_and_averages_durability() {
        let mut a = ItemBatch::new(wood_chair(QualityTier::Excellent), 1).with_durability(100.0);
        let b = ItemBatch::new(wood_chair(QualityTier::Poor), 3).with_durability(60.0);
        a.absorb(b).unwrap();
        assert_eq!(a.count, 4);
        assert_eq!(a.key.quality, Some(QualityTier::Poor));
        assert_eq!(a.durability, 70.0);
    }

    #[test]
    fn absorb_rejects_different_kind() {
        let mut a = ItemBatch::new(ItemKey::new("Steel"), 5);
        let err = a.absorb(ItemBatch::new(ItemKey::new("Wood"), 5)).unwrap_err();
        assert!(matches!(err, TypeError::IdentityMismatch { .. }));
        assert_eq!(a.count, 5);
    }

    #[test]
    fn split_off_validates_count() {
        let mut a = ItemBatch::new(ItemKey::new("Steel"), 5);
        let part = a.split_off(2).unwrap();
        assert_eq!((a.count, part.count), (3, 2));
        assert_eq!(
            a.split_off(4).unwrap_err(),
            TypeError::InvalidSplit {
                requested: 4,
                available: 3
            }
        );
        assert!(a.split_off(0).is_err());
    }

    proptest! {
        #[test]
        fn weighted_durability_stays_within_bounds(
            a in 0.0f32..500.0,
            b in 0.0f32..500.0,
            qa in 1u64..10_000,
            qb in 1u64..10_000,
        ) {
            let mean = weighted_durability(a, qa, b, qb);
            prop_assert!(mean >= a.min(b) - 0.01);
            prop_assert!(mean <= a.max(b) + 0.01);
        }
    }
}

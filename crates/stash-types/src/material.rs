use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::item::ItemBatch;

/// Stack limit assumed for materials the catalog does not know about.
pub const DEFAULT_STACK_LIMIT: u32 = 75;

/// Host-defined material identifier, e.g. `"Steel"` or `"WoodLog"`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MaterialId(String);

impl MaterialId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for MaterialId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for MaterialId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for MaterialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MaterialId({})", self.0)
    }
}

impl fmt::Display for MaterialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Ordered quality grade.
///
/// Ordering is worst-to-best, so `min` yields the degraded tier used when
/// batches of different quality are merged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Awful,
    Poor,
    Normal,
    Good,
    Excellent,
    Masterwork,
    Legendary,
}

impl QualityTier {
    /// Every tier, worst first.
    pub const ALL: [QualityTier; 7] = [
        Self::Awful,
        Self::Poor,
        Self::Normal,
        Self::Good,
        Self::Excellent,
        Self::Masterwork,
        Self::Legendary,
    ];

    /// The tier a merged group ends up with: the lower of the two.
    pub fn reconcile(self, other: Self) -> Self {
        self.min(other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Awful => "awful",
            Self::Poor => "poor",
            Self::Normal => "normal",
            Self::Good => "good",
            Self::Excellent => "excellent",
            Self::Masterwork => "masterwork",
            Self::Legendary => "legendary",
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityTier {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|tier| tier.as_str() == wanted)
            .ok_or_else(|| TypeError::UnknownQuality(s.to_string()))
    }
}

/// Stacking and condition traits of one material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MaterialDef {
    pub id: MaterialId,
    /// Largest number of units a single physical stack may hold.
    pub stack_limit: u32,
    /// Whether items of this material carry a quality tier.
    #[serde(default)]
    pub has_quality: bool,
    /// Whether items of this material carry a durability value.
    #[serde(default)]
    pub has_durability: bool,
    /// Upper bound for durability; ignored when `has_durability` is false.
    #[serde(default)]
    pub max_durability: f32,
}

impl MaterialDef {
    /// A plain stackable resource: no quality, no durability.
    pub fn resource(id: impl Into<MaterialId>, stack_limit: u32) -> Self {
        Self {
            id: id.into(),
            stack_limit,
            has_quality: false,
            has_durability: false,
            max_durability: 0.0,
        }
    }

    /// A crafted item with quality and durability.
    pub fn crafted(id: impl Into<MaterialId>, stack_limit: u32, max_durability: f32) -> Self {
        Self {
            id: id.into(),
            stack_limit,
            has_quality: true,
            has_durability: true,
            max_durability,
        }
    }

    fn validate(&self) -> Result<(), TypeError> {
        if self.stack_limit == 0 {
            return Err(TypeError::InvalidDefinition {
                material: self.id.to_string(),
                reason: "stack limit must be at least 1".into(),
            });
        }
        if self.has_durability && !(self.max_durability > 0.0) {
            return Err(TypeError::InvalidDefinition {
                material: self.id.to_string(),
                reason: "max durability must be positive".into(),
            });
        }
        Ok(())
    }
}

/// Lookup table of known materials.
///
/// Materials missing from the catalog are treated as plain resources with
/// [`DEFAULT_STACK_LIMIT`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<MaterialDef>", into = "Vec<MaterialDef>")]
pub struct MaterialCatalog {
    defs: HashMap<MaterialId, MaterialDef>,
}

impl MaterialCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a material definition.
    pub fn define(&mut self, def: MaterialDef) -> Result<(), TypeError> {
        def.validate()?;
        self.defs.insert(def.id.clone(), def);
        Ok(())
    }

    /// Builder-style [`define`](Self::define).
    pub fn with(mut self, def: MaterialDef) -> Result<Self, TypeError> {
        self.define(def)?;
        Ok(self)
    }

    pub fn get(&self, id: &MaterialId) -> Option<&MaterialDef> {
        self.defs.get(id)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Definitions ordered by material id.
    pub fn definitions(&self) -> Vec<&MaterialDef> {
        let mut defs: Vec<&MaterialDef> = self.defs.values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }

    pub fn stack_limit(&self, id: &MaterialId) -> u32 {
        self.defs
            .get(id)
            .map(|def| def.stack_limit)
            .unwrap_or(DEFAULT_STACK_LIMIT)
    }

    pub fn has_quality(&self, id: &MaterialId) -> bool {
        self.defs.get(id).is_some_and(|def| def.has_quality)
    }

    /// Strip attributes the material does not support.
    ///
    /// Quality is dropped for materials without a quality concept and
    /// durability is zeroed (or clamped to the maximum) accordingly, so that
    /// identities compare equal regardless of what the caller filled in.
    pub fn normalize(&self, mut batch: ItemBatch) -> ItemBatch {
        match self.defs.get(&batch.key.material) {
            Some(def) => {
                if !def.has_quality {
                    batch.key.quality = None;
                }
                batch.durability = if def.has_durability {
                    batch.durability.clamp(0.0, def.max_durability)
                } else {
                    0.0
                };
            }
            None => {
                batch.key.quality = None;
                batch.durability = 0.0;
            }
        }
        batch
    }
}

impl TryFrom<Vec<MaterialDef>> for MaterialCatalog {
    type Error = TypeError;

    fn try_from(defs: Vec<MaterialDef>) -> Result<Self, Self::Error> {
        let mut catalog = Self::new();
        for def in defs {
            catalog.define(def)?;
        }
        Ok(catalog)
    }
}

impl From<MaterialCatalog> for Vec<MaterialDef> {
    fn from(catalog: MaterialCatalog) -> Self {
        let mut defs: Vec<MaterialDef> = catalog.defs.into_values().collect();
        defs.sort_by(|a, b| a.id.cmp(&b.id));
        defs
    }
}

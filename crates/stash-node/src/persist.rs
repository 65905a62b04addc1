use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use stash_ledger::LedgerSnapshot;
use stash_types::{MaterialId, NodeId};

use crate::error::{NodeError, NodeResult};

/// Saved state of one storage node.
///
/// Buffer stacks are real items and are saved by the host with the rest of
/// the world. The target table is written for older readers only; loading
/// recomputes targets from the current configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSave {
    #[serde(default)]
    pub id: Option<NodeId>,
    pub name: String,
    #[serde(default)]
    pub ledger: LedgerSnapshot,
    #[serde(default)]
    pub reserved_targets: BTreeMap<MaterialId, u32>,
}

impl NodeSave {
    pub fn to_json(&self) -> NodeResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| NodeError::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> NodeResult<Self> {
        serde_json::from_str(json).map_err(|e| NodeError::Serialization(e.to_string()))
    }

    pub fn to_bytes(&self) -> NodeResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| NodeError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> NodeResult<Self> {
        bincode::deserialize(bytes).map_err(|e| NodeError::Serialization(e.to_string()))
    }

    /// Write to `path`: JSON for a `.json` extension, bincode otherwise.
    pub fn write_to(&self, path: &Path) -> NodeResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if is_json(path) {
            fs::write(path, self.to_json()?)?;
        } else {
            fs::write(path, self.to_bytes()?)?;
        }
        Ok(())
    }

    /// Read a save written by [`NodeSave::write_to`].
    pub fn read_from(path: &Path) -> NodeResult<Self> {
        if is_json(path) {
            Self::from_json(&fs::read_to_string(path)?)
        } else {
            Self::from_bytes(&fs::read(path)?)
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_ledger::RecordState;
    use stash_types::QualityTier;

    fn sample() -> NodeSave {
        NodeSave {
            id: Some(NodeId::new()),
            name: "Stockpile 3".into(),
            ledger: LedgerSnapshot {
                records: vec![RecordState {
                    material: "Parka".into(),
                    stuff: Some("Cloth".into()),
                    quality: Some(QualityTier::Good),
                    quantity: 4,
                    durability: 80.0,
                }],
                expansions: BTreeMap::from([("rack".to_string(), 20)]),
            },
            reserved_targets: BTreeMap::from([("Parka".into(), 75)]),
        }
    }

    #[test]
    fn json_and_bincode_files() {
        let dir = tempfile::tempdir().unwrap();
        let save = sample();

        let json = dir.path().join("nodes/stockpile.json");
        save.write_to(&json).unwrap();
        assert!(fs::read_to_string(&json).unwrap().contains("Stockpile 3"));
        assert_eq!(NodeSave::read_from(&json).unwrap(), save);

        let bin = dir.path().join("stockpile.bin");
        save.write_to(&bin).unwrap();
        assert_eq!(NodeSave::read_from(&bin).unwrap(), save);
    }

    #[test]
    fn minimal_json_fills_defaults() {
        let save = NodeSave::from_json(r#"{ "name": "old" }"#).unwrap();
        assert_eq!(save.id, None);
        assert!(save.ledger.records.is_empty());
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        assert!(matches!(
            NodeSave::from_json("not json"),
            Err(NodeError::Serialization(_))
        ));
        assert!(matches!(
            NodeSave::from_bytes(&[0xff, 0xff]),
            Err(NodeError::Serialization(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = NodeSave::read_from(&dir.path().join("none.json")).unwrap_err();
        assert!(matches!(err, NodeError::Io(_)));
    }
}

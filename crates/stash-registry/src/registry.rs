use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info};

use stash_jobs::JobScheduler;
use stash_node::{CancelReport, NodeSave, OverflowScan, StorageNode, TaskClaimChecker};
use stash_types::{ItemFilter, MaterialId, NodeId, RegionId, TaskId};

use crate::config::RegistryConfig;
use crate::error::{RegistryError, RegistryResult};

/// Shared handle to a registered node.
pub type NodeRef = Arc<RwLock<StorageNode>>;

pub fn read_node(node: &NodeRef) -> RwLockReadGuard<'_, StorageNode> {
    node.read().unwrap_or_else(PoisonError::into_inner)
}

pub fn write_node(node: &NodeRef) -> RwLockWriteGuard<'_, StorageNode> {
    node.write().unwrap_or_else(PoisonError::into_inner)
}

struct Entry {
    region: RegionId,
    node: NodeRef,
}

#[derive(Default)]
struct State {
    regions: BTreeMap<RegionId, Vec<NodeId>>,
    nodes: HashMap<NodeId, Entry>,
    /// Every node in registration order, across regions.
    global: Vec<NodeId>,
}

/// Totals from one [`StorageNetworkRegistry::tick_all`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetworkTick {
    pub nodes: usize,
    pub materialized: u64,
    pub demoted: u64,
    pub dispatched: usize,
}

/// Directory of storage nodes, per region and network-wide.
///
/// The registry is an explicit value owned by the host; there is no global
/// instance. Lookups copy the relevant node handles out of the registry
/// lock before touching any node, so a node lock is never held while the
/// registry lock is.
pub struct StorageNetworkRegistry {
    config: RegistryConfig,
    state: RwLock<State>,
}

impl StorageNetworkRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            state: RwLock::new(State::default()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- Membership ----

    /// Add `node` to `region`. Returns false if it was already registered
    /// there.
    pub fn register(&self, region: RegionId, node: NodeRef) -> RegistryResult<bool> {
        let id = read_node(&node).id();
        let mut state = self.write();
        if let Some(entry) = state.nodes.get(&id) {
            if entry.region == region {
                return Ok(false);
            }
            return Err(RegistryError::RegionConflict {
                node: id,
                registered: entry.region,
                requested: region,
            });
        }

        state.regions.entry(region).or_default().push(id);
        state.global.push(id);
        state.nodes.insert(id, Entry { region, node });
        debug!(node = %id, %region, "registered storage node");
        Ok(true)
    }

    /// Wrap `node` in a shared handle and register it.
    pub fn add_node(&self, region: RegionId, node: StorageNode) -> RegistryResult<NodeRef> {
        let node = Arc::new(RwLock::new(node));
        self.register(region, Arc::clone(&node))?;
        Ok(node)
    }

    /// Remove a node. Removing an unknown node is a no-op.
    pub fn deregister(&self, id: NodeId) -> Option<NodeRef> {
        let mut state = self.write();
        let entry = state.nodes.remove(&id)?;
        state.global.retain(|n| *n != id);
        let emptied = match state.regions.get_mut(&entry.region) {
            Some(members) => {
                members.retain(|n| *n != id);
                members.is_empty()
            }
            None => false,
        };
        if emptied {
            state.regions.remove(&entry.region);
        }
        debug!(node = %id, region = %entry.region, "deregistered storage node");
        Some(entry.node)
    }

    /// Remove every node of `region`, e.g. when the region is unloaded.
    pub fn deregister_region(&self, region: RegionId) -> Vec<NodeRef> {
        let mut state = self.write();
        let Some(ids) = state.regions.remove(&region) else {
            return Vec::new();
        };
        state.global.retain(|n| !ids.contains(n));
        let removed: Vec<NodeRef> = ids
            .iter()
            .filter_map(|id| state.nodes.remove(id).map(|e| e.node))
            .collect();
        info!(%region, nodes = removed.len(), "deregistered region");
        removed
    }

    pub fn get(&self, id: NodeId) -> Option<NodeRef> {
        self.read().nodes.get(&id).map(|e| Arc::clone(&e.node))
    }

    pub fn region_of(&self, id: NodeId) -> Option<RegionId> {
        self.read().nodes.get(&id).map(|e| e.region)
    }

    pub fn node(&self, id: NodeId) -> RegistryResult<NodeRef> {
        self.get(id).ok_or(RegistryError::UnknownNode(id))
    }

    /// Nodes of `region` in registration order.
    pub fn nodes_in(&self, region: RegionId) -> Vec<NodeRef> {
        let state = self.read();
        state
            .regions
            .get(&region)
            .map(|ids| ids.iter().map(|id| Arc::clone(&state.nodes[id].node)).collect())
            .unwrap_or_default()
    }

    /// Every node in registration order.
    pub fn all_nodes(&self) -> Vec<NodeRef> {
        let state = self.read();
        state
            .global
            .iter()
            .map(|id| Arc::clone(&state.nodes[id].node))
            .collect()
    }

    pub fn regions(&self) -> Vec<RegionId> {
        self.read().regions.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().nodes.is_empty()
    }

    // Search order: the region's own nodes, then (if allowed) everyone else.
    fn search_order(&self, region: Option<RegionId>) -> Vec<NodeRef> {
        let state = self.read();
        let Some(region) = region else {
            return state
                .global
                .iter()
                .map(|id| Arc::clone(&state.nodes[id].node))
                .collect();
        };

        let mut order: Vec<NodeRef> = state
            .regions
            .get(&region)
            .into_iter()
            .flatten()
            .map(|id| Arc::clone(&state.nodes[id].node))
            .collect();
        if self.config.cross_region_lookup {
            order.extend(
                state
                    .global
                    .iter()
                    .filter(|id| state.nodes[*id].region != region)
                    .map(|id| Arc::clone(&state.nodes[id].node)),
            );
        }
        order
    }

    // ---- Lookups ----

    /// First active node that can supply `min_count` units matching
    /// `filter`, preferring `region` when given.
    pub fn find_node_with_stock(
        &self,
        filter: &ItemFilter,
        min_count: u32,
        region: Option<RegionId>,
    ) -> Option<NodeRef> {
        self.search_order(region)
            .into_iter()
            .find(|node| read_node(node).can_supply(filter, min_count))
    }

    /// Whether any active node holds `material`.
    pub fn any_holds(
        &self,
        material: &MaterialId,
        stuff: Option<&MaterialId>,
        region: Option<RegionId>,
    ) -> bool {
        self.search_order(region).iter().any(|node| {
            let node = read_node(node);
            node.is_active() && node.has_any(material, stuff)
        })
    }

    /// Units of `material` across active nodes, ledger and buffer together.
    pub fn total_count(
        &self,
        material: &MaterialId,
        stuff: Option<&MaterialId>,
        region: Option<RegionId>,
    ) -> u64 {
        let nodes = match region {
            Some(region) => self.nodes_in(region),
            None => self.all_nodes(),
        };
        nodes
            .iter()
            .map(|node| {
                let node = read_node(node);
                if node.is_active() {
                    node.aggregate_count(material, stuff)
                } else {
                    0
                }
            })
            .sum()
    }

    // ---- Task fan-out ----

    /// Settle `task` on every node it may have drawn from.
    pub fn complete_task(&self, task: TaskId) -> u64 {
        self.all_nodes()
            .iter()
            .map(|node| write_node(node).complete_task(task))
            .sum()
    }

    /// Return `task`'s ledger units on every node it drew from.
    pub fn cancel_task(&self, task: TaskId) -> CancelReport {
        let mut total = CancelReport::default();
        for node in self.all_nodes() {
            let report = write_node(&node).cancel_task(task);
            total.restored += report.restored;
            total.spilled += report.spilled;
            total.spilled_stacks.extend(report.spilled_stacks);
        }
        total
    }

    // ---- Simulation ----

    /// Tick every registered node, in registration order.
    pub fn tick_all(
        &self,
        now: u64,
        claims: &dyn TaskClaimChecker,
        scheduler: Option<&JobScheduler>,
    ) -> NetworkTick {
        let mut summary = NetworkTick::default();
        for node in self.all_nodes() {
            let report = write_node(&node).tick(now, claims, scheduler);
            summary.nodes += 1;
            summary.demoted += report.applied.demoted;
            summary.materialized += report.top_up.map_or(0, |t| t.materialized);
            if report.overflow == Some(OverflowScan::Dispatched) {
                summary.dispatched += 1;
            }
        }
        summary
    }

    /// Save every node, grouped by region.
    pub fn save_all(&self) -> Vec<(RegionId, NodeSave)> {
        let entries: Vec<(RegionId, NodeRef)> = {
            let state = self.read();
            state
                .global
                .iter()
                .map(|id| {
                    let entry = &state.nodes[id];
                    (entry.region, Arc::clone(&entry.node))
                })
                .collect()
        };
        entries
            .into_iter()
            .map(|(region, node)| (region, read_node(&node).save()))
            .collect()
    }
}

impl Default for StorageNetworkRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl std::fmt::Debug for StorageNetworkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.read();
        f.debug_struct("StorageNetworkRegistry")
            .field("regions", &state.regions.len())
            .field("nodes", &state.nodes.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stash_node::{HandleAllocator, NoClaims, NodeConfig};
    use stash_types::{ItemBatch, ItemKey, MaterialCatalog};

    const NORTH: RegionId = RegionId(1);
    const SOUTH: RegionId = RegionId(2);

    fn storage(name: &str) -> StorageNode {
        StorageNode::new(
            name,
            NodeConfig::default(),
            Arc::new(MaterialCatalog::new()),
            HandleAllocator::new(),
        )
    }

    fn stocked(name: &str, material: &str, count: u32) -> StorageNode {
        let mut node = storage(name);
        node.insert(ItemBatch::new(ItemKey::new(material), count))
            .unwrap();
        node
    }

    fn name_of(node: &NodeRef) -> String {
        read_node(node).name().to_string()
    }

    #[test]
    fn register_is_idempotent_per_region() {
        let reg = StorageNetworkRegistry::default();
        let node = reg.add_node(NORTH, storage("a")).unwrap();
        assert!(!reg.register(NORTH, Arc::clone(&node)).unwrap());
        assert_eq!(reg.len(), 1);

        let err = reg.register(SOUTH, node).unwrap_err();
        assert!(matches!(err, RegistryError::RegionConflict { .. }));
    }

    #[test]
    fn deregister_is_idempotent() {
        let reg = StorageNetworkRegistry::default();
        let id = read_node(&reg.add_node(NORTH, storage("a")).unwrap()).id();

        assert!(reg.deregister(id).is_some());
        assert!(reg.deregister(id).is_none());
        assert!(reg.is_empty());
        assert!(reg.regions().is_empty());
        assert!(matches!(reg.node(id), Err(RegistryError::UnknownNode(_))));
    }

    #[test]
    fn lookup_prefers_the_requested_region() {
        let reg = StorageNetworkRegistry::default();
        reg.add_node(NORTH, stocked("north", "Steel", 100)).unwrap();
        reg.add_node(SOUTH, stocked("south", "Steel", 100)).unwrap();
        let steel = ItemFilter::material("Steel");

        let found = reg.find_node_with_stock(&steel, 50, Some(SOUTH)).unwrap();
        assert_eq!(name_of(&found), "south");
        let found = reg.find_node_with_stock(&steel, 50, None).unwrap();
        assert_eq!(name_of(&found), "north");
    }

    #[test]
    fn cross_region_fallback_can_be_disabled() {
        let steel = ItemFilter::material("Steel");

        let open = StorageNetworkRegistry::default();
        open.add_node(NORTH, stocked("north", "Steel", 100)).unwrap();
        open.add_node(SOUTH, storage("empty")).unwrap();
        let found = open.find_node_with_stock(&steel, 10, Some(SOUTH)).unwrap();
        assert_eq!(name_of(&found), "north");

        let closed = StorageNetworkRegistry::new(RegistryConfig {
            cross_region_lookup: false,
        });
        closed.add_node(NORTH, stocked("north", "Steel", 100)).unwrap();
        assert!(closed.find_node_with_stock(&steel, 10, Some(SOUTH)).is_none());
    }

    #[test]
    fn inactive_nodes_never_match() {
        let reg = StorageNetworkRegistry::default();
        let node = reg.add_node(NORTH, stocked("a", "Steel", 100)).unwrap();
        write_node(&node).set_active(false);

        let steel: MaterialId = "Steel".into();
        assert!(reg
            .find_node_with_stock(&ItemFilter::material("Steel"), 1, None)
            .is_none());
        assert!(!reg.any_holds(&steel, None, None));
        assert_eq!(reg.total_count(&steel, None, None), 0);
    }

    #[test]
    fn totals_span_nodes() {
        let reg = StorageNetworkRegistry::default();
        reg.add_node(NORTH, stocked("a", "Steel", 30)).unwrap();
        reg.add_node(NORTH, stocked("b", "Steel", 20)).unwrap();
        reg.add_node(SOUTH, stocked("c", "Steel", 5)).unwrap();
        let steel: MaterialId = "Steel".into();

        assert_eq!(reg.total_count(&steel, None, None), 55);
        assert_eq!(reg.total_count(&steel, None, Some(NORTH)), 50);
        assert!(reg.any_holds(&steel, None, Some(SOUTH)));
        assert!(!reg.any_holds(&"Gold".into(), None, None));
    }

    #[test]
    fn cancel_fans_out_to_every_node() {
        let reg = StorageNetworkRegistry::default();
        let a = reg.add_node(NORTH, stocked("a", "Steel", 30)).unwrap();
        let b = reg.add_node(SOUTH, stocked("b", "Wood", 30)).unwrap();
        let task = TaskId(5);

        write_node(&a)
            .extract_for_worker(&ItemFilter::material("Steel"), 10, task, &NoClaims)
            .unwrap();
        write_node(&b)
            .extract_for_worker(&ItemFilter::material("Wood"), 4, task, &NoClaims)
            .unwrap();

        let report = reg.cancel_task(task);
        assert_eq!(report.restored, 14);
        assert_eq!(reg.total_count(&"Steel".into(), None, None), 30);
        assert_eq!(reg.complete_task(task), 0);
    }

    #[test]
    fn deregister_region_removes_its_nodes() {
        let reg = StorageNetworkRegistry::default();
        reg.add_node(NORTH, storage("a")).unwrap();
        reg.add_node(NORTH, storage("b")).unwrap();
        reg.add_node(SOUTH, storage("c")).unwrap();

        let removed = reg.deregister_region(NORTH);
        assert_eq!(removed.len(), 2);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.all_nodes().len(), 1);
        assert!(reg.deregister_region(NORTH).is_empty());
    }

    #[test]
    fn tick_all_drives_every_node() {
        let reg = StorageNetworkRegistry::default();
        reg.add_node(NORTH, stocked("a", "Steel", 100)).unwrap();
        reg.add_node(SOUTH, stocked("b", "Wood", 30)).unwrap();

        let summary = reg.tick_all(0, &NoClaims, None);
        assert_eq!(summary.nodes, 2);
        assert_eq!(summary.materialized, 105);
        assert_eq!(reg.save_all().len(), 2);
    }
}

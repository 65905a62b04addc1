use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info};

use stash_jobs::JobScheduler;
use stash_ledger::{InsertOutcome, LedgerSnapshot, RestoreReport, VirtualLedger};
use stash_types::{
    ItemBatch, ItemFilter, ItemHandle, MaterialCatalog, MaterialId, NodeId, TaskId,
};

use crate::buffer::{HandleAllocator, ItemStack, PhysicalBuffer};
use crate::claims::TaskClaimChecker;
use crate::config::NodeConfig;
use crate::error::{NodeError, NodeResult};
use crate::extraction::{CancelReport, ExtractionProtocol, Withdrawal};
use crate::persist::NodeSave;
use crate::reserved::{CycleReport, NodeStock, ReservedBufferManager, ReservedStats};

/// Everything a removed node hands back to its owner.
#[derive(Debug)]
pub struct Decommissioned {
    pub id: NodeId,
    pub name: String,
    /// Buffer stacks to drop into the world.
    pub ejected: Vec<ItemStack>,
    /// Ledger contents for the owning structure's own save.
    pub ledger: LedgerSnapshot,
    /// Ledger units still out with tasks, which can no longer be returned here.
    pub outstanding: HashMap<TaskId, Vec<ItemBatch>>,
}

/// One storage point: a virtual ledger plus a reserved physical buffer.
pub struct StorageNode {
    id: NodeId,
    name: String,
    active: bool,
    config: NodeConfig,
    catalog: Arc<MaterialCatalog>,
    handles: HandleAllocator,
    ledger: VirtualLedger,
    buffer: PhysicalBuffer,
    reserved: ReservedBufferManager,
    extraction: ExtractionProtocol,
}

impl StorageNode {
    pub fn new(
        name: impl Into<String>,
        config: NodeConfig,
        catalog: Arc<MaterialCatalog>,
        handles: HandleAllocator,
    ) -> Self {
        Self::with_parts(
            NodeId::new(),
            name.into(),
            VirtualLedger::new(config.ledger.clone()),
            config,
            catalog,
            handles,
        )
    }

    fn with_parts(
        id: NodeId,
        name: String,
        ledger: VirtualLedger,
        config: NodeConfig,
        catalog: Arc<MaterialCatalog>,
        handles: HandleAllocator,
    ) -> Self {
        debug!(node = %id, %name, "storage node created");
        Self {
            id,
            name,
            active: true,
            config,
            catalog,
            handles,
            ledger,
            buffer: PhysicalBuffer::new(),
            reserved: ReservedBufferManager::new(id, 0),
            extraction: ExtractionProtocol::new(),
        }
    }

    // Split borrow: the stores go out as one view, the managers separately.
    fn parts(&mut self) -> (NodeStock<'_>, &mut ReservedBufferManager, &mut ExtractionProtocol) {
        (
            NodeStock {
                ledger: &mut self.ledger,
                buffer: &mut self.buffer,
                config: &self.config,
                catalog: &self.catalog,
                handles: &self.handles,
            },
            &mut self.reserved,
            &mut self.extraction,
        )
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Powered/unpowered switch. Inactive nodes refuse deposits and
    /// withdrawals and run no cycles.
    pub fn set_active(&mut self, active: bool) {
        if self.active != active {
            info!(node = %self.id, active, "storage node power changed");
        }
        self.active = active;
    }

    fn ensure_active(&self) -> NodeResult<()> {
        if self.active {
            Ok(())
        } else {
            Err(NodeError::Inactive(self.id))
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &VirtualLedger {
        &self.ledger
    }

    pub fn buffer(&self) -> &PhysicalBuffer {
        &self.buffer
    }

    pub fn reserved_stats(&self) -> ReservedStats {
        self.reserved.stats()
    }

    pub fn extractions(&self) -> &ExtractionProtocol {
        &self.extraction
    }

    /// A background overflow scan has not been committed yet.
    pub fn scan_in_flight(&self) -> bool {
        self.reserved.scan_in_flight() || self.reserved.pending_plans() > 0
    }

    // ---- Deposits ----

    /// Dematerialize `batch` straight into the ledger.
    pub fn insert(&mut self, batch: ItemBatch) -> NodeResult<InsertOutcome> {
        self.ensure_active()?;
        let batch = self.catalog.normalize(batch);
        Ok(self.ledger.insert(batch)?)
    }

    /// Whether [`StorageNode::insert`] would accept `batch`.
    pub fn accepts(&self, batch: &ItemBatch) -> bool {
        self.active && self.ledger.accepts(&self.catalog.normalize(batch.clone()))
    }

    /// Real items dropped next to the node by a hauler.
    pub fn deposit_physical(&mut self, batch: ItemBatch) -> NodeResult<Vec<ItemHandle>> {
        self.ensure_active()?;
        if batch.is_empty() {
            return Err(NodeError::EmptyRequest);
        }
        let batch = self.catalog.normalize(batch);
        let limit = self.catalog.stack_limit(&batch.key.material);
        Ok(self.buffer.materialize(batch, limit, &self.handles))
    }

    /// A stack left the buffer through the host (picked up, destroyed).
    pub fn remove_physical(&mut self, handle: ItemHandle) -> Option<ItemStack> {
        self.buffer.remove(handle)
    }

    // ---- Withdrawals ----

    pub fn can_supply(&self, filter: &ItemFilter, count: u32) -> bool {
        self.active && ExtractionProtocol::can_supply(&self.ledger, &self.buffer, filter, count)
    }

    pub fn extract_for_worker(
        &mut self,
        filter: &ItemFilter,
        count: u32,
        task: TaskId,
        claims: &dyn TaskClaimChecker,
    ) -> NodeResult<Withdrawal> {
        self.ensure_active()?;
        let id = self.id;
        let (mut stock, _, extraction) = self.parts();
        extraction.extract_for_worker(id, &mut stock, filter, count, task, claims)
    }

    pub fn complete_task(&mut self, task: TaskId) -> u64 {
        self.extraction.complete_task(task)
    }

    /// Runs on inactive nodes too: cancelled units must always come back.
    pub fn cancel_task(&mut self, task: TaskId) -> CancelReport {
        let (mut stock, _, extraction) = self.parts();
        extraction.cancel_task(task, &mut stock)
    }

    // ---- Queries ----

    /// Units of `material` in ledger and buffer together.
    pub fn aggregate_count(&self, material: &MaterialId, stuff: Option<&MaterialId>) -> u64 {
        self.ledger.query(material, stuff)
            + self.buffer.quantity_matching(&material_filter(material, stuff))
    }

    pub fn has_any(&self, material: &MaterialId, stuff: Option<&MaterialId>) -> bool {
        self.ledger.has_any(material, stuff)
            || self.buffer.quantity_matching(&material_filter(material, stuff)) > 0
    }

    /// Units matching `filter` in ledger and buffer together.
    pub fn count_matching(&self, filter: &ItemFilter) -> u64 {
        self.ledger.count_matching(filter) + self.buffer.quantity_matching(filter)
    }

    /// Best-effort consumption straight out of the ledger, e.g. by a
    /// crafting bill reading from storage. Returns the units removed.
    pub fn deduct(&mut self, material: &MaterialId, count: u64) -> u64 {
        self.ledger.deduct(material, count)
    }

    // ---- Capacity ----

    pub fn attach_expansion(&mut self, module: impl Into<String>, capacity: usize) -> Option<usize> {
        self.ledger.attach_expansion(module, capacity)
    }

    pub fn detach_expansion(&mut self, module: &str) -> NodeResult<usize> {
        Ok(self.ledger.detach_expansion(module)?)
    }

    // ---- Simulation ----

    /// Advance the reserved-buffer cycles to simulation tick `now`.
    pub fn tick(
        &mut self,
        now: u64,
        claims: &dyn TaskClaimChecker,
        scheduler: Option<&JobScheduler>,
    ) -> CycleReport {
        let active = self.active;
        let (mut stock, reserved, _) = self.parts();
        reserved.tick(now, &mut stock, claims, scheduler, active)
    }

    // ---- Lifecycle ----

    /// Remove the node: the buffer is ejected and the ledger handed back.
    pub fn decommission(mut self) -> Decommissioned {
        let ejected = self.buffer.drain();
        let outstanding = self.extraction.take_all();
        info!(
            node = %self.id,
            ejected = ejected.len(),
            records = self.ledger.record_count(),
            outstanding_tasks = outstanding.len(),
            "storage node decommissioned"
        );
        Decommissioned {
            id: self.id,
            name: self.name,
            ejected,
            ledger: self.ledger.snapshot(),
            outstanding,
        }
    }

    pub fn save(&self) -> NodeSave {
        let reserved_targets: BTreeMap<MaterialId, u32> = self
            .ledger
            .records()
            .iter()
            .map(|r| {
                let material = r.key().material.clone();
                let target = self.config.target_for(&material);
                (material, target)
            })
            .collect();
        NodeSave {
            id: Some(self.id),
            name: self.name.clone(),
            ledger: self.ledger.snapshot(),
            reserved_targets,
        }
    }

    /// Rebuild a node from a save. Saved targets are ignored.
    pub fn restore(
        save: NodeSave,
        config: NodeConfig,
        catalog: Arc<MaterialCatalog>,
        handles: HandleAllocator,
    ) -> (Self, RestoreReport) {
        if !save.reserved_targets.is_empty() {
            debug!(name = %save.name, saved = save.reserved_targets.len(), "ignoring saved reserved targets");
        }
        let (ledger, report) = VirtualLedger::restore(config.ledger.clone(), save.ledger);
        let node = Self::with_parts(
            save.id.unwrap_or_default(),
            save.name,
            ledger,
            config,
            catalog,
            handles,
        );
        (node, report)
    }
}

impl std::fmt::Debug for StorageNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("active", &self.active)
            .field("records", &self.ledger.record_count())
            .field("stacks", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

fn material_filter(material: &MaterialId, stuff: Option<&MaterialId>) -> ItemFilter {
    let filter = ItemFilter::material(material.clone());
    match stuff {
        Some(stuff) => filter.stuff(stuff.clone()),
        None => filter,
    }
}

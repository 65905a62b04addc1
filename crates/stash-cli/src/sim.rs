//! Randomized storage-network harness.
//!
//! Workers deposit, withdraw, haul, and consume items across a few regions
//! while every node runs its reserved-buffer cycles on a real job scheduler.
//! At the end every open task is unwound and the per-material books must
//! balance: whatever was deposited is either consumed or still stored.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info, warn};

use stash_jobs::{JobScheduler, SchedulerStats};
use stash_node::{HandleAllocator, NodeError, ReservationBook, StorageNode};
use stash_registry::{read_node, write_node, NodeRef, StashConfig, StorageNetworkRegistry};
use stash_types::{
    ItemBatch, ItemFilter, ItemHandle, ItemKey, MaterialCatalog, MaterialDef, MaterialId,
    QualityTier, RegionId, TaskId, TypeError, WorkerId,
};

const STUFFS: [&str; 3] = ["Wood", "Steel", "Cloth"];

#[derive(Clone, Debug)]
pub struct SimOptions {
    pub regions: u64,
    pub nodes_per_region: usize,
    pub ticks: u64,
    pub workers: u64,
    pub seed: u64,
    pub save_dir: Option<PathBuf>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            regions: 2,
            nodes_per_region: 3,
            ticks: 3_600,
            workers: 8,
            seed: 42,
            save_dir: None,
        }
    }
}

/// Per-material bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Tally {
    pub deposited: u64,
    pub consumed: u64,
    pub stored: u64,
    pub buffered: u64,
}

impl Tally {
    pub fn balanced(&self) -> bool {
        self.deposited == self.consumed + self.stored + self.buffered
    }
}

#[derive(Debug, Default)]
pub struct SimSummary {
    pub ticks: u64,
    pub nodes: usize,
    pub tallies: BTreeMap<MaterialId, Tally>,
    pub withdrawals: u64,
    pub unsupplied: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub hauled: u64,
    pub abandoned: u64,
    pub materialized: u64,
    pub demoted: u64,
    pub dispatched: u64,
    pub scheduler: Option<SchedulerStats>,
    pub saved: Vec<PathBuf>,
}

impl SimSummary {
    pub fn conserved(&self) -> bool {
        self.tallies.values().all(Tally::balanced)
    }
}

/// Materials used when the configuration defines none.
pub fn default_catalog() -> Result<MaterialCatalog, TypeError> {
    MaterialCatalog::new()
        .with(MaterialDef::resource("Wood", 75))?
        .with(MaterialDef::resource("Steel", 75))?
        .with(MaterialDef::resource("Gold", 10))?
        .with(MaterialDef::crafted("Chair", 1, 100.0))?
        .with(MaterialDef::crafted("Parka", 1, 80.0))
}

enum Job {
    Withdraw {
        task: TaskId,
        worker: WorkerId,
        node: NodeRef,
        material: MaterialId,
        /// Units the worker took straight from the buffer.
        carried: Option<ItemBatch>,
        due: u64,
    },
    Haul {
        task: TaskId,
        worker: WorkerId,
        node: NodeRef,
        handle: ItemHandle,
        due: u64,
    },
}

impl Job {
    fn due(&self) -> u64 {
        match self {
            Job::Withdraw { due, .. } | Job::Haul { due, .. } => *due,
        }
    }
}

struct Sim<'a> {
    opts: &'a SimOptions,
    rng: StdRng,
    registry: StorageNetworkRegistry,
    book: ReservationBook,
    materials: Vec<MaterialDef>,
    jobs: Vec<Job>,
    /// Carried units that could not go back because their node was off.
    stranded: Vec<(NodeRef, ItemBatch)>,
    next_task: u64,
    summary: SimSummary,
}

pub fn run(config: &StashConfig, opts: &SimOptions) -> anyhow::Result<SimSummary> {
    let catalog = if config.materials.is_empty() {
        default_catalog()?
    } else {
        config.materials.clone()
    };
    let materials: Vec<MaterialDef> = catalog.definitions().into_iter().cloned().collect();
    let catalog = Arc::new(catalog);

    let scheduler = JobScheduler::new(&config.scheduler).context("starting job scheduler")?;
    let registry = StorageNetworkRegistry::new(config.registry.clone());
    let handles = HandleAllocator::starting_at(1);
    for region in 0..opts.regions {
        for i in 0..opts.nodes_per_region {
            let node = StorageNode::new(
                format!("r{region}-n{i}"),
                config.node.clone(),
                Arc::clone(&catalog),
                handles.clone(),
            );
            registry.add_node(RegionId(region), node)?;
        }
    }

    let mut sim = Sim {
        opts,
        rng: StdRng::seed_from_u64(opts.seed),
        registry,
        book: ReservationBook::new(),
        materials,
        jobs: Vec::new(),
        stranded: Vec::new(),
        next_task: 1,
        summary: SimSummary {
            ticks: opts.ticks,
            nodes: (opts.regions as usize) * opts.nodes_per_region,
            ..Default::default()
        },
    };

    info!(seed = opts.seed, ticks = opts.ticks, nodes = sim.summary.nodes, "simulation started");
    for now in 0..opts.ticks {
        sim.step(now)?;
        let net = sim.registry.tick_all(now, &sim.book, Some(&scheduler));
        sim.summary.materialized += net.materialized;
        sim.summary.demoted += net.demoted;
        sim.summary.dispatched += net.dispatched as u64;
    }

    sim.unwind(opts.ticks)?;
    sim.drain(opts.ticks, &scheduler);
    sim.tally();

    scheduler.stop();
    sim.summary.scheduler = Some(scheduler.stats());

    if let Some(dir) = &opts.save_dir {
        sim.save(dir)?;
    }
    info!(conserved = sim.summary.conserved(), "simulation finished");
    Ok(sim.summary)
}

impl Sim<'_> {
    fn step(&mut self, now: u64) -> anyhow::Result<()> {
        self.finish_due(now)?;

        if self.rng.gen_bool(0.30) {
            self.deposit()?;
        }
        if self.rng.gen_bool(0.20) {
            self.request(now);
        }
        if self.rng.gen_bool(0.05) {
            self.haul(now);
        }
        if self.rng.gen_bool(0.01) {
            self.consume();
        }
        if self.rng.gen_bool(0.002) {
            self.toggle_power();
        }
        if now % 600 == 0 {
            self.book.prune_stale();
        }
        Ok(())
    }

    fn random_node(&mut self) -> Option<NodeRef> {
        self.registry.all_nodes().choose(&mut self.rng).cloned()
    }

    fn random_material(&mut self) -> MaterialDef {
        let idx = self.rng.gen_range(0..self.materials.len());
        self.materials[idx].clone()
    }

    fn idle_worker(&mut self) -> Option<WorkerId> {
        let worker = WorkerId(self.rng.gen_range(0..self.opts.workers.max(1)));
        self.book.current_task(worker).is_none().then_some(worker)
    }

    fn new_task(&mut self) -> TaskId {
        let task = TaskId(self.next_task);
        self.next_task += 1;
        task
    }

    fn random_batch(&mut self) -> ItemBatch {
        let def = self.random_material();
        let mut key = ItemKey::new(def.id.clone());
        if def.has_quality {
            let stuff = STUFFS[self.rng.gen_range(0..STUFFS.len())];
            let quality = QualityTier::ALL[self.rng.gen_range(0..QualityTier::ALL.len())];
            key = key.with_stuff(stuff).with_quality(quality);
        }
        let count = self.rng.gen_range(1..=def.stack_limit.saturating_mul(2).max(4));
        let durability = if def.has_durability {
            def.max_durability * self.rng.gen_range(0.3f32..=1.0)
        } else {
            0.0
        };
        ItemBatch::new(key, count).with_durability(durability)
    }

    fn deposit(&mut self) -> anyhow::Result<()> {
        let Some(node) = self.random_node() else {
            return Ok(());
        };
        let batch = self.random_batch();
        let direct = self.rng.gen_bool(0.5);
        let material = batch.key.material.clone();
        let count = u64::from(batch.count);

        let mut node = write_node(&node);
        if !node.is_active() {
            return Ok(());
        }
        if direct && node.accepts(&batch) {
            node.insert(batch).context("depositing into ledger")?;
        } else {
            node.deposit_physical(batch).context("depositing into buffer")?;
        }
        self.summary.tallies.entry(material).or_default().deposited += count;
        Ok(())
    }

    fn request(&mut self, now: u64) {
        let Some(worker) = self.idle_worker() else {
            return;
        };
        let def = self.random_material();
        let filter = ItemFilter::material(def.id.clone());
        let count = self
            .rng
            .gen_range(1..=def.stack_limit.saturating_mul(2).clamp(1, 60));
        let region = RegionId(self.rng.gen_range(0..self.opts.regions.max(1)));

        let Some(node) = self.registry.find_node_with_stock(&filter, count, Some(region)) else {
            self.summary.unsupplied += 1;
            return;
        };
        let task = self.new_task();
        self.book.set_current_task(worker, Some(task));

        let result = write_node(&node).extract_for_worker(&filter, count, task, &self.book);
        match result {
            Ok(w) => {
                self.summary.withdrawals += 1;
                let carried = (w.from_buffer > 0).then(|| ItemBatch {
                    key: w.batch.key.clone(),
                    count: w.from_buffer,
                    durability: w.batch.durability,
                });
                let due = now + self.rng.gen_range(30..600);
                self.jobs.push(Job::Withdraw {
                    task,
                    worker,
                    node,
                    material: w.batch.key.material,
                    carried,
                    due,
                });
            }
            Err(NodeError::NoSupply { .. }) => {
                // Enough in total but split across groups.
                self.summary.unsupplied += 1;
                self.book.finish_task(worker, task);
            }
            Err(err) => {
                warn!(%task, error = %err, "withdrawal failed");
                self.book.finish_task(worker, task);
            }
        }
    }

    fn haul(&mut self, now: u64) {
        let Some(worker) = self.idle_worker() else {
            return;
        };
        let Some(node) = self.random_node() else {
            return;
        };
        let handle = {
            let n = read_node(&node);
            let free: Vec<ItemHandle> = n
                .buffer()
                .stacks()
                .map(|s| s.handle)
                .filter(|h| self.book.reservation(*h).is_none())
                .collect();
            free.choose(&mut self.rng).copied()
        };
        let Some(handle) = handle else {
            return;
        };

        let task = self.new_task();
        self.book.set_current_task(worker, Some(task));
        self.book.reserve(handle, worker, task);
        let due = now + self.rng.gen_range(60..900);
        self.jobs.push(Job::Haul {
            task,
            worker,
            node,
            handle,
            due,
        });
    }

    fn consume(&mut self) {
        let Some(node) = self.random_node() else {
            return;
        };
        let def = self.random_material();
        let wanted = self.rng.gen_range(1..20);
        let taken = write_node(&node).deduct(&def.id, wanted);
        if taken > 0 {
            self.summary.tallies.entry(def.id).or_default().consumed += taken;
        }
    }

    fn toggle_power(&mut self) {
        if let Some(node) = self.random_node() {
            let mut node = write_node(&node);
            let active = node.is_active();
            node.set_active(!active);
        }
    }

    fn finish_due(&mut self, now: u64) -> anyhow::Result<()> {
        let (due, pending): (Vec<Job>, Vec<Job>) =
            std::mem::take(&mut self.jobs).into_iter().partition(|j| j.due() <= now);
        self.jobs = pending;
        for job in due {
            let succeed = self.rng.gen_bool(0.75);
            self.finish(job, succeed)?;
        }
        Ok(())
    }

    fn finish(&mut self, job: Job, succeed: bool) -> anyhow::Result<()> {
        match job {
            Job::Withdraw {
                task,
                worker,
                node,
                material,
                carried,
                ..
            } => {
                if succeed {
                    let from_ledger = self.registry.complete_task(task);
                    let from_buffer = carried.map_or(0, |b| u64::from(b.count));
                    self.summary.tallies.entry(material).or_default().consumed +=
                        from_ledger + from_buffer;
                    self.summary.completed += 1;
                } else {
                    self.registry.cancel_task(task);
                    if let Some(batch) = carried {
                        self.put_back(node, batch)?;
                    }
                    self.summary.cancelled += 1;
                }
                self.book.finish_task(worker, task);
            }
            Job::Haul {
                task,
                worker,
                node,
                handle,
                ..
            } => {
                if succeed || !self.rng.gen_bool(0.5) {
                    if self.book.reservation(handle).map(|r| r.task) == Some(task) {
                        if let Some(stack) = write_node(&node).remove_physical(handle) {
                            self.summary
                                .tallies
                                .entry(stack.batch.key.material)
                                .or_default()
                                .consumed += u64::from(stack.batch.count);
                            self.summary.hauled += 1;
                        }
                    }
                    self.book.finish_task(worker, task);
                } else {
                    // Walks off without releasing; the reservation goes stale.
                    self.book.set_current_task(worker, None);
                    self.summary.abandoned += 1;
                }
            }
        }
        Ok(())
    }

    fn put_back(&mut self, node: NodeRef, batch: ItemBatch) -> anyhow::Result<()> {
        let result = write_node(&node).deposit_physical(batch.clone());
        match result {
            Ok(_) => Ok(()),
            Err(NodeError::Inactive(_)) => {
                self.stranded.push((node, batch));
                Ok(())
            }
            Err(err) => Err(err).context("returning carried units"),
        }
    }

    /// Power everything back up and close every open task.
    fn unwind(&mut self, now: u64) -> anyhow::Result<()> {
        for node in self.registry.all_nodes() {
            write_node(&node).set_active(true);
        }
        for job in std::mem::take(&mut self.jobs) {
            self.finish(job, false)?;
        }
        for (node, batch) in std::mem::take(&mut self.stranded) {
            write_node(&node).deposit_physical(batch)?;
        }
        debug!(now, "unwound open tasks");
        Ok(())
    }

    /// Commit every overflow plan still in flight.
    fn drain(&mut self, now: u64, scheduler: &JobScheduler) {
        let nodes = self.registry.all_nodes();
        for node in &nodes {
            write_node(node).set_active(false);
        }
        for _ in 0..10 {
            scheduler.wait_idle(Duration::from_secs(5));
            let net = self.registry.tick_all(now, &self.book, Some(scheduler));
            self.summary.demoted += net.demoted;
            if !nodes.iter().any(|n| read_node(n).scan_in_flight()) {
                break;
            }
        }
        for node in &nodes {
            write_node(node).set_active(true);
        }
    }

    fn tally(&mut self) {
        let nodes = self.registry.all_nodes();
        for def in &self.materials {
            let tally = self.summary.tallies.entry(def.id.clone()).or_default();
            for node in &nodes {
                let n = read_node(node);
                tally.stored += n.ledger().query(&def.id, None);
                tally.buffered += n
                    .buffer()
                    .quantity_matching(&ItemFilter::material(def.id.clone()));
            }
        }
    }

    fn save(&mut self, dir: &std::path::Path) -> anyhow::Result<()> {
        for (region, save) in self.registry.save_all() {
            let path = dir.join(format!("{}-{}.json", region.get(), save.name));
            save.write_to(&path)
                .with_context(|| format!("writing {}", path.display()))?;
            self.summary.saved.push(path);
        }
        Ok(())
    }
}

//! Reserved-buffer maintenance: top-up from the ledger and overflow demotion.
//!
//! Every node keeps a small number of real units per identity group next to
//! it. Two timed cycles hold the buffer near that target:
//!
//! - **top-up** pulls the shortfall out of the ledger and materializes it in
//!   stacks no larger than the material's stack limit;
//! - **overflow** demotes unclaimed excess back into the ledger.
//!
//! Overflow scans over large buffers run on the [`JobScheduler`]. The job
//! only produces a [`DemotionPlan`]; the plan is pushed to a [`CommitQueue`]
//! and applied by [`ReservedBufferManager::apply_pending`] on the thread that
//! owns the node. Plans are re-validated against the live buffer there, so a
//! plan that went stale while it was in flight can only do less, never more.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use stash_jobs::{CommitQueue, JobScheduler};
use stash_ledger::VirtualLedger;
use stash_types::{ItemBatch, ItemKey, MaterialCatalog, NodeId};

use crate::buffer::{HandleAllocator, PhysicalBuffer};
use crate::claims::TaskClaimChecker;
use crate::config::NodeConfig;
use crate::demotion::{plan_demotion, DemotionEntry, DemotionPlan, StackSnapshot};

/// Mutable view of one node's stores plus the settings that govern them.
pub struct NodeStock<'a> {
    pub ledger: &'a mut VirtualLedger,
    pub buffer: &'a mut PhysicalBuffer,
    pub config: &'a NodeConfig,
    pub catalog: &'a MaterialCatalog,
    pub handles: &'a HandleAllocator,
}

impl NodeStock<'_> {
    /// Units per ledger group currently sitting in the buffer.
    pub fn physical_by_group(&self) -> HashMap<ItemKey, u64> {
        let ledger = &*self.ledger;
        self.buffer.totals_by(|key| ledger.group_key(key))
    }

    pub fn target_for(&self, group: &ItemKey) -> u32 {
        self.config.target_for(&group.material)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopUpReport {
    /// Units moved from the ledger into the buffer.
    pub materialized: u64,
    /// Stacks created.
    pub stacks: usize,
    /// Groups still short after the cycle because the ledger ran dry.
    pub deferred: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DemotionReport {
    pub plans: usize,
    /// Units moved from the buffer into the ledger.
    pub demoted: u64,
    /// Planned takes dropped because the stack vanished, got claimed, or the
    /// group was no longer over target.
    pub skipped: usize,
    /// Groups left physical because the ledger had no room for them.
    pub refused: usize,
}

impl DemotionReport {
    fn add(&mut self, other: DemotionReport) {
        self.plans += other.plans;
        self.demoted += other.demoted;
        self.skipped += other.skipped;
        self.refused += other.refused;
    }
}

/// How an overflow scan was carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowScan {
    /// Nothing was over target.
    Idle,
    /// Planned on the calling thread.
    Inline,
    /// Handed to the job scheduler; the plan arrives on a later tick.
    Dispatched,
    /// A previous background scan has not reported back yet.
    InFlight,
}

/// Outcome of one [`ReservedBufferManager::tick`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub applied: DemotionReport,
    pub top_up: Option<TopUpReport>,
    pub overflow: Option<OverflowScan>,
}

/// Running totals across the life of a node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedStats {
    pub topup_cycles: u64,
    pub overflow_cycles: u64,
    pub materialized: u64,
    pub demoted: u64,
    pub inline_scans: u64,
    pub dispatched_scans: u64,
    pub lost_scans: u64,
}

/// Timers and handoff state for one node's reserved buffer.
#[derive(Debug)]
pub struct ReservedBufferManager {
    node: NodeId,
    plans: CommitQueue<DemotionPlan>,
    next_topup: u64,
    next_overflow: u64,
    in_flight_since: Option<u64>,
    stats: ReservedStats,
}

impl ReservedBufferManager {
    /// Both cycles are due on the first tick at or after `now`.
    pub fn new(node: NodeId, now: u64) -> Self {
        Self {
            node,
            plans: CommitQueue::new(),
            next_topup: now,
            next_overflow: now,
            in_flight_since: None,
            stats: ReservedStats::default(),
        }
    }

    pub fn stats(&self) -> ReservedStats {
        self.stats
    }

    /// A background scan was dispatched and its plan not yet applied.
    pub fn scan_in_flight(&self) -> bool {
        self.in_flight_since.is_some()
    }

    pub fn pending_plans(&self) -> usize {
        self.plans.len()
    }

    /// Drive both cycles for one simulation tick.
    ///
    /// Pending plans are applied first. When `active` is false no new cycle
    /// starts, but plans already computed are still committed.
    pub fn tick(
        &mut self,
        now: u64,
        stock: &mut NodeStock<'_>,
        claims: &dyn TaskClaimChecker,
        scheduler: Option<&JobScheduler>,
        active: bool,
    ) -> CycleReport {
        let mut report = CycleReport {
            applied: self.apply_pending(stock, claims),
            ..Default::default()
        };
        if !active {
            return report;
        }

        if now >= self.next_topup {
            self.next_topup = now + stock.config.topup_interval.max(1);
            report.top_up = Some(self.top_up(stock));
        }

        if now >= self.next_overflow {
            self.next_overflow = now + stock.config.overflow_interval.max(1);
            let scan = self.scan_overflow(now, stock, claims, scheduler);
            if scan == OverflowScan::Inline {
                report.applied.add(self.apply_pending(stock, claims));
            }
            report.overflow = Some(scan);
        }

        report
    }

    /// Bring every ledger group below target up toward it.
    ///
    /// Shortfall the ledger cannot cover is left for a later cycle.
    pub fn top_up(&mut self, stock: &mut NodeStock<'_>) -> TopUpReport {
        let mut report = TopUpReport::default();
        let mut physical = stock.physical_by_group();

        let groups: Vec<(ItemKey, u64)> = stock
            .ledger
            .records()
            .iter()
            .map(|r| (r.key().clone(), r.quantity()))
            .collect();

        for (key, available) in groups {
            let group = stock.ledger.group_key(&key);
            let target = u64::from(stock.target_for(&group));
            let have = physical.get(&group).copied().unwrap_or(0);
            if have >= target {
                continue;
            }

            let shortfall = target - have;
            let take = shortfall.min(available) as u32;
            if u64::from(take) < shortfall {
                report.deferred += 1;
            }
            if take == 0 {
                continue;
            }

            let batch = match stock.ledger.extract_exact(&key, take) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(node = %self.node, %key, error = %err, "top-up extraction failed");
                    continue;
                }
            };
            let limit = stock.catalog.stack_limit(&key.material);
            let placed = stock.buffer.materialize(batch, limit, stock.handles);
            trace!(node = %self.node, %key, units = take, stacks = placed.len(), "topped up buffer");

            *physical.entry(group).or_insert(0) += u64::from(take);
            report.materialized += u64::from(take);
            report.stacks += placed.len();
        }

        self.stats.topup_cycles += 1;
        self.stats.materialized += report.materialized;
        if stock.config.diagnostics {
            info!(node = %self.node, materialized = report.materialized, stacks = report.stacks, deferred = report.deferred, "top-up cycle");
        } else {
            debug!(node = %self.node, materialized = report.materialized, deferred = report.deferred, "top-up cycle");
        }
        report
    }

    /// Snapshot the buffer and plan demotion of everything over target.
    ///
    /// Small buffers, or calls without a scheduler, plan inline. Otherwise the
    /// plan is computed on a worker; a refused job runs inline instead.
    pub fn scan_overflow(
        &mut self,
        now: u64,
        stock: &NodeStock<'_>,
        claims: &dyn TaskClaimChecker,
        scheduler: Option<&JobScheduler>,
    ) -> OverflowScan {
        if let Some(since) = self.in_flight_since {
            let patience = stock.config.overflow_interval.max(1) * 2;
            if now.saturating_sub(since) < patience {
                return OverflowScan::InFlight;
            }
            warn!(node = %self.node, since, "overflow scan never reported back; rescanning");
            self.stats.lost_scans += 1;
            self.in_flight_since = None;
        }
        self.stats.overflow_cycles += 1;

        let physical = stock.physical_by_group();
        let targets: HashMap<ItemKey, u32> = physical
            .keys()
            .map(|group| (group.clone(), stock.target_for(group)))
            .collect();
        if !physical
            .iter()
            .any(|(group, units)| *units > u64::from(targets[group]))
        {
            return OverflowScan::Idle;
        }

        let stacks: Vec<StackSnapshot> = stock
            .buffer
            .stacks()
            .map(|s| StackSnapshot {
                handle: s.handle,
                key: s.batch.key.clone(),
                group: stock.ledger.group_key(&s.batch.key),
                count: s.batch.count,
                claimed: claims.is_still_claimed(s.handle),
            })
            .collect();

        let node = self.node;
        let scheduler = match scheduler {
            Some(s) if stacks.len() > stock.config.inline_demotion_limit => s,
            _ => {
                self.plans.push(plan_demotion(node, stacks, &targets));
                self.stats.inline_scans += 1;
                return OverflowScan::Inline;
            }
        };

        let queue = self.plans.clone();
        let job = move || queue.push(plan_demotion(node, stacks, &targets));
        match scheduler.try_enqueue(job) {
            Ok(()) => {
                self.in_flight_since = Some(now);
                self.stats.dispatched_scans += 1;
                trace!(node = %node, "dispatched overflow scan");
                OverflowScan::Dispatched
            }
            Err(rejected) => {
                warn!(node = %node, reason = %rejected.reason(), "overflow scan refused; planning inline");
                (rejected.into_job())();
                self.stats.inline_scans += 1;
                OverflowScan::Inline
            }
        }
    }

    /// Commit every plan that has arrived since the last call.
    pub fn apply_pending(
        &mut self,
        stock: &mut NodeStock<'_>,
        claims: &dyn TaskClaimChecker,
    ) -> DemotionReport {
        let mut report = DemotionReport::default();
        for plan in self.plans.drain() {
            if plan.node != self.node {
                warn!(node = %self.node, plan_node = %plan.node, "dropping plan addressed to another node");
                continue;
            }
            self.in_flight_since = None;
            report.plans += 1;

            let mut physical = stock.physical_by_group();
            for entry in plan.entries {
                self.apply_entry(entry, stock, claims, &mut physical, &mut report);
            }
        }

        if report.plans > 0 {
            self.stats.demoted += report.demoted;
            if stock.config.diagnostics {
                info!(node = %self.node, demoted = report.demoted, skipped = report.skipped, refused = report.refused, "overflow cycle");
            } else {
                debug!(node = %self.node, demoted = report.demoted, skipped = report.skipped, refused = report.refused, "overflow cycle");
            }
        }
        report
    }

    fn apply_entry(
        &self,
        entry: DemotionEntry,
        stock: &mut NodeStock<'_>,
        claims: &dyn TaskClaimChecker,
        physical: &mut HashMap<ItemKey, u64>,
        report: &mut DemotionReport,
    ) {
        let group = entry.group;
        if !stock.ledger.accepts(&ItemBatch::new(group.clone(), 1)) {
            warn!(node = %self.node, %group, "ledger full; overflow stays physical");
            report.refused += 1;
            return;
        }

        let target = u64::from(stock.target_for(&group));
        let have = physical.get(&group).copied().unwrap_or(0);
        let mut excess = have.saturating_sub(target);

        let mut merged: Option<ItemBatch> = None;
        for take in entry.takes {
            if excess == 0 {
                report.skipped += 1;
                continue;
            }
            let valid = stock.buffer.get(take.handle).is_some_and(|s| {
                stock.ledger.group_key(&s.batch.key) == group
            }) && !claims.is_still_claimed(take.handle);
            if !valid {
                report.skipped += 1;
                continue;
            }

            let count = u64::from(take.count).min(excess) as u32;
            let Some(part) = stock.buffer.take(take.handle, count) else {
                report.skipped += 1;
                continue;
            };
            excess -= u64::from(part.count);
            match merged.as_mut() {
                // Same group, so the merge cannot fail.
                Some(batch) => {
                    let _ = batch.absorb(part);
                }
                None => merged = Some(part),
            }
        }

        let Some(batch) = merged else {
            return;
        };
        let units = u64::from(batch.count);
        match stock.ledger.insert(batch.clone()) {
            Ok(_) => {
                report.demoted += units;
                if let Some(total) = physical.get_mut(&group) {
                    *total -= units;
                }
            }
            Err(err) => {
                warn!(node = %self.node, %group, error = %err, "demotion refused; returning units to buffer");
                let limit = stock.catalog.stack_limit(&batch.key.material);
                stock.buffer.materialize(batch, limit, stock.handles);
                report.refused += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use stash_jobs::SchedulerConfig;
    use stash_ledger::LedgerConfig;
    use stash_types::{ItemHandle, MaterialDef};

    use crate::claims::NoClaims;

    struct Fixture {
        ledger: VirtualLedger,
        buffer: PhysicalBuffer,
        config: NodeConfig,
        catalog: MaterialCatalog,
        handles: HandleAllocator,
    }

    impl Fixture {
        fn new() -> Self {
            let catalog = MaterialCatalog::new()
                .with(MaterialDef::resource("Wood", 75))
                .unwrap()
                .with(MaterialDef::resource("Steel", 75))
                .unwrap()
                .with(MaterialDef::resource("Gold", 10))
                .unwrap();
            Self {
                ledger: VirtualLedger::default(),
                buffer: PhysicalBuffer::new(),
                config: NodeConfig::default(),
                catalog,
                handles: HandleAllocator::starting_at(1_000),
            }
        }

        fn stock(&mut self) -> NodeStock<'_> {
            NodeStock {
                ledger: &mut self.ledger,
                buffer: &mut self.buffer,
                config: &self.config,
                catalog: &self.catalog,
                handles: &self.handles,
            }
        }

        fn physical(&self, material: &str) -> u64 {
            self.buffer.quantity(&ItemKey::new(material))
        }

        fn stored(&self, material: &str) -> u64 {
            self.ledger.query(&material.into(), None)
        }
    }

    fn wood(count: u32) -> ItemBatch {
        ItemBatch::new(ItemKey::new("Wood"), count)
    }

    #[test]
    fn top_up_fills_to_target_in_stack_limited_chunks() {
        let mut fx = Fixture::new();
        fx.ledger.insert(ItemBatch::new(ItemKey::new("Gold"), 500)).unwrap();
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);

        let report = mgr.top_up(&mut fx.stock());
        assert_eq!(report.materialized, 75);
        assert_eq!(report.stacks, 8);
        assert_eq!(report.deferred, 0);
        assert!(fx.buffer.stacks().all(|s| s.batch.count <= 10));
        assert_eq!(fx.physical("Gold"), 75);
        assert_eq!(fx.stored("Gold"), 425);
    }

    #[test]
    fn top_up_defers_when_ledger_runs_short() {
        let mut fx = Fixture::new();
        fx.ledger.insert(wood(30)).unwrap();
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);

        let report = mgr.top_up(&mut fx.stock());
        assert_eq!(report.materialized, 30);
        assert_eq!(report.deferred, 1);
        assert_eq!(fx.physical("Wood"), 30);
        assert!(fx.ledger.is_empty());
    }

    #[test]
    fn top_up_ignores_groups_at_target() {
        let mut fx = Fixture::new();
        fx.ledger.insert(wood(200)).unwrap();
        fx.buffer.place(ItemHandle(1), wood(75));
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);

        assert_eq!(mgr.top_up(&mut fx.stock()).materialized, 0);
        assert_eq!(fx.stored("Wood"), 200);
    }

    // 150 wood in the buffer, target 75, empty ledger.
    #[test]
    fn overflow_cycle_demotes_excess_wood() {
        let mut fx = Fixture::new();
        fx.buffer.place(ItemHandle(1), wood(75));
        fx.buffer.place(ItemHandle(2), wood(75));
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);

        let report = mgr.tick(0, &mut fx.stock(), &NoClaims, None, true);
        assert_eq!(report.overflow, Some(OverflowScan::Inline));
        assert_eq!(report.applied.demoted, 75);
        assert_eq!(fx.stored("Wood"), 75);
        assert_eq!(fx.physical("Wood"), 75);

        // Next top-up sees the group at target and leaves it alone.
        let report = mgr.tick(60, &mut fx.stock(), &NoClaims, None, true);
        assert_eq!(report.top_up.map(|r| r.materialized), Some(0));
        assert_eq!(fx.stored("Wood"), 75);
        assert_eq!(fx.physical("Wood"), 75);
    }

    #[test]
    fn live_claims_protect_stacks() {
        let mut fx = Fixture::new();
        fx.buffer.place(ItemHandle(1), wood(75));
        fx.buffer.place(ItemHandle(2), wood(75));
        let claims = |h: ItemHandle| h == ItemHandle(1) || h == ItemHandle(2);
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);

        let report = mgr.tick(0, &mut fx.stock(), &claims, None, true);
        assert_eq!(report.applied.demoted, 0);
        assert_eq!(fx.physical("Wood"), 150);
    }

    #[test]
    fn full_ledger_leaves_overflow_physical() {
        let mut fx = Fixture::new();
        fx.config.ledger = LedgerConfig {
            base_capacity: 1,
            ..Default::default()
        };
        fx.ledger = VirtualLedger::new(fx.config.ledger.clone());
        fx.ledger.insert(ItemBatch::new(ItemKey::new("Steel"), 500)).unwrap();
        fx.buffer.place(ItemHandle(1), wood(75));
        fx.buffer.place(ItemHandle(2), wood(75));
        fx.buffer.place(ItemHandle(3), ItemBatch::new(ItemKey::new("Steel"), 75));
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);

        let report = mgr.tick(0, &mut fx.stock(), &NoClaims, None, true);
        assert_eq!(report.applied.refused, 1);
        assert_eq!(fx.physical("Wood"), 150);
        assert_eq!(fx.stored("Steel"), 500);
    }

    #[test]
    fn stale_plan_is_revalidated() {
        let mut fx = Fixture::new();
        let node = NodeId::new();
        fx.buffer.place(ItemHandle(1), wood(75));
        fx.buffer.place(ItemHandle(2), wood(75));
        let mut mgr = ReservedBufferManager::new(node, 0);

        let stacks: Vec<StackSnapshot> = fx
            .buffer
            .stacks()
            .map(|s| StackSnapshot {
                handle: s.handle,
                key: s.batch.key.clone(),
                group: s.batch.key.clone(),
                count: s.batch.count,
                claimed: false,
            })
            .collect();
        let targets = HashMap::from([(ItemKey::new("Wood"), 75)]);
        mgr.plans.push(plan_demotion(node, stacks, &targets));

        // A worker hauls one stack away before the plan is committed.
        fx.buffer.remove(ItemHandle(1));

        let report = mgr.apply_pending(&mut fx.stock(), &NoClaims);
        assert_eq!(report.demoted, 0);
        assert_eq!(fx.physical("Wood"), 75);
        assert!(fx.ledger.is_empty());
    }

    #[test]
    fn large_buffers_are_scanned_in_the_background() {
        let scheduler = JobScheduler::new(&SchedulerConfig {
            workers: Some(2),
            ..Default::default()
        })
        .unwrap();
        let mut fx = Fixture::new();
        fx.config.inline_demotion_limit = 4;
        for h in 0..10 {
            fx.buffer.place(ItemHandle(h), wood(20));
        }
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);

        let report = mgr.tick(0, &mut fx.stock(), &NoClaims, Some(&scheduler), true);
        assert_eq!(report.overflow, Some(OverflowScan::Dispatched));
        assert!(mgr.scan_in_flight());
        // Ledger untouched until the plan is drained on this thread.
        assert!(fx.ledger.is_empty());

        assert!(scheduler.wait_idle(Duration::from_secs(5)));
        let report = mgr.tick(1, &mut fx.stock(), &NoClaims, Some(&scheduler), true);
        assert_eq!(report.applied.plans, 1);
        assert_eq!(report.applied.demoted, 125);
        assert!(!mgr.scan_in_flight());
        assert_eq!(fx.physical("Wood"), 75);
        assert_eq!(fx.stored("Wood"), 125);
    }

    #[test]
    fn stopped_scheduler_falls_back_inline() {
        let scheduler = JobScheduler::new(&SchedulerConfig {
            workers: Some(1),
            ..Default::default()
        })
        .unwrap();
        scheduler.stop();
        let mut fx = Fixture::new();
        fx.config.inline_demotion_limit = 0;
        fx.buffer.place(ItemHandle(1), wood(100));
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);

        let report = mgr.tick(0, &mut fx.stock(), &NoClaims, Some(&scheduler), true);
        assert_eq!(report.overflow, Some(OverflowScan::Inline));
        assert_eq!(fx.stored("Wood"), 25);
    }

    #[test]
    fn lost_scan_is_retried() {
        let mut fx = Fixture::new();
        fx.buffer.place(ItemHandle(1), wood(100));
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);
        mgr.in_flight_since = Some(0);

        let scan = mgr.scan_overflow(10, &fx.stock(), &NoClaims, None);
        assert_eq!(scan, OverflowScan::InFlight);

        let scan = mgr.scan_overflow(600, &fx.stock(), &NoClaims, None);
        assert_eq!(scan, OverflowScan::Inline);
        assert_eq!(mgr.stats().lost_scans, 1);
    }

    #[test]
    fn inactive_nodes_only_commit() {
        let mut fx = Fixture::new();
        fx.ledger.insert(wood(100)).unwrap();
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);

        let report = mgr.tick(0, &mut fx.stock(), &NoClaims, None, false);
        assert!(report.top_up.is_none());
        assert!(report.overflow.is_none());
        assert!(fx.buffer.is_empty());
    }

    #[test]
    fn cycles_follow_their_intervals() {
        let mut fx = Fixture::new();
        let mut mgr = ReservedBufferManager::new(NodeId::new(), 0);

        let at = |mgr: &mut ReservedBufferManager, fx: &mut Fixture, now| {
            mgr.tick(now, &mut fx.stock(), &NoClaims, None, true)
        };
        let r = at(&mut mgr, &mut fx, 0);
        assert!(r.top_up.is_some() && r.overflow.is_some());
        let r = at(&mut mgr, &mut fx, 59);
        assert!(r.top_up.is_none() && r.overflow.is_none());
        let r = at(&mut mgr, &mut fx, 60);
        assert!(r.top_up.is_some() && r.overflow.is_none());
        let r = at(&mut mgr, &mut fx, 300);
        assert!(r.top_up.is_some() && r.overflow.is_some());
        assert_eq!(mgr.stats().topup_cycles, 3);
    }
}

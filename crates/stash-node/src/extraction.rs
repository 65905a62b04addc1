//! Handing items to workers: buffer first, ledger second.
//!
//! Whatever a withdrawal pulls out of the ledger is recorded against the
//! requesting task. Completing the task forgets the record; cancelling it
//! puts the units back so nothing materialized for a failed task is lost.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, trace, warn};

use stash_ledger::{LedgerError, VirtualLedger};
use stash_types::{BatchSource, ItemBatch, ItemFilter, ItemHandle, ItemKey, NodeId, TaskId};

use crate::buffer::PhysicalBuffer;
use crate::claims::TaskClaimChecker;
use crate::error::{NodeError, NodeResult};
use crate::reserved::NodeStock;

/// Units handed to a worker for one request.
#[derive(Clone, Debug, PartialEq)]
pub struct Withdrawal {
    pub batch: ItemBatch,
    pub from_buffer: u32,
    pub from_ledger: u32,
    pub source: BatchSource,
}

/// What cancelling a task put back.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CancelReport {
    /// Units merged back into the ledger.
    pub restored: u64,
    /// Units that no longer fit in the ledger and were placed in the buffer.
    pub spilled: u64,
    pub spilled_stacks: Vec<ItemHandle>,
}

/// Table of ledger units currently out with in-flight tasks.
#[derive(Clone, Debug, Default)]
pub struct ExtractionProtocol {
    extracted: HashMap<TaskId, Vec<ItemBatch>>,
}

impl ExtractionProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether buffer and ledger together hold `count` units matching
    /// `filter`. Claims are not consulted.
    pub fn can_supply(
        ledger: &VirtualLedger,
        buffer: &PhysicalBuffer,
        filter: &ItemFilter,
        count: u32,
    ) -> bool {
        let total = buffer.quantity_matching(filter) + ledger.count_matching(filter);
        total >= u64::from(count)
    }

    /// Withdraw `count` units of a single identity group matching `filter`.
    ///
    /// Unclaimed buffer stacks are used first; the remainder comes out of the
    /// ledger and is recorded against `task`. The group with the most units
    /// already in the buffer wins among those that can cover the request.
    pub fn extract_for_worker(
        &mut self,
        node: NodeId,
        stock: &mut NodeStock<'_>,
        filter: &ItemFilter,
        count: u32,
        task: TaskId,
        claims: &dyn TaskClaimChecker,
    ) -> NodeResult<Withdrawal> {
        if count == 0 {
            return Err(NodeError::EmptyRequest);
        }

        // group -> unclaimed matching buffer stacks, in handle order
        let mut buffered: BTreeMap<ItemKey, Vec<(ItemHandle, u32)>> = BTreeMap::new();
        for stack in stock.buffer.stacks() {
            if filter.matches(&stack.batch.key) && !claims.is_still_claimed(stack.handle) {
                buffered
                    .entry(stock.ledger.group_key(&stack.batch.key))
                    .or_default()
                    .push((stack.handle, stack.batch.count));
            }
        }

        // group -> (unclaimed buffered units, largest single ledger record)
        let mut candidates: BTreeMap<ItemKey, (u64, u64)> = BTreeMap::new();
        for (group, stacks) in &buffered {
            let units = stacks.iter().map(|(_, c)| u64::from(*c)).sum::<u64>();
            candidates.entry(group.clone()).or_default().0 = units;
        }
        for record in stock.ledger.records() {
            if filter.matches(record.key()) {
                let group = stock.ledger.group_key(record.key());
                let largest = &mut candidates.entry(group).or_default().1;
                *largest = (*largest).max(record.quantity());
            }
        }

        let mut ranked: Vec<(ItemKey, u64, u64)> = candidates
            .into_iter()
            .map(|(group, (buffer, ledger))| (group, buffer, ledger))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let needed = u64::from(count);
        let Some((group, in_buffer, _)) = ranked
            .into_iter()
            .find(|(_, buffer, ledger)| buffer + ledger >= needed)
        else {
            trace!(%node, %filter, count, "no single group can supply request");
            return Err(NodeError::NoSupply {
                filter: filter.to_string(),
                requested: count,
            });
        };

        let from_buffer = in_buffer.min(needed) as u32;
        let from_ledger = count - from_buffer;

        // The ledger part is the only step that can fail, so it goes first.
        let ledger_part = if from_ledger > 0 {
            Some(stock.ledger.extract_exact(&group, from_ledger)?)
        } else {
            None
        };

        let mut batch: Option<ItemBatch> = None;
        let mut remaining = from_buffer;
        for (handle, _) in buffered.remove(&group).unwrap_or_default() {
            if remaining == 0 {
                break;
            }
            if let Some(part) = stock.buffer.take(handle, remaining) {
                remaining -= part.count;
                merge_into(&mut batch, part)?;
            }
        }
        if let Some(part) = ledger_part.clone() {
            merge_into(&mut batch, part)?;
        }
        let batch = batch.ok_or(NodeError::Ledger(LedgerError::EmptyBatch))?;

        let source = match ledger_part {
            Some(part) => {
                let key = part.key.clone();
                self.extracted.entry(task).or_default().push(part);
                BatchSource::Virtual { origin: node, key }
            }
            None => BatchSource::Physical,
        };

        debug!(%node, %task, key = %batch.key, from_buffer, from_ledger, "withdrew for worker");
        Ok(Withdrawal {
            batch,
            from_buffer,
            from_ledger,
            source,
        })
    }

    /// Forget the ledger units recorded for `task`. Returns how many there were.
    pub fn complete_task(&mut self, task: TaskId) -> u64 {
        let units = self
            .extracted
            .remove(&task)
            .map_or(0, |batches| batches.iter().map(|b| u64::from(b.count)).sum());
        if units > 0 {
            trace!(%task, units, "task settled");
        }
        units
    }

    /// Return every batch recorded for `task` to the ledger.
    ///
    /// A batch whose group no longer fits in the ledger is materialized into
    /// the buffer instead.
    pub fn cancel_task(&mut self, task: TaskId, stock: &mut NodeStock<'_>) -> CancelReport {
        let mut report = CancelReport::default();
        for batch in self.extracted.remove(&task).unwrap_or_default() {
            let units = u64::from(batch.count);
            match stock.ledger.insert(batch.clone()) {
                Ok(_) => report.restored += units,
                Err(err) => {
                    warn!(%task, key = %batch.key, error = %err, "ledger refused cancelled units; placing them in the buffer");
                    let limit = stock.catalog.stack_limit(&batch.key.material);
                    report
                        .spilled_stacks
                        .extend(stock.buffer.materialize(batch, limit, stock.handles));
                    report.spilled += units;
                }
            }
        }
        if report.restored + report.spilled > 0 {
            debug!(%task, restored = report.restored, spilled = report.spilled, "task cancelled");
        }
        report
    }

    /// Ledger batches currently out with `task`.
    pub fn outstanding(&self, task: TaskId) -> &[ItemBatch] {
        self.extracted.get(&task).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn in_flight_tasks(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.extracted.keys().copied()
    }

    /// Ledger units out with all in-flight tasks.
    pub fn outstanding_units(&self) -> u64 {
        self.extracted
            .values()
            .flatten()
            .map(|b| u64::from(b.count))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.extracted.is_empty()
    }

    pub(crate) fn take_all(&mut self) -> HashMap<TaskId, Vec<ItemBatch>> {
        std::mem::take(&mut self.extracted)
    }
}

fn merge_into(slot: &mut Option<ItemBatch>, part: ItemBatch) -> NodeResult<()> {
    match slot {
        Some(batch) => batch.absorb(part)?,
        None => *slot = Some(part),
    }
    Ok(())
}

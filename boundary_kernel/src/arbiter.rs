/// Boundary Kernel — Instrument Arbiter
///
/// Resolves fired candidates against what is already mounted.
/// Every function takes the current table by reference and returns a
/// new table plus the mount/unmount instructions for the UI. The input
/// table is never mutated.
///
/// Rules:
///   1. At most one modal. A strictly higher priority modal preempts one
///      that is not mid-interaction; the preempted modal is re-queued.
///      Anything else is queued, never dropped.
///   2. Overlays coexist, capped per layer; the oldest non-pinned
///      overlay is evicted when the cap is exceeded.
///   3. Priority class first, then arrival order (FIFO). New candidates
///      and queued modals are one pool: a new modal never takes a free
///      slot ahead of a better queued one.
///   4. Queued modals are re-confirmed against the rule table when the
///      modal slot frees up; those whose predicate no longer holds are
///      dropped.

use serde::{Deserialize, Serialize};

use crate::domain::Layer;
use crate::instruments::{Instrument, Presentation};
use crate::rules::{Candidate, RuleTable};
use crate::state::StateStore;

/// Monotonic handle for one mounted (or queued) instrument.
/// Allocation order is arrival order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mounted {
    pub instance: InstanceId,
    pub candidate: Candidate,
    pub pinned: bool,
    pub mid_interaction: bool,
}

impl Mounted {
    fn sort_key(&self) -> (u8, InstanceId) {
        (self.candidate.priority.rank(), self.instance)
    }

    fn same_trigger(&self, candidate: &Candidate) -> bool {
        self.candidate.rule_id == candidate.rule_id
            && self.candidate.instrument == candidate.instrument
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmountReason {
    Preempted,
    Evicted,
    Completed,
    Dismissed,
    /// The condition that summoned an overlay no longer holds.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MountInstruction {
    Mount {
        instance: InstanceId,
        instrument: Instrument,
        presentation: Presentation,
    },
    Unmount {
        instance: InstanceId,
        reason: UnmountReason,
    },
}

impl MountInstruction {
    fn mount(m: &Mounted) -> Self {
        MountInstruction::Mount {
            instance: m.instance,
            instrument: m.candidate.instrument.clone(),
            presentation: m.candidate.instrument.presentation(),
        }
    }
}

/// Maximum simultaneous overlays per layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayCaps {
    pub sovereign: usize,
    pub commons: usize,
    pub builder: usize,
}

impl Default for OverlayCaps {
    fn default() -> Self {
        Self {
            sovereign: 2,
            commons: 2,
            builder: 4,
        }
    }
}

impl OverlayCaps {
    pub fn cap_for(&self, layer: Layer) -> usize {
        match layer {
            Layer::Sovereign => self.sovereign,
            Layer::Commons => self.commons,
            Layer::Builder => self.builder,
        }
    }
}

/// What is mounted, what is waiting, and the next instance id.
#[derive(Debug, Clone, PartialEq)]
pub struct MountTable {
    modal: Option<Mounted>,
    overlays: Vec<Mounted>,
    queue: Vec<Mounted>,
    next_instance: u64,
}

impl Default for MountTable {
    fn default() -> Self {
        Self {
            modal: None,
            overlays: Vec::new(),
            queue: Vec::new(),
            next_instance: 1,
        }
    }
}

impl MountTable {
    pub fn modal(&self) -> Option<&Mounted> {
        self.modal.as_ref()
    }

    pub fn overlays(&self) -> &[Mounted] {
        &self.overlays
    }

    /// Waiting modals in the order they would be replayed.
    pub fn queue(&self) -> Vec<&Mounted> {
        let mut q: Vec<&Mounted> = self.queue.iter().collect();
        q.sort_by_key(|m| m.sort_key());
        q
    }

    /// A mounted (not queued) instrument.
    pub fn find(&self, instance: InstanceId) -> Option<&Mounted> {
        self.modal
            .iter()
            .chain(self.overlays.iter())
            .find(|m| m.instance == instance)
    }

    pub fn is_queued(&self, instance: InstanceId) -> bool {
        self.queue.iter().any(|m| m.instance == instance)
    }

    fn contains_trigger(&self, candidate: &Candidate) -> bool {
        self.modal
            .iter()
            .chain(self.overlays.iter())
            .chain(self.queue.iter())
            .any(|m| m.same_trigger(candidate))
    }

    fn allocate(&mut self, candidate: Candidate) -> Mounted {
        let instance = InstanceId(self.next_instance);
        self.next_instance += 1;
        Mounted {
            instance,
            pinned: candidate.instrument.pinned_by_default(),
            candidate,
            mid_interaction: false,
        }
    }

    /// Best waiting modal by priority, then arrival.
    fn queue_head(&self) -> Option<&Mounted> {
        self.queue.iter().min_by_key(|m| m.sort_key())
    }

    fn offer_modal(&mut self, incoming: Mounted, out: &mut Vec<MountInstruction>) {
        match self.modal.take() {
            // A free slot with a better entry waiting belongs to the queue;
            // `replay_queue` re-confirms and mounts it.
            None if self
                .queue_head()
                .is_some_and(|head| head.sort_key() < incoming.sort_key()) =>
            {
                self.queue.push(incoming);
            }
            None => {
                out.push(MountInstruction::mount(&incoming));
                self.modal = Some(incoming);
            }
            Some(current)
                if incoming.candidate.priority.outranks(current.candidate.priority)
                    && !current.mid_interaction =>
            {
                out.push(MountInstruction::Unmount {
                    instance: current.instance,
                    reason: UnmountReason::Preempted,
                });
                self.queue.push(current);
                out.push(MountInstruction::mount(&incoming));
                self.modal = Some(incoming);
            }
            Some(current) => {
                self.modal = Some(current);
                self.queue.push(incoming);
            }
        }
    }

    fn mount_overlay(&mut self, incoming: Mounted, cap: usize, out: &mut Vec<MountInstruction>) {
        if self.overlays.len() >= cap && !self.evict_oldest_unpinned(out) {
            return;
        }
        out.push(MountInstruction::mount(&incoming));
        self.overlays.push(incoming);
    }

    fn evict_oldest_unpinned(&mut self, out: &mut Vec<MountInstruction>) -> bool {
        match self.overlays.iter().position(|o| !o.pinned) {
            Some(pos) => {
                let evicted = self.overlays.remove(pos);
                out.push(MountInstruction::Unmount {
                    instance: evicted.instance,
                    reason: UnmountReason::Evicted,
                });
                true
            }
            None => false,
        }
    }
}

/// Resolve a batch of candidates fired in the same tick.
///
/// Candidates already mounted or queued (same rule, same instrument)
/// are ignored, which keeps repeated evaluation of unchanged inputs
/// from stacking duplicates.
pub fn arbitrate(
    table: &MountTable,
    candidates: Vec<Candidate>,
    layer: Layer,
    caps: &OverlayCaps,
) -> (MountTable, Vec<MountInstruction>) {
    let mut next = table.clone();
    let mut out = Vec::new();

    let mut fresh: Vec<Candidate> = Vec::new();
    for c in candidates {
        if !next.contains_trigger(&c) && !fresh.contains(&c) {
            fresh.push(c);
        }
    }

    let arrivals: Vec<Mounted> = fresh.into_iter().map(|c| next.allocate(c)).collect();
    let (mut modals, overlays): (Vec<Mounted>, Vec<Mounted>) = arrivals
        .into_iter()
        .partition(|m| m.candidate.instrument.is_modal());

    modals.sort_by_key(|m| m.sort_key());
    for m in modals {
        next.offer_modal(m, &mut out);
    }

    let cap = caps.cap_for(layer);
    for o in overlays {
        next.mount_overlay(o, cap, &mut out);
    }

    (next, out)
}

/// Remove a mounted or queued instrument.
///
/// Returns `None` when `instance` is unknown. Removing a queued entry
/// yields no instruction since it was never on screen.
pub fn release(
    table: &MountTable,
    instance: InstanceId,
    reason: UnmountReason,
) -> Option<(MountTable, Mounted, Vec<MountInstruction>)> {
    let mut next = table.clone();

    if next.modal.as_ref().is_some_and(|m| m.instance == instance) {
        let released = next.modal.take()?;
        let out = vec![MountInstruction::Unmount { instance, reason }];
        return Some((next, released, out));
    }
    if let Some(pos) = next.overlays.iter().position(|m| m.instance == instance) {
        let released = next.overlays.remove(pos);
        let out = vec![MountInstruction::Unmount { instance, reason }];
        return Some((next, released, out));
    }
    if let Some(pos) = next.queue.iter().position(|m| m.instance == instance) {
        let released = next.queue.remove(pos);
        return Some((next, released, Vec::new()));
    }
    None
}

/// Mark a mounted instrument as being interacted with; it can no longer
/// be preempted. `None` when `instance` is not mounted.
pub fn begin_interaction(table: &MountTable, instance: InstanceId) -> Option<MountTable> {
    let mut next = table.clone();
    let target = next
        .modal
        .iter_mut()
        .chain(next.overlays.iter_mut())
        .find(|m| m.instance == instance)?;
    target.mid_interaction = true;
    Some(next)
}

/// Pin or unpin a mounted overlay. `None` when `instance` is not a
/// mounted overlay.
pub fn set_pinned(table: &MountTable, instance: InstanceId, pinned: bool) -> Option<MountTable> {
    let mut next = table.clone();
    let target = next.overlays.iter_mut().find(|m| m.instance == instance)?;
    target.pinned = pinned;
    Some(next)
}

/// Re-apply the overlay cap, e.g. after the layer changed.
pub fn rebalance(
    table: &MountTable,
    layer: Layer,
    caps: &OverlayCaps,
) -> (MountTable, Vec<MountInstruction>) {
    let mut next = table.clone();
    let mut out = Vec::new();
    let cap = caps.cap_for(layer);
    while next.overlays.len() > cap {
        if !next.evict_oldest_unpinned(&mut out) {
            break;
        }
    }
    (next, out)
}

/// Unmount overlays whose rule no longer fires for the current state,
/// pinned or not (a fork banner goes away once the fork is exited).
pub fn prune_overlays(
    table: &MountTable,
    store: &StateStore,
    rules: &RuleTable,
) -> (MountTable, Vec<MountInstruction>) {
    let mut next = table.clone();
    let mut out = Vec::new();
    next.overlays.retain(|o| {
        let live = rules.reconfirm(&o.candidate, store).is_some();
        if !live {
            out.push(MountInstruction::Unmount {
                instance: o.instance,
                reason: UnmountReason::Stale,
            });
        }
        live
    });
    (next, out)
}

/// Replay queued modals once the modal slot is free.
///
/// Each queued trigger is re-confirmed against `rules` with the current
/// state. Stale ones are dropped; the best surviving one is mounted and
/// the rest stay queued with refreshed instruments. Returns the table,
/// the instructions, and the dropped entries.
pub fn replay_queue(
    table: &MountTable,
    store: &StateStore,
    rules: &RuleTable,
) -> (MountTable, Vec<MountInstruction>, Vec<Mounted>) {
    let mut next = table.clone();
    let mut out = Vec::new();
    let mut dropped = Vec::new();

    if next.modal.is_some() || next.queue.is_empty() {
        return (next, out, dropped);
    }

    let mut waiting = std::mem::take(&mut next.queue);
    waiting.sort_by_key(|m| m.sort_key());

    for mut entry in waiting {
        match rules.reconfirm(&entry.candidate, store) {
            None => dropped.push(entry),
            Some(refreshed) => {
                entry.candidate = refreshed;
                entry.mid_interaction = false;
                if next.modal.is_none() {
                    out.push(MountInstruction::mount(&entry));
                    next.modal = Some(entry);
                } else {
                    next.queue.push(entry);
                }
            }
        }
    }

    (next, out, dropped)
}

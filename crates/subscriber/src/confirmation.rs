//! Pending triggers and confirmation-depth evaluation.
//!
//! A trigger is confirmed once, and only when its observed-at block is on the canonical chain
//! and `tip - observed + 1 >= required`. Orphaned triggers are invalidated, never re-armed.
//! Dedup key is `(job, initiator, block hash, log index)`; keys of confirmed triggers are kept
//! for the retained history window so a replayed report cannot confirm twice.

use crate::head::{BlockHash, Head};
use crate::job::JobId;
use crate::registry::JobRegistry;
use crate::tracker::{Canonicality, HeadTracker};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Confirmation-depth rule; the observed block counts as the first confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationDepth(u64);

impl ConfirmationDepth {
    /// Zero is treated as one: an event is final no earlier than its own block.
    pub fn new(required: u64) -> Self {
        Self(required.max(1))
    }

    pub fn required(&self) -> u64 {
        self.0
    }

    /// Confirmations a block at `observed` has when the tip is at `tip`.
    pub fn depth(observed: u64, tip: u64) -> u64 {
        tip.saturating_add(1).saturating_sub(observed)
    }

    pub fn is_eligible(&self, observed: u64, tip: u64) -> bool {
        Self::depth(observed, tip) >= self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TriggerId(pub u64);

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// An event observation reported by the upstream event source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub job_id: JobId,
    /// Index into the job's `initiators`.
    pub initiator: usize,
    pub head: Head,
    pub log_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TriggerKey {
    job_id: JobId,
    initiator: usize,
    block: BlockHash,
    log_index: u64,
}

impl TriggerKey {
    fn of(event: &TriggerEvent) -> Self {
        Self {
            job_id: event.job_id.clone(),
            initiator: event.initiator,
            block: event.head.hash,
            log_index: event.log_index,
        }
    }
}

/// A trigger waiting for confirmations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub id: TriggerId,
    pub job_id: JobId,
    pub initiator: usize,
    pub head: Head,
    pub log_index: u64,
    pub depth: ConfirmationDepth,
}

impl Trigger {
    fn key(&self) -> TriggerKey {
        TriggerKey {
            job_id: self.job_id.clone(),
            initiator: self.initiator,
            block: self.head.hash,
            log_index: self.log_index,
        }
    }
}

/// One confirmed trigger, handed to the run pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmation {
    pub trigger_id: TriggerId,
    pub job_id: JobId,
    pub initiator: usize,
    pub log_index: u64,
    pub observed_at: Head,
    /// Canonical tip at the moment the depth condition held.
    pub confirmed_at: Head,
    pub confirmations: u64,
}

impl Confirmation {
    fn new(trigger: &Trigger, tip: Head) -> Self {
        Self {
            trigger_id: trigger.id,
            job_id: trigger.job_id.clone(),
            initiator: trigger.initiator,
            log_index: trigger.log_index,
            observed_at: trigger.head,
            confirmed_at: tip,
            confirmations: ConfirmationDepth::depth(trigger.head.height, tip.height),
        }
    }
}

/// Result of one pass over the pending set.
#[derive(Debug, Default)]
pub struct Evaluation {
    /// Ordered by (observed height, log index, trigger id).
    pub confirmed: Vec<Confirmation>,
    pub invalidated: Vec<Trigger>,
    /// Job no longer registered.
    pub dropped: Vec<Trigger>,
    /// Fell below the history window with undeterminable ancestry.
    pub expired: Vec<Trigger>,
}

#[derive(Debug, Default)]
pub struct PendingTriggers {
    next_id: u64,
    pending: BTreeMap<TriggerId, Trigger>,
    keys: HashSet<TriggerKey>,
    emitted: HashMap<TriggerKey, u64>,
}

impl PendingTriggers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// True if this exact event is pending or was already confirmed.
    pub fn is_known(&self, event: &TriggerEvent) -> bool {
        let key = TriggerKey::of(event);
        self.keys.contains(&key) || self.emitted.contains_key(&key)
    }

    /// Adds a pending trigger. Returns `None` for an event that is already pending or confirmed.
    pub fn insert(&mut self, event: TriggerEvent, depth: ConfirmationDepth) -> Option<Trigger> {
        if self.is_known(&event) {
            return None;
        }
        let id = TriggerId(self.next_id);
        self.next_id += 1;
        let trigger = Trigger {
            id,
            job_id: event.job_id,
            initiator: event.initiator,
            head: event.head,
            log_index: event.log_index,
            depth,
        };
        self.keys.insert(trigger.key());
        self.pending.insert(id, trigger.clone());
        Some(trigger)
    }

    fn take(&mut self, id: TriggerId) -> Option<Trigger> {
        let trigger = self.pending.remove(&id)?;
        self.keys.remove(&trigger.key());
        Some(trigger)
    }

    /// Discards every pending trigger of `job_id`.
    pub fn remove_job(&mut self, job_id: &JobId) -> Vec<Trigger> {
        let ids: Vec<TriggerId> = self
            .pending
            .values()
            .filter(|t| &t.job_id == job_id)
            .map(|t| t.id)
            .collect();
        ids.into_iter().filter_map(|id| self.take(id)).collect()
    }

    /// Confirms a single trigger if it is already final against the current chain.
    pub fn confirm_if_final(&mut self, id: TriggerId, tracker: &HeadTracker) -> Option<Confirmation> {
        let tip = tracker.tip()?;
        let trigger = self.pending.get(&id)?;
        if tracker.canonicality(&trigger.head) != Canonicality::Canonical
            || !trigger.depth.is_eligible(trigger.head.height, tip.height)
        {
            return None;
        }
        let trigger = self.take(id)?;
        self.emitted.insert(trigger.key(), trigger.head.height);
        Some(Confirmation::new(&trigger, tip))
    }

    /// Re-evaluates every pending trigger against the canonical chain and the registry.
    pub fn evaluate(&mut self, tracker: &HeadTracker, registry: &JobRegistry) -> Evaluation {
        let mut out = Evaluation::default();
        let Some(tip) = tracker.tip() else {
            return out;
        };
        let floor = tracker.window_floor();
        let ids: Vec<TriggerId> = self.pending.keys().copied().collect();
        for id in ids {
            let Some(trigger) = self.pending.get(&id) else {
                continue;
            };
            if !registry.contains(&trigger.job_id) {
                out.dropped.extend(self.take(id));
                continue;
            }
            match tracker.canonicality(&trigger.head) {
                Canonicality::Canonical => {
                    if trigger.depth.is_eligible(trigger.head.height, tip.height) {
                        if let Some(t) = self.take(id) {
                            self.emitted.insert(t.key(), t.head.height);
                            out.confirmed.push(Confirmation::new(&t, tip));
                        }
                    }
                }
                Canonicality::Orphaned => out.invalidated.extend(self.take(id)),
                Canonicality::Unknown if trigger.head.height < floor => {
                    out.expired.extend(self.take(id))
                }
                // Ancestry not determinable yet: stays pending, never confirmed on a guess.
                Canonicality::Unknown => {}
            }
        }
        out.confirmed
            .sort_by_key(|c| (c.observed_at.height, c.log_index, c.trigger_id));
        self.emitted.retain(|_, height| *height >= floor);
        out
    }

    /// Pending triggers in report order.
    pub fn snapshot(&self) -> Vec<Trigger> {
        self.pending.values().cloned().collect()
    }

    /// Drops all pending triggers; returns how many were discarded.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        self.keys.clear();
        self.emitted.clear();
        n
    }
}

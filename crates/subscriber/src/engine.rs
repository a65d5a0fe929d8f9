//! The job-subscription engine.
//!
//! [Engine] is a cheap, cloneable handle around a single mutex-guarded state: job registry,
//! head tracker and pending-trigger set are mutated by one writer at a time, so a `remove_job`
//! that returns before a head notification starts can never see that job confirmed. Confirmed
//! triggers leave through a bounded queue and never block head processing.
//!
//! Lifecycle: build -> [Engine::connect] -> operate -> [Engine::stop] -> drop.

use crate::config::{ConfirmationQueueConfig, EngineConfig, OverflowPolicy};
use crate::confirmation::{
    Confirmation, ConfirmationDepth, PendingTriggers, Trigger, TriggerEvent, TriggerId,
};
use crate::head::{Head, HeadError};
use crate::job::{JobId, JobSpec};
use crate::registry::JobRegistry;
use crate::sink::{ConfirmationSender, Confirmations, Delivery};
use crate::tracker::{Advance, AdvanceError, AncestryError, Canonicality, ChainChange, HeadTracker};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("job {0} already exists")]
    DuplicateJob(JobId),

    #[error("job {0} is not registered")]
    UnknownJob(JobId),

    #[error("already connected")]
    AlreadyConnected,

    #[error("invalid head: {0}")]
    InvalidHead(#[from] HeadError),

    #[error("invalid job {job_id}: {reason}")]
    InvalidJob { job_id: JobId, reason: String },

    #[error("initiator {initiator} of job {job_id} is not event-triggered")]
    NotEventInitiator { job_id: JobId, initiator: usize },

    #[error("trigger for job {job_id} at #{height} precedes job start #{start}")]
    TriggerBeforeStart {
        job_id: JobId,
        height: u64,
        start: u64,
    },

    #[error("trigger for job {job_id} at {head} log {log_index} already reported")]
    DuplicateTrigger {
        job_id: JobId,
        head: Head,
        log_index: u64,
    },

    #[error("block {0} is not on the canonical chain")]
    OrphanedBlock(Head),

    #[error("block {head} is below the retained history (floor #{floor})")]
    StaleTrigger { head: Head, floor: u64 },

    #[error("engine stopped")]
    Stopped,

    #[error("config error: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Disconnected,
    Connected,
    /// Terminal.
    Stopped,
}

/// What one evaluation pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub confirmed: usize,
    pub invalidated: usize,
    pub dropped: usize,
    pub expired: usize,
    /// Confirmed but refused by the queue (full or closed).
    pub undelivered: usize,
}

/// Result of processing one head notification. The chain source never sees this;
/// [Engine::on_new_longest_chain] only logs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadOutcome {
    Applied {
        change: ChainChange,
        summary: EvaluationSummary,
    },
    Duplicate,
    Stale,
    /// Competing block below the highest confirmed-at height; held until its fork catches up.
    Deferred,
    /// Not connected; the head was dropped.
    Ignored(Lifecycle),
    Rejected(HeadError),
    /// Ancestry could not be connected; chain state unchanged until a later head connects.
    Indeterminate(AncestryError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerStatus {
    Pending(TriggerId),
    /// Already final when reported; the confirmation has been queued.
    Confirmed(TriggerId),
}

/// Counter snapshot for metrics export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub heads_received: u64,
    pub heads_ignored: u64,
    pub heads_rejected: u64,
    pub heads_indeterminate: u64,
    pub heads_deferred: u64,
    pub reorgs: u64,
    pub confirmed: u64,
    pub invalidated: u64,
    pub dropped: u64,
    pub expired: u64,
    pub undelivered: u64,
    pub pending: usize,
    pub jobs: usize,
}

struct State {
    lifecycle: Lifecycle,
    registry: JobRegistry,
    tracker: HeadTracker,
    pending: PendingTriggers,
    sink: Option<ConfirmationSender>,
    stats: EngineStats,
}

impl State {
    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.lifecycle == Lifecycle::Stopped {
            return Err(EngineError::Stopped);
        }
        Ok(())
    }

    fn deliver(&mut self, confirmation: Confirmation) -> bool {
        let Some(sink) = self.sink.as_ref() else {
            return false;
        };
        let trigger = confirmation.trigger_id;
        match sink.send(confirmation) {
            Delivery::Queued => true,
            Delivery::Rejected => {
                tracing::warn!(%trigger, "confirmation queue full; dropping newest");
                false
            }
            Delivery::Closed => {
                tracing::warn!(%trigger, "confirmation receiver gone");
                false
            }
        }
    }

    fn confirmed(&mut self, confirmation: Confirmation) -> bool {
        tracing::info!(
            job_id = %confirmation.job_id,
            trigger = %confirmation.trigger_id,
            height = confirmation.observed_at.height,
            hash = %confirmation.observed_at.hash,
            tip = confirmation.confirmed_at.height,
            confirmations = confirmation.confirmations,
            "trigger confirmed"
        );
        self.stats.confirmed += 1;
        self.tracker.mark_confirmed(confirmation.confirmed_at.height);
        let delivered = self.deliver(confirmation);
        if !delivered {
            self.stats.undelivered += 1;
        }
        delivered
    }

    fn evaluate(&mut self) -> EvaluationSummary {
        if self.tracker.tip().is_none() {
            tracing::error!("evaluation without a canonical tip; confirmations suspended");
            return EvaluationSummary::default();
        }
        let eval = self.pending.evaluate(&self.tracker, &self.registry);
        for t in &eval.invalidated {
            tracing::warn!(
                job_id = %t.job_id,
                trigger = %t.id,
                height = t.head.height,
                hash = %t.head.hash,
                "trigger invalidated: block orphaned"
            );
        }
        for t in &eval.expired {
            tracing::warn!(
                job_id = %t.job_id,
                trigger = %t.id,
                height = t.head.height,
                "trigger expired: ancestry undeterminable within history"
            );
        }
        for t in &eval.dropped {
            tracing::debug!(job_id = %t.job_id, trigger = %t.id, "trigger dropped: job removed");
        }
        let mut summary = EvaluationSummary {
            confirmed: eval.confirmed.len(),
            invalidated: eval.invalidated.len(),
            dropped: eval.dropped.len(),
            expired: eval.expired.len(),
            undelivered: 0,
        };
        for c in eval.confirmed {
            if !self.confirmed(c) {
                summary.undelivered += 1;
            }
        }
        self.stats.invalidated += summary.invalidated as u64;
        self.stats.dropped += summary.dropped as u64;
        self.stats.expired += summary.expired as u64;
        summary
    }
}

/// Builder for the engine.
pub struct EngineBuilder {
    history_depth: Option<u64>,
    queue: ConfirmationQueueConfig,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            history_depth: None,
            queue: ConfirmationQueueConfig::default(),
        }
    }

    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            history_depth: Some(config.history_depth),
            queue: config.queue,
        }
    }

    /// Heads retained below the tip; bounds reorg depth and `required_confirmations`.
    pub fn history_depth(mut self, depth: u64) -> Self {
        self.history_depth = Some(depth);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue.capacity = capacity;
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.queue.overflow = policy;
        self
    }

    pub fn build(self) -> Result<(Engine, Confirmations), EngineError> {
        let history_depth = self
            .history_depth
            .ok_or_else(|| EngineError::Config("history_depth required".into()))?;
        if history_depth == 0 {
            return Err(EngineError::Config("history_depth must be > 0".into()));
        }
        if self.queue.capacity == 0 {
            return Err(EngineError::Config("queue capacity must be > 0".into()));
        }
        let (sink, confirmations) = ConfirmationSender::channel(&self.queue);
        let state = State {
            lifecycle: Lifecycle::Disconnected,
            registry: JobRegistry::new(),
            tracker: HeadTracker::new(history_depth),
            pending: PendingTriggers::new(),
            sink: Some(sink),
            stats: EngineStats::default(),
        };
        Ok((
            Engine {
                inner: Arc::new(Mutex::new(state)),
            },
            confirmations,
        ))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the engine; clones share the same state.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Mutex<State>>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Registers `spec`. Event initiators only accept triggers above `current_head`.
    pub async fn add_job(&self, spec: JobSpec, current_head: Option<&Head>) -> Result<(), EngineError> {
        let mut state = self.inner.lock().await;
        state.ensure_running()?;
        if spec.id.as_str().trim().is_empty() {
            return Err(EngineError::InvalidJob {
                job_id: spec.id,
                reason: "empty id".into(),
            });
        }
        if state.registry.contains(&spec.id) {
            return Err(EngineError::DuplicateJob(spec.id));
        }
        let history_depth = state.tracker.history_depth();
        let too_deep = spec
            .event_initiators()
            .find(|(_, ev)| ev.required_confirmations > history_depth)
            .map(|(i, ev)| {
                format!(
                    "initiator {} requires {} confirmations but only {} heads of history are kept",
                    i, ev.required_confirmations, history_depth
                )
            });
        if let Some(reason) = too_deep {
            return Err(EngineError::InvalidJob {
                job_id: spec.id,
                reason,
            });
        }
        if let Some(head) = current_head {
            head.validate()?;
        }
        let job_id = spec.id.clone();
        let event_initiators = spec.event_initiators().count();
        state
            .registry
            .insert(spec, current_head)
            .map_err(|spec| EngineError::DuplicateJob(spec.id))?;
        state.stats.jobs = state.registry.len();
        tracing::info!(
            %job_id,
            event_initiators,
            start = ?current_head.map(|h| h.height.saturating_add(1)),
            "job added"
        );
        Ok(())
    }

    /// Deregisters `id` and discards its pending triggers.
    pub async fn remove_job(&self, id: &JobId) -> Result<(), EngineError> {
        let mut state = self.inner.lock().await;
        state.ensure_running()?;
        if state.registry.remove(id).is_none() {
            return Err(EngineError::UnknownJob(id.clone()));
        }
        let discarded = state.pending.remove_job(id).len();
        state.stats.dropped += discarded as u64;
        state.stats.jobs = state.registry.len();
        tracing::info!(job_id = %id, discarded, "job removed");
        Ok(())
    }

    /// Snapshot of all registered jobs, ordered by ID.
    pub async fn jobs(&self) -> Vec<JobSpec> {
        self.inner.lock().await.registry.snapshot()
    }

    /// Reports that a job's event condition was observed at `event.head`.
    pub async fn report_trigger(&self, event: TriggerEvent) -> Result<TriggerStatus, EngineError> {
        let mut guard = self.inner.lock().await;
        let state = &mut *guard;
        state.ensure_running()?;
        event.head.validate()?;
        let job = state
            .registry
            .get(&event.job_id)
            .ok_or_else(|| EngineError::UnknownJob(event.job_id.clone()))?;
        let initiator = job
            .spec
            .initiators
            .get(event.initiator)
            .and_then(|i| i.as_event())
            .ok_or_else(|| EngineError::NotEventInitiator {
                job_id: event.job_id.clone(),
                initiator: event.initiator,
            })?;
        if let Some(start) = job.start_height {
            if event.head.height < start {
                return Err(EngineError::TriggerBeforeStart {
                    job_id: event.job_id,
                    height: event.head.height,
                    start,
                });
            }
        }
        let depth = ConfirmationDepth::new(initiator.required_confirmations);
        if state.tracker.tip().is_some() && event.head.height < state.tracker.window_floor() {
            return Err(EngineError::StaleTrigger {
                head: event.head,
                floor: state.tracker.window_floor(),
            });
        }
        state.tracker.insert(event.head)?;
        if state.tracker.canonicality(&event.head) == Canonicality::Orphaned {
            return Err(EngineError::OrphanedBlock(event.head));
        }
        let (job_id, head, log_index) = (event.job_id.clone(), event.head, event.log_index);
        let Some(trigger) = state.pending.insert(event, depth) else {
            return Err(EngineError::DuplicateTrigger {
                job_id,
                head,
                log_index,
            });
        };
        tracing::debug!(
            job_id = %trigger.job_id,
            trigger = %trigger.id,
            height = trigger.head.height,
            hash = %trigger.head.hash,
            required = depth.required(),
            "trigger pending"
        );
        if state.lifecycle == Lifecycle::Connected {
            if let Some(c) = state.pending.confirm_if_final(trigger.id, &state.tracker) {
                state.confirmed(c);
                return Ok(TriggerStatus::Confirmed(trigger.id));
            }
        }
        Ok(TriggerStatus::Pending(trigger.id))
    }

    /// Establishes the starting canonical head and catches up on pending triggers.
    pub async fn connect(&self, head: Head) -> Result<(), EngineError> {
        let mut state = self.inner.lock().await;
        match state.lifecycle {
            Lifecycle::Stopped => return Err(EngineError::Stopped),
            Lifecycle::Connected => return Err(EngineError::AlreadyConnected),
            Lifecycle::Disconnected => {}
        }
        head.validate()?;
        let change = match state.tracker.advance(head) {
            Ok(Advance::Changed(change)) => Some(change),
            Ok(Advance::Duplicate) | Ok(Advance::Stale) | Ok(Advance::Deferred) => None,
            Err(AdvanceError::Head(e)) => return Err(e.into()),
            Err(AdvanceError::Ancestry(e)) if state.tracker.is_below_confirmed(head.height) => {
                tracing::warn!(reason = %e, height = head.height, "ancestry gap on connect below confirmed height; keeping canonical chain");
                None
            }
            Err(AdvanceError::Ancestry(e)) => {
                tracing::warn!(reason = %e, height = head.height, "ancestry gap on connect; reseeding canonical chain");
                Some(state.tracker.reseed(head)?)
            }
        };
        state.lifecycle = Lifecycle::Connected;
        tracing::info!(height = head.height, hash = %head.hash, "connected");
        if let Some(change) = change {
            if matches!(change, ChainChange::Reorg { .. }) {
                state.stats.reorgs += 1;
            }
            let summary = state.evaluate();
            tracing::debug!(?summary, "catch-up evaluation");
        }
        Ok(())
    }

    /// Processes a new canonical tip. Never fails towards the caller; see [Engine::process_head]
    /// for the inspectable result.
    pub async fn on_new_longest_chain(&self, head: Head) {
        match self.process_head(head).await {
            HeadOutcome::Applied {
                change:
                    ChainChange::Reorg {
                        common_ancestor,
                        orphaned,
                        tip,
                    },
                summary,
            } => {
                tracing::info!(
                    ancestor = common_ancestor.height,
                    orphaned = orphaned.len(),
                    tip = tip.height,
                    hash = %tip.hash,
                    ?summary,
                    "reorg applied"
                );
            }
            HeadOutcome::Applied { change, summary } => {
                tracing::debug!(tip = change.tip().height, ?summary, "head applied");
            }
            HeadOutcome::Duplicate | HeadOutcome::Stale => {
                tracing::debug!(height = head.height, hash = %head.hash, "head already known");
            }
            HeadOutcome::Deferred => {
                tracing::info!(height = head.height, hash = %head.hash, "competing head below confirmed height; holding");
            }
            HeadOutcome::Ignored(lifecycle) => {
                tracing::warn!(height = head.height, ?lifecycle, "head dropped: not connected");
            }
            HeadOutcome::Rejected(e) => {
                tracing::warn!(reason = %e, height = head.height, "head rejected");
            }
            HeadOutcome::Indeterminate(e) => {
                tracing::warn!(reason = %e, height = head.height, "ancestry indeterminate; keeping prior chain state");
            }
        }
    }

    /// Applies `head` and evaluates pending triggers, returning what happened.
    pub async fn process_head(&self, head: Head) -> HeadOutcome {
        let mut state = self.inner.lock().await;
        state.stats.heads_received += 1;
        if state.lifecycle != Lifecycle::Connected {
            state.stats.heads_ignored += 1;
            return HeadOutcome::Ignored(state.lifecycle);
        }
        match state.tracker.advance(head) {
            Ok(Advance::Changed(change)) => {
                if matches!(change, ChainChange::Reorg { .. }) {
                    state.stats.reorgs += 1;
                }
                let summary = state.evaluate();
                HeadOutcome::Applied { change, summary }
            }
            Ok(Advance::Duplicate) => HeadOutcome::Duplicate,
            Ok(Advance::Stale) => HeadOutcome::Stale,
            Ok(Advance::Deferred) => {
                state.stats.heads_deferred += 1;
                HeadOutcome::Deferred
            }
            Err(AdvanceError::Head(e)) => {
                state.stats.heads_rejected += 1;
                HeadOutcome::Rejected(e)
            }
            Err(AdvanceError::Ancestry(e)) => {
                state.stats.heads_indeterminate += 1;
                HeadOutcome::Indeterminate(e)
            }
        }
    }

    /// Stops head processing until the next [Engine::connect]. Idempotent.
    pub async fn disconnect(&self) {
        let mut state = self.inner.lock().await;
        if state.lifecycle == Lifecycle::Connected {
            state.lifecycle = Lifecycle::Disconnected;
            tracing::info!(pending = state.pending.len(), "disconnected");
        }
    }

    /// Terminal shutdown: disconnects, discards pending triggers and head history, and closes the
    /// confirmation stream. Idempotent.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let mut state = self.inner.lock().await;
        if state.lifecycle == Lifecycle::Stopped {
            return Ok(());
        }
        state.lifecycle = Lifecycle::Stopped;
        let discarded = state.pending.clear();
        state.tracker.clear();
        state.sink = None;
        tracing::info!(discarded, jobs = state.registry.len(), "engine stopped");
        Ok(())
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        self.inner.lock().await.lifecycle
    }

    pub async fn canonical_head(&self) -> Option<Head> {
        self.inner.lock().await.tracker.tip()
    }

    pub async fn pending_triggers(&self) -> Vec<Trigger> {
        self.inner.lock().await.pending.snapshot()
    }

    pub async fn stats(&self) -> EngineStats {
        let state = self.inner.lock().await;
        EngineStats {
            pending: state.pending.len(),
            jobs: state.registry.len(),
            ..state.stats.clone()
        }
    }
}

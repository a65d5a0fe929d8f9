//! Oracle job subscriber: decides when event-triggered jobs are final.
//!
//! - **JobRegistry**: the set of active job specs (add/remove/snapshot).
//! - **HeadTracker**: follows the canonical head reported by the chain source and detects
//!   reorgs by walking an arena of observed heads back to a common ancestor.
//! - **Confirmation**: holds pending triggers (job + block where its event was seen) and confirms
//!   each exactly once when it is canonical and `tip - observed + 1 >= required_confirmations`;
//!   triggers on orphaned blocks are invalidated.
//! - **Engine**: serializes all of the above behind one handle, with the
//!   connect / disconnect / stop lifecycle, and hands confirmations to the run pipeline through a
//!   bounded queue.

pub mod config;
pub mod confirmation;
pub mod driver;
pub mod engine;
pub mod head;
pub mod job;
pub mod registry;
pub mod sink;
pub mod tracker;

pub use config::{ConfirmationQueueConfig, EngineConfig, OverflowPolicy};
pub use confirmation::{Confirmation, ConfirmationDepth, Trigger, TriggerEvent, TriggerId};
pub use driver::{drive, ChainEvent, DriveExit};
pub use engine::{
    Engine, EngineBuilder, EngineError, EngineStats, EvaluationSummary, HeadOutcome, Lifecycle,
    TriggerStatus,
};
pub use head::{decode_rpc_header, BlockHash, Head, HeadError};
pub use job::{decode_job_spec, EventInitiator, Initiator, JobId, JobSpec, TaskSpec};
pub use registry::JobRegistry;
pub use sink::Confirmations;
pub use tracker::{AncestryError, Canonicality, ChainChange, HeadTracker};

//! Engine configuration.

use serde::Deserialize;

/// Engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Heads retained below the canonical tip for ancestry walks. Must cover the deepest reorg
    /// expected on the target chain; there is deliberately no default.
    pub history_depth: u64,
    /// Hand-off queue towards the run pipeline.
    #[serde(default)]
    pub queue: ConfirmationQueueConfig,
}

/// What to do when the confirmation queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Overwrite the oldest queued confirmation; the receiver observes the lag.
    #[default]
    DropOldest,
    /// Drop the new confirmation and count it as undelivered.
    RejectNewest,
}

/// Confirmation hand-off queue.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationQueueConfig {
    pub capacity: usize,
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for ConfirmationQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

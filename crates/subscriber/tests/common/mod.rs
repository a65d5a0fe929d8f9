//! Common helpers for integration tests.
//! Some helpers are only used by specific test binaries; allow dead_code to avoid per-binary warnings.
#![allow(dead_code)]

use std::collections::HashSet;
use subscriber::{
    BlockHash, Confirmation, Confirmations, Engine, EventInitiator, Initiator, JobId, JobSpec,
    OverflowPolicy, TriggerEvent,
};
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("subscriber=debug".parse().unwrap()))
        .with_test_writer()
        .try_init();
}

/// Deterministic block identity: height plus a fork tag.
pub fn block_id(height: u64, fork: u8) -> BlockHash {
    let mut b = [0u8; 32];
    b[..8].copy_from_slice(&height.to_be_bytes());
    b[8] = fork;
    b[31] = 0xff;
    BlockHash(b)
}

/// Head at `height` on `fork`, child of the block at `height - 1` on `parent_fork`.
pub fn head(height: u64, fork: u8, parent_fork: u8) -> subscriber::Head {
    subscriber::Head::new(height, block_id(height, fork), block_id(height - 1, parent_fork))
}

/// Heads `from..=to` on `fork`; the first one's parent is on `parent_fork`.
pub fn chain(from: u64, to: u64, fork: u8, parent_fork: u8) -> Vec<subscriber::Head> {
    (from..=to)
        .map(|h| head(h, fork, if h == from { parent_fork } else { fork }))
        .collect()
}

pub fn event_job(id: &str, required_confirmations: u64) -> JobSpec {
    JobSpec::new(id)
        .with_initiator(Initiator::EthLog(EventInitiator {
            address: Some("0x5fbdb2315678afecb367f032d93f642f64180aa3".into()),
            required_confirmations,
        }))
        .with_task("ethtx", serde_json::json!({ "functionSelector": "0x4ab0d190" }))
}

pub fn trigger(job: &str, at: subscriber::Head, log_index: u64) -> TriggerEvent {
    TriggerEvent {
        job_id: JobId::from(job),
        initiator: 0,
        head: at,
        log_index,
    }
}

pub fn engine(history_depth: u64) -> (Engine, Confirmations) {
    init_tracing();
    Engine::builder()
        .history_depth(history_depth)
        .build()
        .expect("engine build")
}

pub fn engine_with_queue(
    history_depth: u64,
    capacity: usize,
    overflow: OverflowPolicy,
) -> (Engine, Confirmations) {
    init_tracing();
    Engine::builder()
        .history_depth(history_depth)
        .queue_capacity(capacity)
        .overflow(overflow)
        .build()
        .expect("engine build")
}

/// Asserts no trigger was confirmed twice.
pub fn assert_unique(confirmations: &[Confirmation]) {
    let mut seen = HashSet::new();
    for c in confirmations {
        assert!(seen.insert(c.trigger_id), "trigger {} confirmed twice", c.trigger_id);
    }
}

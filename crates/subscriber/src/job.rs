//! Job specifications.
//!
//! A [JobSpec] is immutable once registered; replacing a job means remove + add. Only the
//! event-style initiators ([Initiator::EthLog], [Initiator::RunLog]) take part in confirmation
//! tracking; the rest are carried through untouched.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Globally unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Parameters of an event-triggered initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventInitiator {
    /// Emitting contract, if the upstream filter is address-scoped. Informational here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Blocks (including the observed one) required before a trigger is final.
    #[serde(default = "default_confirmations")]
    pub required_confirmations: u64,
}

fn default_confirmations() -> u64 {
    1
}

/// Condition that starts a job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Initiator {
    Web,
    Cron { schedule: String },
    RunAt { time: String },
    EthLog(EventInitiator),
    RunLog(EventInitiator),
}

impl Initiator {
    /// Event parameters if this initiator is triggered by on-chain events.
    pub fn as_event(&self) -> Option<&EventInitiator> {
        match self {
            Initiator::EthLog(ev) | Initiator::RunLog(ev) => Some(ev),
            Initiator::Web | Initiator::Cron { .. } | Initiator::RunAt { .. } => None,
        }
    }
}

/// Opaque task; executed by the run pipeline, never interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    #[serde(default)]
    pub initiators: Vec<Initiator>,
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

impl JobSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: JobId::new(id),
            initiators: Vec::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_initiator(mut self, initiator: Initiator) -> Self {
        self.initiators.push(initiator);
        self
    }

    pub fn with_task(mut self, kind: impl Into<String>, params: Value) -> Self {
        self.tasks.push(TaskSpec {
            kind: kind.into(),
            params,
        });
        self
    }

    /// Event initiators with their index into `initiators`.
    pub fn event_initiators(&self) -> impl Iterator<Item = (usize, &EventInitiator)> {
        self.initiators
            .iter()
            .enumerate()
            .filter_map(|(i, init)| init.as_event().map(|ev| (i, ev)))
    }
}

/// Decode a job spec from its JSON submission form.
pub fn decode_job_spec(value: &Value) -> Result<JobSpec> {
    let spec: JobSpec = serde_json::from_value(value.clone()).context("decode job spec")?;
    if spec.id.0.trim().is_empty() {
        anyhow::bail!("job spec has empty id");
    }
    Ok(spec)
}

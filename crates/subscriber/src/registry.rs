//! Job registry: the ground truth for which jobs exist.

use crate::head::Head;
use crate::job::{JobId, JobSpec};
use std::collections::BTreeMap;

/// A registered job plus the bookkeeping seeded at registration.
#[derive(Debug, Clone)]
pub struct RegisteredJob {
    pub spec: JobSpec,
    /// Lowest height at which triggers are accepted. `None` when the job was added without a
    /// current head.
    pub start_height: Option<u64>,
}

/// Job ID -> spec, ordered by ID so snapshots are deterministic.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: BTreeMap<JobId, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `spec`. Returns the spec back if its ID is taken, leaving the registry unchanged.
    pub fn insert(&mut self, spec: JobSpec, current_head: Option<&Head>) -> Result<(), JobSpec> {
        if self.jobs.contains_key(&spec.id) {
            return Err(spec);
        }
        let start_height = current_head.map(|h| h.height.saturating_add(1));
        self.jobs
            .insert(spec.id.clone(), RegisteredJob { spec, start_height });
        Ok(())
    }

    pub fn remove(&mut self, id: &JobId) -> Option<RegisteredJob> {
        self.jobs.remove(id)
    }

    pub fn get(&self, id: &JobId) -> Option<&RegisteredJob> {
        self.jobs.get(id)
    }

    pub fn contains(&self, id: &JobId) -> bool {
        self.jobs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Owned copies of every registered spec.
    pub fn snapshot(&self) -> Vec<JobSpec> {
        self.jobs.values().map(|j| j.spec.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::head::BlockHash;

    fn head(height: u64) -> Head {
        Head::new(height, BlockHash([7; 32]), BlockHash([6; 32]))
    }

    #[test]
    fn insert_seeds_start_height_after_current_head() {
        let mut r = JobRegistry::new();
        r.insert(JobSpec::new("a"), Some(&head(100))).unwrap();
        r.insert(JobSpec::new("b"), None).unwrap();
        assert_eq!(r.get(&"a".into()).unwrap().start_height, Some(101));
        assert_eq!(r.get(&"b".into()).unwrap().start_height, None);
    }

    #[test]
    fn duplicate_insert_leaves_registry_unchanged() {
        let mut r = JobRegistry::new();
        let original = JobSpec::new("a").with_task("noop", serde_json::Value::Null);
        r.insert(original.clone(), None).unwrap();
        let rejected = r.insert(JobSpec::new("a"), Some(&head(5))).unwrap_err();
        assert_eq!(rejected.id, JobId::from("a"));
        assert_eq!(r.snapshot(), vec![original]);
        assert_eq!(r.get(&"a".into()).unwrap().start_height, None);
    }

    #[test]
    fn snapshot_does_not_alias() {
        let mut r = JobRegistry::new();
        r.insert(JobSpec::new("a"), None).unwrap();
        let mut snap = r.snapshot();
        snap[0].id = JobId::from("mutated");
        snap.push(JobSpec::new("extra"));
        assert_eq!(r.snapshot(), vec![JobSpec::new("a")]);
    }

    #[test]
    fn remove_unknown_is_none() {
        let mut r = JobRegistry::new();
        assert!(r.remove(&"nope".into()).is_none());
        assert!(r.is_empty());
    }
}

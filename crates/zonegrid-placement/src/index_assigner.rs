//! Instance index assignment.
//!
//! Indices are per instance group and scoped to one deployment. Existing
//! instances keep their index; new instances take the smallest index not in
//! use by a committed record or by an earlier assignment in the same pass.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;
use zonegrid_state::{InstanceRecord, StateResult, StateStore};

pub struct IndexAssigner {
    deployment: String,
    /// Indices held by committed records, per group.
    committed: HashMap<String, BTreeSet<u32>>,
    /// Indices handed out during this pass, per group.
    claimed: HashMap<String, BTreeSet<u32>>,
}

impl IndexAssigner {
    pub fn new<'a>(deployment: &str, records: impl IntoIterator<Item = &'a InstanceRecord>) -> Self {
        let mut committed: HashMap<String, BTreeSet<u32>> = HashMap::new();
        for record in records.into_iter().filter(|r| r.deployment == deployment) {
            committed
                .entry(record.instance_group.clone())
                .or_default()
                .insert(record.index);
        }
        Self {
            deployment: deployment.to_string(),
            committed,
            claimed: HashMap::new(),
        }
    }

    /// Seed from every committed record of `deployment`.
    pub fn from_store(store: &StateStore, deployment: &str) -> StateResult<Self> {
        let records = store.list_instances_for_deployment(deployment)?;
        Ok(Self::new(deployment, &records))
    }

    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    /// Index for an instance of `group`.
    ///
    /// An existing instance created for the same group keeps its index unless
    /// another instance already claimed it in this pass. Everything else gets
    /// the lowest free index.
    pub fn assign(&mut self, group: &str, existing: Option<&InstanceRecord>) -> u32 {
        if let Some(record) = existing {
            if record.instance_group == group && !self.is_claimed(group, record.index) {
                self.claim(group, record.index);
                return record.index;
            }
        }

        let committed = self.committed.get(group);
        let claimed = self.claimed.get(group);
        let taken = |i: &u32| {
            committed.is_some_and(|c| c.contains(i)) || claimed.is_some_and(|c| c.contains(i))
        };
        let index = (0u32..).find(|i| !taken(i)).unwrap_or(u32::MAX);
        self.claim(group, index);
        debug!(deployment = %self.deployment, group, index, "assigned fresh index");
        index
    }

    fn is_claimed(&self, group: &str, index: u32) -> bool {
        self.claimed.get(group).is_some_and(|c| c.contains(&index))
    }

    fn claim(&mut self, group: &str, index: u32) {
        self.claimed.entry(group.to_string()).or_default().insert(index);
    }
}

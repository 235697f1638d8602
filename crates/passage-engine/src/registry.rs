//! Process-wide index of live tunnel instances.

use dashmap::DashMap;
use passage_proto::TunnelId;
use std::sync::Arc;

use crate::instance::TunnelInstance;
use crate::EngineError;

/// Maps tunnel IDs to their running data-plane instances.
///
/// The registry only records instances; starting and stopping them is
/// the manager's job. Mutation is serialized per entry, reads are
/// lock-free snapshots.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    instances: DashMap<TunnelId, Arc<TunnelInstance>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an instance. Fails if the tunnel already has one; a
    /// record in `active` or `connecting` must map to exactly one
    /// instance.
    pub fn insert(&self, instance: Arc<TunnelInstance>) -> Result<(), EngineError> {
        use dashmap::mapref::entry::Entry;
        match self.instances.entry(instance.tunnel_id()) {
            Entry::Occupied(_) => Err(EngineError::AlreadyRegistered(instance.tunnel_id())),
            Entry::Vacant(slot) => {
                slot.insert(instance);
                Ok(())
            }
        }
    }

    pub fn remove(&self, id: TunnelId) -> Option<Arc<TunnelInstance>> {
        self.instances.remove(&id).map(|(_, instance)| instance)
    }

    pub fn lookup(&self, id: TunnelId) -> Option<Arc<TunnelInstance>> {
        self.instances.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: TunnelId) -> bool {
        self.instances.contains_key(&id)
    }

    /// Clone out the current set of instances.
    pub fn snapshot(&self) -> Vec<Arc<TunnelInstance>> {
        self.instances
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

//! A node's private view of its peers.
//!
//! `known` maps each peer id to its latest descriptor. `groups` indexes the
//! same ids by feature fingerprint so that the common "who is compatible with
//! me" question only has to look at one descriptor per group. Both maps keep
//! insertion order, which makes target selection reproducible.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tessera_core::{FeatureSet, Fingerprint, HealthStatus, ServerDescriptor, ServerId, Timestamp};

/// Mesh activity counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MeshStats {
    /// Servers registered for the first time
    pub new_discoveries: u64,
    /// Announcements published
    pub announcements_sent: u64,
    /// Announcements received from peers
    pub announcements_received: u64,
    /// Discovery rounds started
    pub discovery_rounds: u64,
    /// Explicit removals
    pub removals: u64,
    /// Servers dropped by stale cleanup
    pub stale_removals: u64,
    /// Tasks run by a local handler
    pub local_dispatches: u64,
    /// Tasks completed by a peer
    pub remote_dispatches: u64,
    /// Dispatches that ended in an error
    pub failed_dispatches: u64,
    /// Health checks answered by the target
    pub direct_health_checks: u64,
    /// Health checks decided from last contact
    pub inferred_health_checks: u64,
}

/// What `register` did with a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First time this server was seen
    Inserted,
    /// Existing entry refreshed
    Updated,
    /// Descriptor was our own and was ignored
    IgnoredSelf,
}

/// Known peers of one node, indexed by fingerprint
#[derive(Debug, Clone)]
pub struct LocalRegistry {
    self_id: ServerId,
    known: IndexMap<ServerId, ServerDescriptor>,
    groups: IndexMap<Fingerprint, IndexSet<ServerId>>,
    stats: MeshStats,
}

impl LocalRegistry {
    /// Empty registry for the node `self_id`
    #[must_use]
    pub fn new(self_id: ServerId) -> Self {
        Self {
            self_id,
            known: IndexMap::new(),
            groups: IndexMap::new(),
            stats: MeshStats::default(),
        }
    }

    /// Insert or refresh a peer
    ///
    /// New entries get `first_seen = now`. Updates keep `first_seen`, never
    /// move `last_seen` backwards, and re-bucket the id if its fingerprint
    /// changed.
    pub fn register(&mut self, descriptor: ServerDescriptor, now: Timestamp) -> Registration {
        if descriptor.id == self.self_id {
            return Registration::IgnoredSelf;
        }

        let fingerprint = descriptor.fingerprint();
        if let Some(existing) = self.known.get_mut(&descriptor.id) {
            let previous = existing.fingerprint();
            existing.refresh_from(&descriptor);
            if previous != fingerprint {
                let id = descriptor.id.clone();
                self.ungroup(&id, &previous);
                self.groups.entry(fingerprint).or_default().insert(id);
            }
            return Registration::Updated;
        }

        let mut descriptor = descriptor;
        descriptor.first_seen = now;
        self.groups
            .entry(fingerprint)
            .or_default()
            .insert(descriptor.id.clone());
        self.known.insert(descriptor.id.clone(), descriptor);
        self.stats.new_discoveries += 1;
        Registration::Inserted
    }

    fn ungroup(&mut self, id: &ServerId, fingerprint: &Fingerprint) {
        if let Some(members) = self.groups.get_mut(fingerprint) {
            members.shift_remove(id);
            if members.is_empty() {
                self.groups.shift_remove(fingerprint);
            }
        }
    }

    /// Drop a peer, returning its last descriptor
    pub fn remove(&mut self, id: &ServerId) -> Option<ServerDescriptor> {
        let removed = self.known.shift_remove(id)?;
        self.ungroup(id, &removed.fingerprint());
        Some(removed)
    }

    /// Look up a peer
    #[must_use]
    pub fn get(&self, id: &ServerId) -> Option<&ServerDescriptor> {
        self.known.get(id)
    }

    /// Check if a peer is known
    #[must_use]
    pub fn contains(&self, id: &ServerId) -> bool {
        self.known.contains_key(id)
    }

    /// Known peers in registration order
    pub fn descriptors(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.known.values()
    }

    /// Known peer ids in registration order
    #[must_use]
    pub fn ids(&self) -> Vec<ServerId> {
        self.known.keys().cloned().collect()
    }

    /// Number of known peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.known.len()
    }

    /// Check if no peers are known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    /// Peers that can serve a caller with feature set `own`
    ///
    /// With `required`, every known peer offering all required tokens.
    /// Without it, every peer whose group is version-compatible with `own`,
    /// decided once per group.
    #[must_use]
    pub fn compatible(
        &self,
        own: &FeatureSet,
        required: Option<&BTreeSet<String>>,
    ) -> Vec<ServerDescriptor> {
        if let Some(required) = required {
            return self
                .known
                .values()
                .filter(|d| d.feature_set.can_handle(required))
                .cloned()
                .collect();
        }

        let mut matches = Vec::new();
        for members in self.groups.values() {
            let compatible = members
                .first()
                .and_then(|id| self.known.get(id))
                .is_some_and(|d| d.feature_set.is_compatible_with(own));
            if compatible {
                matches.extend(members.iter().filter_map(|id| self.known.get(id)).cloned());
            }
        }
        matches
    }

    /// Ids silent for longer than `max_age` as of `now`
    #[must_use]
    pub fn stale(&self, now: Timestamp, max_age: Duration) -> Vec<ServerId> {
        self.known
            .values()
            .filter(|d| d.is_stale(now, max_age))
            .map(|d| d.id.clone())
            .collect()
    }

    /// Record direct contact with a known peer
    pub fn touch(&mut self, id: &ServerId, now: Timestamp) -> bool {
        match self.known.get_mut(id) {
            Some(descriptor) => {
                descriptor.touch(now);
                true
            }
            None => false,
        }
    }

    /// Overwrite a known peer's `last_seen`
    pub fn set_last_seen(&mut self, id: &ServerId, at: Timestamp) -> bool {
        match self.known.get_mut(id) {
            Some(descriptor) => {
                descriptor.last_seen = at;
                true
            }
            None => false,
        }
    }

    /// Store a health verdict for a known peer
    pub fn set_health(&mut self, id: &ServerId, health: HealthStatus) -> bool {
        match self.known.get_mut(id) {
            Some(descriptor) => {
                descriptor.health = health;
                true
            }
            None => false,
        }
    }

    /// Fingerprint groups with their members, in insertion order
    #[must_use]
    pub fn groups(&self) -> Vec<(Fingerprint, Vec<ServerId>)> {
        self.groups
            .iter()
            .map(|(fp, members)| (*fp, members.iter().cloned().collect()))
            .collect()
    }

    /// Forget every peer and zero the counters
    pub fn clear(&mut self) {
        self.known.clear();
        self.groups.clear();
        self.stats = MeshStats::default();
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> MeshStats {
        self.stats
    }

    /// Counters, for updating
    pub fn stats_mut(&mut self) -> &mut MeshStats {
        &mut self.stats
    }

    /// Check that `groups` is exactly the fingerprint index of `known`
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        let indexed: usize = self.groups.values().map(IndexSet::len).sum();
        indexed == self.known.len()
            && self.groups.iter().all(|(fp, members)| {
                !members.is_empty()
                    && members
                        .iter()
                        .all(|id| self.known.get(id).is_some_and(|d| d.fingerprint() == *fp))
            })
    }
}

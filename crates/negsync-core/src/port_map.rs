//! Port-to-backend map: the mergeable, diffable description of which service
//! ports are exposed as which backend groups.
//!
//! Every configuration feature (ingress, standalone annotation, mesh subsets)
//! builds its own map; the controller unions them with [`PortToBackendMap::merge`]
//! and computes what changed between passes with [`PortToBackendMap::difference`].

use crate::error::{NegError, Result};
use crate::namer::BackendNamer;
use crate::types::{BackendInfo, BackendKey, ServiceKey, SvcPortMap};
use std::collections::{btree_map, BTreeMap, BTreeSet};

/// Mapping of backend key to backend info. Not safe for concurrent mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortToBackendMap {
    entries: BTreeMap<BackendKey, BackendInfo>,
}

impl PortToBackendMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// One entry per `service port -> target port` pair, all sharing `readiness_gate`
    pub fn from_ports(
        service: &ServiceKey,
        ports: &SvcPortMap,
        namer: &dyn BackendNamer,
        readiness_gate: bool,
    ) -> Self {
        let entries = ports
            .iter()
            .map(|(&port, target_port)| {
                (
                    BackendKey::port(port),
                    BackendInfo {
                        target_port: target_port.clone(),
                        subset: String::new(),
                        backend_group_name: namer.name(service, port),
                        readiness_gate,
                    },
                )
            })
            .collect();
        Self { entries }
    }

    /// One entry per (service port, subset) pair; no plain entries are emitted.
    ///
    /// An empty subset list yields an empty map. Subset names must be non-empty
    /// since an empty subset denotes the plain key.
    pub fn from_ports_with_subsets(
        service: &ServiceKey,
        ports: &SvcPortMap,
        subsets: &[String],
        namer: &dyn BackendNamer,
        readiness_gate: bool,
    ) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for subset in subsets {
            if subset.is_empty() {
                return Err(NegError::invalid_subset(format!(
                    "empty subset name in routing rule for {}",
                    service
                )));
            }
            for (&port, target_port) in ports {
                entries.insert(
                    BackendKey::with_subset(port, subset.clone()),
                    BackendInfo {
                        target_port: target_port.clone(),
                        subset: subset.clone(),
                        backend_group_name: namer.name_with_subset(service, port, subset),
                        readiness_gate,
                    },
                );
            }
        }
        Ok(Self { entries })
    }

    /// Union `other` into `self` in place.
    ///
    /// Shared keys must agree on target port (else [`NegError::Conflict`]) and on
    /// backend group name (else [`NegError::NameMismatch`]); their readiness gates
    /// are OR-ed. On error the receiver is left partially merged and must be
    /// discarded.
    pub fn merge(&mut self, other: &PortToBackendMap) -> Result<()> {
        for (key, incoming) in &other.entries {
            match self.entries.entry(key.clone()) {
                btree_map::Entry::Vacant(slot) => {
                    slot.insert(incoming.clone());
                }
                btree_map::Entry::Occupied(mut slot) => {
                    let existing = slot.get_mut();
                    if existing.target_port != incoming.target_port {
                        return Err(NegError::conflict(
                            key.to_string(),
                            &existing.target_port,
                            &incoming.target_port,
                        ));
                    }
                    if existing.backend_group_name != incoming.backend_group_name {
                        return Err(NegError::name_mismatch(
                            key.to_string(),
                            &existing.backend_group_name,
                            &incoming.backend_group_name,
                        ));
                    }
                    existing.readiness_gate |= incoming.readiness_gate;
                }
            }
        }
        Ok(())
    }

    /// Entries of `self` whose (key, value) pair is not present identically in `other`
    pub fn difference(&self, other: &PortToBackendMap) -> PortToBackendMap {
        let entries = self
            .entries
            .iter()
            .filter(|(key, info)| other.entries.get(*key) != Some(*info))
            .map(|(key, info)| (key.clone(), info.clone()))
            .collect();
        PortToBackendMap { entries }
    }

    /// Flat `service port -> backend group name` table, ignoring subsets
    pub fn to_backend_name_index(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|(key, info)| (key.service_port.to_string(), info.backend_group_name.clone()))
            .collect()
    }

    /// Distinct backend group names of entries that require the readiness gate
    pub fn gated_backend_names(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .filter(|info| info.readiness_gate)
            .map(|info| info.backend_group_name.clone())
            .collect()
    }

    /// Distinct backend group names of all entries
    pub fn backend_names(&self) -> BTreeSet<String> {
        self.entries
            .values()
            .map(|info| info.backend_group_name.clone())
            .collect()
    }

    pub fn get(&self, key: &BackendKey) -> Option<&BackendInfo> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &BackendKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert an entry, returning the previous value for the key
    pub fn insert(&mut self, key: BackendKey, info: BackendInfo) -> Option<BackendInfo> {
        self.entries.insert(key, info)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, BackendKey, BackendInfo> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &BackendKey> {
        self.entries.keys()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(BackendKey, BackendInfo)> for PortToBackendMap {
    fn from_iter<I: IntoIterator<Item = (BackendKey, BackendInfo)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for PortToBackendMap {
    type Item = (BackendKey, BackendInfo);
    type IntoIter = btree_map::IntoIter<BackendKey, BackendInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<'a> IntoIterator for &'a PortToBackendMap {
    type Item = (&'a BackendKey, &'a BackendInfo);
    type IntoIter = btree_map::Iter<'a, BackendKey, BackendInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

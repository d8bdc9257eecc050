use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Health state reported for an endpoint that passes its load-balancer health check
pub const HEALTHY_STATE: &str = "HEALTHY";

/// One health record of a network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub health_state: String,
}

impl HealthRecord {
    pub fn healthy() -> Self {
        Self {
            health_state: HEALTHY_STATE.to_string(),
        }
    }

    pub fn with_state(state: impl Into<String>) -> Self {
        Self {
            health_state: state.into(),
        }
    }
}

/// Observed network endpoint inside a backend group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointObservation {
    /// Pod IP address
    pub ip_address: String,
    pub port: i32,
    /// Pod name, when the provider reports it
    #[serde(default)]
    pub pod_name: Option<String>,
    #[serde(default)]
    pub healths: Vec<HealthRecord>,
}

impl EndpointObservation {
    pub fn new(ip_address: impl Into<String>, port: i32) -> Self {
        Self {
            ip_address: ip_address.into(),
            port,
            pod_name: None,
            healths: Vec::new(),
        }
    }

    pub fn with_healths(mut self, healths: Vec<HealthRecord>) -> Self {
        self.healths = healths;
        self
    }

    /// Exactly one health record, and it is [`HEALTHY_STATE`]
    pub fn is_healthy(&self) -> bool {
        matches!(self.healths.as_slice(), [only] if only.health_state == HEALTHY_STATE)
    }

    /// Describe why the endpoint is not healthy, `None` if it is
    pub fn health_mismatch(&self) -> Option<String> {
        match self.healths.as_slice() {
            [only] if only.health_state == HEALTHY_STATE => None,
            [only] => Some(format!(
                "endpoint {}:{} has health status {:?}, want {:?}",
                self.ip_address, self.port, only.health_state, HEALTHY_STATE
            )),
            records => Some(format!(
                "endpoint {}:{} has {} health records, want 1",
                self.ip_address,
                self.port,
                records.len()
            )),
        }
    }
}

/// Observed backend group with its endpoints across zones
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendGroupObservation {
    pub name: String,
    #[serde(default)]
    pub zones: BTreeSet<String>,
    #[serde(default)]
    pub endpoints: Vec<EndpointObservation>,
}

impl BackendGroupObservation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Find the endpoint for a pod IP
    pub fn endpoint_for_ip(&self, ip: &str) -> Option<&EndpointObservation> {
        self.endpoints.iter().find(|e| e.ip_address == ip)
    }
}

/// Backend groups attributable to one target, keyed by name
pub type BackendGroups = BTreeMap<String, BackendGroupObservation>;

/// Snapshot of the load-balancer topology attributable to one target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyObservation {
    pub forwarding_rules: usize,
    pub backend_services: usize,
    pub backend_groups: BackendGroups,
}

impl TopologyObservation {
    /// Union of zones across all observed backend groups
    pub fn zones(&self) -> BTreeSet<String> {
        self.backend_groups
            .values()
            .flat_map(|g| g.zones.iter().cloned())
            .collect()
    }

    /// Nothing attributable remains
    pub fn is_empty(&self) -> bool {
        self.forwarding_rules == 0 && self.backend_services == 0 && self.backend_groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_health_shapes() {
        let ep = EndpointObservation::new("10.0.0.1", 8080);
        assert!(!ep.is_healthy());
        assert!(ep.health_mismatch().unwrap().contains("0 health records"));

        let ep = ep.with_healths(vec![HealthRecord::healthy()]);
        assert!(ep.is_healthy());
        assert!(ep.health_mismatch().is_none());

        let ep = ep.with_healths(vec![HealthRecord::healthy(), HealthRecord::healthy()]);
        assert!(!ep.is_healthy());
        assert!(ep.health_mismatch().unwrap().contains("2 health records"));

        let ep = ep.with_healths(vec![HealthRecord::with_state("UNHEALTHY")]);
        assert!(!ep.is_healthy());
        assert!(ep.health_mismatch().unwrap().contains("UNHEALTHY"));
    }

    #[test]
    fn test_topology_zones_and_emptiness() {
        let mut topo = TopologyObservation::default();
        assert!(topo.is_empty());

        let mut a = BackendGroupObservation::new("a");
        a.zones.insert("zone-a".to_string());
        let mut b = BackendGroupObservation::new("b");
        b.zones.insert("zone-b".to_string());
        b.zones.insert("zone-a".to_string());
        topo.backend_groups.insert("a".to_string(), a);
        topo.backend_groups.insert("b".to_string(), b);

        assert!(!topo.is_empty());
        assert_eq!(
            topo.zones().into_iter().collect::<Vec<_>>(),
            vec!["zone-a", "zone-b"]
        );
    }
}

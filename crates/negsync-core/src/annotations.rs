use crate::error::{NegError, Result};
use crate::port_map::PortToBackendMap;
use k8s_openapi::api::core::v1::Service;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Service annotation requesting backend groups
pub const NEG_ANNOTATION_KEY: &str = "cloud.google.com/neg";

/// Service annotation carrying the backend group status written by the controller
pub const NEG_STATUS_KEY: &str = "cloud.google.com/neg-status";

/// Pod readiness gate condition type satisfied once the pod's endpoint is healthy
pub const NEG_READINESS_GATE: &str = "cloud.google.com/load-balancer-neg-ready";

/// Condition reason when the pod is healthy in its backend groups
pub const NEG_READY_REASON: &str = "LoadBalancerNegReady";

/// Condition reason while the pod is still waiting on backend health
pub const NEG_NOT_READY_REASON: &str = "LoadBalancerNegNotReady";

/// Per-port attributes of a standalone backend group request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegAttributes {}

/// Parsed value of the [`NEG_ANNOTATION_KEY`] annotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegAnnotation {
    /// Ingress-referenced ports become backend groups (with readiness gate)
    #[serde(default)]
    pub ingress: bool,
    /// Standalone backend groups keyed by service port
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<i32, NegAttributes>,
}

impl NegAnnotation {
    /// Parse an annotation value
    pub fn parse(value: &str) -> Result<Self> {
        serde_json::from_str(value)
            .map_err(|e| NegError::invalid_annotation(NEG_ANNOTATION_KEY, e.to_string()))
    }

    /// Read the annotation from a service; `None` when absent
    pub fn from_service(service: &Service) -> Result<Option<Self>> {
        service
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(NEG_ANNOTATION_KEY))
            .map(|v| Self::parse(v))
            .transpose()
    }

    /// Whether any feature is enabled
    pub fn neg_enabled(&self) -> bool {
        self.ingress || !self.exposed_ports.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        crate::to_json(self)
    }
}

/// Parsed value of the [`NEG_STATUS_KEY`] annotation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegStatus {
    /// Service port (as string) to backend group name
    #[serde(default)]
    pub network_endpoint_groups: BTreeMap<String, String>,
    /// Zones the backend groups span
    #[serde(default)]
    pub zones: Vec<String>,
}

impl NegStatus {
    /// Build the status from the canonical map and the observed zones
    pub fn new(map: &PortToBackendMap, zones: impl IntoIterator<Item = String>) -> Self {
        let zones: BTreeSet<String> = zones.into_iter().collect();
        Self {
            network_endpoint_groups: map.to_backend_name_index(),
            zones: zones.into_iter().collect(),
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        serde_json::from_str(value)
            .map_err(|e| NegError::invalid_annotation(NEG_STATUS_KEY, e.to_string()))
    }

    /// Read the status from a service; `None` when absent
    pub fn from_service(service: &Service) -> Result<Option<Self>> {
        service
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(NEG_STATUS_KEY))
            .map(|v| Self::parse(v))
            .transpose()
    }

    /// Serialize into the single-string annotation value
    pub fn to_annotation_value(&self) -> Result<String> {
        crate::to_json(self)
    }

    /// Check that the status lists exactly `expected` service ports
    pub fn check_ports<I, S>(&self, expected: I) -> std::result::Result<(), String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let expected: BTreeSet<String> = expected.into_iter().map(Into::into).collect();
        let existing: BTreeSet<String> = self.network_endpoint_groups.keys().cloned().collect();
        if expected == existing {
            Ok(())
        } else {
            Err(format!(
                "status lists ports {:?}, want {:?}",
                existing, expected
            ))
        }
    }
}

use k8s_openapi::api::core::v1::Service;
use negsync_core::{
    desired_port_map, BackendNamer, BackendSources, DestinationRule, NegStatus, PortToBackendMap,
    ServiceKey,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// Pod to simulate behind a service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanPod {
    pub name: String,
    pub ip: String,
}

/// One service and the configuration sources that reference it
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanEntry {
    pub service: Service,
    #[serde(default)]
    pub ingress_ports: BTreeSet<i32>,
    #[serde(default)]
    pub destination_rule: Option<DestinationRule>,
    #[serde(default)]
    pub pods: Vec<PlanPod>,
}

impl PlanEntry {
    pub fn key(&self) -> miette::Result<ServiceKey> {
        ServiceKey::from_metadata(&self.service.metadata)
            .ok_or_else(|| miette::miette!("Service in plan file has no name"))
    }

    pub fn sources(&self) -> BackendSources {
        BackendSources {
            service: self.service.clone(),
            ingress_ports: self.ingress_ports.clone(),
            destination_rule: self.destination_rule.clone(),
        }
    }
}

/// Plan file listing services to reconcile
#[derive(Debug, Clone, Deserialize)]
pub struct PlanFile {
    pub services: Vec<PlanEntry>,
}

impl PlanFile {
    pub fn load(path: &Path) -> miette::Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            miette::miette!("Failed to read plan file '{}': {}", path.display(), e)
        })?;
        Ok(negsync_core::from_yaml(&data)?)
    }
}

/// One backend entry of a planned service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedBackend {
    pub key: String,
    pub target_port: String,
    pub backend_group: String,
    pub readiness_gate: bool,
}

/// Canonical topology computed for one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReport {
    pub service: String,
    pub backends: Vec<PlannedBackend>,
    pub gated_backend_groups: BTreeSet<String>,
    pub status_annotation: String,
}

impl PlanReport {
    pub fn new(target: &ServiceKey, map: &PortToBackendMap) -> miette::Result<Self> {
        let backends = map
            .iter()
            .map(|(key, info)| PlannedBackend {
                key: key.to_string(),
                target_port: info.target_port.clone(),
                backend_group: info.backend_group_name.clone(),
                readiness_gate: info.readiness_gate,
            })
            .collect();
        Ok(Self {
            service: target.to_string(),
            backends,
            gated_backend_groups: map.gated_backend_names(),
            status_annotation: NegStatus::new(map, Vec::new()).to_annotation_value()?,
        })
    }
}

/// Merge every entry's sources offline
pub fn plan(file: &PlanFile, namer: &dyn BackendNamer) -> miette::Result<Vec<PlanReport>> {
    file.services
        .iter()
        .map(|entry| {
            let target = entry.key()?;
            let map = desired_port_map(&target, &entry.sources(), namer)
                .map_err(|e| miette::miette!("Failed to plan {}: {}", target, e))?;
            PlanReport::new(&target, &map)
        })
        .collect()
}

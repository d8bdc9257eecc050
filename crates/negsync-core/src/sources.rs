//! Per-feature builders for port-to-backend maps.
//!
//! Each configuration feature contributes its own map independently; the
//! canonical map is their merge.

use crate::annotations::NegAnnotation;
use crate::error::{NegError, Result};
use crate::namer::BackendNamer;
use crate::port_map::PortToBackendMap;
use crate::types::{ServiceKey, SvcPortMap};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

/// Mesh routing rule splitting a service into named subsets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationRule {
    /// Host the rule applies to
    pub host: String,
    /// Named subsets
    #[serde(default)]
    pub subsets: Vec<String>,
    /// Whether subset backend groups require the readiness gate
    #[serde(default)]
    pub readiness_gate: bool,
}

/// All configuration sources for one service in one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct BackendSources {
    pub service: Service,
    /// Service ports referenced by ingress routing rules
    pub ingress_ports: BTreeSet<i32>,
    pub destination_rule: Option<DestinationRule>,
}

/// Map every service port to its target port.
///
/// Named target ports are kept by name; a missing target port defaults to the
/// service port, as the API server does.
pub fn service_port_map(service: &Service) -> SvcPortMap {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| {
                    let target = match &p.target_port {
                        Some(IntOrString::Int(n)) => n.to_string(),
                        Some(IntOrString::String(s)) if !s.is_empty() => s.clone(),
                        _ => p.port.to_string(),
                    };
                    (p.port, target)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Restrict `ports` to `wanted`, failing on ports the service does not define
fn select_ports(
    service: &ServiceKey,
    ports: &SvcPortMap,
    wanted: impl IntoIterator<Item = i32>,
) -> Result<SvcPortMap> {
    let mut selected = SvcPortMap::new();
    for port in wanted {
        match ports.get(&port) {
            Some(target) => {
                selected.insert(port, target.clone());
            }
            None => {
                let available = ports
                    .keys()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(NegError::unknown_service_port(
                    service.to_string(),
                    port,
                    available,
                ));
            }
        }
    }
    Ok(selected)
}

/// Backend groups for ingress-referenced ports; these always carry the readiness gate
pub fn ingress_source(
    service: &ServiceKey,
    ports: &SvcPortMap,
    ingress_ports: &BTreeSet<i32>,
    namer: &dyn BackendNamer,
) -> Result<PortToBackendMap> {
    let selected = select_ports(service, ports, ingress_ports.iter().copied())?;
    Ok(PortToBackendMap::from_ports(service, &selected, namer, true))
}

/// Standalone backend groups requested through the annotation's exposed ports
pub fn standalone_source(
    service: &ServiceKey,
    ports: &SvcPortMap,
    annotation: &NegAnnotation,
    namer: &dyn BackendNamer,
) -> Result<PortToBackendMap> {
    let selected = select_ports(service, ports, annotation.exposed_ports.keys().copied())?;
    Ok(PortToBackendMap::from_ports(service, &selected, namer, false))
}

/// Subset-qualified backend groups for every service port
pub fn subset_source(
    service: &ServiceKey,
    ports: &SvcPortMap,
    rule: &DestinationRule,
    namer: &dyn BackendNamer,
) -> Result<PortToBackendMap> {
    PortToBackendMap::from_ports_with_subsets(
        service,
        ports,
        &rule.subsets,
        namer,
        rule.readiness_gate,
    )
}

/// Build and merge every feature's contribution into the canonical map.
///
/// Features merge in a fixed order (ingress, standalone, subsets); since merge is
/// commutative for non-conflicting inputs, the order only affects which conflict
/// is reported first.
pub fn desired_port_map(
    service_key: &ServiceKey,
    sources: &BackendSources,
    namer: &dyn BackendNamer,
) -> Result<PortToBackendMap> {
    let ports = service_port_map(&sources.service);
    let annotation = NegAnnotation::from_service(&sources.service)?.unwrap_or_default();

    let mut desired = PortToBackendMap::new();

    if annotation.ingress {
        let ingress = ingress_source(service_key, &ports, &sources.ingress_ports, namer)?;
        debug!(service = %service_key, entries = ingress.len(), "Ingress backend groups");
        desired.merge(&ingress)?;
    }

    if !annotation.exposed_ports.is_empty() {
        let standalone = standalone_source(service_key, &ports, &annotation, namer)?;
        debug!(service = %service_key, entries = standalone.len(), "Standalone backend groups");
        desired.merge(&standalone)?;
    }

    if let Some(rule) = &sources.destination_rule {
        let subsets = subset_source(service_key, &ports, rule, namer)?;
        debug!(service = %service_key, entries = subsets.len(), "Subset backend groups");
        desired.merge(&subsets)?;
    }

    Ok(desired)
}

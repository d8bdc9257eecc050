//! Negsync Core - backend topology data model for the load-balancer controller
//!
//! This crate provides:
//! - The port-to-backend map with merge/difference set algebra
//! - The backend group naming capability
//! - Service annotation formats (request and status)
//! - Per-feature source builders
//! - Convergence outcome events
//! - Error types with miette diagnostics

pub mod annotations;
pub mod error;
pub mod events;
pub mod namer;
pub mod port_map;
pub mod sources;
pub mod types;

// Re-export commonly used types
pub use annotations::{NegAnnotation, NegStatus};
pub use error::{NegError, Result};
pub use events::{ConvergenceEvent, ConvergenceOperation, ConvergenceOutcome};
pub use namer::{BackendNamer, PrefixNamer};
pub use port_map::PortToBackendMap;
pub use sources::{desired_port_map, BackendSources, DestinationRule};
pub use types::{BackendInfo, BackendKey, ServiceKey, SvcPortMap};

// Re-export k8s-openapi types for convenience
pub use k8s_openapi;
pub use k8s_openapi::api::core::v1::{Pod, Service};

/// Serialize a value to JSON
pub fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        NegError::serialization_error(
            format!("Failed to serialize to JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a value from JSON
pub fn from_json<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_json::from_str(data).map_err(|e| {
        NegError::serialization_error(
            format!("Failed to deserialize from JSON: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Serialize a value to YAML
pub fn to_yaml<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value).map_err(|e| {
        NegError::serialization_error(
            format!("Failed to serialize to YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

/// Deserialize a value from YAML
pub fn from_yaml<T: for<'de> serde::Deserialize<'de>>(data: &str) -> Result<T> {
    serde_yaml::from_str(data).map_err(|e| {
        NegError::serialization_error(
            format!("Failed to deserialize from YAML: {}", e),
            Some(Box::new(e)),
        )
    })
}

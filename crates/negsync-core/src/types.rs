use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Service port number to target port (number or named port) as requested by one feature
pub type SvcPortMap = BTreeMap<i32, String>;

/// ServiceKey identifies the workload whose ports are exposed as backend groups
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    /// Create a new service key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Build a key from object metadata, defaulting the namespace like the API server does
    pub fn from_metadata(
        metadata: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    ) -> Option<Self> {
        let name = metadata.name.as_deref()?;
        let namespace = metadata.namespace.as_deref().unwrap_or("default");
        Some(Self::new(namespace, name))
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// BackendKey is the primary key of a port-to-backend map
///
/// `subset` is empty when no mesh-subset routing applies.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackendKey {
    pub service_port: i32,
    #[serde(default)]
    pub subset: String,
}

impl BackendKey {
    /// Key for a plain (subset-less) service port
    pub fn port(service_port: i32) -> Self {
        Self {
            service_port,
            subset: String::new(),
        }
    }

    /// Key for a subset-qualified service port
    pub fn with_subset(service_port: i32, subset: impl Into<String>) -> Self {
        Self {
            service_port,
            subset: subset.into(),
        }
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subset.is_empty() {
            write!(f, "{}", self.service_port)
        } else {
            write!(f, "{}/{}", self.service_port, self.subset)
        }
    }
}

/// Value stored for each backend key
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendInfo {
    /// Workload-side port number or name endpoints route to
    pub target_port: String,
    /// Duplicated from the key; empty if not subset-routed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subset: String,
    /// Generated backend group name; immutable once computed
    pub backend_group_name: String,
    /// Pods behind this group must report backend health before being ready
    #[serde(default)]
    pub readiness_gate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_backend_key_display() {
        assert_eq!(BackendKey::port(80).to_string(), "80");
        assert_eq!(BackendKey::with_subset(80, "v1").to_string(), "80/v1");
    }

    #[test]
    fn test_backend_key_ordering_groups_by_port() {
        let mut keys = vec![
            BackendKey::with_subset(443, "v1"),
            BackendKey::port(8080),
            BackendKey::port(443),
            BackendKey::with_subset(80, "v2"),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                BackendKey::with_subset(80, "v2"),
                BackendKey::port(443),
                BackendKey::with_subset(443, "v1"),
                BackendKey::port(8080),
            ]
        );
    }

    #[test]
    fn test_service_key_from_metadata_defaults_namespace() {
        let meta = ObjectMeta {
            name: Some("web".to_string()),
            ..Default::default()
        };
        let key = ServiceKey::from_metadata(&meta).unwrap();
        assert_eq!(key, ServiceKey::new("default", "web"));
        assert_eq!(key.to_string(), "default/web");
    }

    #[test]
    fn test_service_key_from_metadata_requires_name() {
        assert!(ServiceKey::from_metadata(&ObjectMeta::default()).is_none());
    }
}

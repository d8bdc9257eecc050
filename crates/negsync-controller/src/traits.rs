use crate::error::Result;
use crate::types::BackendGroups;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition, Service};
use negsync_core::{PortToBackendMap, ServiceKey};

/// Read-only view of the cloud load-balancer state attributable to a target
///
/// Every method is an observation. Implementations may fail transiently;
/// callers inside a polling window swallow those errors and retry.
#[async_trait]
pub trait CloudObserver: Send + Sync {
    /// List backend groups attributable to the target, with endpoints and health
    async fn list_backend_groups(&self, target: &ServiceKey) -> Result<BackendGroups>;

    /// Number of forwarding rules attributable to the target
    async fn count_forwarding_rules(&self, target: &ServiceKey) -> Result<usize>;

    /// Number of backend services attributable to the target
    async fn count_backend_services(&self, target: &ServiceKey) -> Result<usize>;
}

/// Desired-state sink for the cloud provider
///
/// Physical creation and deletion happen asynchronously on the provider side.
/// A group that stops being referenced is eventually deleted by the provider.
#[async_trait]
pub trait BackendProvisioner: Send + Sync {
    /// Replace the target's referenced backend groups with `desired`. Idempotent.
    async fn ensure_backend_groups(
        &self,
        target: &ServiceKey,
        desired: &PortToBackendMap,
    ) -> Result<()>;

    /// Drop every reference the target holds. Idempotent.
    async fn release_target(&self, target: &ServiceKey) -> Result<()>;
}

/// Workload orchestration API used for pod readiness and service status
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Upsert a pod status condition keyed by its type
    async fn set_pod_condition(
        &self,
        namespace: &str,
        name: &str,
        condition: PodCondition,
    ) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service>;

    /// Upsert one annotation on a service
    async fn set_service_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;
}

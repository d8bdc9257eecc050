use crate::api_client::upsert_condition;
use crate::error::{ControllerError, Result};
use crate::traits::{BackendProvisioner, CloudObserver, WorkloadApi};
use crate::types::{BackendGroupObservation, BackendGroups, EndpointObservation, HealthRecord};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, PodCondition, Service};
use negsync_core::{PortToBackendMap, ServiceKey};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Physical backend group held by the mock provider
#[derive(Debug, Clone)]
struct MockGroup {
    owner: ServiceKey,
    /// Observations left before the group becomes visible
    pending_creation: u32,
    /// Observations left before the provider deletes the unreferenced group
    pending_deletion: Option<u32>,
}

#[derive(Debug, Clone, Default)]
struct MockTarget {
    referenced: BTreeSet<String>,
    endpoints: Vec<(String, i32)>,
}

#[derive(Debug, Default)]
struct MockCloudState {
    targets: HashMap<ServiceKey, MockTarget>,
    groups: BTreeMap<String, MockGroup>,
    endpoint_health: HashMap<String, Vec<HealthRecord>>,
}

/// In-memory cloud provider
///
/// Groups are created when first referenced and deleted by the provider once
/// unreferenced. Both transitions complete only after a configurable number of
/// backend group observations, modelling eventual consistency.
pub struct MockCloud {
    state: Arc<RwLock<MockCloudState>>,
    provision_delay: u32,
    deletion_delay: u32,
    zones: Vec<String>,
    endpoints_healthy: AtomicBool,
    failing_lookups: AtomicU32,
}

impl Default for MockCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCloud {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockCloudState::default())),
            provision_delay: 0,
            deletion_delay: 0,
            zones: vec!["zone-a".to_string()],
            endpoints_healthy: AtomicBool::new(false),
            failing_lookups: AtomicU32::new(0),
        }
    }

    /// Keep new groups invisible for `observations` lookups
    pub fn with_provision_delay(mut self, observations: u32) -> Self {
        self.provision_delay = observations;
        self
    }

    /// Keep unreferenced groups alive for `observations` lookups
    pub fn with_deletion_delay(mut self, observations: u32) -> Self {
        self.deletion_delay = observations;
        self
    }

    pub fn with_zones(mut self, zones: Vec<String>) -> Self {
        self.zones = zones;
        self
    }

    /// Report one healthy record for endpoints without an explicit override
    pub fn set_endpoints_healthy(&self, healthy: bool) {
        self.endpoints_healthy.store(healthy, Ordering::SeqCst);
    }

    /// Fail the next `count` backend group lookups
    pub fn fail_next_lookups(&self, count: u32) {
        self.failing_lookups.store(count, Ordering::SeqCst);
    }

    /// Add a pod endpoint to every backend group of `target`
    pub async fn add_endpoint(&self, target: &ServiceKey, ip: &str, port: i32) {
        let mut state = self.state.write().await;
        state
            .targets
            .entry(target.clone())
            .or_default()
            .endpoints
            .push((ip.to_string(), port));
    }

    /// Override the health records reported for an endpoint IP
    pub async fn set_endpoint_health(&self, ip: &str, healths: Vec<HealthRecord>) {
        let mut state = self.state.write().await;
        state.endpoint_health.insert(ip.to_string(), healths);
    }

    /// Names currently referenced by `target`
    pub async fn referenced(&self, target: &ServiceKey) -> BTreeSet<String> {
        let state = self.state.read().await;
        state
            .targets
            .get(target)
            .map(|t| t.referenced.clone())
            .unwrap_or_default()
    }

    /// Names of every group the provider still holds, visible or not
    pub async fn group_names(&self) -> BTreeSet<String> {
        self.state.read().await.groups.keys().cloned().collect()
    }

    fn take_failure(&self) -> bool {
        self.failing_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn endpoint(&self, state: &MockCloudState, ip: &str, port: i32) -> EndpointObservation {
        let healths = match state.endpoint_health.get(ip) {
            Some(records) => records.clone(),
            None if self.endpoints_healthy.load(Ordering::SeqCst) => vec![HealthRecord::healthy()],
            None => Vec::new(),
        };
        EndpointObservation::new(ip, port).with_healths(healths)
    }

    fn reconcile_references(&self, state: &mut MockCloudState, target: &ServiceKey) {
        let referenced = state
            .targets
            .get(target)
            .map(|t| t.referenced.clone())
            .unwrap_or_default();

        for name in &referenced {
            match state.groups.get_mut(name) {
                Some(group) => group.pending_deletion = None,
                None => {
                    debug!("Mock: backend group created: {}", name);
                    state.groups.insert(
                        name.clone(),
                        MockGroup {
                            owner: target.clone(),
                            pending_creation: self.provision_delay,
                            pending_deletion: None,
                        },
                    );
                }
            }
        }

        for (name, group) in state.groups.iter_mut() {
            if &group.owner == target
                && !referenced.contains(name)
                && group.pending_deletion.is_none()
            {
                debug!("Mock: backend group dereferenced: {}", name);
                group.pending_deletion = Some(self.deletion_delay);
            }
        }
    }
}

#[async_trait]
impl CloudObserver for MockCloud {
    async fn list_backend_groups(&self, target: &ServiceKey) -> Result<BackendGroups> {
        if self.take_failure() {
            return Err(ControllerError::observation_failed(
                format!("backend groups of {}", target),
                "injected lookup failure",
            ));
        }

        let mut state = self.state.write().await;

        // Advance the provider by one observation. Groups still being created
        // stay hidden from this observation.
        let mut deleted = Vec::new();
        let mut hidden = BTreeSet::new();
        for (name, group) in state.groups.iter_mut() {
            if &group.owner != target {
                continue;
            }
            if group.pending_creation > 0 {
                group.pending_creation -= 1;
                hidden.insert(name.clone());
                continue;
            }
            match group.pending_deletion {
                Some(0) => deleted.push(name.clone()),
                Some(n) => group.pending_deletion = Some(n - 1),
                None => {}
            }
        }
        for name in deleted {
            debug!("Mock: backend group deleted: {}", name);
            state.groups.remove(&name);
        }

        let endpoints = state
            .targets
            .get(target)
            .map(|t| t.endpoints.clone())
            .unwrap_or_default();

        let mut result = BackendGroups::new();
        for (name, group) in &state.groups {
            if &group.owner != target || hidden.contains(name) {
                continue;
            }
            let mut observation = BackendGroupObservation::new(name);
            observation.zones = self.zones.iter().cloned().collect();
            observation.endpoints = endpoints
                .iter()
                .map(|(ip, port)| self.endpoint(&state, ip, *port))
                .collect();
            result.insert(name.clone(), observation);
        }
        Ok(result)
    }

    async fn count_forwarding_rules(&self, target: &ServiceKey) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state
            .targets
            .get(target)
            .map(|t| usize::from(!t.referenced.is_empty()))
            .unwrap_or(0))
    }

    async fn count_backend_services(&self, target: &ServiceKey) -> Result<usize> {
        let state = self.state.read().await;
        Ok(state
            .targets
            .get(target)
            .map(|t| t.referenced.len())
            .unwrap_or(0))
    }
}

#[async_trait]
impl BackendProvisioner for MockCloud {
    async fn ensure_backend_groups(
        &self,
        target: &ServiceKey,
        desired: &PortToBackendMap,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.targets.entry(target.clone()).or_default().referenced = desired.backend_names();
        self.reconcile_references(&mut state, target);
        Ok(())
    }

    async fn release_target(&self, target: &ServiceKey) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(t) = state.targets.get_mut(target) {
            t.referenced.clear();
        }
        self.reconcile_references(&mut state, target);
        Ok(())
    }
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// In-memory workload API holding pods and services
#[derive(Default)]
pub struct MockWorkloadApi {
    pods: Arc<RwLock<HashMap<String, Pod>>>,
    services: Arc<RwLock<HashMap<String, Service>>>,
}

impl MockWorkloadApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_pod(&self, pod: Pod) {
        let namespace = pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let name = pod.metadata.name.clone().unwrap_or_default();
        self.pods.write().await.insert(object_key(&namespace, &name), pod);
    }

    pub async fn remove_pod(&self, namespace: &str, name: &str) {
        self.pods.write().await.remove(&object_key(namespace, name));
    }

    pub async fn add_service(&self, service: Service) {
        let namespace = service
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let name = service.metadata.name.clone().unwrap_or_default();
        self.services
            .write()
            .await
            .insert(object_key(&namespace, &name), service);
    }

    /// Condition of the given type on a stored pod
    pub async fn pod_condition(
        &self,
        namespace: &str,
        name: &str,
        condition_type: &str,
    ) -> Option<PodCondition> {
        let pods = self.pods.read().await;
        pods.get(&object_key(namespace, name))
            .and_then(|p| p.status.as_ref())
            .and_then(|s| s.conditions.as_ref())
            .and_then(|c| c.iter().find(|c| c.type_ == condition_type).cloned())
    }

    /// Annotation value on a stored service
    pub async fn service_annotation(&self, namespace: &str, name: &str, key: &str) -> Option<String> {
        let services = self.services.read().await;
        services
            .get(&object_key(namespace, name))
            .and_then(|s| s.metadata.annotations.as_ref())
            .and_then(|a| a.get(key).cloned())
    }
}

#[async_trait]
impl WorkloadApi for MockWorkloadApi {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods
            .read()
            .await
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| ControllerError::pod_not_found(namespace, name))
    }

    async fn set_pod_condition(
        &self,
        namespace: &str,
        name: &str,
        condition: PodCondition,
    ) -> Result<()> {
        let mut pods = self.pods.write().await;
        let pod = pods
            .get_mut(&object_key(namespace, name))
            .ok_or_else(|| ControllerError::pod_not_found(namespace, name))?;

        upsert_condition(pod, condition);
        debug!("Mock: pod condition set on {}/{}", namespace, name);
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service> {
        self.services
            .read()
            .await
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| ControllerError::service_not_found(namespace, name))
    }

    async fn set_service_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: &str,
    ) -> Result<()> {
        let mut services = self.services.write().await;
        let service = services
            .get_mut(&object_key(namespace, name))
            .ok_or_else(|| ControllerError::service_not_found(namespace, name))?;
        service
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

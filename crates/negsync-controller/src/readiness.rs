use crate::config::ReflectorConfig;
use crate::error::{ControllerError, Result};
use crate::retry::retry_with_backoff;
use crate::traits::{CloudObserver, WorkloadApi};
use crate::types::BackendGroups;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Pod, PodCondition};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use negsync_core::annotations::{NEG_NOT_READY_REASON, NEG_READINESS_GATE, NEG_READY_REASON};
use negsync_core::ServiceKey;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Readiness state of one (pod, backend group) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Waiting for the pod's endpoint to report healthy
    Pending,
    /// Endpoint observed healthy
    Healthy,
    /// The backend group could not be looked up this pass
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GateKey {
    pod_key: String,
    backend_group: String,
}

#[derive(Debug, Clone)]
struct TrackedPod {
    target: ServiceKey,
    namespace: String,
    name: String,
    /// Condition already written because no watched group backs the pod
    unbacked_marked: bool,
    /// Not-ready condition already written
    not_ready_marked: bool,
}

#[derive(Debug, Default)]
struct ReflectorState {
    watched: HashMap<ServiceKey, BTreeSet<String>>,
    pods: HashMap<String, TrackedPod>,
    gates: HashMap<GateKey, GateState>,
}

impl ReflectorState {
    fn register_pairs(&mut self, pod_key: &str, groups: &BTreeSet<String>) {
        for group in groups {
            self.gates
                .entry(GateKey {
                    pod_key: pod_key.to_string(),
                    backend_group: group.clone(),
                })
                .or_insert(GateState::Pending);
        }
    }

    fn pairs_of(&self, pod_key: &str) -> Vec<(String, GateState)> {
        let mut pairs: Vec<(String, GateState)> = self
            .gates
            .iter()
            .filter(|(k, _)| k.pod_key == pod_key)
            .map(|(k, s)| (k.backend_group.clone(), *s))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        pairs
    }
}

/// Counts from one reflection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReflectionSummary {
    pub healthy: usize,
    pub pending: usize,
    pub failed: usize,
    /// Pods whose readiness condition was satisfied this pass
    pub pods_ready: usize,
    /// Pods satisfied because no watched backend group backs them
    pub unbacked_ready: usize,
    /// Pods dropped because they no longer exist
    pub dropped: usize,
}

impl ReflectionSummary {
    fn tally(&mut self, state: GateState) {
        match state {
            GateState::Healthy => self.healthy += 1,
            GateState::Pending => self.pending += 1,
            GateState::Failed => self.failed += 1,
        }
    }
}

fn pod_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Whether the pod declares the backend readiness gate
pub fn has_readiness_gate(pod: &Pod) -> bool {
    pod.spec
        .as_ref()
        .and_then(|s| s.readiness_gates.as_ref())
        .map(|gates| gates.iter().any(|g| g.condition_type == NEG_READINESS_GATE))
        .unwrap_or(false)
}

fn gate_condition(pod: &Pod) -> Option<&PodCondition> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == NEG_READINESS_GATE))
}

fn readiness_condition(satisfied: bool, reason: &str, message: String) -> PodCondition {
    PodCondition {
        type_: NEG_READINESS_GATE.to_string(),
        status: if satisfied { "True" } else { "False" }.to_string(),
        reason: Some(reason.to_string()),
        message: Some(message),
        last_transition_time: Some(Time(Utc::now())),
        ..Default::default()
    }
}

/// Propagates backend health observations onto pod readiness-gate conditions.
///
/// Only groups handed to [`set_watched_groups`](Self::set_watched_groups) are
/// observed; pods behind other groups never wait on this component.
pub struct ReadinessReflector {
    cloud: Arc<dyn CloudObserver>,
    workload: Arc<dyn WorkloadApi>,
    config: ReflectorConfig,
    state: Mutex<ReflectorState>,
}

impl ReadinessReflector {
    pub fn new(
        cloud: Arc<dyn CloudObserver>,
        workload: Arc<dyn WorkloadApi>,
        config: ReflectorConfig,
    ) -> Self {
        Self {
            cloud,
            workload,
            config,
            state: Mutex::new(ReflectorState::default()),
        }
    }

    /// Replace the watch set for `target`. Pairs for groups no longer listed are dropped.
    pub async fn set_watched_groups(&self, target: &ServiceKey, groups: BTreeSet<String>) {
        let mut state = self.state.lock().await;

        let pod_keys: Vec<String> = state
            .pods
            .iter()
            .filter(|(_, p)| &p.target == target)
            .map(|(k, _)| k.clone())
            .collect();

        state
            .gates
            .retain(|k, _| !pod_keys.contains(&k.pod_key) || groups.contains(&k.backend_group));
        for key in &pod_keys {
            state.register_pairs(key, &groups);
        }

        debug!(service = %target, groups = groups.len(), "Updated readiness watch set");
        if groups.is_empty() {
            state.watched.remove(target);
        } else {
            state.watched.insert(target.clone(), groups);
        }
    }

    /// Start tracking a pod selected by `target`.
    ///
    /// Returns false, and tracks nothing, when the pod does not declare the gate.
    /// Re-tracking under the same target keeps existing pair state; under a new
    /// target the old pairs are replaced.
    pub async fn track_pod(&self, target: &ServiceKey, pod: &Pod) -> bool {
        if !has_readiness_gate(pod) {
            return false;
        }
        let (namespace, name) = match (&pod.metadata.namespace, &pod.metadata.name) {
            (ns, Some(name)) => (ns.clone().unwrap_or_else(|| "default".to_string()), name.clone()),
            (_, None) => return false,
        };

        let key = pod_key(&namespace, &name);
        let mut state = self.state.lock().await;
        let retargeted = match state.pods.get(&key) {
            Some(tracked) if &tracked.target == target => false,
            Some(tracked) => {
                debug!(pod = %key, from = %tracked.target, to = %target, "Pod moved to another service");
                true
            }
            None => true,
        };
        if retargeted {
            state.gates.retain(|k, _| k.pod_key != key);
            state.pods.insert(
                key.clone(),
                TrackedPod {
                    target: target.clone(),
                    namespace,
                    name,
                    unbacked_marked: false,
                    not_ready_marked: false,
                },
            );
        }
        let groups = state.watched.get(target).cloned().unwrap_or_default();
        state.register_pairs(&key, &groups);
        true
    }

    /// Stop tracking a pod and drop all its pairs
    pub async fn untrack_pod(&self, namespace: &str, name: &str) {
        let key = pod_key(namespace, name);
        let mut state = self.state.lock().await;
        state.pods.remove(&key);
        state.gates.retain(|k, _| k.pod_key != key);
    }

    /// Current state of one pair, `None` when not tracked
    pub async fn gate_state(&self, namespace: &str, name: &str, backend_group: &str) -> Option<GateState> {
        let state = self.state.lock().await;
        state
            .gates
            .get(&GateKey {
                pod_key: pod_key(namespace, name),
                backend_group: backend_group.to_string(),
            })
            .copied()
    }

    /// Watched groups for a target
    pub async fn watched_groups(&self, target: &ServiceKey) -> BTreeSet<String> {
        let state = self.state.lock().await;
        state.watched.get(target).cloned().unwrap_or_default()
    }

    pub async fn tracked_pods(&self) -> usize {
        self.state.lock().await.pods.len()
    }

    /// Satisfy the gate of a pod that no watched backend group backs
    pub async fn mark_unbacked_pod_ready(&self, namespace: &str, name: &str) -> Result<()> {
        let condition = readiness_condition(
            true,
            NEG_READY_REASON,
            "Pod does not belong to any backend group that requires readiness feedback. \
             Readiness gate is satisfied"
                .to_string(),
        );
        self.workload
            .set_pod_condition(namespace, name, condition)
            .await?;
        info!(pod = %pod_key(namespace, name), "Pod is not behind any gated backend group; marked ready");
        Ok(())
    }

    /// Run one reflection pass over every tracked pod
    pub async fn reflect_once(&self) -> ReflectionSummary {
        let (pods, gates_by_pod) = {
            let state = self.state.lock().await;
            let pods: Vec<(String, TrackedPod)> =
                state.pods.iter().map(|(k, p)| (k.clone(), p.clone())).collect();
            let gates: HashMap<String, Vec<(String, GateState)>> = pods
                .iter()
                .map(|(k, _)| (k.clone(), state.pairs_of(k)))
                .collect();
            (pods, gates)
        };

        let mut summary = ReflectionSummary::default();
        let mut lookups: HashMap<ServiceKey, Option<BackendGroups>> = HashMap::new();
        let mut updates: Vec<(GateKey, GateState)> = Vec::new();
        let mut flags: Vec<(String, bool, bool)> = Vec::new();
        let mut dropped: Vec<String> = Vec::new();

        for (key, pod) in &pods {
            let pairs = gates_by_pod.get(key).cloned().unwrap_or_default();

            // Every tracked pod is looked up each pass so deleted pods release their pairs
            let current = match self.workload.get_pod(&pod.namespace, &pod.name).await {
                Ok(p) => p,
                Err(ControllerError::PodNotFound { .. }) => {
                    debug!(pod = %key, "Pod is gone; dropping its readiness tracking");
                    dropped.push(key.clone());
                    continue;
                }
                Err(e) => {
                    warn!(pod = %key, error = %e, "Failed to read pod");
                    for (_, s) in &pairs {
                        summary.tally(*s);
                    }
                    continue;
                }
            };

            if pairs.is_empty() {
                if !pod.unbacked_marked {
                    match self.mark_unbacked_pod_ready(&pod.namespace, &pod.name).await {
                        Ok(()) => {
                            summary.unbacked_ready += 1;
                            flags.push((key.clone(), true, pod.not_ready_marked));
                        }
                        Err(ControllerError::PodNotFound { .. }) => dropped.push(key.clone()),
                        Err(e) => warn!(pod = %key, error = %e, "Failed to mark unbacked pod ready"),
                    }
                }
                continue;
            }

            if pairs.iter().all(|(_, s)| *s == GateState::Healthy) {
                summary.healthy += pairs.len();
                continue;
            }

            if !lookups.contains_key(&pod.target) {
                let groups = self.lookup_groups(&pod.target).await;
                lookups.insert(pod.target.clone(), groups);
            }
            let groups = lookups.get(&pod.target).and_then(|g| g.as_ref());
            let pod_ip = current.status.as_ref().and_then(|s| s.pod_ip.as_deref());

            let mut next: Vec<(String, GateState)> = Vec::with_capacity(pairs.len());
            for (group_name, previous) in &pairs {
                let state = match (previous, groups) {
                    (GateState::Healthy, _) => GateState::Healthy,
                    (_, None) => GateState::Failed,
                    (_, Some(groups)) => {
                        let healthy = pod_ip
                            .and_then(|ip| groups.get(group_name).and_then(|g| g.endpoint_for_ip(ip)))
                            .map(|e| e.is_healthy())
                            .unwrap_or(false);
                        if healthy {
                            GateState::Healthy
                        } else {
                            GateState::Pending
                        }
                    }
                };
                next.push((group_name.clone(), state));
            }

            let all_healthy = next.iter().all(|(_, s)| *s == GateState::Healthy);
            let mut not_ready_marked = pod.not_ready_marked;

            if all_healthy {
                let message = format!(
                    "Pod has become healthy in backend groups {:?}",
                    next.iter().map(|(g, _)| g.as_str()).collect::<Vec<_>>()
                );
                let condition = readiness_condition(true, NEG_READY_REASON, message);
                match self
                    .workload
                    .set_pod_condition(&pod.namespace, &pod.name, condition)
                    .await
                {
                    Ok(()) => {
                        info!(pod = %key, "Readiness gate satisfied");
                        summary.pods_ready += 1;
                    }
                    Err(e) => {
                        warn!(pod = %key, error = %e, "Failed to satisfy readiness gate");
                        // Leave the pairs unhealthy so the next pass writes again
                        for (_, s) in next.iter_mut() {
                            *s = GateState::Pending;
                        }
                    }
                }
            } else if !pod.not_ready_marked && gate_condition(&current).is_none() {
                let condition = readiness_condition(
                    false,
                    NEG_NOT_READY_REASON,
                    "Waiting for pod to become healthy in its backend groups".to_string(),
                );
                match self
                    .workload
                    .set_pod_condition(&pod.namespace, &pod.name, condition)
                    .await
                {
                    Ok(()) => not_ready_marked = true,
                    Err(e) => debug!(pod = %key, error = %e, "Failed to write not-ready condition"),
                }
            }

            if not_ready_marked != pod.not_ready_marked {
                flags.push((key.clone(), pod.unbacked_marked, not_ready_marked));
            }

            for (group_name, s) in next {
                summary.tally(s);
                updates.push((
                    GateKey {
                        pod_key: key.clone(),
                        backend_group: group_name,
                    },
                    s,
                ));
            }
        }

        let mut state = self.state.lock().await;
        for (key, s) in updates {
            // Pairs removed while the pass ran stay removed
            if let Some(slot) = state.gates.get_mut(&key) {
                *slot = s;
            }
        }
        for (key, unbacked, not_ready) in flags {
            if let Some(pod) = state.pods.get_mut(&key) {
                pod.unbacked_marked = unbacked;
                pod.not_ready_marked = not_ready;
            }
        }
        for key in dropped {
            state.pods.remove(&key);
            state.gates.retain(|k, _| k.pod_key != key);
            summary.dropped += 1;
        }

        summary
    }

    /// Backend groups for one target with retries, `None` once retries are exhausted
    async fn lookup_groups(&self, target: &ServiceKey) -> Option<BackendGroups> {
        let cloud = &self.cloud;
        match retry_with_backoff(&self.config.lookup_retry, "list_backend_groups", || async move {
            cloud.list_backend_groups(target).await
        })
        .await
        {
            Ok(groups) => Some(groups),
            Err(e) => {
                warn!(service = %target, error = %e, "Backend group lookup failed; retrying next pass");
                None
            }
        }
    }

    /// Run reflection passes until cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(interval = ?self.config.interval, "Starting readiness reflector");

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Readiness reflector shutting down");
                    return Ok(());
                }
                _ = interval.tick() => {
                    let summary = tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            info!("Readiness reflector shutting down during a pass");
                            return Ok(());
                        }
                        summary = self.reflect_once() => summary,
                    };
                    if summary.failed > 0 {
                        error!(failed = summary.failed, "Backend group lookups failed this pass");
                    }
                    debug!(?summary, "Reflection pass complete");
                }
            }
        }
    }
}

use crate::config::{ControllerConfig, PollConfig};
use crate::error::{ControllerError, Result};
use crate::poll::{poll_until, Check, PollError, Polled};
use crate::traits::{BackendProvisioner, CloudObserver};
use crate::types::TopologyObservation;
use negsync_core::{ConvergenceEvent, ConvergenceOperation, PortToBackendMap, ServiceKey};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the convergence event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Observed topology a target must reach before provisioning counts as converged
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyExpectation {
    pub forwarding_rules: Option<usize>,
    pub backend_services: Option<usize>,
    /// Backend groups that must be present
    pub backend_groups: BTreeSet<String>,
    /// Groups in which every endpoint must show exactly one healthy record
    pub healthy_groups: BTreeSet<String>,
    /// Total endpoints each expected group must report
    pub endpoints_per_group: Option<usize>,
    /// Observed groups that are neither required nor unexpected
    pub ignored_groups: BTreeSet<String>,
}

impl TopologyExpectation {
    /// Expectation implied by the canonical map
    pub fn from_desired(desired: &PortToBackendMap, config: &ControllerConfig) -> Self {
        Self {
            forwarding_rules: config.expected_forwarding_rules,
            backend_services: config.expected_backend_services,
            backend_groups: desired.backend_names(),
            healthy_groups: if config.check_endpoint_health {
                desired.gated_backend_names()
            } else {
                BTreeSet::new()
            },
            endpoints_per_group: config.expected_endpoints_per_group,
            ignored_groups: BTreeSet::new(),
        }
    }

    /// Tolerate `names` in observations, typically groups awaiting garbage collection
    pub fn ignoring(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.ignored_groups.extend(names);
        self
    }

    /// First mismatch between the expectation and `observed`, `None` when converged
    pub fn mismatch(&self, observed: &TopologyObservation) -> Option<String> {
        if let Some(want) = self.forwarding_rules {
            if observed.forwarding_rules != want {
                return Some(format!(
                    "got {} forwarding rules, want {}",
                    observed.forwarding_rules, want
                ));
            }
        }

        if let Some(want) = self.backend_services {
            if observed.backend_services != want {
                return Some(format!(
                    "got {} backend services, want {}",
                    observed.backend_services, want
                ));
            }
        }

        let relevant: BTreeSet<&String> = observed
            .backend_groups
            .keys()
            .filter(|name| !self.ignored_groups.contains(*name))
            .collect();
        if relevant.len() != self.backend_groups.len() {
            return Some(format!(
                "got {} backend groups, want {}",
                relevant.len(),
                self.backend_groups.len()
            ));
        }

        for name in &self.backend_groups {
            let group = match observed.backend_groups.get(name) {
                Some(group) => group,
                None => return Some(format!("backend group {} not found", name)),
            };

            if let Some(want) = self.endpoints_per_group {
                if group.endpoints.len() != want {
                    return Some(format!(
                        "backend group {} has {} endpoints, want {}",
                        name,
                        group.endpoints.len(),
                        want
                    ));
                }
            }

            if self.healthy_groups.contains(name) {
                if let Some(unhealthy) = group.endpoints.iter().find_map(|e| e.health_mismatch()) {
                    return Some(format!("backend group {}: {}", name, unhealthy));
                }
            }
        }

        None
    }
}

/// Drives bounded observe-compare-act waits against the cloud provider
pub struct ConvergenceEngine {
    cloud: Arc<dyn CloudObserver>,
    provisioner: Arc<dyn BackendProvisioner>,
    config: ControllerConfig,
    event_tx: broadcast::Sender<ConvergenceEvent>,
}

impl ConvergenceEngine {
    pub fn new(
        cloud: Arc<dyn CloudObserver>,
        provisioner: Arc<dyn BackendProvisioner>,
        config: ControllerConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            cloud,
            provisioner,
            config,
            event_tx,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Subscribe to convergence outcome events
    pub fn subscribe(&self) -> broadcast::Receiver<ConvergenceEvent> {
        self.event_tx.subscribe()
    }

    /// Take one snapshot of everything attributable to `target`
    pub async fn observe(&self, target: &ServiceKey) -> Result<TopologyObservation> {
        let backend_groups = self.cloud.list_backend_groups(target).await?;
        let forwarding_rules = self.cloud.count_forwarding_rules(target).await?;
        let backend_services = self.cloud.count_backend_services(target).await?;
        Ok(TopologyObservation {
            forwarding_rules,
            backend_services,
            backend_groups,
        })
    }

    /// Wait until the observed topology matches `desired`.
    ///
    /// Every attempt re-applies the desired backend group references before
    /// observing; that write is idempotent and the only one the wait makes.
    /// Groups in `awaiting_gc` are tolerated in observations.
    pub async fn await_provisioned(
        &self,
        target: &ServiceKey,
        desired: &PortToBackendMap,
        awaiting_gc: &BTreeSet<String>,
        token: &CancellationToken,
    ) -> Result<TopologyObservation> {
        let expectation = TopologyExpectation::from_desired(desired, &self.config)
            .ignoring(awaiting_gc.iter().cloned());
        let provisioner = &self.provisioner;
        let expectation = &expectation;

        self.wait(
            target,
            ConvergenceOperation::Provision,
            &self.config.provision,
            token,
            || async move {
                if let Err(e) = provisioner.ensure_backend_groups(target, desired).await {
                    debug!(service = %target, error = %e, "Corrective action failed");
                    return Check::Pending(format!("corrective action failed: {}", e));
                }
                match self.observe(target).await {
                    Ok(observed) => match expectation.mismatch(&observed) {
                        None => Check::Done(observed),
                        Some(mismatch) => Check::Pending(mismatch),
                    },
                    Err(e) => {
                        debug!(service = %target, error = %e, "Observation failed");
                        Check::Pending(format!("observation failed: {}", e))
                    }
                }
            },
        )
        .await
    }

    /// Wait until nothing attributable to `target` remains
    pub async fn await_teardown(
        &self,
        target: &ServiceKey,
        token: &CancellationToken,
    ) -> Result<()> {
        let provisioner = &self.provisioner;

        self.wait(
            target,
            ConvergenceOperation::Teardown,
            &self.config.teardown,
            token,
            || async move {
                if let Err(e) = provisioner.release_target(target).await {
                    debug!(service = %target, error = %e, "Release failed");
                    return Check::Pending(format!("release failed: {}", e));
                }
                match self.observe(target).await {
                    Ok(observed) if observed.is_empty() => Check::Done(()),
                    Ok(observed) => Check::Pending(format!(
                        "{} backend groups, {} forwarding rules, {} backend services remain",
                        observed.backend_groups.len(),
                        observed.forwarding_rules,
                        observed.backend_services
                    )),
                    Err(e) => {
                        debug!(service = %target, error = %e, "Observation failed");
                        Check::Pending(format!("observation failed: {}", e))
                    }
                }
            },
        )
        .await
    }

    /// Wait until the provider has deleted every group in `names`.
    ///
    /// The groups must already be dereferenced; this only verifies.
    pub async fn await_backend_groups_deleted(
        &self,
        target: &ServiceKey,
        names: &BTreeSet<String>,
        token: &CancellationToken,
    ) -> Result<()> {
        let cloud = &self.cloud;

        self.wait(
            target,
            ConvergenceOperation::GarbageCollection,
            &self.config.garbage_collection,
            token,
            || async move {
                match cloud.list_backend_groups(target).await {
                    Ok(groups) => {
                        let remaining: Vec<&String> =
                            names.iter().filter(|n| groups.contains_key(*n)).collect();
                        if remaining.is_empty() {
                            Check::Done(())
                        } else {
                            Check::Pending(format!("backend groups still present: {:?}", remaining))
                        }
                    }
                    Err(e) => {
                        debug!(service = %target, error = %e, "Observation failed");
                        Check::Pending(format!("observation failed: {}", e))
                    }
                }
            },
        )
        .await
    }

    /// Run one wait, publish its outcome event and map failures to controller errors
    async fn wait<T, F, Fut>(
        &self,
        target: &ServiceKey,
        operation: ConvergenceOperation,
        poll: &PollConfig,
        token: &CancellationToken,
        check: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Check<T>>,
    {
        debug!(service = %target, %operation, timeout_secs = poll.timeout.as_secs(), "Awaiting convergence");

        match poll_until(poll, token, check).await {
            Ok(Polled {
                value,
                attempts,
                last_mismatch,
            }) => {
                info!(service = %target, %operation, attempts, "Converged");
                self.publish(ConvergenceEvent::converged(
                    target.clone(),
                    operation,
                    last_mismatch,
                    attempts,
                ));
                Ok(value)
            }
            Err(PollError::TimedOut {
                last_mismatch,
                attempts,
            }) => {
                let mismatch = last_mismatch.clone().unwrap_or_default();
                warn!(service = %target, %operation, attempts, %mismatch, "Convergence timed out");
                self.publish(ConvergenceEvent::timed_out(
                    target.clone(),
                    operation,
                    last_mismatch,
                    attempts,
                ));
                Err(match operation {
                    ConvergenceOperation::Provision => ControllerError::convergence_timeout(
                        operation.to_string(),
                        target.to_string(),
                        poll.timeout.as_secs(),
                        mismatch,
                    ),
                    ConvergenceOperation::Teardown | ConvergenceOperation::GarbageCollection => {
                        ControllerError::deletion_timeout(
                            target.to_string(),
                            poll.timeout.as_secs(),
                            mismatch,
                        )
                    }
                })
            }
            Err(PollError::Cancelled {
                last_mismatch,
                attempts,
            }) => {
                info!(service = %target, %operation, attempts, "Convergence wait cancelled");
                self.publish(ConvergenceEvent::cancelled(
                    target.clone(),
                    operation,
                    last_mismatch,
                    attempts,
                ));
                Err(ControllerError::cancelled(
                    operation.to_string(),
                    target.to_string(),
                ))
            }
        }
    }

    fn publish(&self, event: ConvergenceEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCloud;
    use crate::types::{BackendGroupObservation, EndpointObservation, HealthRecord};
    use negsync_core::{BackendNamer, ConvergenceOutcome, PrefixNamer, SvcPortMap};
    use std::time::Duration;

    fn fast_config() -> ControllerConfig {
        let mut config = ControllerConfig::default();
        config.provision = PollConfig::new(Duration::from_secs(1), Duration::from_secs(10));
        config.teardown = PollConfig::new(Duration::from_secs(1), Duration::from_secs(10));
        config.garbage_collection = PollConfig::new(Duration::from_secs(1), Duration::from_secs(10));
        config
    }

    fn group_name(port: i32) -> String {
        PrefixNamer::default().name(&ServiceKey::new("default", "web"), port)
    }

    fn desired(ports: &[(i32, &str)], gate: bool) -> PortToBackendMap {
        let ports: SvcPortMap = ports.iter().map(|(p, t)| (*p, t.to_string())).collect();
        PortToBackendMap::from_ports(
            &ServiceKey::new("default", "web"),
            &ports,
            &PrefixNamer::default(),
            gate,
        )
    }

    fn engine(cloud: &Arc<MockCloud>, config: ControllerConfig) -> ConvergenceEngine {
        ConvergenceEngine::new(cloud.clone(), cloud.clone(), config)
    }

    #[test]
    fn test_expectation_counts_and_health() {
        let map = desired(&[(80, "8080"), (443, "8443")], true);
        let expectation = TopologyExpectation::from_desired(&map, &ControllerConfig::default());
        assert_eq!(expectation.healthy_groups.len(), 2);

        let mut observed = TopologyObservation::default();
        assert_eq!(
            expectation.mismatch(&observed).as_deref(),
            Some("got 0 backend groups, want 2")
        );

        for name in map.backend_names() {
            let mut group = BackendGroupObservation::new(&name);
            group.endpoints.push(
                EndpointObservation::new("10.0.0.1", 8080)
                    .with_healths(vec![HealthRecord::with_state("UNKNOWN")]),
            );
            observed.backend_groups.insert(name, group);
        }
        assert!(expectation.mismatch(&observed).unwrap().contains("UNKNOWN"));

        for group in observed.backend_groups.values_mut() {
            group.endpoints[0].healths = vec![HealthRecord::healthy()];
        }
        assert!(expectation.mismatch(&observed).is_none());
    }

    #[test]
    fn test_expectation_ignores_groups_awaiting_gc() {
        let map = desired(&[(80, "8080")], false);
        let expectation =
            TopologyExpectation::from_desired(&map, &ControllerConfig::default())
                .ignoring(vec![group_name(443)]);

        let mut observed = TopologyObservation::default();
        for name in [group_name(80), group_name(443)] {
            let group = BackendGroupObservation::new(&name);
            observed.backend_groups.insert(name, group);
        }
        assert!(expectation.mismatch(&observed).is_none());

        observed
            .backend_groups
            .insert(group_name(8000), BackendGroupObservation::new(&group_name(8000)));
        assert_eq!(
            expectation.mismatch(&observed).as_deref(),
            Some("got 2 backend groups, want 1")
        );
    }

    #[test]
    fn test_expectation_forwarding_rules_and_endpoints() {
        let map = desired(&[(80, "8080")], false);
        let mut config = ControllerConfig::default();
        config.expected_forwarding_rules = Some(1);
        config.expected_endpoints_per_group = Some(2);
        let expectation = TopologyExpectation::from_desired(&map, &config);

        let mut observed = TopologyObservation::default();
        observed
            .backend_groups
            .insert(group_name(80), BackendGroupObservation::new(&group_name(80)));
        assert_eq!(
            expectation.mismatch(&observed).as_deref(),
            Some("got 0 forwarding rules, want 1")
        );

        observed.forwarding_rules = 1;
        assert!(expectation
            .mismatch(&observed)
            .unwrap()
            .contains("has 0 endpoints, want 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_converges_once_groups_appear() {
        let cloud = Arc::new(MockCloud::new().with_provision_delay(3));
        cloud.set_endpoints_healthy(true);
        let engine = engine(&cloud, fast_config());
        let mut events = engine.subscribe();
        let target = ServiceKey::new("default", "web");
        let map = desired(&[(80, "8080"), (443, "8443")], true);

        let observed = engine
            .await_provisioned(&target, &map, &BTreeSet::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(observed.backend_groups.len(), 2);

        let event = events.recv().await.unwrap();
        assert_eq!(event.operation, ConvergenceOperation::Provision);
        assert_eq!(event.outcome, ConvergenceOutcome::Converged);
        assert!(event.attempts > 1);
        assert!(event.last_mismatch.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_waits_for_endpoint_health() {
        let cloud = Arc::new(MockCloud::new());
        let engine = engine(&cloud, fast_config());
        let target = ServiceKey::new("default", "web");
        let map = desired(&[(80, "8080")], true);
        cloud.add_endpoint(&target, "10.0.0.5", 8080).await;

        let err = engine
            .await_provisioned(&target, &map, &BTreeSet::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ConvergenceTimeout { .. }));
        assert!(err.to_string().contains("0 health records"));

        cloud.set_endpoints_healthy(true);
        assert!(engine
            .await_provisioned(&target, &map, &BTreeSet::new(), &CancellationToken::new())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_swallows_transient_observation_errors() {
        let cloud = Arc::new(MockCloud::new());
        cloud.fail_next_lookups(2);
        let engine = engine(&cloud, fast_config());
        let target = ServiceKey::new("default", "web");
        let map = desired(&[(80, "8080")], false);

        let observed = engine
            .await_provisioned(&target, &map, &BTreeSet::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(observed.backend_groups.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait_reports_cancellation() {
        let cloud = Arc::new(MockCloud::new().with_provision_delay(1000));
        let engine = engine(&cloud, fast_config());
        let mut events = engine.subscribe();
        let target = ServiceKey::new("default", "web");
        let map = desired(&[(80, "8080")], false);

        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            child.cancel();
        });

        let err = engine
            .await_provisioned(&target, &map, &BTreeSet::new(), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());

        let event = events.recv().await.unwrap();
        assert_eq!(event.outcome, ConvergenceOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_waits_for_provider_deletion() {
        let cloud = Arc::new(MockCloud::new().with_deletion_delay(3));
        let engine = engine(&cloud, fast_config());
        let target = ServiceKey::new("default", "web");
        let map = desired(&[(80, "8080"), (443, "8443")], false);

        engine
            .await_provisioned(&target, &map, &BTreeSet::new(), &CancellationToken::new())
            .await
            .unwrap();

        engine
            .await_teardown(&target, &CancellationToken::new())
            .await
            .unwrap();
        assert!(engine.observe(&target).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_timeout_is_deletion_timeout() {
        let cloud = Arc::new(MockCloud::new().with_deletion_delay(1000));
        let engine = engine(&cloud, fast_config());
        let mut events = engine.subscribe();
        let target = ServiceKey::new("default", "web");
        let map = desired(&[(80, "8080"), (443, "8443")], false);

        engine
            .await_provisioned(&target, &map, &BTreeSet::new(), &CancellationToken::new())
            .await
            .unwrap();
        let _ = events.recv().await;

        let kept = desired(&[(80, "8080")], false);
        let gone = map.difference(&kept).backend_names();
        cloud.ensure_backend_groups(&target, &kept).await.unwrap();

        let err = engine
            .await_backend_groups_deleted(&target, &gone, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::DeletionTimeout { .. }));
        assert!(err.to_string().contains(&group_name(443)));

        let event = events.recv().await.unwrap();
        assert_eq!(event.operation, ConvergenceOperation::GarbageCollection);
        assert_eq!(event.outcome, ConvergenceOutcome::TimedOut);
    }
}

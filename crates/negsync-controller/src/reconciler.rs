use crate::convergence::ConvergenceEngine;
use crate::error::{ControllerError, Result};
use crate::readiness::ReadinessReflector;
use crate::traits::WorkloadApi;
use negsync_core::annotations::NEG_STATUS_KEY;
use negsync_core::{
    desired_port_map, BackendNamer, BackendSources, NegStatus, PortToBackendMap, ServiceKey,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-target state carried between passes
#[derive(Debug, Default)]
struct TargetState {
    /// Desired map most recently committed to the provider
    committed: PortToBackendMap,
    /// Dereferenced groups whose deletion has not been confirmed yet
    unconfirmed_gc: BTreeSet<String>,
}

/// Result of one successful reconciliation pass
#[derive(Debug)]
pub struct PassOutcome {
    pub target: ServiceKey,
    /// Canonical map committed by this pass
    pub desired: PortToBackendMap,
    /// Status annotation written for the target
    pub status: NegStatus,
    /// Backend groups dereferenced by this pass
    pub garbage_collected: BTreeSet<String>,
    /// Why garbage collection could not be confirmed; the groups are re-verified by the next pass
    pub gc_failure: Option<ControllerError>,
}

impl PassOutcome {
    pub fn gc_confirmed(&self) -> bool {
        self.gc_failure.is_none()
    }
}

/// Drives reconciliation passes, one at a time per target
pub struct BackendReconciler {
    engine: Arc<ConvergenceEngine>,
    workload: Arc<dyn WorkloadApi>,
    reflector: Arc<ReadinessReflector>,
    namer: Arc<dyn BackendNamer>,
    targets: Mutex<HashMap<ServiceKey, Arc<Mutex<TargetState>>>>,
}

impl BackendReconciler {
    pub fn new(
        engine: Arc<ConvergenceEngine>,
        workload: Arc<dyn WorkloadApi>,
        reflector: Arc<ReadinessReflector>,
        namer: Arc<dyn BackendNamer>,
    ) -> Self {
        Self {
            engine,
            workload,
            reflector,
            namer,
            targets: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &Arc<ConvergenceEngine> {
        &self.engine
    }

    pub fn reflector(&self) -> &Arc<ReadinessReflector> {
        &self.reflector
    }

    async fn target_state(&self, target: &ServiceKey) -> Arc<Mutex<TargetState>> {
        let mut targets = self.targets.lock().await;
        targets.entry(target.clone()).or_default().clone()
    }

    /// Desired map most recently committed for `target`
    pub async fn committed(&self, target: &ServiceKey) -> PortToBackendMap {
        let state = self.target_state(target).await;
        let state = state.lock().await;
        state.committed.clone()
    }

    /// Reconcile `target` from its configuration sources
    pub async fn reconcile(
        &self,
        target: &ServiceKey,
        sources: &BackendSources,
        token: &CancellationToken,
    ) -> Result<PassOutcome> {
        let namer = self.namer.as_ref();
        self.run_pass(target, || Ok(desired_port_map(target, sources, namer)?), token)
            .await
    }

    /// Reconcile `target` from prebuilt per-feature contributions, merged in order
    pub async fn reconcile_maps(
        &self,
        target: &ServiceKey,
        contributions: &[PortToBackendMap],
        token: &CancellationToken,
    ) -> Result<PassOutcome> {
        self.run_pass(
            target,
            || {
                let mut desired = PortToBackendMap::new();
                for contribution in contributions {
                    desired.merge(contribution)?;
                }
                Ok(desired)
            },
            token,
        )
        .await
    }

    async fn run_pass<F>(
        &self,
        target: &ServiceKey,
        build: F,
        token: &CancellationToken,
    ) -> Result<PassOutcome>
    where
        F: FnOnce() -> Result<PortToBackendMap>,
    {
        let state = self.target_state(target).await;
        // Passes for one target never overlap
        let mut state = state.lock().await;

        let desired = match build() {
            Ok(desired) => desired,
            Err(e) => {
                error!(service = %target, error = %e, "Failed to build desired backend groups; pass aborted");
                return Err(e);
            }
        };

        let garbage = self.garbage_set(target, &state.committed, &state.unconfirmed_gc, &desired);
        debug!(
            service = %target,
            desired = desired.len(),
            garbage = garbage.len(),
            "Committing desired backend groups"
        );

        state.committed = desired.clone();
        state.unconfirmed_gc = garbage.clone();
        self.reflector
            .set_watched_groups(target, desired.gated_backend_names())
            .await;

        let observed = self
            .engine
            .await_provisioned(target, &desired, &garbage, token)
            .await?;

        let status = NegStatus::new(&desired, observed.zones());
        let value = status.to_annotation_value()?;
        self.workload
            .set_service_annotation(&target.namespace, &target.name, NEG_STATUS_KEY, &value)
            .await?;
        info!(service = %target, groups = desired.len(), "Backend groups provisioned");

        let gc_failure = if garbage.is_empty() {
            None
        } else {
            match self
                .engine
                .await_backend_groups_deleted(target, &garbage, token)
                .await
            {
                Ok(()) => {
                    info!(service = %target, groups = ?garbage, "Garbage collection confirmed");
                    state.unconfirmed_gc.clear();
                    None
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(service = %target, error = %e, "Garbage collection not confirmed");
                    Some(e)
                }
            }
        };

        Ok(PassOutcome {
            target: target.clone(),
            desired,
            status,
            garbage_collected: garbage,
            gc_failure,
        })
    }

    /// Groups referenced by `previous`, or still unconfirmed from earlier
    /// passes, that `current` no longer carries
    fn garbage_set(
        &self,
        target: &ServiceKey,
        previous: &PortToBackendMap,
        unconfirmed: &BTreeSet<String>,
        current: &PortToBackendMap,
    ) -> BTreeSet<String> {
        let kept = current.backend_names();
        previous
            .difference(current)
            .backend_names()
            .into_iter()
            .chain(unconfirmed.iter().cloned())
            .filter(|name| !kept.contains(name))
            .filter(|name| {
                let ours = self.namer.is_generated(name);
                if !ours {
                    warn!(service = %target, backend_group = %name, "Skipping garbage collection of foreign backend group");
                }
                ours
            })
            .collect()
    }

    /// Release every backend group of `target` and wait until the provider has removed them
    pub async fn teardown(&self, target: &ServiceKey, token: &CancellationToken) -> Result<()> {
        let state = self.target_state(target).await;
        let mut state = state.lock().await;

        self.reflector
            .set_watched_groups(target, BTreeSet::new())
            .await;
        state.committed = PortToBackendMap::new();
        state.unconfirmed_gc.clear();
        self.engine.await_teardown(target, token).await?;

        info!(service = %target, "Teardown complete");
        drop(state);
        self.targets.lock().await.remove(target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, PollConfig, ReflectorConfig};
    use crate::mock::{MockCloud, MockWorkloadApi};
    use crate::traits::{BackendProvisioner, CloudObserver};
    use crate::types::BackendGroups;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
    use negsync_core::annotations::NEG_ANNOTATION_KEY;
    use negsync_core::{BackendKey, ConvergenceOperation, ConvergenceOutcome, PrefixNamer, SvcPortMap};
    use std::time::Duration;

    fn group_name(port: i32) -> String {
        PrefixNamer::default().name(&ServiceKey::new("default", "web"), port)
    }

    fn port_map(target: &ServiceKey, ports: &[i32]) -> PortToBackendMap {
        let ports: SvcPortMap = ports.iter().map(|p| (*p, (p + 8000).to_string())).collect();
        PortToBackendMap::from_ports(target, &ports, &PrefixNamer::default(), false)
    }

    /// Provider wrapper recording the order of provider calls
    struct RecordingCloud {
        inner: Arc<MockCloud>,
        calls: std::sync::Mutex<Vec<&'static str>>,
    }

    impl RecordingCloud {
        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }

        fn take_calls(&self) -> Vec<&'static str> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    #[async_trait]
    impl CloudObserver for RecordingCloud {
        async fn list_backend_groups(&self, target: &ServiceKey) -> Result<BackendGroups> {
            self.record("list");
            self.inner.list_backend_groups(target).await
        }

        async fn count_forwarding_rules(&self, target: &ServiceKey) -> Result<usize> {
            self.record("rules");
            self.inner.count_forwarding_rules(target).await
        }

        async fn count_backend_services(&self, target: &ServiceKey) -> Result<usize> {
            self.record("services");
            self.inner.count_backend_services(target).await
        }
    }

    #[async_trait]
    impl BackendProvisioner for RecordingCloud {
        async fn ensure_backend_groups(
            &self,
            target: &ServiceKey,
            desired: &PortToBackendMap,
        ) -> Result<()> {
            self.record("ensure");
            self.inner.ensure_backend_groups(target, desired).await
        }

        async fn release_target(&self, target: &ServiceKey) -> Result<()> {
            self.record("release");
            self.inner.release_target(target).await
        }
    }

    struct Fixture {
        cloud: Arc<MockCloud>,
        workload: Arc<MockWorkloadApi>,
        reconciler: BackendReconciler,
    }

    fn fast_config() -> ControllerConfig {
        ControllerConfig {
            provision: PollConfig::new(Duration::from_secs(1), Duration::from_secs(20)),
            teardown: PollConfig::new(Duration::from_secs(1), Duration::from_secs(20)),
            garbage_collection: PollConfig::new(Duration::from_secs(1), Duration::from_secs(20)),
            ..Default::default()
        }
    }

    fn fixture(cloud: MockCloud, config: ControllerConfig) -> Fixture {
        let cloud = Arc::new(cloud);
        let workload = Arc::new(MockWorkloadApi::new());
        let engine = Arc::new(ConvergenceEngine::new(cloud.clone(), cloud.clone(), config));
        let reflector = Arc::new(ReadinessReflector::new(
            cloud.clone(),
            workload.clone(),
            ReflectorConfig::default(),
        ));
        let reconciler = BackendReconciler::new(
            engine,
            workload.clone(),
            reflector,
            Arc::new(PrefixNamer::default()),
        );
        Fixture {
            cloud,
            workload,
            reconciler,
        }
    }

    fn service(name: &str) -> Service {
        let mut svc = Service::default();
        svc.metadata.name = Some(name.to_string());
        svc.metadata.namespace = Some("default".to_string());
        svc.metadata.annotations = Some(
            [(NEG_ANNOTATION_KEY.to_string(), r#"{"ingress":true}"#.to_string())]
                .into_iter()
                .collect(),
        );
        svc.spec = Some(ServiceSpec {
            ports: Some(vec![
                ServicePort {
                    port: 80,
                    target_port: Some(IntOrString::Int(8080)),
                    ..Default::default()
                },
                ServicePort {
                    port: 443,
                    target_port: Some(IntOrString::Int(8443)),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        });
        svc
    }

    fn sources(svc: &Service, ports: &[i32]) -> BackendSources {
        BackendSources {
            service: svc.clone(),
            ingress_ports: ports.iter().copied().collect(),
            destination_rule: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrinking_desired_state_collects_only_removed_group() {
        let f = fixture(
            MockCloud::new().with_provision_delay(1).with_deletion_delay(2),
            fast_config(),
        );
        f.cloud.set_endpoints_healthy(true);
        let target = ServiceKey::new("default", "web");
        f.cloud.add_endpoint(&target, "10.0.0.9", 8080).await;
        let svc = service("web");
        f.workload.add_service(svc.clone()).await;
        let token = CancellationToken::new();

        let first = f
            .reconciler
            .reconcile(&target, &sources(&svc, &[80, 443]), &token)
            .await
            .unwrap();
        assert_eq!(first.desired.len(), 2);
        assert!(first.garbage_collected.is_empty());
        assert_eq!(first.desired.gated_backend_names().len(), 2);
        assert!(first.status.check_ports(["80", "443"]).is_ok());
        assert_eq!(first.status.zones, vec!["zone-a"]);

        let annotation = f
            .workload
            .service_annotation("default", "web", NEG_STATUS_KEY)
            .await
            .unwrap();
        assert_eq!(NegStatus::parse(&annotation).unwrap(), first.status);

        let second = f
            .reconciler
            .reconcile(&target, &sources(&svc, &[80]), &token)
            .await
            .unwrap();

        let removed: Vec<BackendKey> = first.desired.difference(&second.desired).keys().cloned().collect();
        assert_eq!(removed, vec![BackendKey::port(443)]);
        assert_eq!(
            second.garbage_collected.iter().cloned().collect::<Vec<_>>(),
            vec![group_name(443)]
        );
        assert!(second.gc_confirmed());
        assert_eq!(
            f.cloud.group_names().await.into_iter().collect::<Vec<_>>(),
            vec![group_name(80)]
        );
        assert_eq!(
            f.reconciler.reflector().watched_groups(&target).await,
            second.desired.gated_backend_names()
        );
        assert!(second.status.check_ports(["80"]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_aborts_before_commit() {
        let f = fixture(MockCloud::new(), fast_config());
        let target = ServiceKey::new("default", "web");
        let namer = PrefixNamer::default();

        let a: SvcPortMap = [(80, "3000".to_string())].into_iter().collect();
        let b: SvcPortMap = [(80, "namedport".to_string()), (8000, "9000".to_string())]
            .into_iter()
            .collect();
        let contributions = vec![
            PortToBackendMap::from_ports(&target, &a, &namer, false),
            PortToBackendMap::from_ports(&target, &b, &namer, false),
        ];

        let err = f
            .reconciler
            .reconcile_maps(&target, &contributions, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(f.reconciler.committed(&target).await.is_empty());
        assert!(f.cloud.referenced(&target).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_timeout_reported_not_fatal() {
        let f = fixture(MockCloud::new().with_deletion_delay(10_000), fast_config());
        let target = ServiceKey::new("default", "web");
        let svc = service("web");
        f.workload.add_service(svc.clone()).await;
        let token = CancellationToken::new();

        f.reconciler
            .reconcile(&target, &sources(&svc, &[80, 443]), &token)
            .await
            .unwrap();
        let outcome = f
            .reconciler
            .reconcile(&target, &sources(&svc, &[80]), &token)
            .await
            .unwrap();

        assert!(!outcome.gc_confirmed());
        assert!(matches!(
            outcome.gc_failure,
            Some(ControllerError::DeletionTimeout { .. })
        ));
        assert_eq!(outcome.desired.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_gc_is_reverified_by_later_passes() {
        // A dereferenced group survives 31 observations; one GC wait makes at most 21
        let f = fixture(MockCloud::new().with_deletion_delay(30), fast_config());
        let target = ServiceKey::new("default", "web");
        f.workload.add_service(service("web")).await;
        let token = CancellationToken::new();

        f.reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80, 443, 9000])], &token)
            .await
            .unwrap();

        let second = f
            .reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80, 9000])], &token)
            .await
            .unwrap();
        assert!(matches!(
            second.gc_failure,
            Some(ControllerError::DeletionTimeout { .. })
        ));
        assert_eq!(second.garbage_collected, BTreeSet::from([group_name(443)]));

        // 443 is carried over even though this pass only drops 9000
        let third = f
            .reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80])], &token)
            .await
            .unwrap();
        assert_eq!(
            third.garbage_collected,
            BTreeSet::from([group_name(443), group_name(9000)])
        );
        assert!(!third.gc_confirmed());
        assert!(!f.cloud.group_names().await.contains(&group_name(443)));

        let fourth = f
            .reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80])], &token)
            .await
            .unwrap();
        assert_eq!(
            fourth.garbage_collected,
            BTreeSet::from([group_name(443), group_name(9000)])
        );
        assert!(fourth.gc_confirmed());
        assert_eq!(f.cloud.group_names().await, BTreeSet::from([group_name(80)]));

        let fifth = f
            .reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80])], &token)
            .await
            .unwrap();
        assert!(fifth.garbage_collected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconfirmed_gc_dropped_when_desired_again() {
        let f = fixture(MockCloud::new().with_deletion_delay(10_000), fast_config());
        let target = ServiceKey::new("default", "web");
        f.workload.add_service(service("web")).await;
        let token = CancellationToken::new();

        f.reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80, 443])], &token)
            .await
            .unwrap();
        let shrink = f
            .reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80])], &token)
            .await
            .unwrap();
        assert!(!shrink.gc_confirmed());

        let grow = f
            .reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80, 443])], &token)
            .await
            .unwrap();
        assert!(grow.garbage_collected.is_empty());
        assert!(grow.gc_confirmed());
        assert!(f.cloud.referenced(&target).await.contains(&group_name(443)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_timeout_keeps_garbage_for_next_pass() {
        let f = fixture(MockCloud::new().with_deletion_delay(3), fast_config());
        let target = ServiceKey::new("default", "web");
        f.workload.add_service(service("web")).await;
        let token = CancellationToken::new();

        f.reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80, 443])], &token)
            .await
            .unwrap();

        // Every lookup of the shrinking pass fails, so provisioning never converges
        f.cloud.fail_next_lookups(1_000);
        let err = f
            .reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80])], &token)
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::ConvergenceTimeout { .. }));
        f.cloud.fail_next_lookups(0);

        let retry = f
            .reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80])], &token)
            .await
            .unwrap();
        assert_eq!(retry.garbage_collected, BTreeSet::from([group_name(443)]));
        assert!(retry.gc_confirmed());
        assert_eq!(f.cloud.group_names().await, BTreeSet::from([group_name(80)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_completes_before_gc_verification() {
        let inner = Arc::new(
            MockCloud::new()
                .with_provision_delay(2)
                .with_deletion_delay(4),
        );
        let cloud = Arc::new(RecordingCloud {
            inner: inner.clone(),
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let workload = Arc::new(MockWorkloadApi::new());
        let engine = Arc::new(ConvergenceEngine::new(
            cloud.clone(),
            cloud.clone(),
            fast_config(),
        ));
        let reflector = Arc::new(ReadinessReflector::new(
            inner.clone(),
            workload.clone(),
            ReflectorConfig::default(),
        ));
        let reconciler = BackendReconciler::new(
            engine.clone(),
            workload.clone(),
            reflector,
            Arc::new(PrefixNamer::default()),
        );
        let target = ServiceKey::new("default", "web");
        workload.add_service(service("web")).await;
        let token = CancellationToken::new();

        reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80, 443])], &token)
            .await
            .unwrap();
        cloud.take_calls();

        let mut events = engine.subscribe();
        let outcome = reconciler
            .reconcile_maps(&target, &[port_map(&target, &[80, 8080])], &token)
            .await
            .unwrap();
        assert!(outcome.gc_confirmed());

        let first = events.recv().await.unwrap();
        assert_eq!(first.operation, ConvergenceOperation::Provision);
        assert_eq!(first.outcome, ConvergenceOutcome::Converged);
        assert!(first.attempts > 1);
        let second = events.recv().await.unwrap();
        assert_eq!(second.operation, ConvergenceOperation::GarbageCollection);
        assert_eq!(second.outcome, ConvergenceOutcome::Converged);

        // Once the last corrective write has been observed, only GC lookups follow
        let calls = cloud.take_calls();
        let last_ensure = calls.iter().rposition(|c| *c == "ensure").unwrap();
        let tail = &calls[last_ensure + 1..];
        assert_eq!(&tail[..3], &["list", "rules", "services"]);
        assert!(tail.len() > 3);
        assert!(tail[3..].iter().all(|c| *c == "list"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_names_are_not_collected() {
        let f = fixture(MockCloud::new(), fast_config());
        let target = ServiceKey::new("default", "web");
        let namer = PrefixNamer::new("other");
        let ports: SvcPortMap = [(80, "8080".to_string())].into_iter().collect();
        let foreign = PortToBackendMap::from_ports(&target, &ports, &namer, false);
        f.workload.add_service(service("web")).await;
        let token = CancellationToken::new();

        f.reconciler
            .reconcile_maps(&target, &[foreign], &token)
            .await
            .unwrap();
        let outcome = f
            .reconciler
            .reconcile_maps(&target, &[], &token)
            .await
            .unwrap();
        assert!(outcome.garbage_collected.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_pass_surfaces_cancellation() {
        let f = fixture(MockCloud::new().with_provision_delay(10_000), fast_config());
        let target = ServiceKey::new("default", "web");
        let svc = service("web");
        f.workload.add_service(svc.clone()).await;

        let token = CancellationToken::new();
        token.cancel();
        let err = f
            .reconciler
            .reconcile(&target, &sources(&svc, &[80]), &token)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_targets_reconcile_concurrently() {
        let f = fixture(MockCloud::new().with_provision_delay(2), fast_config());
        let web = ServiceKey::new("default", "web");
        let api = ServiceKey::new("default", "api");
        let web_svc = service("web");
        let api_svc = service("api");
        f.workload.add_service(web_svc.clone()).await;
        f.workload.add_service(api_svc.clone()).await;
        let token = CancellationToken::new();

        let web_sources = sources(&web_svc, &[80]);
        let api_sources = sources(&api_svc, &[80, 443]);
        let (a, b) = tokio::join!(
            f.reconciler.reconcile(&web, &web_sources, &token),
            f.reconciler.reconcile(&api, &api_sources, &token),
        );
        assert_eq!(a.unwrap().desired.len(), 1);
        assert_eq!(b.unwrap().desired.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_releases_everything() {
        let f = fixture(MockCloud::new().with_deletion_delay(3), fast_config());
        let target = ServiceKey::new("default", "web");
        let svc = service("web");
        f.workload.add_service(svc.clone()).await;
        let token = CancellationToken::new();

        f.reconciler
            .reconcile(&target, &sources(&svc, &[80, 443]), &token)
            .await
            .unwrap();
        f.reconciler.teardown(&target, &token).await.unwrap();

        assert!(f.cloud.group_names().await.is_empty());
        assert!(f.reconciler.committed(&target).await.is_empty());
        assert!(f.reconciler.reflector().watched_groups(&target).await.is_empty());
    }
}

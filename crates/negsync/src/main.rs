mod plan;

use clap::{Parser, Subcommand};
use futures_util::future::join_all;
use k8s_openapi::api::core::v1::{Pod, PodReadinessGate, PodSpec, PodStatus};
use negsync_controller::{
    BackendReconciler, ControllerConfig, ConvergenceEngine, MockCloud, MockWorkloadApi,
    ReadinessReflector,
};
use negsync_core::annotations::NEG_READINESS_GATE;
use negsync_core::PrefixNamer;
use plan::{PlanFile, PlanPod};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "negsync", about = "Load-balancer backend group reconciliation")]
struct Cli {
    /// Controller configuration file (YAML)
    #[arg(long, global = true, env = "NEGSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge every service's configuration sources and print the canonical topology
    Plan {
        /// Plan file listing services and their sources
        #[arg(long)]
        file: PathBuf,
    },
    /// Reconcile every service in a plan file concurrently against an in-memory cloud
    Simulate {
        /// Plan file listing services and their sources
        #[arg(long)]
        file: PathBuf,
        /// Observations before a new backend group becomes visible
        #[arg(long, default_value_t = 2)]
        provision_delay: u32,
        /// Observations before an unreferenced backend group is deleted
        #[arg(long, default_value_t = 2)]
        deletion_delay: u32,
        /// Override every polling interval, in milliseconds
        #[arg(long, default_value_t = 200)]
        poll_interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Plan { file } => run_plan(&file, &config),
        Commands::Simulate {
            file,
            provision_delay,
            deletion_delay,
            poll_interval_ms,
        } => {
            run_simulate(
                &file,
                config,
                provision_delay,
                deletion_delay,
                Duration::from_millis(poll_interval_ms),
            )
            .await
        }
    }
}

fn load_config(path: Option<&Path>) -> miette::Result<ControllerConfig> {
    match path {
        Some(path) => {
            info!("Loading controller config from {}", path.display());
            Ok(ControllerConfig::load(path)?)
        }
        None => Ok(ControllerConfig::default()),
    }
}

/// Print the canonical topology of every service in the plan file
fn run_plan(file: &Path, config: &ControllerConfig) -> miette::Result<()> {
    let plan_file = PlanFile::load(file)?;
    let namer = PrefixNamer::new(&config.naming_prefix);
    let reports = plan::plan(&plan_file, &namer)?;
    print!("{}", negsync_core::to_yaml(&reports)?);
    Ok(())
}

fn gated_pod(namespace: &str, spec: &PlanPod) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = Some(spec.name.clone());
    pod.metadata.namespace = Some(namespace.to_string());
    pod.spec = Some(PodSpec {
        readiness_gates: Some(vec![PodReadinessGate {
            condition_type: NEG_READINESS_GATE.to_string(),
        }]),
        ..Default::default()
    });
    pod.status = Some(PodStatus {
        pod_ip: Some(spec.ip.clone()),
        ..Default::default()
    });
    pod
}

/// Run one reconciliation pass per service, all services concurrently
async fn run_simulate(
    file: &Path,
    mut config: ControllerConfig,
    provision_delay: u32,
    deletion_delay: u32,
    poll_interval: Duration,
) -> miette::Result<()> {
    let plan_file = PlanFile::load(file)?;

    for poll in [
        &mut config.provision,
        &mut config.teardown,
        &mut config.garbage_collection,
    ] {
        poll.interval = poll_interval;
    }
    config.readiness.interval = poll_interval;

    let cloud = Arc::new(
        MockCloud::new()
            .with_provision_delay(provision_delay)
            .with_deletion_delay(deletion_delay),
    );
    cloud.set_endpoints_healthy(true);
    let workload = Arc::new(MockWorkloadApi::new());

    let engine = Arc::new(ConvergenceEngine::new(
        cloud.clone(),
        cloud.clone(),
        config.clone(),
    ));
    let reflector = Arc::new(ReadinessReflector::new(
        cloud.clone(),
        workload.clone(),
        config.readiness.clone(),
    ));
    let reconciler = BackendReconciler::new(
        engine.clone(),
        workload.clone(),
        reflector.clone(),
        Arc::new(PrefixNamer::new(&config.naming_prefix)),
    );

    let mut events = engine.subscribe();
    let token = CancellationToken::new();

    // Log convergence events as they arrive
    let event_handle = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            info!(
                service = %event.target,
                operation = %event.operation,
                outcome = ?event.outcome,
                attempts = event.attempts,
                "Convergence event"
            );
        }
    });

    let mut targets = Vec::new();
    for entry in &plan_file.services {
        let target = entry.key()?;
        workload.add_service(entry.service.clone()).await;
        for spec in &entry.pods {
            let pod = gated_pod(&target.namespace, spec);
            workload.add_pod(pod.clone()).await;
            cloud.add_endpoint(&target, &spec.ip, 0).await;
            reflector.track_pod(&target, &pod).await;
        }
        targets.push((target, entry.sources()));
    }

    let reflector_token = token.child_token();
    let reflector_task = reflector.clone();
    let reflector_handle =
        tokio::spawn(async move { reflector_task.run(reflector_token).await });

    let passes = targets
        .iter()
        .map(|(target, sources)| reconciler.reconcile(target, sources, &token));
    let outcomes = join_all(passes).await;

    let mut failures = 0;
    for ((target, _), outcome) in targets.iter().zip(outcomes) {
        match outcome {
            Ok(outcome) => {
                info!(
                    service = %target,
                    backend_groups = outcome.desired.len(),
                    zones = ?outcome.status.zones,
                    "Pass succeeded"
                );
            }
            Err(e) => {
                failures += 1;
                error!(service = %target, error = %e, "Pass failed");
            }
        }
    }

    // Let the reflector observe the converged topology once more
    let summary = reflector.reflect_once().await;
    info!(
        healthy = summary.healthy,
        pending = summary.pending,
        pods_ready = summary.pods_ready,
        "Readiness reflection"
    );

    token.cancel();
    if let Err(e) = reflector_handle
        .await
        .map_err(|e| miette::miette!("reflector task failed: {}", e))?
    {
        warn!("Readiness reflector stopped with error: {}", e);
    }
    drop(reconciler);
    drop(engine);
    let _ = event_handle.await;

    if failures > 0 {
        return Err(miette::miette!("{} of {} passes failed", failures, targets.len()));
    }
    info!("All {} passes converged", targets.len());
    Ok(())
}

pub mod api_client;
pub mod config;
pub mod convergence;
pub mod error;
pub mod mock;
pub mod poll;
pub mod readiness;
pub mod reconciler;
pub mod retry;
pub mod traits;
pub mod types;

// Re-export primary types
pub use config::{ControllerConfig, PollConfig, ReflectorConfig};
pub use error::{ControllerError, Result};
pub use mock::{MockCloud, MockWorkloadApi};
pub use retry::{retry_with_backoff, RetryConfig};
pub use traits::{BackendProvisioner, CloudObserver, WorkloadApi};
pub use types::{
    BackendGroupObservation, BackendGroups, EndpointObservation, HealthRecord,
    TopologyObservation, HEALTHY_STATE,
};

// Re-export convergence, readiness and reconciliation
pub use api_client::ApiClient;
pub use convergence::{ConvergenceEngine, TopologyExpectation};
pub use poll::{poll_until, Check, PollError, Polled};
pub use readiness::{GateState, ReadinessReflector, ReflectionSummary};
pub use reconciler::{BackendReconciler, PassOutcome};

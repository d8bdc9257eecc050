// Diagnostic fields are only read by the derive-generated code
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Controller error type for convergence, readiness and workload API operations
#[derive(Error, Debug, Diagnostic)]
pub enum ControllerError {
    /// Core library error (merge conflicts, annotation parsing)
    #[error(transparent)]
    #[diagnostic(transparent)]
    Core(#[from] negsync_core::NegError),

    /// Cloud observation failed
    #[error("Cloud observation failed for {resource}: {message}")]
    #[diagnostic(
        code(negsync::controller::observation_failed),
        help("Observation errors are usually transient. They are retried within the current polling window")
    )]
    ObservationFailed {
        #[allow(unused)]
        resource: String,
        #[allow(unused)]
        message: String,
    },

    /// Desired and observed state never matched within the window
    #[error("{operation} of {target} did not converge within {timeout_secs}s: {last_mismatch}")]
    #[diagnostic(
        code(negsync::controller::convergence_timeout),
        help("The next reconciliation pass re-attempts from fresh desired state. The last mismatch shows what was still missing")
    )]
    ConvergenceTimeout {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        target: String,
        #[allow(unused)]
        timeout_secs: u64,
        #[allow(unused)]
        last_mismatch: String,
    },

    /// Resources failed to disappear within the window
    #[error("Resources of {target} still present after {timeout_secs}s: {last_mismatch}")]
    #[diagnostic(
        code(negsync::controller::deletion_timeout),
        help("Deletion by the provider is asynchronous. Dereferencing is idempotent, so the next pass re-attempts it")
    )]
    DeletionTimeout {
        #[allow(unused)]
        target: String,
        #[allow(unused)]
        timeout_secs: u64,
        #[allow(unused)]
        last_mismatch: String,
    },

    /// Caller-initiated abort
    #[error("{operation} of {target} was cancelled")]
    #[diagnostic(
        code(negsync::controller::cancelled),
        help("The wait was aborted by its caller before the deadline")
    )]
    Cancelled {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        target: String,
    },

    /// Pod does not exist
    #[error("Pod not found: {namespace}/{name}")]
    #[diagnostic(
        code(negsync::controller::pod_not_found),
        help("The pod may have been deleted. Its readiness tracking is dropped")
    )]
    PodNotFound {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        name: String,
    },

    /// Service does not exist
    #[error("Service not found: {namespace}/{name}")]
    #[diagnostic(
        code(negsync::controller::service_not_found),
        help("Verify the service exists in the namespace")
    )]
    ServiceNotFound {
        #[allow(unused)]
        namespace: String,
        #[allow(unused)]
        name: String,
    },

    /// Workload API request failed
    #[error("Workload API request failed: {message}")]
    #[diagnostic(
        code(negsync::controller::workload_api),
        help("Check that the API server is reachable and the controller has permission to update pods and services")
    )]
    WorkloadApi {
        #[allow(unused)]
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(negsync::controller::invalid_config), help("{suggestion}"))]
    InvalidConfig {
        #[allow(unused)]
        message: String,
        #[allow(unused)]
        suggestion: String,
    },

    /// Internal error
    #[error("Internal controller error: {message}")]
    #[diagnostic(
        code(negsync::controller::internal_error),
        help("This is likely a bug in negsync-controller. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    pub fn observation_failed(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ObservationFailed {
            resource: resource.into(),
            message: message.into(),
        }
    }

    pub fn convergence_timeout(
        operation: impl Into<String>,
        target: impl Into<String>,
        timeout_secs: u64,
        last_mismatch: impl Into<String>,
    ) -> Self {
        Self::ConvergenceTimeout {
            operation: operation.into(),
            target: target.into(),
            timeout_secs,
            last_mismatch: last_mismatch.into(),
        }
    }

    pub fn deletion_timeout(
        target: impl Into<String>,
        timeout_secs: u64,
        last_mismatch: impl Into<String>,
    ) -> Self {
        Self::DeletionTimeout {
            target: target.into(),
            timeout_secs,
            last_mismatch: last_mismatch.into(),
        }
    }

    pub fn cancelled(operation: impl Into<String>, target: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
            target: target.into(),
        }
    }

    pub fn pod_not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::PodNotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn service_not_found(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ServiceNotFound {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn workload_api(message: impl Into<String>) -> Self {
        Self::WorkloadApi {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether the pass failed because configuration sources conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_conflict())
    }

    /// Whether the caller aborted the wait
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Whether a wait gave up at its deadline
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConvergenceTimeout { .. } | Self::DeletionTimeout { .. }
        )
    }
}

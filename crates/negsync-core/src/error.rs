// Allow unused assignments for diagnostic fields - they're used by the macros
#![allow(unused_assignments)]

use miette::Diagnostic;
use thiserror::Error;

/// Core error type for backend map construction and merging
#[derive(Error, Debug, Diagnostic)]
pub enum NegError {
    /// Two configuration sources disagree on the target port of one backend key
    #[error(
        "Conflicting target ports for {key}: '{existing_target_port}' vs '{incoming_target_port}'"
    )]
    #[diagnostic(
        code(negsync::conflict),
        help("Two features expose service port {key} with different target ports. Align the service port definitions (or the mesh destination rule) so every source agrees")
    )]
    Conflict {
        #[allow(unused)]
        key: String,
        #[allow(unused)]
        existing_target_port: String,
        #[allow(unused)]
        incoming_target_port: String,
    },

    /// Same key, same target port, but the generated backend group names differ
    #[error("Backend group name mismatch for {key}: '{existing}' vs '{incoming}'")]
    #[diagnostic(
        code(negsync::name_mismatch),
        help("Backend group names must be generated by a single naming capability. Check that every source uses the same namer")
    )]
    NameMismatch {
        #[allow(unused)]
        key: String,
        #[allow(unused)]
        existing: String,
        #[allow(unused)]
        incoming: String,
    },

    /// Routing subset cannot be used as a backend key
    #[error("Invalid routing subset: {reason}")]
    #[diagnostic(
        code(negsync::invalid_subset),
        help("Every subset of the destination rule needs a non-empty name")
    )]
    InvalidSubset {
        #[allow(unused)]
        reason: String,
    },

    /// A feature requested a port the service does not define
    #[error("Service {service} has no port {port}")]
    #[diagnostic(
        code(negsync::unknown_service_port),
        help("Only ports listed in the service spec can be exposed. Available ports: {available}")
    )]
    UnknownServicePort {
        #[allow(unused)]
        service: String,
        #[allow(unused)]
        port: i32,
        #[allow(unused)]
        available: String,
    },

    /// Annotation value could not be parsed
    #[error("Invalid annotation '{key}': {message}")]
    #[diagnostic(
        code(negsync::invalid_annotation),
        help("The annotation value must be a JSON document, e.g. {{\"ingress\":true,\"exposed_ports\":{{\"80\":{{}}}}}}")
    )]
    InvalidAnnotation {
        #[allow(unused)]
        key: String,
        #[allow(unused)]
        message: String,
    },

    /// Serialization error
    #[error("Serialization error: {message}")]
    #[diagnostic(
        code(negsync::serialization_error),
        help("Ensure the document format is valid JSON or YAML")
    )]
    SerializationError {
        #[allow(unused)]
        message: String,
        #[source]
        #[allow(unused)]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Internal error
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(negsync::internal_error),
        help("This is likely a bug. Please report it with the full error details")
    )]
    InternalError {
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, NegError>;

impl NegError {
    /// Create a Conflict error
    pub fn conflict(
        key: impl Into<String>,
        existing_target_port: impl Into<String>,
        incoming_target_port: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            key: key.into(),
            existing_target_port: existing_target_port.into(),
            incoming_target_port: incoming_target_port.into(),
        }
    }

    /// Create a NameMismatch error
    pub fn name_mismatch(
        key: impl Into<String>,
        existing: impl Into<String>,
        incoming: impl Into<String>,
    ) -> Self {
        Self::NameMismatch {
            key: key.into(),
            existing: existing.into(),
            incoming: incoming.into(),
        }
    }

    /// Create an InvalidSubset error
    pub fn invalid_subset(reason: impl Into<String>) -> Self {
        Self::InvalidSubset {
            reason: reason.into(),
        }
    }

    /// Create an UnknownServicePort error
    pub fn unknown_service_port(
        service: impl Into<String>,
        port: i32,
        available: impl Into<String>,
    ) -> Self {
        Self::UnknownServicePort {
            service: service.into(),
            port,
            available: available.into(),
        }
    }

    /// Create an InvalidAnnotation error
    pub fn invalid_annotation(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidAnnotation {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::SerializationError {
            message: message.into(),
            source,
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether this error is a merge conflict between configuration sources
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::NameMismatch { .. })
    }
}

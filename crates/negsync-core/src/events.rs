use crate::types::ServiceKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which desired-state transition a convergence wait covered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConvergenceOperation {
    Provision,
    Teardown,
    GarbageCollection,
}

impl fmt::Display for ConvergenceOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvergenceOperation::Provision => write!(f, "provision"),
            ConvergenceOperation::Teardown => write!(f, "teardown"),
            ConvergenceOperation::GarbageCollection => write!(f, "garbage-collection"),
        }
    }
}

/// How a convergence wait terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConvergenceOutcome {
    Converged,
    TimedOut,
    Cancelled,
}

/// Event emitted once per convergence wait, consumed by whoever decides to retry the pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergenceEvent {
    pub target: ServiceKey,
    pub operation: ConvergenceOperation,
    pub outcome: ConvergenceOutcome,
    /// Last observed mismatch (empty on success unless earlier attempts mismatched)
    pub last_mismatch: Option<String>,
    pub attempts: u32,
    pub timestamp: DateTime<Utc>,
}

impl ConvergenceEvent {
    fn new(
        target: ServiceKey,
        operation: ConvergenceOperation,
        outcome: ConvergenceOutcome,
        last_mismatch: Option<String>,
        attempts: u32,
    ) -> Self {
        Self {
            target,
            operation,
            outcome,
            last_mismatch,
            attempts,
            timestamp: Utc::now(),
        }
    }

    /// Create a CONVERGED event
    pub fn converged(
        target: ServiceKey,
        operation: ConvergenceOperation,
        last_mismatch: Option<String>,
        attempts: u32,
    ) -> Self {
        Self::new(
            target,
            operation,
            ConvergenceOutcome::Converged,
            last_mismatch,
            attempts,
        )
    }

    /// Create a TIMEDOUT event
    pub fn timed_out(
        target: ServiceKey,
        operation: ConvergenceOperation,
        last_mismatch: Option<String>,
        attempts: u32,
    ) -> Self {
        Self::new(
            target,
            operation,
            ConvergenceOutcome::TimedOut,
            last_mismatch,
            attempts,
        )
    }

    /// Create a CANCELLED event
    pub fn cancelled(
        target: ServiceKey,
        operation: ConvergenceOperation,
        last_mismatch: Option<String>,
        attempts: u32,
    ) -> Self {
        Self::new(
            target,
            operation,
            ConvergenceOutcome::Cancelled,
            last_mismatch,
            attempts,
        )
    }
}

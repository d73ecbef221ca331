//! Error types for workflow orchestration

use std::time::Duration;

use thiserror::Error;

use crate::types::{PlanId, RequestId, StepId, StepStatus};

/// Errors surfaced by the orchestration engine
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// Plan has a cycle, a dangling dependency or a malformed step
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Registry lookup miss
    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    /// Illegal step status move
    #[error("Invalid transition for step {step_id}: {from} -> {to}")]
    InvalidTransition {
        step_id: StepId,
        from: StepStatus,
        to: StepStatus,
    },

    /// Input template could not be rendered
    #[error("Template error: {0}")]
    Template(String),

    /// No such request
    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    /// Plan has not reached a terminal state
    #[error("Result not ready for request {0}")]
    NotReady(RequestId),

    /// Planning rejected the request; nothing was executed
    #[error("Request {0} was rejected: {1}")]
    Rejected(RequestId, String),

    /// The plan was stored but could not be driven to a result
    #[error("Request {0} failed: {1}")]
    RunFailed(RequestId, String),

    /// Request is still running and cannot be replanned
    #[error("Request {0} is still running")]
    StillRunning(RequestId),

    /// Plan not found
    #[error("Plan not found: {0}")]
    PlanNotFound(PlanId),

    /// State store error
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Errors reported by an LLM transport.
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    /// Provider throttled the call
    #[error("Rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    /// No answer within the per-call timeout
    #[error("Invocation timed out after {0:?}")]
    Timeout(Duration),

    /// 5xx-equivalent provider failure
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// Input was malformed or the content was rejected; retrying will not help
    #[error("Permanent invocation error: {0}")]
    Permanent(String),
}

impl InvocationError {
    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// Final failure of an invocation, with the number of calls actually made
#[derive(Debug, Clone, Error)]
#[error("{error} (after {attempts} attempt(s))")]
pub struct InvocationFailure {
    pub error: InvocationError,
    pub attempts: u32,
}

/// Errors from a durable state store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Conditional write lost the race
    #[error("Conflict on step {step_id}: expected {expected}, found {actual}")]
    Conflict {
        step_id: StepId,
        expected: StepStatus,
        actual: StepStatus,
    },

    /// Unknown plan or step
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write would create a duplicate record
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Update breaks the step state machine
    #[error("Rejected transition for step {step_id}: {from} -> {to}")]
    InvalidTransition {
        step_id: StepId,
        from: StepStatus,
        to: StepStatus,
    },

    /// Backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Errors from an event bus
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus has been shut down
    #[error("Event bus is closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(InvocationError::RateLimited { retry_after: None }.is_transient());
        assert!(InvocationError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(InvocationError::Unavailable("503".into()).is_transient());
        assert!(!InvocationError::Permanent("rejected".into()).is_transient());
    }

    #[test]
    fn test_failure_display_includes_attempts() {
        let failure = InvocationFailure {
            error: InvocationError::Unavailable("502".into()),
            attempts: 3,
        };
        assert_eq!(
            failure.to_string(),
            "Provider unavailable: 502 (after 3 attempt(s))"
        );
    }
}

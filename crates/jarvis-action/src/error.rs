//! Error types for the orchestration core.

use crate::plan::PlanStatus;
use crate::state_machine::{ActionState, RequestState};
use crate::types::ActionKind;
use uuid::Uuid;

/// Errors from turning a reasoning response into a plan.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    #[error("Malformed plan: {0}")]
    MalformedPlan(String),
    #[error("Plan contains no valid actions ({})", reasons.join("; "))]
    EmptyPlan { reasons: Vec<String> },
}

/// Errors from loading or parsing the policy rule set.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PolicyError {
    #[error("Policy configuration unavailable: {0}")]
    ConfigUnavailable(String),
    #[error("Invalid policy rule: {0}")]
    InvalidRule(String),
}

/// Per-action execution failures as seen by the executor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Action execution timed out after {0} ms")]
    Timeout(u64),
    #[error("Execution context failed to start: {0}")]
    SandboxStartup(String),
    #[error("Action execution failed: {0}")]
    Failure(String),
    #[error("No adapter registered for action kind: {0}")]
    HandlerMissing(ActionKind),
    #[error("Path outside the allow-list: {0}")]
    PathDenied(String),
    #[error("Network access denied for action kind: {0}")]
    NetworkDenied(ActionKind),
    #[error("Refusing to execute a plan in status {0}")]
    Unvalidated(PlanStatus),
}

impl ExecutionError {
    /// Failure classes that may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecutionError::Timeout(_) | ExecutionError::SandboxStartup(_)
        )
    }
}

/// Errors raised by an individual action adapter.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Action handler failed: {0}")]
    HandlerFailed(String),
    #[error("Payload validation failed: {0}")]
    InvalidPayload(String),
    #[error("Rate limit exceeded for {0}")]
    RateLimited(ActionKind),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ActionError> for ExecutionError {
    fn from(err: ActionError) -> Self {
        ExecutionError::Failure(err.to_string())
    }
}

/// Errors from the audit sink.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("Audit store unavailable: {0}")]
    Unavailable(String),
    #[error("Audit append timed out after {0} ms")]
    Timeout(u64),
    #[error("Audit I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Audit chain broken at line {line}: {detail}")]
    ChainBroken { line: usize, detail: String },
}

/// Errors from the external reasoning service.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReasoningError {
    #[error("Reasoning service timed out after {0} ms")]
    Timeout(u64),
    #[error("Reasoning service unavailable: {0}")]
    Transport(String),
}

impl From<ReasoningError> for PlanError {
    fn from(err: ReasoningError) -> Self {
        PlanError::MalformedPlan(err.to_string())
    }
}

/// Errors from the contextual memory store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error("Memory store unavailable: {0}")]
    Unavailable(String),
}

/// Errors from lifecycle state machines.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StateError {
    #[error("Invalid action transition: {0} -> {1}")]
    InvalidActionTransition(ActionState, ActionState),
    #[error("Invalid request transition: {0} -> {1}")]
    InvalidRequestTransition(RequestState, RequestState),
}

/// Errors from resolving parked confirmations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfirmationError {
    #[error("No pending confirmations for plan: {0}")]
    PlanNotFound(Uuid),
    #[error("Step {index} of plan {plan_id} is not awaiting confirmation")]
    StepNotPending { plan_id: Uuid, index: usize },
    #[error("Confirmation window expired for plan: {0}")]
    Expired(Uuid),
}

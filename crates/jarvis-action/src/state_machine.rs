//! Lifecycle state machines with validated transitions.
//!
//! Per action:
//! Pending -> Running -> Succeeded/Failed/TimedOut
//! Pending -> Skipped
//!
//! Per request:
//! RECEIVED -> PLANNED -> VALIDATED -> EXECUTING -> COMPLETED/FAILED/PARTIAL
//! VALIDATED -> REJECTED
//! RECEIVED/PLANNED -> FAILED (planning failed)

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StateError;
use crate::plan::{ExecutionStatus, PlanStatus};

/// Execution state of a single action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Pending,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl ActionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ActionState::Pending | ActionState::Running)
    }
}

impl From<ExecutionStatus> for ActionState {
    fn from(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Succeeded => ActionState::Succeeded,
            ExecutionStatus::Failed => ActionState::Failed,
            ExecutionStatus::TimedOut => ActionState::TimedOut,
            ExecutionStatus::Skipped => ActionState::Skipped,
        }
    }
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionState::Pending => write!(f, "pending"),
            ActionState::Running => write!(f, "running"),
            ActionState::Succeeded => write!(f, "succeeded"),
            ActionState::Failed => write!(f, "failed"),
            ActionState::TimedOut => write!(f, "timed_out"),
            ActionState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Pipeline state of one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestState {
    Received,
    Planned,
    Validated,
    Executing,
    Completed,
    Failed,
    Partial,
    Rejected,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::Failed
                | RequestState::Partial
                | RequestState::Rejected
        )
    }

    /// Request state corresponding to a terminal plan status.
    pub fn from_plan_status(status: PlanStatus) -> Option<Self> {
        match status {
            PlanStatus::Completed => Some(RequestState::Completed),
            PlanStatus::Failed => Some(RequestState::Failed),
            PlanStatus::Partial => Some(RequestState::Partial),
            PlanStatus::Rejected => Some(RequestState::Rejected),
            PlanStatus::Draft | PlanStatus::Validated | PlanStatus::Executing => None,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestState::Received => write!(f, "RECEIVED"),
            RequestState::Planned => write!(f, "PLANNED"),
            RequestState::Validated => write!(f, "VALIDATED"),
            RequestState::Executing => write!(f, "EXECUTING"),
            RequestState::Completed => write!(f, "COMPLETED"),
            RequestState::Failed => write!(f, "FAILED"),
            RequestState::Partial => write!(f, "PARTIAL"),
            RequestState::Rejected => write!(f, "REJECTED"),
        }
    }
}

/// Validate an action state transition.
pub fn validate_action_transition(from: ActionState, to: ActionState) -> Result<(), StateError> {
    let valid = matches!(
        (from, to),
        (ActionState::Pending, ActionState::Running)
            | (ActionState::Pending, ActionState::Skipped)
            | (ActionState::Running, ActionState::Succeeded)
            | (ActionState::Running, ActionState::Failed)
            | (ActionState::Running, ActionState::TimedOut)
    );

    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidActionTransition(from, to))
    }
}

/// Validate a request state transition.
///
/// REJECTED is reachable only from VALIDATED; the executor is never entered
/// before validation.
pub fn validate_request_transition(
    from: RequestState,
    to: RequestState,
) -> Result<(), StateError> {
    let valid = matches!(
        (from, to),
        (RequestState::Received, RequestState::Planned)
            | (RequestState::Received, RequestState::Failed)
            | (RequestState::Planned, RequestState::Validated)
            | (RequestState::Planned, RequestState::Failed)
            | (RequestState::Validated, RequestState::Executing)
            | (RequestState::Validated, RequestState::Rejected)
            | (RequestState::Executing, RequestState::Completed)
            | (RequestState::Executing, RequestState::Failed)
            | (RequestState::Executing, RequestState::Partial)
    );

    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidRequestTransition(from, to))
    }
}

/// Tracks one request through the pipeline, rejecting illegal moves.
#[derive(Debug, Clone)]
pub struct RequestLifecycle {
    state: RequestState,
    history: Vec<RequestState>,
}

impl RequestLifecycle {
    pub fn new() -> Self {
        Self {
            state: RequestState::Received,
            history: vec![RequestState::Received],
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn history(&self) -> &[RequestState] {
        &self.history
    }

    pub fn advance(&mut self, to: RequestState) -> Result<(), StateError> {
        validate_request_transition(self.state, to)?;
        self.state = to;
        self.history.push(to);
        Ok(())
    }
}

impl Default for RequestLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

//! Orchestration core for Jarvis.
//!
//! Turns a free-form intent into a plan of typed actions, validates every
//! step against a declarative safety policy, executes the approved subset in
//! resource-bounded execution contexts and records an audit trail of each
//! decision and outcome.

pub mod audit;
pub mod confirmation;
pub mod controller;
pub mod error;
pub mod executor;
pub mod handler;
pub mod memory;
pub mod plan;
pub mod planner;
pub mod policy;
pub mod sandbox;
pub mod state_machine;
pub mod types;

pub use audit::{
    AuditEvent, AuditHealth, AuditRecord, AuditRecorder, AuditSink, JsonlAuditSink,
    MemoryAuditSink,
};
pub use confirmation::{ConfirmationGate, NotificationRateLimiter};
pub use controller::{ActionReport, Controller, PipelineResponse};
pub use error::{
    ActionError, AuditError, ConfirmationError, ExecutionError, MemoryError, PlanError,
    PolicyError, ReasoningError, StateError,
};
pub use executor::ActionExecutor;
pub use handler::{ActionHandler, ActionRegistry, ExecutionContext};
pub use memory::{ContextSnippet, InMemoryMemoryStore, MemoryRecord, MemoryStore};
pub use plan::{
    Decision, ExecutionResult, ExecutionStatus, Plan, PlanStatus, PlanStep, PlanningIssue,
    SkipReason, Verdict, VerdictReason,
};
pub use planner::{
    HttpReasoningService, PlanGenerator, ReasoningRequest, ReasoningResponse, ReasoningService,
};
pub use policy::{Evaluation, PolicyEngine, ReloadWatcher, RuleSet, RuleSource};
pub use sandbox::{ResourceLimits, Sandbox, SandboxHandle, TaskSandbox};
pub use state_machine::{ActionState, RequestLifecycle, RequestState};
pub use tokio_util::sync::CancellationToken;
pub use types::{Action, ActionKind, Arguments, IntentSource, RequestContext, RiskTier};

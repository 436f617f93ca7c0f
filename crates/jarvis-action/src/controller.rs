//! Orchestration controller.
//!
//! Drives each request through plan generation, policy evaluation and
//! execution, recording every decision and outcome in the audit trail:
//!
//! RECEIVED -> PLANNED -> VALIDATED -> EXECUTING -> COMPLETED/FAILED/PARTIAL
//!
//! A plan with no runnable step goes from VALIDATED straight to REJECTED and
//! the executor is never called. The caller always gets a [`PipelineResponse`]
//! listing every step's verdict, result and reason.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use jarvis_core::config::PolicyConfig;

use crate::audit::{AuditRecord, AuditRecorder};
use crate::confirmation::ConfirmationGate;
use crate::error::ConfirmationError;
use crate::executor::{withheld, ActionExecutor};
use crate::memory::{MemoryRecord, MemoryStore};
use crate::plan::{
    ExecutionResult, ExecutionStatus, Plan, PlanStatus, PlanStep, SkipReason, Verdict,
};
use crate::planner::PlanGenerator;
use crate::policy::PolicyEngine;
use crate::state_machine::{RequestLifecycle, RequestState};
use crate::types::{ActionKind, RequestContext};

// =============================================================================
// Response
// =============================================================================

/// Outcome of one step as reported to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub index: usize,
    pub label: String,
    pub kind: Option<ActionKind>,
    pub description: String,
    pub verdict: Option<Verdict>,
    pub result: ExecutionResult,
    /// Why the step ended the way it did.
    pub reason: String,
}

/// Structured result of one pass through the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResponse {
    pub request_id: Uuid,
    pub plan_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_plan_id: Option<Uuid>,
    pub intent_summary: Option<String>,
    pub state: RequestState,
    pub plan_status: Option<PlanStatus>,
    pub actions: Vec<ActionReport>,
    /// Steps parked for confirmation via [`Controller::confirm`].
    pub pending_confirmations: Vec<usize>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// At least one audit record for this request could not be persisted.
    pub audit_degraded: bool,
}

impl PipelineResponse {
    pub fn succeeded_count(&self) -> usize {
        self.actions.iter().filter(|a| a.result.succeeded()).count()
    }
}

/// Every step fails with the executor's refusal message.
fn refused(plan: &Plan, message: &str) -> Vec<ExecutionResult> {
    plan.steps
        .iter()
        .map(|step| ExecutionResult::failed(step.index, message, 0))
        .collect()
}

fn summary_line(succeeded: usize, total: usize) -> String {
    format!("Executed {}/{} actions successfully.", succeeded, total)
}

fn reason_for(step: &PlanStep, result: &ExecutionResult) -> String {
    let verdict_reason = || match &step.verdict {
        Some(v) if v.detail.is_empty() => v.reason.to_string(),
        Some(v) => format!("{}: {}", v.reason, v.detail),
        None => "not evaluated".to_string(),
    };
    match result.status {
        ExecutionStatus::Succeeded => verdict_reason(),
        ExecutionStatus::Failed | ExecutionStatus::TimedOut => result
            .error
            .clone()
            .unwrap_or_else(|| result.status.to_string()),
        ExecutionStatus::Skipped => match result.skip_reason {
            Some(SkipReason::Rejected) | Some(SkipReason::AwaitingConfirmation) | None => {
                verdict_reason()
            }
            Some(other) => other.to_string(),
        },
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct Controller {
    generator: PlanGenerator,
    policy: Arc<PolicyEngine>,
    executor: Arc<ActionExecutor>,
    audit: Arc<AuditRecorder>,
    gate: Arc<ConfirmationGate>,
    memory: Option<Arc<dyn MemoryStore>>,
    force_dry_run: bool,
    force_sandboxed: bool,
}

impl Controller {
    pub fn new(
        generator: PlanGenerator,
        policy: Arc<PolicyEngine>,
        executor: Arc<ActionExecutor>,
        audit: Arc<AuditRecorder>,
        gate: Arc<ConfirmationGate>,
    ) -> Self {
        Self {
            generator,
            policy,
            executor,
            audit,
            gate,
            memory: None,
            force_dry_run: false,
            force_sandboxed: false,
        }
    }

    /// Write a summary of each finished request back to `memory`.
    pub fn with_memory_write_back(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Apply deployment-wide dry-run and sandbox flags to every request.
    pub fn with_policy_config(mut self, config: &PolicyConfig) -> Self {
        self.force_dry_run = config.dry_run;
        self.force_sandboxed = config.sandboxed;
        self
    }

    pub fn policy(&self) -> &Arc<PolicyEngine> {
        &self.policy
    }

    pub fn executor(&self) -> &Arc<ActionExecutor> {
        &self.executor
    }

    pub fn audit(&self) -> &Arc<AuditRecorder> {
        &self.audit
    }

    pub fn gate(&self) -> &Arc<ConfirmationGate> {
        &self.gate
    }

    pub async fn handle(&self, context: RequestContext) -> PipelineResponse {
        self.handle_with_cancel(context, CancellationToken::new())
            .await
    }

    /// Run one request through the full pipeline.
    ///
    /// Cancelling `cancel` during planning fails the request; during
    /// execution it stops issuance of further steps.
    pub async fn handle_with_cancel(
        &self,
        mut context: RequestContext,
        cancel: CancellationToken,
    ) -> PipelineResponse {
        context.dry_run |= self.force_dry_run;
        context.sandboxed |= self.force_sandboxed;

        let mut lifecycle = RequestLifecycle::new();
        tracing::info!(
            request_id = %context.request_id,
            requester = %context.requester,
            dry_run = context.dry_run,
            "Request received"
        );

        let planned = tokio::select! {
            planned = self.generator.generate(&context) => planned.map_err(|e| e.to_string()),
            _ = cancel.cancelled() => Err("request cancelled during planning".to_string()),
        };

        match planned {
            Ok(plan) => self.process(plan, lifecycle, cancel).await,
            Err(error) => {
                tracing::warn!(request_id = %context.request_id, error = %error, "Planning failed");
                advance(&mut lifecycle, RequestState::Failed);
                let audited = self
                    .audit
                    .record(AuditRecord::planning_failed(&context, &error))
                    .await;
                self.audit.close_stream(context.request_id);
                PipelineResponse {
                    request_id: context.request_id,
                    plan_id: None,
                    parent_plan_id: None,
                    intent_summary: None,
                    state: lifecycle.state(),
                    plan_status: None,
                    actions: Vec::new(),
                    pending_confirmations: Vec::new(),
                    summary: summary_line(0, 0),
                    error: Some(error),
                    audit_degraded: !audited,
                }
            }
        }
    }

    /// Approve parked steps of an earlier plan and run the follow-up plan.
    pub async fn confirm(
        &self,
        plan_id: Uuid,
        indices: &[usize],
    ) -> Result<PipelineResponse, ConfirmationError> {
        let follow_up = self.gate.approve(plan_id, indices)?;
        let lifecycle = RequestLifecycle::new();
        Ok(self
            .process(follow_up, lifecycle, CancellationToken::new())
            .await)
    }

    /// Validate, execute and report a drafted plan.
    async fn process(
        &self,
        plan: Plan,
        mut lifecycle: RequestLifecycle,
        cancel: CancellationToken,
    ) -> PipelineResponse {
        let mut audited = true;

        advance(&mut lifecycle, RequestState::Planned);
        audited &= self.audit.record(AuditRecord::plan_created(&plan)).await;

        let mut plan = self.policy.evaluate(plan).plan;
        advance(&mut lifecycle, RequestState::Validated);
        for step in &plan.steps {
            audited &= self
                .audit
                .record(AuditRecord::action_validated(&plan, step))
                .await;
        }

        let mut error = None;
        let results = if plan.is_fully_withheld() {
            tracing::info!(plan_id = %plan.plan_id, "No runnable steps, rejecting plan");
            plan.steps
                .iter()
                .map(|step| {
                    let reason = withheld(&plan, step).unwrap_or(SkipReason::Rejected);
                    ExecutionResult::skipped(step.index, reason)
                })
                .collect()
        } else {
            advance(&mut lifecycle, RequestState::Executing);
            match self.executor.execute(&plan, cancel).await {
                Ok(results) => results,
                Err(e) => {
                    tracing::error!(plan_id = %plan.plan_id, error = %e, "Executor refused plan");
                    let message = e.to_string();
                    let results = refused(&plan, &message);
                    error = Some(message);
                    results
                }
            }
        };

        for result in &results {
            audited &= self
                .audit
                .record(AuditRecord::action_executed(&plan, result))
                .await;
        }

        plan.status = if error.is_some() {
            PlanStatus::Failed
        } else {
            PlanStatus::resolve(&plan, &results)
        };
        if let Some(state) = RequestState::from_plan_status(plan.status) {
            advance(&mut lifecycle, state);
        }

        let pending_confirmations = self.gate.park(&plan, &results);
        let succeeded = results.iter().filter(|r| r.succeeded()).count();
        let summary = summary_line(succeeded, plan.steps.len());

        audited &= self
            .audit
            .record(AuditRecord::plan_finished(&plan, &summary))
            .await;
        self.audit.close_stream(plan.plan_id);

        tracing::info!(
            request_id = %plan.context.request_id,
            plan_id = %plan.plan_id,
            status = %plan.status,
            state = %lifecycle.state(),
            summary = %summary,
            "Request finished"
        );

        self.write_back(&plan, &summary);

        let actions = plan
            .steps
            .iter()
            .zip(results)
            .map(|(step, result)| ActionReport {
                index: step.index,
                label: step.label.clone(),
                kind: step.action.as_ref().map(|a| a.kind),
                description: step
                    .action
                    .as_ref()
                    .map(|a| a.description.clone())
                    .unwrap_or_default(),
                verdict: step.verdict.clone(),
                reason: reason_for(step, &result),
                result,
            })
            .collect();

        PipelineResponse {
            request_id: plan.context.request_id,
            plan_id: Some(plan.plan_id),
            parent_plan_id: plan.parent_plan_id,
            intent_summary: plan.intent_summary.clone(),
            state: lifecycle.state(),
            plan_status: Some(plan.status),
            actions,
            pending_confirmations,
            summary,
            error,
            audit_degraded: !audited,
        }
    }

    /// Fire-and-forget summary write to the memory store.
    fn write_back(&self, plan: &Plan, summary: &str) {
        let Some(memory) = self.memory.clone() else {
            return;
        };
        if plan.context.dry_run {
            return;
        }
        let record = MemoryRecord {
            request_id: plan.context.request_id,
            text: format!("{} => {}", plan.context.intent_text, summary),
            metadata: serde_json::json!({
                "plan_id": plan.plan_id,
                "status": plan.status,
                "requester": plan.context.requester,
            }),
            recorded_at: Utc::now(),
        };
        tokio::spawn(async move {
            if let Err(e) = memory.write(record).await {
                tracing::warn!(error = %e, "Memory write-back failed");
            }
        });
    }
}

fn advance(lifecycle: &mut RequestLifecycle, to: RequestState) {
    if let Err(e) = lifecycle.advance(to) {
        tracing::error!(error = %e, "Request state machine violated");
    }
}

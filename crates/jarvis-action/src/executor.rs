//! Action executor.
//!
//! Runs the approved steps of a validated plan inside execution contexts
//! obtained from a [`Sandbox`], producing exactly one [`ExecutionResult`] per
//! step.
//!
//! Steps are issued in declared order. A step with dependencies is issued
//! only after every dependency has finished; steps without pending
//! dependencies run concurrently, bounded by a semaphore shared by every
//! plan this executor runs.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use jarvis_core::config::ExecutorConfig;

use crate::error::{ExecutionError, StateError};
use crate::handler::ExecutionContext;
use crate::plan::{
    Decision, ExecutionResult, ExecutionStatus, Plan, PlanStatus, PlanStep, SkipReason,
};
use crate::sandbox::{ResourceLimits, Sandbox};
use crate::state_machine::{validate_action_transition, ActionState};
use crate::types::Action;

pub struct ActionExecutor {
    runner: StepRunner,
    max_concurrent: usize,
}

impl ActionExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: &ExecutorConfig, limits: ResourceLimits) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            runner: StepRunner {
                sandbox,
                permits: Arc::new(Semaphore::new(max_concurrent)),
                action_timeout: config.action_timeout(),
                retry_bound: config.retry_bound,
                retry_backoff: config.retry_backoff(),
                limits,
            },
            max_concurrent,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Execution slots not currently held by a running step.
    pub fn available_permits(&self) -> usize {
        self.runner.permits.available_permits()
    }

    /// Execute a validated plan.
    ///
    /// Cancelling `cancel` stops issuance of further steps; steps already
    /// running finish (or time out) and are recorded.
    pub async fn execute(
        &self,
        plan: &Plan,
        cancel: CancellationToken,
    ) -> Result<Vec<ExecutionResult>, ExecutionError> {
        if plan.status != PlanStatus::Validated || !plan.is_fully_validated() {
            return Err(ExecutionError::Unvalidated(plan.status));
        }

        let mut finished: HashMap<usize, ExecutionResult> = HashMap::new();
        let mut running: JoinSet<ExecutionResult> = JoinSet::new();

        for step in &plan.steps {
            if let Some(reason) = withheld(plan, step) {
                finished.insert(step.index, ExecutionResult::skipped(step.index, reason));
                continue;
            }

            // Wait for dependencies still in flight.
            while step
                .depends_on
                .iter()
                .any(|d| !finished.contains_key(d) && *d < step.index)
            {
                match running.join_next().await {
                    Some(Ok(result)) => {
                        finished.insert(result.index, result);
                    }
                    Some(Err(e)) => {
                        tracing::error!(plan_id = %plan.plan_id, error = %e, "Step task failed to join");
                    }
                    None => break,
                }
            }

            let deps_satisfied = step.depends_on.iter().all(|d| {
                *d < step.index && finished.get(d).is_some_and(|r| r.is_satisfied())
            });
            if !deps_satisfied {
                tracing::info!(
                    plan_id = %plan.plan_id,
                    index = step.index,
                    depends_on = ?step.depends_on,
                    "Dependency not satisfied, skipping step"
                );
                finished.insert(
                    step.index,
                    ExecutionResult::skipped(step.index, SkipReason::DependencyNotSatisfied),
                );
                continue;
            }

            if cancel.is_cancelled() {
                finished.insert(
                    step.index,
                    ExecutionResult::skipped(step.index, SkipReason::Cancelled),
                );
                continue;
            }

            let Some(action) = step.action.clone() else {
                finished.insert(step.index, ExecutionResult::skipped(step.index, SkipReason::Rejected));
                continue;
            };
            let ctx = ExecutionContext {
                request_id: plan.context.request_id,
                plan_id: plan.plan_id,
                index: step.index,
                attempt: 0,
                limits: self.runner.limits.clone(),
            };
            let runner = self.runner.clone();
            let token = cancel.clone();
            running.spawn(async move { runner.run(action, ctx, token).await });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(result) => {
                    finished.insert(result.index, result);
                }
                Err(e) => {
                    tracing::error!(plan_id = %plan.plan_id, error = %e, "Step task failed to join");
                }
            }
        }

        let mut results: Vec<ExecutionResult> = plan
            .steps
            .iter()
            .map(|step| {
                finished
                    .remove(&step.index)
                    .unwrap_or_else(|| ExecutionResult::failed(step.index, "step task aborted", 0))
            })
            .collect();
        results.sort_by_key(|r| r.index);

        tracing::info!(
            plan_id = %plan.plan_id,
            steps = results.len(),
            succeeded = results.iter().filter(|r| r.succeeded()).count(),
            "Plan executed"
        );
        Ok(results)
    }
}

/// Skip reason for a step the executor must not run, from its verdict alone.
pub(crate) fn withheld(plan: &Plan, step: &PlanStep) -> Option<SkipReason> {
    let Some(verdict) = &step.verdict else {
        return Some(SkipReason::Rejected);
    };
    if verdict.simulate_only {
        return Some(SkipReason::SimulateOnly);
    }
    match verdict.decision {
        Decision::Approved => None,
        Decision::Rejected => Some(SkipReason::Rejected),
        Decision::NeedsConfirmation if plan.context.is_confirmed(step.index) => None,
        Decision::NeedsConfirmation => Some(SkipReason::AwaitingConfirmation),
    }
}

/// Runs one step to a terminal state. Cloned into each step task.
#[derive(Clone)]
struct StepRunner {
    sandbox: Arc<dyn Sandbox>,
    permits: Arc<Semaphore>,
    action_timeout: Duration,
    retry_bound: u32,
    retry_backoff: Duration,
    limits: ResourceLimits,
}

impl StepRunner {
    async fn run(
        &self,
        action: Action,
        mut ctx: ExecutionContext,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => permit,
            _ = cancel.cancelled() => {
                return ExecutionResult::skipped(ctx.index, SkipReason::Cancelled);
            }
        };
        let Ok(_permit) = permit else {
            return ExecutionResult::skipped(ctx.index, SkipReason::Cancelled);
        };

        let mut state = ActionState::Pending;
        if let Err(e) = advance(&mut state, ActionState::Running) {
            return ExecutionResult::failed(ctx.index, e.to_string(), 0);
        }

        let started_at = Utc::now();
        let max_attempts = if action.idempotent {
            1 + self.retry_bound
        } else {
            1
        };

        let mut outcome = Err(ExecutionError::Failure("not attempted".to_string()));
        let mut attempts = 0;
        while attempts < max_attempts {
            attempts += 1;
            ctx.attempt = attempts;
            outcome = self.attempt(&action, &ctx).await;

            match &outcome {
                Ok(_) => break,
                Err(e) if e.is_transient() && attempts < max_attempts && !cancel.is_cancelled() => {
                    tracing::warn!(
                        index = ctx.index,
                        kind = %action.kind,
                        attempt = attempts,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(self.retry_backoff * attempts).await;
                }
                Err(_) => break,
            }
        }

        let (status, output, error) = match outcome {
            Ok(value) => (ExecutionStatus::Succeeded, Some(value), None),
            Err(e @ ExecutionError::Timeout(_)) => (ExecutionStatus::TimedOut, None, Some(e.to_string())),
            Err(e) => (ExecutionStatus::Failed, None, Some(e.to_string())),
        };
        if let Err(e) = advance(&mut state, ActionState::from(status)) {
            tracing::error!(index = ctx.index, error = %e, "Action state machine violated");
        }

        match &error {
            Some(e) => tracing::warn!(index = ctx.index, kind = %action.kind, status = %status, attempts, error = %e, "Action finished"),
            None => tracing::info!(index = ctx.index, kind = %action.kind, attempts, "Action succeeded"),
        }

        ExecutionResult {
            index: ctx.index,
            status,
            skip_reason: None,
            output,
            error,
            started_at,
            finished_at: Utc::now(),
            attempts,
        }
    }

    /// One start-and-wait cycle under the per-action timeout.
    async fn attempt(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        let handle = match tokio::time::timeout(self.action_timeout, self.sandbox.start(action, ctx)).await {
            Ok(started) => started?,
            Err(_) => {
                return Err(ExecutionError::SandboxStartup(
                    "execution context did not start in time".to_string(),
                ))
            }
        };

        match tokio::time::timeout(self.action_timeout, self.sandbox.wait(&handle)).await {
            Ok(finished) => finished,
            Err(_) => {
                self.sandbox.terminate(&handle).await;
                Err(ExecutionError::Timeout(self.action_timeout.as_millis() as u64))
            }
        }
    }
}

fn advance(state: &mut ActionState, to: ActionState) -> Result<(), StateError> {
    validate_action_transition(*state, to)?;
    *state = to;
    Ok(())
}

//! Plans, verdicts and execution results.
//!
//! A [`Plan`] is created by the plan generator, annotated with one
//! [`Verdict`] per step by the policy engine, and consumed by the executor,
//! which produces one [`ExecutionResult`] per step.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::types::{Action, RequestContext, RiskTier};

// =============================================================================
// Plan
// =============================================================================

/// Why the plan generator marked a step as unusable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "issue")]
pub enum PlanningIssue {
    UnknownKind { label: String },
    MissingArgument { names: Vec<String> },
}

impl fmt::Display for PlanningIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanningIssue::UnknownKind { label } => write!(f, "unknown action kind '{}'", label),
            PlanningIssue::MissingArgument { names } => {
                write!(f, "missing required argument(s): {}", names.join(", "))
            }
        }
    }
}

/// One position in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: usize,
    /// Kind label exactly as the reasoning engine emitted it.
    pub label: String,
    /// `None` only when the label named no known kind.
    pub action: Option<Action>,
    /// Earlier steps that must succeed before this one runs.
    pub depends_on: Vec<usize>,
    pub planning_issue: Option<PlanningIssue>,
    pub verdict: Option<Verdict>,
}

impl PlanStep {
    pub fn new(index: usize, action: Action) -> Self {
        Self {
            index,
            label: action.kind.to_string(),
            action: Some(action),
            depends_on: Vec::new(),
            planning_issue: None,
            verdict: None,
        }
    }

    pub fn after(mut self, dependencies: impl IntoIterator<Item = usize>) -> Self {
        self.depends_on.extend(dependencies);
        self
    }

    /// Whether the executor may run this step given the request's confirmations.
    pub fn is_runnable(&self, confirmed: bool) -> bool {
        match &self.verdict {
            Some(v) if v.simulate_only => false,
            Some(v) => match v.decision {
                Decision::Approved => true,
                Decision::NeedsConfirmation => confirmed,
                Decision::Rejected => false,
            },
            None => false,
        }
    }
}

/// Plan lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Draft,
    Validated,
    Executing,
    Completed,
    Failed,
    Partial,
    Rejected,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Partial | PlanStatus::Rejected
        )
    }

    /// Resolve the terminal status of a plan from its steps and results.
    ///
    /// A step is satisfied when it succeeded or was skipped as simulate-only.
    pub fn resolve(plan: &Plan, results: &[ExecutionResult]) -> PlanStatus {
        let total = plan.steps.len();
        let satisfied = results.iter().filter(|r| r.is_satisfied()).count();

        if total > 0 && satisfied == total {
            PlanStatus::Completed
        } else if satisfied == 0 {
            if plan.is_fully_withheld() {
                PlanStatus::Rejected
            } else {
                PlanStatus::Failed
            }
        } else {
            PlanStatus::Partial
        }
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanStatus::Draft => write!(f, "draft"),
            PlanStatus::Validated => write!(f, "validated"),
            PlanStatus::Executing => write!(f, "executing"),
            PlanStatus::Completed => write!(f, "completed"),
            PlanStatus::Failed => write!(f, "failed"),
            PlanStatus::Partial => write!(f, "partial"),
            PlanStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl PlanStep {
    fn is_simulated(&self) -> bool {
        self.verdict.as_ref().is_some_and(|v| v.simulate_only)
    }
}

/// An ordered sequence of steps derived from one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: Uuid,
    /// Set on follow-up plans built from confirmed steps of an earlier plan.
    pub parent_plan_id: Option<Uuid>,
    pub context: RequestContext,
    pub intent_summary: Option<String>,
    pub steps: Vec<PlanStep>,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(context: RequestContext, steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id: Uuid::new_v4(),
            parent_plan_id: None,
            context,
            intent_summary: None,
            steps,
            status: PlanStatus::Draft,
            created_at: Utc::now(),
        }
    }

    /// Every step carries a verdict.
    pub fn is_fully_validated(&self) -> bool {
        self.steps.iter().all(|s| s.verdict.is_some())
    }

    /// Steps the executor would run for this plan's confirmations.
    pub fn runnable_steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.steps
            .iter()
            .filter(|s| s.is_runnable(self.context.is_confirmed(s.index)))
    }

    /// No step would run or be simulated.
    pub fn is_fully_withheld(&self) -> bool {
        self.steps
            .iter()
            .all(|s| !s.is_runnable(self.context.is_confirmed(s.index)) && !s.is_simulated())
    }

    /// Build an unvalidated follow-up plan from steps confirmed after this
    /// plan finished executing.
    ///
    /// The follow-up holds the confirmed steps plus every unfinished step that
    /// depends on one of them. A step is kept only if each of its
    /// dependencies either succeeded here or is itself kept; dependencies
    /// that already succeeded are dropped. Indices are renumbered and the
    /// confirmations carried over to the new numbering.
    pub fn follow_up(&self, confirmed: &BTreeSet<usize>, succeeded: &BTreeSet<usize>) -> Plan {
        let mut kept: Vec<usize> = Vec::new();
        for step in &self.steps {
            let rejected = step
                .verdict
                .as_ref()
                .is_some_and(|v| v.decision == Decision::Rejected);
            if step.action.is_none() || rejected || succeeded.contains(&step.index) {
                continue;
            }
            let wanted = confirmed.contains(&step.index)
                || step.depends_on.iter().any(|d| kept.contains(d));
            let deps_ok = step
                .depends_on
                .iter()
                .all(|d| succeeded.contains(d) || kept.contains(d));
            if wanted && deps_ok {
                kept.push(step.index);
            }
        }

        let renumber = |old: usize| kept.iter().position(|k| *k == old);
        let steps = kept
            .iter()
            .enumerate()
            .filter_map(|(new_index, old)| self.steps.get(*old).map(|s| (new_index, s)))
            .map(|(new_index, s)| PlanStep {
                index: new_index,
                label: s.label.clone(),
                action: s.action.clone(),
                depends_on: s.depends_on.iter().filter_map(|d| renumber(*d)).collect(),
                planning_issue: None,
                verdict: None,
            })
            .collect();

        let mut context = self.context.clone();
        context.confirmations = confirmed.iter().filter_map(|c| renumber(*c)).collect();

        let mut plan = Plan::new(context, steps);
        plan.parent_plan_id = Some(self.plan_id);
        plan.intent_summary = self.intent_summary.clone();
        plan
    }

    /// Steps still waiting for an explicit confirmation.
    pub fn awaiting_confirmation(&self) -> Vec<usize> {
        self.steps
            .iter()
            .filter(|s| {
                s.verdict
                    .as_ref()
                    .is_some_and(|v| v.decision == Decision::NeedsConfirmation && !v.simulate_only)
                    && !self.context.is_confirmed(s.index)
            })
            .map(|s| s.index)
            .collect()
    }
}

// =============================================================================
// Verdict
// =============================================================================

/// Policy decision for one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    NeedsConfirmation,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Approved => write!(f, "approved"),
            Decision::Rejected => write!(f, "rejected"),
            Decision::NeedsConfirmation => write!(f, "needs_confirmation"),
        }
    }
}

/// Why a verdict was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictReason {
    UnknownKind,
    MissingArgument,
    Blacklisted,
    InvalidArgument,
    FailClosed,
    RiskApproved,
    SandboxedHighRisk,
    ConfirmationRequired,
}

impl fmt::Display for VerdictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VerdictReason::UnknownKind => "unknown-kind",
            VerdictReason::MissingArgument => "missing-argument",
            VerdictReason::Blacklisted => "blacklisted",
            VerdictReason::InvalidArgument => "invalid-argument",
            VerdictReason::FailClosed => "fail-closed",
            VerdictReason::RiskApproved => "risk-approved",
            VerdictReason::SandboxedHighRisk => "sandboxed-high-risk",
            VerdictReason::ConfirmationRequired => "confirmation-required",
        };
        f.write_str(s)
    }
}

/// The policy engine's decision for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Effective decision the executor acts on.
    pub decision: Decision,
    /// Decision of the rule chain before any dry-run override.
    pub evaluated: Decision,
    pub reason: VerdictReason,
    pub detail: String,
    pub rules_fired: Vec<String>,
    pub risk_tier: Option<RiskTier>,
    /// Approved for simulation only; never forwarded to real execution.
    pub simulate_only: bool,
}

impl Verdict {
    pub fn approved(reason: VerdictReason, detail: impl Into<String>) -> Self {
        Self::with_decision(Decision::Approved, reason, detail)
    }

    pub fn rejected(reason: VerdictReason, detail: impl Into<String>) -> Self {
        Self::with_decision(Decision::Rejected, reason, detail)
    }

    pub fn needs_confirmation(reason: VerdictReason, detail: impl Into<String>) -> Self {
        Self::with_decision(Decision::NeedsConfirmation, reason, detail)
    }

    fn with_decision(decision: Decision, reason: VerdictReason, detail: impl Into<String>) -> Self {
        Self {
            decision,
            evaluated: decision,
            reason,
            detail: detail.into(),
            rules_fired: Vec::new(),
            risk_tier: None,
            simulate_only: false,
        }
    }

    pub fn fired(mut self, rule: impl Into<String>) -> Self {
        self.rules_fired.push(rule.into());
        self
    }

    pub fn with_tier(mut self, tier: RiskTier) -> Self {
        self.risk_tier = Some(tier);
        self
    }

    /// Dry-run override: anything not rejected becomes approved, simulate-only.
    pub fn into_simulation(mut self) -> Self {
        if self.decision != Decision::Rejected {
            self.decision = Decision::Approved;
            self.simulate_only = true;
            self.rules_fired.push("dry-run".to_string());
        }
        self
    }
}

// =============================================================================
// Execution results
// =============================================================================

/// Terminal per-step outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    Failed,
    TimedOut,
    Skipped,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Succeeded => write!(f, "succeeded"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::TimedOut => write!(f, "timed_out"),
            ExecutionStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why a step was skipped without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SkipReason {
    Rejected,
    AwaitingConfirmation,
    SimulateOnly,
    DependencyNotSatisfied,
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::Rejected => "rejected",
            SkipReason::AwaitingConfirmation => "awaiting-confirmation",
            SkipReason::SimulateOnly => "simulate-only",
            SkipReason::DependencyNotSatisfied => "dependency-not-satisfied",
            SkipReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-step execution outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub index: usize,
    pub status: ExecutionStatus,
    pub skip_reason: Option<SkipReason>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub attempts: u32,
}

impl ExecutionResult {
    pub fn skipped(index: usize, reason: SkipReason) -> Self {
        let now = Utc::now();
        Self {
            index,
            status: ExecutionStatus::Skipped,
            skip_reason: Some(reason),
            output: None,
            error: None,
            started_at: now,
            finished_at: now,
            attempts: 0,
        }
    }

    pub fn failed(index: usize, error: impl Into<String>, attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            index,
            status: ExecutionStatus::Failed,
            skip_reason: None,
            output: None,
            error: Some(error.into()),
            started_at: now,
            finished_at: now,
            attempts,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    /// Succeeded, or stood in for success during a dry run.
    pub fn is_satisfied(&self) -> bool {
        self.succeeded() || self.skip_reason == Some(SkipReason::SimulateOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, Arguments};

    fn step(index: usize, verdict: Verdict) -> PlanStep {
        let mut args = Arguments::new();
        args.insert("query".to_string(), serde_json::json!("weather"));
        let mut s = PlanStep::new(index, Action::new(ActionKind::WebSearch, args));
        s.verdict = Some(verdict);
        s
    }

    fn result(index: usize, status: ExecutionStatus) -> ExecutionResult {
        let mut r = ExecutionResult::skipped(index, SkipReason::Rejected);
        r.status = status;
        r.skip_reason = None;
        r
    }

    fn plan(steps: Vec<PlanStep>) -> Plan {
        Plan::new(RequestContext::new("test"), steps)
    }

    #[test]
    fn test_resolve_completed() {
        let p = plan(vec![
            step(0, Verdict::approved(VerdictReason::RiskApproved, "")),
            step(1, Verdict::approved(VerdictReason::RiskApproved, "")),
        ]);
        let results = vec![
            result(0, ExecutionStatus::Succeeded),
            result(1, ExecutionStatus::Succeeded),
        ];
        assert_eq!(PlanStatus::resolve(&p, &results), PlanStatus::Completed);
    }

    #[test]
    fn test_resolve_partial_keeps_success() {
        let p = plan(vec![
            step(0, Verdict::approved(VerdictReason::RiskApproved, "")),
            step(1, Verdict::rejected(VerdictReason::Blacklisted, "")),
        ]);
        let results = vec![
            result(0, ExecutionStatus::Succeeded),
            ExecutionResult::skipped(1, SkipReason::Rejected),
        ];
        assert_eq!(PlanStatus::resolve(&p, &results), PlanStatus::Partial);
    }

    #[test]
    fn test_resolve_rejected_when_nothing_runnable() {
        let p = plan(vec![
            step(0, Verdict::rejected(VerdictReason::Blacklisted, "")),
            step(
                1,
                Verdict::needs_confirmation(VerdictReason::ConfirmationRequired, ""),
            ),
        ]);
        let results = vec![
            ExecutionResult::skipped(0, SkipReason::Rejected),
            ExecutionResult::skipped(1, SkipReason::AwaitingConfirmation),
        ];
        assert_eq!(PlanStatus::resolve(&p, &results), PlanStatus::Rejected);
    }

    #[test]
    fn test_resolve_failed_when_runnable_steps_fail() {
        let p = plan(vec![step(
            0,
            Verdict::approved(VerdictReason::RiskApproved, ""),
        )]);
        let results = vec![result(0, ExecutionStatus::TimedOut)];
        assert_eq!(PlanStatus::resolve(&p, &results), PlanStatus::Failed);
    }

    #[test]
    fn test_resolve_dry_run_completes() {
        let p = plan(vec![step(
            0,
            Verdict::approved(VerdictReason::RiskApproved, "").into_simulation(),
        )]);
        let results = vec![ExecutionResult::skipped(0, SkipReason::SimulateOnly)];
        assert_eq!(PlanStatus::resolve(&p, &results), PlanStatus::Completed);
    }

    #[test]
    fn test_simulation_keeps_evaluated_decision() {
        let v = Verdict::needs_confirmation(VerdictReason::ConfirmationRequired, "critical")
            .into_simulation();
        assert_eq!(v.decision, Decision::Approved);
        assert_eq!(v.evaluated, Decision::NeedsConfirmation);
        assert!(v.simulate_only);

        let v = Verdict::rejected(VerdictReason::Blacklisted, "rm").into_simulation();
        assert_eq!(v.decision, Decision::Rejected);
        assert!(!v.simulate_only);
    }

    #[test]
    fn test_is_runnable() {
        let approved = step(0, Verdict::approved(VerdictReason::RiskApproved, ""));
        assert!(approved.is_runnable(false));

        let confirm = step(
            1,
            Verdict::needs_confirmation(VerdictReason::ConfirmationRequired, ""),
        );
        assert!(!confirm.is_runnable(false));
        assert!(confirm.is_runnable(true));

        let simulated = step(
            2,
            Verdict::approved(VerdictReason::RiskApproved, "").into_simulation(),
        );
        assert!(!simulated.is_runnable(true));

        let mut unvalidated = approved.clone();
        unvalidated.verdict = None;
        assert!(!unvalidated.is_runnable(true));
    }

    #[test]
    fn test_awaiting_confirmation_excludes_confirmed() {
        let mut p = plan(vec![
            step(
                0,
                Verdict::needs_confirmation(VerdictReason::ConfirmationRequired, ""),
            ),
            step(
                1,
                Verdict::needs_confirmation(VerdictReason::ConfirmationRequired, ""),
            ),
        ]);
        p.context.confirmations.insert(1);
        assert_eq!(p.awaiting_confirmation(), vec![0]);
        assert_eq!(p.runnable_steps().count(), 1);
    }

    #[test]
    fn test_follow_up_takes_confirmed_steps_and_dependents() {
        let confirm = || Verdict::needs_confirmation(VerdictReason::ConfirmationRequired, "");
        let approve = || Verdict::approved(VerdictReason::RiskApproved, "");
        let p = plan(vec![
            step(0, approve()),
            step(1, confirm()).after([0]),
            step(2, approve()).after([1]),
            step(3, confirm()).after([2]),
            step(4, Verdict::rejected(VerdictReason::Blacklisted, "")).after([1]),
        ]);
        let confirmed: BTreeSet<usize> = [1].into_iter().collect();
        let succeeded: BTreeSet<usize> = [0].into_iter().collect();

        let follow_up = p.follow_up(&confirmed, &succeeded);
        assert_eq!(follow_up.parent_plan_id, Some(p.plan_id));
        assert_ne!(follow_up.plan_id, p.plan_id);
        assert_eq!(follow_up.status, PlanStatus::Draft);
        // steps 1 and 2 survive; 3 depends on 2 but was never confirmed, so it is
        // carried along unconfirmed and will be re-evaluated.
        assert_eq!(follow_up.steps.len(), 3);
        assert!(follow_up.steps[0].depends_on.is_empty());
        assert_eq!(follow_up.steps[1].depends_on, vec![0]);
        assert_eq!(follow_up.steps[2].depends_on, vec![1]);
        assert!(follow_up.steps.iter().all(|s| s.verdict.is_none()));
        assert!(follow_up.context.is_confirmed(0));
        assert!(!follow_up.context.is_confirmed(2));
    }

    #[test]
    fn test_follow_up_drops_steps_with_unmet_dependencies() {
        let confirm = || Verdict::needs_confirmation(VerdictReason::ConfirmationRequired, "");
        let p = plan(vec![
            step(0, confirm()),
            step(1, confirm()).after([0]),
        ]);
        let confirmed: BTreeSet<usize> = [1].into_iter().collect();
        let follow_up = p.follow_up(&confirmed, &BTreeSet::new());
        assert!(follow_up.steps.is_empty());
    }

    #[test]
    fn test_planning_issue_display() {
        let issue = PlanningIssue::MissingArgument {
            names: vec!["path".to_string(), "content".to_string()],
        };
        assert_eq!(
            issue.to_string(),
            "missing required argument(s): path, content"
        );
    }
}

//! Policy engine.
//!
//! Attaches exactly one [`Verdict`] to every step of a plan. Evaluation per
//! step stops at the first terminal stage:
//!
//! 0. planning issue (unknown kind, missing argument) -> rejected
//! 1. deny pattern over the normalized arguments -> rejected (blacklisted)
//! 2. argument schema -> rejected (invalid-argument)
//! 3. risk tier: low/medium approved, high approved only when sandboxed,
//!    critical always needs confirmation
//! 4. dry-run: anything not rejected becomes approved and simulate-only
//!
//! When the rule configuration cannot be loaded every step is rejected
//! (fail-closed).

pub mod reload;
pub mod rules;
pub mod schema;

use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

use crate::error::PolicyError;
use crate::plan::{Decision, Plan, PlanStatus, PlanStep, PlanningIssue, Verdict, VerdictReason};
use crate::types::{RequestContext, RiskTier};

pub use reload::ReloadWatcher;
pub use rules::{FileRuleSource, RuleSet, RuleSource, StaticRuleSource};
pub use schema::{ParamSpec, ParamType};

/// A validated plan and whether it was judged without rules.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub plan: Plan,
    pub fail_closed: bool,
}

impl Evaluation {
    pub fn count(&self, decision: Decision) -> usize {
        self.plan
            .steps
            .iter()
            .filter(|s| s.verdict.as_ref().is_some_and(|v| v.decision == decision))
            .count()
    }
}

/// Evaluates plans against a hot-swappable rule set.
pub struct PolicyEngine {
    source: Arc<dyn RuleSource>,
    rules: RwLock<Option<Arc<RuleSet>>>,
}

impl PolicyEngine {
    /// Create an engine and load its rules. A failed load leaves the engine
    /// fail-closed until a reload succeeds.
    pub fn new(source: Arc<dyn RuleSource>) -> Self {
        let engine = Self {
            source,
            rules: RwLock::new(None),
        };
        if let Err(e) = engine.reload() {
            error!(error = %e, "Initial policy load failed; rejecting all actions");
        }
        engine
    }

    /// Engine over a fixed in-memory rule set.
    pub fn with_rules(rules: RuleSet) -> Self {
        Self::new(Arc::new(StaticRuleSource::new(rules)))
    }

    pub fn source(&self) -> &Arc<dyn RuleSource> {
        &self.source
    }

    /// Re-read the rule source and swap the active rule set.
    ///
    /// On failure the active rules are dropped so that nothing is approved
    /// against a configuration that can no longer be confirmed.
    pub fn reload(&self) -> Result<(), PolicyError> {
        let loaded = self.source.load();
        let mut guard = self
            .rules
            .write()
            .map_err(|e| PolicyError::ConfigUnavailable(format!("Lock poisoned: {}", e)))?;
        match loaded {
            Ok(rules) => {
                *guard = Some(Arc::new(rules));
                info!(source = %self.source.describe(), "Policy rules active");
                Ok(())
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    /// Snapshot of the active rules, `None` when fail-closed.
    pub fn rules(&self) -> Option<Arc<RuleSet>> {
        self.rules.read().ok().and_then(|guard| guard.clone())
    }

    pub fn is_fail_closed(&self) -> bool {
        self.rules().is_none()
    }

    /// Attach a verdict to every step and mark the plan validated.
    pub fn evaluate(&self, mut plan: Plan) -> Evaluation {
        let rules = self.rules();
        let fail_closed = rules.is_none();
        if fail_closed {
            warn!(plan_id = %plan.plan_id, "Policy configuration unavailable; failing closed");
        }

        for step in &mut plan.steps {
            let verdict = match &rules {
                Some(rules) => evaluate_step(rules, step, &plan.context),
                None => Verdict::rejected(
                    VerdictReason::FailClosed,
                    "policy configuration unavailable",
                )
                .fired("fail-closed"),
            };
            step.verdict = Some(verdict);
        }
        plan.status = PlanStatus::Validated;

        let evaluation = Evaluation { plan, fail_closed };
        info!(
            plan_id = %evaluation.plan.plan_id,
            approved = evaluation.count(Decision::Approved),
            rejected = evaluation.count(Decision::Rejected),
            needs_confirmation = evaluation.count(Decision::NeedsConfirmation),
            dry_run = evaluation.plan.context.dry_run,
            "Plan evaluated"
        );
        evaluation
    }
}

/// Run the rule chain for one step.
pub fn evaluate_step(rules: &RuleSet, step: &PlanStep, context: &RequestContext) -> Verdict {
    let verdict = rule_chain(rules, step, context);
    if context.dry_run {
        verdict.into_simulation()
    } else {
        verdict
    }
}

fn rule_chain(rules: &RuleSet, step: &PlanStep, context: &RequestContext) -> Verdict {
    if let Some(issue) = &step.planning_issue {
        return match issue {
            PlanningIssue::UnknownKind { .. } => {
                Verdict::rejected(VerdictReason::UnknownKind, issue.to_string())
                    .fired("planning:unknown-kind")
            }
            PlanningIssue::MissingArgument { .. } => {
                Verdict::rejected(VerdictReason::MissingArgument, issue.to_string())
                    .fired("planning:missing-argument")
            }
        };
    }

    let Some(action) = &step.action else {
        return Verdict::rejected(
            VerdictReason::UnknownKind,
            format!("unknown action kind '{}'", step.label),
        )
        .fired("planning:unknown-kind");
    };

    if let Some(pattern) = rules.deny_match(action) {
        return Verdict::rejected(
            VerdictReason::Blacklisted,
            format!("matched deny pattern '{}'", pattern.name),
        )
        .fired(format!("blacklist:{}", pattern.name));
    }

    if let Some(schema) = rules.schemas.get(&action.kind) {
        if let Err(violation) = schema::validate_arguments(action, schema, &rules.allowed_roots) {
            return Verdict::rejected(
                VerdictReason::InvalidArgument,
                format!("{}: {}", violation.param, violation.detail),
            )
            .fired(format!("schema:{}.{}", action.kind, violation.param));
        }
    }

    let assessment = rules.assess(action);
    let tier = assessment.tier;
    let mut verdict = match tier {
        RiskTier::Low | RiskTier::Medium => {
            Verdict::approved(VerdictReason::RiskApproved, format!("{} risk", tier))
        }
        RiskTier::High if context.sandboxed => Verdict::approved(
            VerdictReason::SandboxedHighRisk,
            "high risk approved inside a sandboxed context",
        ),
        RiskTier::High => Verdict::needs_confirmation(
            VerdictReason::ConfirmationRequired,
            "high risk outside a sandboxed context",
        ),
        RiskTier::Critical => Verdict::needs_confirmation(
            VerdictReason::ConfirmationRequired,
            "critical risk always requires confirmation",
        ),
    };
    verdict.rules_fired = assessment.rules_fired;
    verdict.with_tier(tier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStep;
    use crate::types::{Action, ActionKind, Arguments};
    use serde_json::json;

    struct BrokenSource;

    impl RuleSource for BrokenSource {
        fn load(&self) -> Result<RuleSet, PolicyError> {
            Err(PolicyError::ConfigUnavailable("rules.toml: permission denied".to_string()))
        }
        fn describe(&self) -> String {
            "broken".to_string()
        }
    }

    fn engine() -> PolicyEngine {
        PolicyEngine::with_rules(RuleSet::builtin().unwrap())
    }

    fn step(index: usize, kind: ActionKind, pairs: &[(&str, serde_json::Value)]) -> PlanStep {
        let args: Arguments = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        PlanStep::new(index, Action::new(kind, args))
    }

    fn verdict_of(evaluation: &Evaluation, index: usize) -> &Verdict {
        evaluation.plan.steps[index].verdict.as_ref().unwrap()
    }

    #[test]
    fn test_every_step_gets_one_verdict() {
        let plan = Plan::new(
            RequestContext::new("mixed"),
            vec![
                step(0, ActionKind::LaunchApplication, &[("name", json!("notes"))]),
                step(1, ActionKind::RunCommand, &[("command", json!("rm -rf /"))]),
                step(2, ActionKind::DeleteFile, &[("path", json!("/tmp/jarvis/a"))]),
            ],
        );
        let evaluation = engine().evaluate(plan);
        assert!(evaluation.plan.is_fully_validated());
        assert_eq!(evaluation.plan.status, PlanStatus::Validated);
        assert!(!evaluation.fail_closed);
    }

    #[test]
    fn test_low_risk_is_approved() {
        let plan = Plan::new(
            RequestContext::new("notes"),
            vec![step(0, ActionKind::LaunchApplication, &[("name", json!("notes"))])],
        );
        let evaluation = engine().evaluate(plan);
        let v = verdict_of(&evaluation, 0);
        assert_eq!(v.decision, Decision::Approved);
        assert_eq!(v.reason, VerdictReason::RiskApproved);
        assert_eq!(v.risk_tier, Some(RiskTier::Low));
    }

    #[test]
    fn test_blacklist_beats_low_risk_kind() {
        let plan = Plan::new(
            RequestContext::new("search"),
            vec![step(0, ActionKind::Notify, &[("message", json!("run rm -rf / now"))])],
        );
        let evaluation = engine().evaluate(plan);
        let v = verdict_of(&evaluation, 0);
        assert_eq!(v.decision, Decision::Rejected);
        assert_eq!(v.reason, VerdictReason::Blacklisted);
        assert_eq!(v.rules_fired, vec!["blacklist:recursive-delete".to_string()]);
    }

    #[test]
    fn test_schema_violation_is_invalid_argument() {
        let plan = Plan::new(
            RequestContext::new("read"),
            vec![step(0, ActionKind::ReadFile, &[("path", json!("/etc/shadow"))])],
        );
        let evaluation = engine().evaluate(plan);
        let v = verdict_of(&evaluation, 0);
        assert_eq!(v.decision, Decision::Rejected);
        assert_eq!(v.reason, VerdictReason::InvalidArgument);
        assert!(v.detail.starts_with("path:"));
    }

    #[test]
    fn test_high_risk_depends_on_sandbox() {
        let write = || {
            step(
                0,
                ActionKind::WriteFile,
                &[("path", json!("/tmp/jarvis/a.txt")), ("content", json!("hi"))],
            )
        };

        let evaluation = engine().evaluate(Plan::new(RequestContext::new("w"), vec![write()]));
        assert_eq!(
            verdict_of(&evaluation, 0).decision,
            Decision::NeedsConfirmation
        );

        let evaluation = engine().evaluate(Plan::new(
            RequestContext::new("w").sandboxed(true),
            vec![write()],
        ));
        let v = verdict_of(&evaluation, 0);
        assert_eq!(v.decision, Decision::Approved);
        assert_eq!(v.reason, VerdictReason::SandboxedHighRisk);
    }

    #[test]
    fn test_critical_never_auto_approved() {
        let evaluation = engine().evaluate(Plan::new(
            RequestContext::new("delete").sandboxed(true),
            vec![step(0, ActionKind::DeleteFile, &[("path", json!("/tmp/jarvis/a"))])],
        ));
        let v = verdict_of(&evaluation, 0);
        assert_eq!(v.decision, Decision::NeedsConfirmation);
        assert_eq!(v.risk_tier, Some(RiskTier::Critical));
    }

    #[test]
    fn test_dry_run_verdicts_match_normal_evaluation() {
        let steps = || {
            vec![
                step(0, ActionKind::LaunchApplication, &[("name", json!("notes"))]),
                step(1, ActionKind::RunCommand, &[("command", json!("rm -rf /"))]),
                step(2, ActionKind::RunCommand, &[("command", json!("ls"))]),
            ]
        };
        let normal = engine().evaluate(Plan::new(RequestContext::new("x"), steps()));
        let dry = engine().evaluate(Plan::new(RequestContext::new("x").dry_run(true), steps()));

        for i in 0..3 {
            let (n, d) = (verdict_of(&normal, i), verdict_of(&dry, i));
            assert_eq!(n.evaluated, d.evaluated);
            assert_eq!(n.reason, d.reason);
        }
        assert!(verdict_of(&dry, 0).simulate_only);
        assert_eq!(verdict_of(&dry, 1).decision, Decision::Rejected);
        assert!(!verdict_of(&dry, 1).simulate_only);
        assert_eq!(verdict_of(&dry, 2).decision, Decision::Approved);
        assert!(verdict_of(&dry, 2).simulate_only);
    }

    #[test]
    fn test_planning_issues_are_rejected() {
        let mut unknown = step(0, ActionKind::Notify, &[("message", json!("x"))]);
        unknown.action = None;
        unknown.label = "teleport".to_string();
        unknown.planning_issue = Some(PlanningIssue::UnknownKind {
            label: "teleport".to_string(),
        });
        let mut missing = step(1, ActionKind::WriteFile, &[("path", json!("/tmp/jarvis/a"))]);
        missing.planning_issue = Some(PlanningIssue::MissingArgument {
            names: vec!["content".to_string()],
        });

        let evaluation = engine().evaluate(Plan::new(
            RequestContext::new("x"),
            vec![unknown, missing],
        ));
        assert_eq!(verdict_of(&evaluation, 0).reason, VerdictReason::UnknownKind);
        assert_eq!(
            verdict_of(&evaluation, 1).reason,
            VerdictReason::MissingArgument
        );
    }

    #[test]
    fn test_unloadable_config_fails_closed() {
        let engine = PolicyEngine::new(Arc::new(BrokenSource));
        assert!(engine.is_fail_closed());

        let evaluation = engine.evaluate(Plan::new(
            RequestContext::new("notes"),
            vec![step(0, ActionKind::LaunchApplication, &[("name", json!("notes"))])],
        ));
        assert!(evaluation.fail_closed);
        let v = verdict_of(&evaluation, 0);
        assert_eq!(v.decision, Decision::Rejected);
        assert_eq!(v.reason, VerdictReason::FailClosed);
    }

    #[test]
    fn test_failed_reload_drops_rules() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(rules::DEFAULT_RULES.as_bytes()).unwrap();
        let path = file.path().to_path_buf();

        let engine = PolicyEngine::new(Arc::new(FileRuleSource::new(&path)));
        assert!(!engine.is_fail_closed());

        std::fs::write(&path, "[risk]\nnotify = \"extreme\"\n").unwrap();
        assert!(engine.reload().is_err());
        assert!(engine.is_fail_closed());

        std::fs::write(&path, rules::DEFAULT_RULES).unwrap();
        assert!(engine.reload().is_ok());
        assert!(!engine.is_fail_closed());
    }
}

//! Jarvis application binary - composition root.
//!
//! Ties the orchestration core into a single executable:
//! 1. Start logging, then load configuration from TOML
//! 2. Open the audit trail and the safety policy
//! 3. Build the executor over the default action adapters
//! 4. Plan through the configured reasoning endpoint or a recorded plan
//! 5. Run one request, query the audit trail or check the policy

mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

use jarvis_action::policy::{FileRuleSource, StaticRuleSource};
use jarvis_action::{
    ActionExecutor, ActionRegistry, AuditRecorder, AuditSink, ConfirmationGate, Controller,
    HttpReasoningService, InMemoryMemoryStore, JsonlAuditSink, MemoryAuditSink, MemoryStore,
    PlanGenerator, PolicyEngine, ReasoningError, ReasoningRequest, ReasoningResponse,
    ReasoningService, ReloadWatcher, RequestContext, ResourceLimits, RuleSet, RuleSource,
    TaskSandbox,
};
use jarvis_core::config::JarvisConfig;

use cli::{AuditArgs, CliArgs, Command, PolicyCommand, RunArgs};

/// Reasoning service that answers every request with a recorded plan.
struct ReplayReasoning {
    raw_plan_text: String,
}

#[async_trait]
impl ReasoningService for ReplayReasoning {
    async fn generate(
        &self,
        request: &ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        tracing::debug!(
            intent_len = request.intent_text.len(),
            snippets = request.context.len(),
            "Replaying recorded plan"
        );
        Ok(ReasoningResponse {
            raw_plan_text: self.raw_plan_text.clone(),
        })
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Log filter used until the config file is read: --log-level, else info.
fn startup_filter(args: &CliArgs) -> (reload::Layer<EnvFilter, Registry>, FilterHandle) {
    reload::Layer::new(EnvFilter::new(args.resolve_log_level("info")))
}

/// Install the subscriber. Logs go to stderr so stdout stays machine-readable.
///
/// Returns a handle for applying the config file's level, or `None` when
/// RUST_LOG or --log-level already decided it.
fn init_tracing(args: &CliArgs) -> Option<FilterHandle> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
        return None;
    }
    let (filter, handle) = startup_filter(args);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
    args.log_level.is_none().then_some(handle)
}

/// Expand ~ to home directory in a path string.
fn resolve_data_dir(data_dir: &str) -> PathBuf {
    if let Some(rest) = data_dir.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(data_dir)
    }
}

/// Resolve a configured path against the data directory unless absolute.
fn resolve_in(data_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        data_dir.join(p)
    }
}

fn audit_sink(
    config: &JarvisConfig,
    data_dir: &Path,
) -> Result<Arc<dyn AuditSink>, Box<dyn std::error::Error>> {
    if !config.audit.enabled {
        tracing::warn!("Audit file disabled; records are kept in memory only");
        return Ok(Arc::new(MemoryAuditSink::new()));
    }
    let path = resolve_in(data_dir, &config.audit.path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let sink = JsonlAuditSink::open(&path)?;
    tracing::info!(path = %path.display(), "Audit trail opened");
    Ok(Arc::new(sink))
}

/// Recorded plan when one is given, otherwise the configured endpoint.
fn reasoning_service(
    config: &JarvisConfig,
    plan_file: Option<&Path>,
) -> Result<Arc<dyn ReasoningService>, Box<dyn std::error::Error>> {
    if let Some(path) = plan_file {
        let raw_plan_text = std::fs::read_to_string(path)?;
        tracing::info!(path = %path.display(), "Replaying recorded plan");
        return Ok(Arc::new(ReplayReasoning { raw_plan_text }));
    }
    match HttpReasoningService::from_config(&config.reasoning) {
        Some(service) => {
            let service = service?;
            tracing::info!(
                url = %service.url(),
                model = %config.reasoning.model,
                "Using reasoning endpoint"
            );
            Ok(Arc::new(service))
        }
        None => Err("no reasoning backend: pass --plan-file or set reasoning.endpoint".into()),
    }
}

fn rule_source(
    config: &JarvisConfig,
    data_dir: &Path,
    rules_override: Option<&Path>,
) -> Result<Arc<dyn RuleSource>, Box<dyn std::error::Error>> {
    let path = match (rules_override, &config.policy.rules_path) {
        (Some(p), _) => Some(p.to_path_buf()),
        (None, Some(p)) => Some(resolve_in(data_dir, p)),
        (None, None) => None,
    };
    Ok(match path {
        Some(path) => Arc::new(
            FileRuleSource::new(path).with_default_roots(config.sandbox.allowed_paths.clone()),
        ),
        None => {
            let rules = RuleSet::builtin()?.with_allowed_roots(config.sandbox.allowed_paths.clone());
            Arc::new(StaticRuleSource::new(rules))
        }
    })
}

async fn run_request(
    config: &JarvisConfig,
    data_dir: &Path,
    args: RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let reasoning = reasoning_service(config, args.plan_file.as_deref())?;
    let intent = match (args.intent, &args.plan_file) {
        (Some(intent), _) => intent,
        (None, Some(path)) => format!("replay {}", path.display()),
        (None, None) => return Err("--intent is required without --plan-file".into()),
    };

    let memory: Arc<dyn MemoryStore> = Arc::new(InMemoryMemoryStore::new());
    let generator = PlanGenerator::from_config(reasoning, Some(Arc::clone(&memory)), config);

    let policy = Arc::new(PolicyEngine::new(rule_source(config, data_dir, None)?));
    if policy.is_fail_closed() {
        tracing::warn!("Policy rules unavailable; every action will be rejected");
    }
    let watcher = (config.policy.rules_path.is_some() && config.policy.reload_interval_secs > 0)
        .then(|| {
            Arc::new(ReloadWatcher::new(
                Arc::clone(&policy),
                Duration::from_secs(config.policy.reload_interval_secs),
            ))
        });
    if let Some(ref watcher) = watcher {
        let watcher = Arc::clone(watcher);
        tokio::spawn(async move { watcher.run().await });
    }

    let registry = Arc::new(ActionRegistry::with_defaults(config));
    tracing::info!(kinds = ?registry.kinds(), "Action adapters registered");
    let executor = Arc::new(ActionExecutor::new(
        Arc::new(TaskSandbox::new(registry)),
        &config.executor,
        ResourceLimits::from(&config.sandbox),
    ));

    let mut controller = Controller::new(
        generator,
        policy,
        executor,
        Arc::new(AuditRecorder::from_config(
            audit_sink(config, data_dir)?,
            &config.audit,
        )),
        Arc::new(ConfirmationGate::new(config.confirmation.ttl())),
    )
    .with_policy_config(&config.policy);
    if config.memory.write_back {
        controller = controller.with_memory_write_back(memory);
    }

    let context = RequestContext::new(intent)
        .with_requester(args.requester)
        .with_source(args.source)
        .sandboxed(args.sandboxed)
        .dry_run(args.dry_run)
        .confirm(args.confirm);

    let response = controller.handle(context).await;
    if let Some(watcher) = watcher {
        watcher.shutdown();
    }

    if !response.pending_confirmations.is_empty() {
        tracing::info!(
            steps = ?response.pending_confirmations,
            "Steps awaiting confirmation; re-run with --confirm to approve them"
        );
    }
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_audit(
    config: &JarvisConfig,
    data_dir: &Path,
    args: AuditArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let path = resolve_in(data_dir, &config.audit.path);

    if args.verify {
        let verified = JsonlAuditSink::verify_chain(&path)?;
        println!("{}: {} records, chain intact", path.display(), verified);
        return Ok(());
    }

    let records = match (args.plan_id, args.request_id) {
        (Some(plan_id), _) => JsonlAuditSink::open(&path)?.query_plan(plan_id).await?,
        (None, Some(request_id)) => JsonlAuditSink::open(&path)?.query_request(request_id).await?,
        (None, None) => JsonlAuditSink::read_all(&path)?,
    };
    for record in records {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn run_policy_check(
    config: &JarvisConfig,
    data_dir: &Path,
    rules: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let source = rule_source(config, data_dir, rules.as_deref())?;
    let loaded = source.load()?;
    println!("{}", source.describe());
    println!("  risk tiers:        {}", loaded.risk.len());
    println!("  blacklist entries: {}", loaded.blacklist.len());
    println!("  escalations:       {}", loaded.escalations.len());
    println!("  schemas:           {}", loaded.schemas.len());
    println!("  allowed roots:     {}", loaded.allowed_roots.join(", "));
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    let filter = init_tracing(&args);
    tracing::info!("Starting Jarvis v{}", env!("CARGO_PKG_VERSION"));

    let config_file = args.resolve_config_path();
    let config = JarvisConfig::load_or_default(&config_file);
    if let Some(handle) = filter {
        if let Err(e) = handle.reload(EnvFilter::new(&config.general.log_level)) {
            tracing::warn!(error = %e, "Could not apply configured log level");
        }
    }

    let data_dir = resolve_data_dir(&args.resolve_data_dir(&config.general.data_dir));
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        tracing::error!(path = %data_dir.display(), error = %e, "Failed to create data directory");
        return Err(e.into());
    }

    match args.command {
        Command::Run(run) => run_request(&config, &data_dir, run).await,
        Command::Audit(audit) => run_audit(&config, &data_dir, audit).await,
        Command::Policy {
            command: PolicyCommand::Check { rules },
        } => run_policy_check(&config, &data_dir, rules),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_resolve_in_keeps_absolute_paths() {
        let base = Path::new("/var/lib/jarvis");
        assert_eq!(resolve_in(base, "/tmp/audit.jsonl"), PathBuf::from("/tmp/audit.jsonl"));
        assert_eq!(
            resolve_in(base, "audit.jsonl"),
            PathBuf::from("/var/lib/jarvis/audit.jsonl")
        );
    }

    #[test]
    fn test_resolve_data_dir_plain_path() {
        assert_eq!(resolve_data_dir("/srv/jarvis"), PathBuf::from("/srv/jarvis"));
    }

    #[test]
    fn test_startup_filter_reloads_to_config_level() {
        let args = CliArgs::parse_from(["jarvis", "policy", "check"]);
        let (filter, handle) = startup_filter(&args);
        let subscriber = tracing_subscriber::registry().with(filter);
        tracing::subscriber::with_default(subscriber, || {
            assert!(tracing::enabled!(tracing::Level::INFO));
            assert!(!tracing::enabled!(tracing::Level::DEBUG));
            handle.reload(EnvFilter::new("debug")).unwrap();
            assert!(tracing::enabled!(tracing::Level::DEBUG));
        });
    }

    #[test]
    fn test_reasoning_backend_selection() {
        let mut config = JarvisConfig::default();
        assert!(reasoning_service(&config, None).is_err());

        config.reasoning.endpoint = Some("http://localhost:11434".to_string());
        assert!(reasoning_service(&config, None).is_ok());

        let dir = tempdir().unwrap();
        assert!(reasoning_service(&config, Some(dir.path().join("missing.json").as_path())).is_err());
    }

    #[tokio::test]
    async fn test_live_run_without_endpoint_fails() {
        let dir = tempdir().unwrap();
        let args = RunArgs {
            plan_file: None,
            intent: Some("mute the speakers".to_string()),
            requester: "test".to_string(),
            source: jarvis_action::IntentSource::Text,
            dry_run: true,
            sandboxed: false,
            confirm: Vec::new(),
        };
        let err = run_request(&JarvisConfig::default(), dir.path(), args)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reasoning.endpoint"));
    }

    #[test]
    fn test_builtin_rules_without_rules_path() {
        let dir = tempdir().unwrap();
        let config = JarvisConfig::default();
        let source = rule_source(&config, dir.path(), None).unwrap();
        let rules = source.load().unwrap();
        assert_eq!(rules.allowed_roots, config.sandbox.allowed_paths);
        assert!(!rules.blacklist.is_empty());
    }

    #[test]
    fn test_missing_rule_file_fails_to_load() {
        let dir = tempdir().unwrap();
        let mut config = JarvisConfig::default();
        config.policy.rules_path = Some("rules.toml".to_string());
        let source = rule_source(&config, dir.path(), None).unwrap();
        assert!(source.load().is_err());
    }

    #[tokio::test]
    async fn test_replayed_plan_runs_through_pipeline() {
        let dir = tempdir().unwrap();
        let mut config = JarvisConfig::default();
        config.audit.path = "trail/audit.jsonl".to_string();
        let plan = dir.path().join("plan.json");
        std::fs::write(
            &plan,
            r#"[{"kind": "run_command", "arguments": {"command": "rm -rf /"}}]"#,
        )
        .unwrap();

        let args = RunArgs {
            plan_file: Some(plan),
            intent: Some("clean up".to_string()),
            requester: "test".to_string(),
            source: jarvis_action::IntentSource::Text,
            dry_run: true,
            sandboxed: false,
            confirm: Vec::new(),
        };
        run_request(&config, dir.path(), args).await.unwrap();

        let audit = dir.path().join("trail").join("audit.jsonl");
        assert!(JsonlAuditSink::verify_chain(&audit).unwrap() >= 4);
    }
}

//! CLI argument definitions for the Jarvis binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Args, Parser, Subcommand};
use jarvis_action::IntentSource;
use std::path::PathBuf;
use uuid::Uuid;

/// Jarvis: plans, validates and executes assistant actions under a safety policy.
#[derive(Parser, Debug)]
#[command(name = "jarvis", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Data directory for the audit log.
    #[arg(short = 'd', long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one request through the pipeline.
    Run(RunArgs),
    /// Query or verify the audit trail.
    Audit(AuditArgs),
    /// Inspect the safety policy.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Replay a recorded reasoning output instead of calling the configured endpoint.
    #[arg(long = "plan-file")]
    pub plan_file: Option<PathBuf>,

    /// Intent text for the request. Required without --plan-file.
    #[arg(long, required_unless_present = "plan_file")]
    pub intent: Option<String>,

    /// Who issued the request.
    #[arg(long, default_value = "cli")]
    pub requester: String,

    /// Modality the intent arrived through (speech, text, vision).
    #[arg(long, default_value = "text", value_parser = parse_source)]
    pub source: IntentSource,

    /// Evaluate and simulate without side effects.
    #[arg(long)]
    pub dry_run: bool,

    /// Run inside the sandbox, allowing high-risk steps without confirmation.
    #[arg(long)]
    pub sandboxed: bool,

    /// Step indices confirmed up front.
    #[arg(long, value_delimiter = ',')]
    pub confirm: Vec<usize>,
}

#[derive(Args, Debug)]
pub struct AuditArgs {
    /// Records for one plan.
    #[arg(long = "plan-id", conflicts_with = "request_id")]
    pub plan_id: Option<Uuid>,

    /// Records for one request, across its follow-up plans.
    #[arg(long = "request-id")]
    pub request_id: Option<Uuid>,

    /// Check the hash chain instead of printing records.
    #[arg(long)]
    pub verify: bool,
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommand {
    /// Load the rule file and report what it contains.
    Check {
        /// Rule file to check instead of the configured one.
        #[arg(long)]
        rules: Option<PathBuf>,
    },
}

fn parse_source(raw: &str) -> Result<IntentSource, String> {
    match raw.to_ascii_lowercase().as_str() {
        "speech" => Ok(IntentSource::Speech),
        "text" => Ok(IntentSource::Text),
        "vision" => Ok(IntentSource::Vision),
        other => Err(format!("unknown intent source: {}", other)),
    }
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > JARVIS_CONFIG env var > ~/.jarvis/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("JARVIS_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the data directory.
    ///
    /// Priority: --data-dir flag > JARVIS_DATA_DIR env var > config file value.
    pub fn resolve_data_dir(&self, config_data_dir: &str) -> String {
        if let Some(ref p) = self.data_dir {
            return p.to_string_lossy().to_string();
        }
        if let Ok(p) = std::env::var("JARVIS_DATA_DIR") {
            if !p.is_empty() {
                return p;
            }
        }
        config_data_dir.to_string()
    }

    /// Resolve the log filter.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

fn default_config_path() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".jarvis").join("config.toml");
    }
    PathBuf::from("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse() {
        let args = CliArgs::parse_from([
            "jarvis",
            "run",
            "--plan-file",
            "plan.json",
            "--dry-run",
            "--confirm",
            "1,3",
            "--source",
            "speech",
        ]);
        match args.command {
            Command::Run(run) => {
                assert_eq!(run.plan_file, Some(PathBuf::from("plan.json")));
                assert!(run.dry_run);
                assert!(!run.sandboxed);
                assert_eq!(run.confirm, vec![1, 3]);
                assert_eq!(run.source, IntentSource::Speech);
                assert_eq!(run.requester, "cli");
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = CliArgs::parse_from(["jarvis", "audit", "--verify", "-c", "/etc/jarvis.toml"]);
        assert_eq!(args.resolve_config_path(), PathBuf::from("/etc/jarvis.toml"));
        assert!(matches!(args.command, Command::Audit(AuditArgs { verify: true, .. })));
    }

    #[test]
    fn test_flag_overrides_config_values() {
        let args = CliArgs::parse_from([
            "jarvis",
            "--data-dir",
            "/srv/jarvis",
            "--log-level",
            "debug",
            "policy",
            "check",
        ]);
        assert_eq!(args.resolve_data_dir("~/.jarvis/data"), "/srv/jarvis");
        assert_eq!(args.resolve_log_level("info"), "debug");
    }

    #[test]
    fn test_config_value_used_without_flag() {
        let args = CliArgs::parse_from(["jarvis", "policy", "check"]);
        assert_eq!(args.resolve_log_level("warn"), "warn");
    }

    #[test]
    fn test_live_run_needs_intent() {
        assert!(CliArgs::try_parse_from(["jarvis", "run"]).is_err());
        let args = CliArgs::parse_from(["jarvis", "run", "--intent", "mute the speakers"]);
        match args.command {
            Command::Run(run) => {
                assert!(run.plan_file.is_none());
                assert_eq!(run.intent.as_deref(), Some("mute the speakers"));
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_source_rejected() {
        assert!(CliArgs::try_parse_from([
            "jarvis",
            "run",
            "--plan-file",
            "p.json",
            "--source",
            "telepathy"
        ])
        .is_err());
    }
}

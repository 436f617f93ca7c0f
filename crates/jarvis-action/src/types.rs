//! Action schema: the closed vocabulary of executable actions, their risk
//! classification, and the request context a plan is generated for.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Named, typed action parameters.
pub type Arguments = BTreeMap<String, serde_json::Value>;

// =============================================================================
// Enums
// =============================================================================

/// Capabilities an action can exercise. One execution adapter exists per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    LaunchApplication,
    CloseApplication,
    ReadFile,
    WriteFile,
    DeleteFile,
    RunCommand,
    IotCommand,
    Notify,
    WebSearch,
    Screenshot,
    ControlVolume,
}

impl ActionKind {
    pub const ALL: [ActionKind; 11] = [
        ActionKind::LaunchApplication,
        ActionKind::CloseApplication,
        ActionKind::ReadFile,
        ActionKind::WriteFile,
        ActionKind::DeleteFile,
        ActionKind::RunCommand,
        ActionKind::IotCommand,
        ActionKind::Notify,
        ActionKind::WebSearch,
        ActionKind::Screenshot,
        ActionKind::ControlVolume,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::LaunchApplication => "launch_application",
            ActionKind::CloseApplication => "close_application",
            ActionKind::ReadFile => "read_file",
            ActionKind::WriteFile => "write_file",
            ActionKind::DeleteFile => "delete_file",
            ActionKind::RunCommand => "run_command",
            ActionKind::IotCommand => "iot_command",
            ActionKind::Notify => "notify",
            ActionKind::WebSearch => "web_search",
            ActionKind::Screenshot => "screenshot",
            ActionKind::ControlVolume => "control_volume",
        }
    }

    /// Resolve a kind from the label a reasoning engine emitted.
    ///
    /// Case, hyphens and spaces are normalized; the tool names used by older
    /// planner prompts (`open_app`, `execute_command`, ...) are accepted.
    pub fn from_label(label: &str) -> Option<Self> {
        let normalized = label.trim().to_lowercase().replace(['-', ' '], "_");
        let kind = match normalized.as_str() {
            "launch_application" | "launch_app" | "open_app" | "open_application" | "launch" => {
                ActionKind::LaunchApplication
            }
            "close_application" | "close_app" => ActionKind::CloseApplication,
            "read_file" | "file_read" => ActionKind::ReadFile,
            "write_file" | "file_write" => ActionKind::WriteFile,
            "delete_file" | "file_delete" | "remove_file" => ActionKind::DeleteFile,
            "run_command" | "execute_command" | "shell_command" | "system_command" => {
                ActionKind::RunCommand
            }
            "iot_command" | "iot_action" | "toggle_light" | "set_temperature" | "unlock_door" => {
                ActionKind::IotCommand
            }
            "notify" | "notification" | "send_notification" => ActionKind::Notify,
            "web_search" | "search_web" | "search" => ActionKind::WebSearch,
            "screenshot" | "take_screenshot" | "capture_screen" => ActionKind::Screenshot,
            "control_volume" | "set_volume" | "volume" => ActionKind::ControlVolume,
            _ => return None,
        };
        Some(kind)
    }

    /// Arguments that must be present (and non-null) for the action to be planned.
    pub fn required_arguments(&self) -> &'static [&'static str] {
        match self {
            ActionKind::LaunchApplication | ActionKind::CloseApplication => &["name"],
            ActionKind::ReadFile | ActionKind::DeleteFile => &["path"],
            ActionKind::WriteFile => &["path", "content"],
            ActionKind::RunCommand => &["command"],
            ActionKind::IotCommand => &["device", "command"],
            ActionKind::Notify => &["message"],
            ActionKind::WebSearch => &["query"],
            ActionKind::Screenshot => &["path"],
            // Either `level` or `action`; the adapter checks which.
            ActionKind::ControlVolume => &[],
        }
    }

    /// Built-in risk tier, used when the rule set has no entry for the kind.
    pub fn default_risk_tier(&self) -> RiskTier {
        match self {
            ActionKind::LaunchApplication
            | ActionKind::CloseApplication
            | ActionKind::Notify
            | ActionKind::WebSearch
            | ActionKind::Screenshot
            | ActionKind::ControlVolume => RiskTier::Low,
            ActionKind::ReadFile | ActionKind::IotCommand => RiskTier::Medium,
            ActionKind::WriteFile => RiskTier::High,
            ActionKind::DeleteFile | ActionKind::RunCommand => RiskTier::Critical,
        }
    }

    /// Whether repeating the action has no additional side effect.
    ///
    /// Only idempotent kinds are eligible for retry.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            ActionKind::ReadFile | ActionKind::CloseApplication | ActionKind::WebSearch
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionKind::from_label(s).ok_or_else(|| format!("Unknown action kind: {}", s))
    }
}

/// Ordinal risk classification governing approval strictness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn requires_confirmation(&self) -> bool {
        *self >= RiskTier::High
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Low => write!(f, "low"),
            RiskTier::Medium => write!(f, "medium"),
            RiskTier::High => write!(f, "high"),
            RiskTier::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for RiskTier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(RiskTier::Low),
            "medium" => Ok(RiskTier::Medium),
            "high" => Ok(RiskTier::High),
            "critical" => Ok(RiskTier::Critical),
            _ => Err(format!("Unknown risk tier: {}", s)),
        }
    }
}

/// Where the free-form intent came from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentSource {
    Speech,
    #[default]
    Text,
    Vision,
}

// =============================================================================
// Domain Structs
// =============================================================================

/// A single unit of work produced by the plan generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub arguments: Arguments,
    pub risk_tier: RiskTier,
    pub requires_confirmation: bool,
    pub idempotent: bool,
    pub description: String,
}

impl Action {
    /// Create an action; risk, confirmation and idempotency derive from the kind.
    pub fn new(kind: ActionKind, arguments: Arguments) -> Self {
        let risk_tier = kind.default_risk_tier();
        Self {
            kind,
            arguments,
            risk_tier,
            requires_confirmation: risk_tier.requires_confirmation(),
            idempotent: kind.is_idempotent(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// String argument lookup.
    pub fn str_arg(&self, name: &str) -> Option<&str> {
        self.arguments.get(name).and_then(|v| v.as_str())
    }

    /// Required arguments that are absent or null.
    pub fn missing_arguments(&self) -> Vec<&'static str> {
        self.kind
            .required_arguments()
            .iter()
            .copied()
            .filter(|name| self.arguments.get(*name).is_none_or(|v| v.is_null()))
            .collect()
    }

    /// Canonical text form used for deny-pattern matching.
    ///
    /// Kind label followed by `key=value` pairs in key order, lower-cased,
    /// with runs of whitespace collapsed to one space.
    pub fn normalized(&self) -> String {
        let mut out = String::from(self.kind.as_str());
        for (key, value) in &self.arguments {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            out.push(' ');
            out.push_str(key);
            out.push('=');
            out.push_str(&rendered);
        }
        out.to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Context of one inbound request, carried by its plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub requester: String,
    pub source: IntentSource,
    pub intent_text: String,
    /// The execution context is sandboxed; high-risk actions may auto-approve.
    pub sandboxed: bool,
    /// Evaluate the full rule chain but never execute.
    pub dry_run: bool,
    /// Step indices the requester explicitly confirmed.
    pub confirmations: BTreeSet<usize>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RequestContext {
    pub fn new(intent_text: impl Into<String>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            requester: "anonymous".to_string(),
            source: IntentSource::default(),
            intent_text: intent_text.into(),
            sandboxed: false,
            dry_run: false,
            confirmations: BTreeSet::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = requester.into();
        self
    }

    pub fn with_source(mut self, source: IntentSource) -> Self {
        self.source = source;
        self
    }

    pub fn sandboxed(mut self, sandboxed: bool) -> Self {
        self.sandboxed = sandboxed;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn confirm(mut self, indices: impl IntoIterator<Item = usize>) -> Self {
        self.confirmations.extend(indices);
        self
    }

    pub fn is_confirmed(&self, index: usize) -> bool {
        self.confirmations.contains(&index)
    }
}

// =============================================================================
// Tests
// =============================================================================

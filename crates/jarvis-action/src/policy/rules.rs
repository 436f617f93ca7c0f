//! Declarative rule set: risk table, deny patterns, escalations and schemas.
//!
//! Rules are plain TOML data so they can be edited and hot-reloaded without
//! touching code:
//!
//! ```toml
//! allowed_roots = ["/tmp/jarvis"]
//!
//! [risk]
//! run_command = "critical"
//!
//! [[blacklist]]
//! name = "recursive-delete"
//! pattern = '\brm\s+-[a-z]*[rf]'
//!
//! [[escalations]]
//! name = "door-unlock"
//! kind = "iot_command"
//! pattern = '\bunlock'
//! tier = "critical"
//!
//! [schemas.write_file.path]
//! type = "path"
//! required = true
//! ```

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

use crate::error::PolicyError;
use crate::policy::schema::{KindSchema, ParamSpec};
use crate::types::{Action, ActionKind, RiskTier};

/// Built-in rules used when no rule file is configured.
pub const DEFAULT_RULES: &str = r#"
allowed_roots = ["/tmp/jarvis"]

[risk]
launch_application = "low"
close_application = "low"
read_file = "medium"
write_file = "high"
delete_file = "critical"
run_command = "critical"
iot_command = "medium"
notify = "low"
web_search = "low"
screenshot = "low"
control_volume = "low"

[[blacklist]]
name = "recursive-delete"
pattern = '\brm\s+(-[a-z]*[rf]|--(recursive|force|no-preserve-root)\b)'

[[blacklist]]
name = "raw-disk-write"
pattern = '\bdd\s+if='

[[blacklist]]
name = "format-filesystem"
pattern = '\bmkfs(\.[a-z0-9]+)?\b'

[[blacklist]]
name = "device-redirect"
pattern = '>\s*/dev/(sd|hd|nvme|vd|xvd|disk|mmcblk|mem|kmem|port)'

[[blacklist]]
name = "fork-bomb"
pattern = ':\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:'

[[blacklist]]
name = "world-writable-root"
pattern = '\bchmod\s+-r\s+777\s+/'

[[blacklist]]
name = "pipe-to-shell"
pattern = '\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z)?sh\b'
kinds = ["run_command"]

[[blacklist]]
name = "power-state"
pattern = '\b(shutdown|reboot|poweroff|halt)\b|\binit\s+[06]\b|\bsystemctl\s+(suspend|hibernate)\b'
kinds = ["run_command", "launch_application"]

[[escalations]]
name = "door-or-alarm"
kind = "iot_command"
pattern = '\b(unlock|disarm)'
tier = "critical"

[schemas.launch_application.name]
type = "string"
required = true
max_len = 128

[schemas.close_application.name]
type = "string"
required = true
max_len = 128

[schemas.read_file.path]
type = "path"
required = true

[schemas.write_file.path]
type = "path"
required = true

[schemas.write_file.content]
type = "string"
required = true
max_len = 1048576

[schemas.delete_file.path]
type = "path"
required = true

[schemas.run_command.command]
type = "string"
required = true
max_len = 4096

[schemas.iot_command.device]
type = "string"
required = true
max_len = 64

[schemas.iot_command.command]
type = "string"
required = true
max_len = 64

[schemas.iot_command.temperature]
type = "number"
min = 5.0
max = 35.0

[schemas.iot_command.brightness]
type = "integer"
min = 0
max = 100

[schemas.notify.message]
type = "string"
required = true
max_len = 1024

[schemas.notify.urgency]
type = "string"
allowed = ["low", "normal", "critical"]

[schemas.web_search.query]
type = "string"
required = true
max_len = 512

[schemas.screenshot.path]
type = "path"
required = true

[schemas.control_volume.level]
type = "integer"
min = 0
max = 100

[schemas.control_volume.action]
type = "string"
allowed = ["mute", "unmute", "toggle"]
"#;

// =============================================================================
// File format
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RuleFile {
    allowed_roots: Vec<String>,
    risk: BTreeMap<String, RiskTier>,
    blacklist: Vec<PatternEntry>,
    escalations: Vec<EscalationEntry>,
    schemas: BTreeMap<String, BTreeMap<String, ParamSpec>>,
}

#[derive(Debug, Deserialize)]
struct PatternEntry {
    name: String,
    pattern: String,
    #[serde(default)]
    kinds: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EscalationEntry {
    name: String,
    kind: String,
    pattern: String,
    tier: RiskTier,
}

// =============================================================================
// Compiled rules
// =============================================================================

/// A compiled deny pattern, optionally scoped to some kinds.
#[derive(Debug, Clone)]
pub struct DenyPattern {
    pub name: String,
    pub regex: Regex,
    /// Empty means the pattern applies to every kind.
    pub kinds: Vec<ActionKind>,
}

impl DenyPattern {
    pub fn matches(&self, action: &Action, normalized: &str) -> bool {
        (self.kinds.is_empty() || self.kinds.contains(&action.kind)) && self.regex.is_match(normalized)
    }
}

/// Raises the risk tier of matching actions of one kind.
#[derive(Debug, Clone)]
pub struct Escalation {
    pub name: String,
    pub kind: ActionKind,
    pub regex: Regex,
    pub tier: RiskTier,
}

/// Outcome of a risk lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RiskAssessment {
    pub tier: RiskTier,
    pub rules_fired: Vec<String>,
}

/// The loaded, read-only policy rule table.
#[derive(Debug, Clone)]
pub struct RuleSet {
    pub risk: BTreeMap<ActionKind, RiskTier>,
    pub blacklist: Vec<DenyPattern>,
    pub escalations: Vec<Escalation>,
    pub schemas: BTreeMap<ActionKind, KindSchema>,
    /// Roots for path parameters whose spec names none.
    pub allowed_roots: Vec<String>,
}

impl RuleSet {
    /// Parse and compile a rule file.
    pub fn from_toml(content: &str) -> Result<Self, PolicyError> {
        let file: RuleFile =
            toml::from_str(content).map_err(|e| PolicyError::InvalidRule(e.to_string()))?;

        let risk = file
            .risk
            .into_iter()
            .map(|(label, tier)| Ok((parse_kind(&label)?, tier)))
            .collect::<Result<BTreeMap<_, _>, PolicyError>>()?;

        let blacklist = file
            .blacklist
            .into_iter()
            .map(|entry| {
                Ok(DenyPattern {
                    regex: compile(&entry.name, &entry.pattern)?,
                    kinds: entry
                        .kinds
                        .iter()
                        .map(|k| parse_kind(k))
                        .collect::<Result<_, _>>()?,
                    name: entry.name,
                })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;

        let escalations = file
            .escalations
            .into_iter()
            .map(|entry| {
                Ok(Escalation {
                    regex: compile(&entry.name, &entry.pattern)?,
                    kind: parse_kind(&entry.kind)?,
                    tier: entry.tier,
                    name: entry.name,
                })
            })
            .collect::<Result<Vec<_>, PolicyError>>()?;

        let schemas = file
            .schemas
            .into_iter()
            .map(|(label, params)| Ok((parse_kind(&label)?, params)))
            .collect::<Result<BTreeMap<_, _>, PolicyError>>()?;

        debug!(
            kinds = risk.len(),
            patterns = blacklist.len(),
            schemas = schemas.len(),
            "Compiled policy rules"
        );

        Ok(Self {
            risk,
            blacklist,
            escalations,
            schemas,
            allowed_roots: file.allowed_roots,
        })
    }

    /// The built-in rule table.
    pub fn builtin() -> Result<Self, PolicyError> {
        Self::from_toml(DEFAULT_RULES)
    }

    pub fn with_allowed_roots(mut self, roots: Vec<String>) -> Self {
        self.allowed_roots = roots;
        self
    }

    /// First deny pattern matching the action, if any.
    pub fn deny_match(&self, action: &Action) -> Option<&DenyPattern> {
        let normalized = action.normalized();
        self.blacklist
            .iter()
            .find(|p| p.matches(action, &normalized))
    }

    /// Risk tier from the table (or the kind's default), raised by escalations.
    pub fn assess(&self, action: &Action) -> RiskAssessment {
        let mut rules_fired = Vec::new();
        let mut tier = match self.risk.get(&action.kind) {
            Some(tier) => {
                rules_fired.push(format!("risk:{}={}", action.kind, tier));
                *tier
            }
            None => {
                rules_fired.push(format!("risk-default:{}={}", action.kind, action.risk_tier));
                action.risk_tier
            }
        };

        let normalized = action.normalized();
        for escalation in self
            .escalations
            .iter()
            .filter(|e| e.kind == action.kind && e.regex.is_match(&normalized))
        {
            if escalation.tier > tier {
                tier = escalation.tier;
                rules_fired.push(format!("escalation:{}={}", escalation.name, tier));
            }
        }

        RiskAssessment { tier, rules_fired }
    }
}

fn parse_kind(label: &str) -> Result<ActionKind, PolicyError> {
    ActionKind::from_label(label)
        .ok_or_else(|| PolicyError::InvalidRule(format!("unknown action kind '{}'", label)))
}

fn compile(name: &str, pattern: &str) -> Result<Regex, PolicyError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| PolicyError::InvalidRule(format!("pattern '{}': {}", name, e)))
}

// =============================================================================
// Sources
// =============================================================================

/// Where the policy engine loads its rules from.
pub trait RuleSource: Send + Sync {
    fn load(&self) -> Result<RuleSet, PolicyError>;

    /// Human-readable origin for logs.
    fn describe(&self) -> String;

    /// Last modification time, for sources that can change underneath us.
    fn modified(&self) -> Option<SystemTime> {
        None
    }
}

/// Rules read from a TOML file on disk.
pub struct FileRuleSource {
    path: PathBuf,
    default_roots: Vec<String>,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            default_roots: Vec::new(),
        }
    }

    /// Roots used when the file itself declares none.
    pub fn with_default_roots(mut self, roots: Vec<String>) -> Self {
        self.default_roots = roots;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RuleSource for FileRuleSource {
    fn load(&self) -> Result<RuleSet, PolicyError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            PolicyError::ConfigUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let mut rules = RuleSet::from_toml(&content).map_err(|e| {
            PolicyError::ConfigUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        if rules.allowed_roots.is_empty() {
            rules.allowed_roots = self.default_roots.clone();
        }
        info!(path = %self.path.display(), "Policy rules loaded");
        Ok(rules)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
    }
}

/// Rules held in memory.
pub struct StaticRuleSource {
    rules: RuleSet,
}

impl StaticRuleSource {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }
}

impl RuleSource for StaticRuleSource {
    fn load(&self) -> Result<RuleSet, PolicyError> {
        Ok(self.rules.clone())
    }

    fn describe(&self) -> String {
        "in-memory rules".to_string()
    }
}

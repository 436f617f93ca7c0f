use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{JarvisError, Result};

/// Top-level configuration for the Jarvis orchestration core.
///
/// Loaded from `~/.jarvis/config.toml` by default. Each section corresponds
/// to one pipeline stage or cross-cutting concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JarvisConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
}

impl JarvisConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: JarvisConfig = toml::from_str(&content)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| JarvisError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory for the audit log and runtime state.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.jarvis/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Reasoning service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    /// Per-call timeout for plan generation.
    pub timeout_secs: u64,
    /// Base URL of an Ollama-compatible `/api/generate` server.
    pub endpoint: Option<String>,
    pub model: String,
    pub temperature: f32,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            endpoint: None,
            model: "llama3.2:latest".to_string(),
            temperature: 0.7,
        }
    }
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Contextual memory store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Query the memory store for context while planning.
    pub enabled: bool,
    /// Number of context snippets to request.
    pub top_k: usize,
    /// Per-call timeout for query and write.
    pub timeout_ms: u64,
    /// Write a summary of each finished request back to the store.
    pub write_back: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: 5,
            timeout_ms: 10_000,
            write_back: true,
        }
    }
}

impl MemoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Policy engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Path to the declarative rule file. Built-in rules are used when unset.
    pub rules_path: Option<String>,
    /// Poll interval for hot-reloading the rule file. Zero disables reloads.
    pub reload_interval_secs: u64,
    /// Whether requests run inside a sandboxed execution context by default.
    pub sandboxed: bool,
    /// Force every request into dry-run mode.
    pub dry_run: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            reload_interval_secs: 30,
            sandboxed: true,
            dry_run: false,
        }
    }
}

/// Action executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Global limit on simultaneously running actions across all plans.
    pub max_concurrent: usize,
    /// Hard per-action timeout.
    pub action_timeout_secs: u64,
    /// Additional attempts allowed for idempotent actions.
    pub retry_bound: u32,
    /// Delay between attempts.
    pub retry_backoff_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            action_timeout_secs: 30,
            retry_bound: 2,
            retry_backoff_ms: 200,
        }
    }
}

impl ExecutorConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Resource ceilings applied to every execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// CPU time ceiling for spawned processes.
    pub cpu_seconds: u64,
    /// Virtual memory ceiling for spawned processes.
    pub memory_mb: u64,
    /// Whether actions may reach the network.
    pub network: bool,
    /// Filesystem roots actions may touch.
    pub allowed_paths: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            cpu_seconds: 10,
            memory_mb: 512,
            network: true,
            allowed_paths: vec!["/tmp/jarvis".to_string()],
        }
    }
}

/// Audit trail settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Persist audit records to `path`. When disabled records stay in memory.
    pub enabled: bool,
    /// JSON Lines audit file. Relative paths resolve against `general.data_dir`.
    pub path: String,
    /// Longest a single append may take before the sink counts as unavailable.
    pub append_timeout_ms: u64,
    /// After a timed-out append, records bypass the sink for this long.
    pub stall_cool_off_secs: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "audit.jsonl".to_string(),
            append_timeout_ms: 2000,
            stall_cool_off_secs: 30,
        }
    }
}

impl AuditConfig {
    pub fn append_timeout(&self) -> Duration {
        Duration::from_millis(self.append_timeout_ms)
    }

    pub fn stall_cool_off(&self) -> Duration {
        Duration::from_secs(self.stall_cool_off_secs)
    }
}

/// Notification delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub max_per_minute: u32,
    /// Deliver through `notify-send` in addition to the log.
    pub desktop: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            max_per_minute: 10,
            desktop: false,
        }
    }
}

/// Web search adapter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Search endpoint to fetch results from. Unset means the adapter only
    /// builds the search URL.
    pub fetch_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            fetch_url: None,
            timeout_secs: 10,
        }
    }
}

impl SearchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Parked confirmation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// How long unconfirmed steps stay parked before they expire.
    pub ttl_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

impl ConfirmationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

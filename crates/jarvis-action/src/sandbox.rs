//! Isolated execution contexts.
//!
//! The isolation technology is pluggable behind [`Sandbox`]. [`TaskSandbox`]
//! is the in-process implementation. Before starting it checks each declared
//! path argument against the allow-list, with symlinks resolved, and refuses
//! network-bound adapters when the network ceiling is off. It then runs the
//! kind's adapter on its own task and aborts that task on terminate.
//!
//! Process adapters apply the CPU and memory ceilings themselves and are
//! killed when their task is dropped. A shell command's own file accesses
//! are not inspected: only its working directory is checked here, and it is
//! placed in a fresh network namespace when the network ceiling is off.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

use jarvis_core::config::SandboxConfig;

use crate::error::{ActionError, ExecutionError};
use crate::handler::{ActionRegistry, ExecutionContext};
use crate::policy::schema::{normalize_path, path_within_roots};
use crate::types::{Action, ActionKind};

/// Ceilings applied to one execution context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_seconds: u64,
    pub memory_mb: u64,
    pub network: bool,
    pub allowed_paths: Vec<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from(&SandboxConfig::default())
    }
}

impl From<&SandboxConfig> for ResourceLimits {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            cpu_seconds: config.cpu_seconds,
            memory_mb: config.memory_mb,
            network: config.network,
            allowed_paths: config.allowed_paths.clone(),
        }
    }
}

/// Reference to a started execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    pub id: Uuid,
    pub kind: ActionKind,
    pub started_at: DateTime<Utc>,
}

/// A resource-bounded environment actions run inside.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Start executing `action` under `ctx.limits`.
    async fn start(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<SandboxHandle, ExecutionError>;

    /// Wait for the execution to finish and return its output.
    async fn wait(&self, handle: &SandboxHandle) -> Result<serde_json::Value, ExecutionError>;

    /// Forcibly stop the execution. Unknown or finished handles are ignored.
    async fn terminate(&self, handle: &SandboxHandle);
}

type AdapterTask = JoinHandle<Result<serde_json::Value, ActionError>>;

/// In-process sandbox running each adapter on its own tokio task.
pub struct TaskSandbox {
    registry: Arc<ActionRegistry>,
    running: Mutex<HashMap<Uuid, AdapterTask>>,
    aborts: Mutex<HashMap<Uuid, AbortHandle>>,
}

impl TaskSandbox {
    pub fn new(registry: Arc<ActionRegistry>) -> Self {
        Self {
            registry,
            running: Mutex::new(HashMap::new()),
            aborts: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    /// Number of executions started and not yet waited on or terminated.
    pub fn active_count(&self) -> usize {
        self.aborts.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Check every path argument against the allow-list, both as written
    /// and with symlinks resolved.
    async fn check_paths(
        action: &Action,
        arguments: &[&str],
        limits: &ResourceLimits,
    ) -> Result<(), ExecutionError> {
        for name in arguments {
            let Some(raw) = action.str_arg(name) else {
                continue;
            };
            let allowed = match normalize_path(raw) {
                Some(path) if path_within_roots(&path, &limits.allowed_paths) => {
                    match resolve_existing(&path).await {
                        Some(real) => within_resolved_roots(&real, &limits.allowed_paths).await,
                        None => false,
                    }
                }
                _ => false,
            };
            if !allowed {
                return Err(ExecutionError::PathDenied(raw.to_string()));
            }
        }
        Ok(())
    }
}

/// Canonicalize the longest existing prefix of an absolute, normalized path
/// and re-append the components that do not exist yet.
///
/// Returns `None` when a missing component is itself a dangling symlink.
async fn resolve_existing(path: &Path) -> Option<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut missing: Vec<OsString> = Vec::new();
    loop {
        if let Ok(real) = tokio::fs::canonicalize(&existing).await {
            let mut out = real;
            for part in missing.iter().rev() {
                out.push(part);
            }
            return Some(out);
        }
        if tokio::fs::symlink_metadata(&existing).await.is_ok() {
            return None;
        }
        let name = existing.file_name()?.to_os_string();
        let parent = existing.parent()?.to_path_buf();
        missing.push(name);
        existing = parent;
    }
}

async fn within_resolved_roots(path: &Path, roots: &[String]) -> bool {
    for root in roots {
        let Some(root) = normalize_path(root) else {
            continue;
        };
        let resolved = resolve_existing(&root).await;
        if path.starts_with(resolved.as_deref().unwrap_or(&root)) {
            return true;
        }
    }
    false
}

fn lock_error<T>(e: std::sync::PoisonError<T>) -> ExecutionError {
    ExecutionError::SandboxStartup(format!("Lock poisoned: {}", e))
}

#[async_trait]
impl Sandbox for TaskSandbox {
    async fn start(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<SandboxHandle, ExecutionError> {
        let handler = self
            .registry
            .get(action.kind)
            .ok_or(ExecutionError::HandlerMissing(action.kind))?;

        if handler.needs_network() && !ctx.limits.network {
            return Err(ExecutionError::NetworkDenied(action.kind));
        }
        Self::check_paths(action, handler.path_arguments(), &ctx.limits).await?;

        let handle = SandboxHandle {
            id: Uuid::new_v4(),
            kind: action.kind,
            started_at: Utc::now(),
        };

        let task_action = action.clone();
        let task_ctx = ctx.clone();
        let task = tokio::spawn(async move { handler.execute(&task_action, &task_ctx).await });

        self.aborts
            .lock()
            .map_err(lock_error)?
            .insert(handle.id, task.abort_handle());
        self.running
            .lock()
            .map_err(lock_error)?
            .insert(handle.id, task);

        tracing::debug!(sandbox_id = %handle.id, kind = %action.kind, index = ctx.index, "Execution context started");
        Ok(handle)
    }

    async fn wait(&self, handle: &SandboxHandle) -> Result<serde_json::Value, ExecutionError> {
        let task = self
            .running
            .lock()
            .map_err(|e| ExecutionError::Failure(format!("Lock poisoned: {}", e)))?
            .remove(&handle.id)
            .ok_or_else(|| {
                ExecutionError::Failure(format!("Unknown execution context: {}", handle.id))
            })?;

        let joined = task.await;
        if let Ok(mut aborts) = self.aborts.lock() {
            aborts.remove(&handle.id);
        }

        match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.into()),
            Err(e) if e.is_cancelled() => {
                Err(ExecutionError::Failure("execution context terminated".to_string()))
            }
            Err(e) => Err(ExecutionError::Failure(format!("adapter panicked: {}", e))),
        }
    }

    async fn terminate(&self, handle: &SandboxHandle) {
        if let Ok(mut aborts) = self.aborts.lock() {
            if let Some(abort) = aborts.remove(&handle.id) {
                abort.abort();
                tracing::warn!(sandbox_id = %handle.id, kind = %handle.kind, "Execution context terminated");
            }
        }
        if let Ok(mut running) = self.running.lock() {
            if let Some(task) = running.remove(&handle.id) {
                task.abort();
            }
        }
    }
}

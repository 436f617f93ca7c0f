//! Shell command adapter.
//!
//! Runs the command through `sh -c` with CPU and virtual-memory ceilings
//! applied via `ulimit`. With the network ceiling off the shell is started
//! under `unshare` in a fresh user and network namespace, leaving only a
//! down loopback. If `unshare` is missing the command fails rather than
//! running with network access.
//!
//! The child is killed if the execution is dropped, which is how the
//! sandbox enforces its timeout.

use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::ActionError;
use crate::handler::{required_str, ActionHandler, ExecutionContext};
use crate::sandbox::ResourceLimits;
use crate::types::{Action, ActionKind};

/// Captured stdout/stderr is truncated to this many bytes.
const MAX_OUTPUT_BYTES: usize = 64 * 1024;

/// Prefix that detaches the shell from the host network.
const NETWORK_ISOLATION: &[&str] = &["unshare", "--user", "--map-root-user", "--net"];

pub struct ShellCommandHandler {
    shell: String,
}

impl ShellCommandHandler {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Command line with resource ceilings prepended.
    pub fn wrap(command: &str, limits: &ResourceLimits) -> String {
        let mut prefix = String::new();
        if limits.cpu_seconds > 0 {
            prefix.push_str(&format!("ulimit -t {}; ", limits.cpu_seconds));
        }
        if limits.memory_mb > 0 {
            prefix.push_str(&format!("ulimit -v {}; ", limits.memory_mb * 1024));
        }
        format!("{}{}", prefix, command)
    }

    /// Program and arguments that run `script` under `limits`.
    pub fn argv(&self, script: &str, limits: &ResourceLimits) -> Vec<String> {
        let mut argv: Vec<String> = if limits.network {
            Vec::new()
        } else {
            NETWORK_ISOLATION.iter().map(|s| s.to_string()).collect()
        };
        argv.extend([self.shell.clone(), "-c".to_string(), script.to_string()]);
        argv
    }
}

impl Default for ShellCommandHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn truncated(bytes: &[u8]) -> String {
    let end = bytes.len().min(MAX_OUTPUT_BYTES);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[async_trait]
impl ActionHandler for ShellCommandHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::RunCommand
    }

    async fn execute(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let command = required_str(action, "command")?;
        let script = Self::wrap(command, &ctx.limits);
        let argv = self.argv(&script, &ctx.limits);
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ActionError::InvalidPayload("empty command line".to_string()))?;

        let mut process = Command::new(program);
        process.args(args).stdin(Stdio::null()).kill_on_drop(true);
        if let Some(cwd) = action.str_arg("cwd") {
            process.current_dir(cwd);
        }

        tracing::info!(
            command = %command,
            index = ctx.index,
            network = ctx.limits.network,
            "Running command"
        );
        let output = process.output().await?;

        let stdout = truncated(&output.stdout);
        let stderr = truncated(&output.stderr);
        if !output.status.success() {
            return Err(ActionError::HandlerFailed(format!(
                "command exited with {}: {}",
                output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr.trim()
            )));
        }

        Ok(json!({
            "exit_code": output.status.code(),
            "stdout": stdout,
            "stderr": stderr,
        }))
    }

    fn describe(&self, action: &Action) -> String {
        format!(
            "Execute command: {}",
            action.str_arg("command").unwrap_or("<no command>")
        )
    }

    fn path_arguments(&self) -> &'static [&'static str] {
        &["cwd"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::{action, ctx};

    #[tokio::test]
    async fn test_shell_command_captures_stdout() {
        let a = action(ActionKind::RunCommand, &[("command", json!("echo hello"))]);
        let out = ShellCommandHandler::new().execute(&a, &ctx()).await.unwrap();
        assert_eq!(out["stdout"], "hello\n");
        assert_eq!(out["exit_code"], 0);
    }

    #[tokio::test]
    async fn test_shell_command_nonzero_exit_fails() {
        let a = action(
            ActionKind::RunCommand,
            &[("command", json!("echo broken >&2; exit 3"))],
        );
        let err = ShellCommandHandler::new()
            .execute(&a, &ctx())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exited with 3"), "{msg}");
        assert!(msg.contains("broken"), "{msg}");
    }

    #[tokio::test]
    async fn test_shell_command_empty_command() {
        let a = action(ActionKind::RunCommand, &[("command", json!(""))]);
        let err = ShellCommandHandler::new()
            .execute(&a, &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidPayload(_)));
    }

    #[test]
    fn test_wrap_applies_limits() {
        let limits = ResourceLimits {
            cpu_seconds: 5,
            memory_mb: 256,
            ..ResourceLimits::default()
        };
        assert_eq!(
            ShellCommandHandler::wrap("ls", &limits),
            "ulimit -t 5; ulimit -v 262144; ls"
        );

        let unlimited = ResourceLimits {
            cpu_seconds: 0,
            memory_mb: 0,
            ..ResourceLimits::default()
        };
        assert_eq!(ShellCommandHandler::wrap("ls", &unlimited), "ls");
    }

    #[test]
    fn test_network_off_runs_in_fresh_namespace() {
        let handler = ShellCommandHandler::new();
        let offline = ResourceLimits {
            network: false,
            ..ResourceLimits::default()
        };
        assert_eq!(
            handler.argv("curl example.com", &offline),
            vec!["unshare", "--user", "--map-root-user", "--net", "sh", "-c", "curl example.com"]
        );

        let online = ResourceLimits {
            network: true,
            ..ResourceLimits::default()
        };
        assert_eq!(handler.argv("ls", &online), vec!["sh", "-c", "ls"]);
    }

    #[test]
    fn test_shell_command_describe() {
        let a = action(ActionKind::RunCommand, &[("command", json!("echo hello"))]);
        assert_eq!(
            ShellCommandHandler::new().describe(&a),
            "Execute command: echo hello"
        );
    }
}

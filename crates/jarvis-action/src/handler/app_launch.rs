//! Application launch and close adapters.

use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::ActionError;
use crate::handler::{required_str, ActionHandler, ExecutionContext};
use crate::types::{Action, ActionKind};

/// Application names are bare program names or http(s) URLs.
fn validate_name(name: &str) -> Result<(), ActionError> {
    if name.starts_with("http://") || name.starts_with("https://") {
        return Ok(());
    }
    if name.contains('/') || name.chars().any(char::is_whitespace) || name.starts_with('-') {
        return Err(ActionError::InvalidPayload(format!(
            "Application name must be a bare program name, got: {}",
            name
        )));
    }
    Ok(())
}

/// Starts an application detached from the pipeline.
pub struct LaunchApplicationHandler;

#[async_trait]
impl ActionHandler for LaunchApplicationHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::LaunchApplication
    }

    async fn execute(
        &self,
        action: &Action,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let name = required_str(action, "name")?;
        validate_name(name)?;

        let mut command = if name.starts_with("http") {
            let mut c = Command::new("xdg-open");
            c.arg(name);
            c
        } else {
            Command::new(name)
        };

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        tracing::info!(application = %name, pid = ?child.id(), "Application launched");
        Ok(json!({ "application": name, "pid": child.id() }))
    }

    fn describe(&self, action: &Action) -> String {
        format!(
            "Launch application: {}",
            action.str_arg("name").unwrap_or("<no name>")
        )
    }
}

/// Terminates running instances of an application by exact process name.
pub struct CloseApplicationHandler;

#[async_trait]
impl ActionHandler for CloseApplicationHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::CloseApplication
    }

    async fn execute(
        &self,
        action: &Action,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let name = required_str(action, "name")?;
        validate_name(name)?;

        let output = Command::new("pkill")
            .arg("-x")
            .arg(name)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        // pkill exits 1 when nothing matched; closing is idempotent.
        match output.status.code() {
            Some(0) => {
                tracing::info!(application = %name, "Application closed");
                Ok(json!({ "application": name, "closed": true }))
            }
            Some(1) => Ok(json!({ "application": name, "closed": false })),
            _ => Err(ActionError::HandlerFailed(format!(
                "pkill failed for {}: {}",
                name,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }

    fn describe(&self, action: &Action) -> String {
        format!(
            "Close application: {}",
            action.str_arg("name").unwrap_or("<no name>")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::{action, ctx};

    #[tokio::test]
    async fn test_launch_rejects_paths_and_flags() {
        for name in ["/bin/sh", "../evil", "rm -rf", "--help"] {
            let a = action(ActionKind::LaunchApplication, &[("name", json!(name))]);
            let err = LaunchApplicationHandler.execute(&a, &ctx()).await.unwrap_err();
            assert!(matches!(err, ActionError::InvalidPayload(_)), "{name}");
        }
    }

    #[tokio::test]
    async fn test_launch_missing_name() {
        let a = action(ActionKind::LaunchApplication, &[]);
        let err = LaunchApplicationHandler.execute(&a, &ctx()).await.unwrap_err();
        assert!(matches!(err, ActionError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_launch_unknown_program_is_io_error() {
        let a = action(
            ActionKind::LaunchApplication,
            &[("name", json!("jarvis-no-such-program-42"))],
        );
        let err = LaunchApplicationHandler.execute(&a, &ctx()).await.unwrap_err();
        assert!(matches!(err, ActionError::Io(_)));
    }

    #[test]
    fn test_describe() {
        let a = action(ActionKind::LaunchApplication, &[("name", json!("notes"))]);
        assert_eq!(
            LaunchApplicationHandler.describe(&a),
            "Launch application: notes"
        );
        let a = action(ActionKind::CloseApplication, &[]);
        assert_eq!(
            CloseApplicationHandler.describe(&a),
            "Close application: <no name>"
        );
    }

    #[test]
    fn test_kinds() {
        assert_eq!(LaunchApplicationHandler.kind(), ActionKind::LaunchApplication);
        assert_eq!(CloseApplicationHandler.kind(), ActionKind::CloseApplication);
    }
}

//! Screen capture and audio volume adapters.
//!
//! Screenshots go through `scrot` and volume through `pactl` on the default
//! sink. Both run with `kill_on_drop` so the sandbox timeout applies.

use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::ActionError;
use crate::handler::{required_str, ActionHandler, ExecutionContext};
use crate::types::{Action, ActionKind};

const DEFAULT_SINK: &str = "@DEFAULT_SINK@";

async fn run_tool(program: &str, args: &[String]) -> Result<(), ActionError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ActionError::HandlerFailed(format!(
            "{} exited with {}: {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Captures the screen to an image file under the allowed roots.
pub struct ScreenshotHandler {
    tool: String,
}

impl ScreenshotHandler {
    pub fn new() -> Self {
        Self {
            tool: "scrot".to_string(),
        }
    }
}

impl Default for ScreenshotHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for ScreenshotHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Screenshot
    }

    async fn execute(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let path = required_str(action, "path")?;
        if !Path::new(path).is_absolute() {
            return Err(ActionError::InvalidPayload(format!(
                "screenshot path must be absolute, got: {}",
                path
            )));
        }
        if let Some(parent) = Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        run_tool(&self.tool, &["--overwrite".to_string(), path.to_string()]).await?;
        tracing::info!(path = %path, index = ctx.index, "Screenshot saved");
        Ok(json!({ "path": path }))
    }

    fn describe(&self, action: &Action) -> String {
        format!(
            "Take screenshot to: {}",
            action.str_arg("path").unwrap_or("<no path>")
        )
    }

    fn path_arguments(&self) -> &'static [&'static str] {
        &["path"]
    }
}

/// What a volume action asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeChange {
    Level(u8),
    Mute,
    Unmute,
    ToggleMute,
}

impl VolumeChange {
    /// Read the change from `level` (0-100) or `action` (mute, unmute, toggle).
    pub fn from_action(action: &Action) -> Result<Self, ActionError> {
        let level = action.arguments.get("level").filter(|v| !v.is_null());
        let verb = action.str_arg("action");
        match (level, verb) {
            (Some(_), Some(_)) => Err(ActionError::InvalidPayload(
                "control_volume takes either 'level' or 'action', not both".to_string(),
            )),
            (Some(value), None) => {
                let level = value
                    .as_u64()
                    .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
                    .filter(|l| *l <= 100)
                    .ok_or_else(|| {
                        ActionError::InvalidPayload(format!(
                            "volume level must be an integer 0-100, got: {}",
                            value
                        ))
                    })?;
                Ok(VolumeChange::Level(level as u8))
            }
            (None, Some(verb)) => match verb.trim().to_lowercase().as_str() {
                "mute" => Ok(VolumeChange::Mute),
                "unmute" => Ok(VolumeChange::Unmute),
                "toggle" => Ok(VolumeChange::ToggleMute),
                other => Err(ActionError::InvalidPayload(format!(
                    "unknown volume action: {}",
                    other
                ))),
            },
            (None, None) => Err(ActionError::InvalidPayload(
                "control_volume requires a 'level' or an 'action' argument".to_string(),
            )),
        }
    }

    /// `pactl` arguments applying the change to the default sink.
    pub fn pactl_args(&self) -> Vec<String> {
        let (command, value) = match self {
            VolumeChange::Level(level) => ("set-sink-volume", format!("{}%", level)),
            VolumeChange::Mute => ("set-sink-mute", "1".to_string()),
            VolumeChange::Unmute => ("set-sink-mute", "0".to_string()),
            VolumeChange::ToggleMute => ("set-sink-mute", "toggle".to_string()),
        };
        vec![command.to_string(), DEFAULT_SINK.to_string(), value]
    }
}

/// Sets the output volume or mute state.
pub struct VolumeHandler;

#[async_trait]
impl ActionHandler for VolumeHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::ControlVolume
    }

    async fn execute(
        &self,
        action: &Action,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let change = VolumeChange::from_action(action)?;
        run_tool("pactl", &change.pactl_args()).await?;
        tracing::info!(change = ?change, "Volume changed");
        Ok(match change {
            VolumeChange::Level(level) => json!({ "level": level }),
            VolumeChange::Mute => json!({ "muted": true }),
            VolumeChange::Unmute => json!({ "muted": false }),
            VolumeChange::ToggleMute => json!({ "muted": "toggled" }),
        })
    }

    fn describe(&self, action: &Action) -> String {
        match VolumeChange::from_action(action) {
            Ok(VolumeChange::Level(level)) => format!("Set volume to {}%", level),
            Ok(VolumeChange::Mute) => "Mute audio".to_string(),
            Ok(VolumeChange::Unmute) => "Unmute audio".to_string(),
            Ok(VolumeChange::ToggleMute) => "Toggle mute".to_string(),
            Err(_) => "Change volume: <invalid>".to_string(),
        }
    }
}

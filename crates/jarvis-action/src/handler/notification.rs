//! Notification adapter.
//!
//! Delivers user notifications, rate limited to prevent flooding. Desktop
//! delivery goes through `notify-send` when enabled.

use async_trait::async_trait;
use serde_json::json;
use std::process::Stdio;
use tokio::process::Command;

use crate::confirmation::NotificationRateLimiter;
use crate::error::ActionError;
use crate::handler::{required_str, ActionHandler, ExecutionContext};
use crate::types::{Action, ActionKind};

pub struct NotificationHandler {
    limiter: NotificationRateLimiter,
    desktop: bool,
}

impl NotificationHandler {
    pub fn new(max_per_minute: u32, desktop: bool) -> Self {
        Self {
            limiter: NotificationRateLimiter::new(max_per_minute),
            desktop,
        }
    }
}

/// `notify-send` arguments. Title and message follow `--` so text starting
/// with a dash is never read as an option.
fn desktop_args(title: &str, message: &str, urgency: &str) -> Vec<String> {
    vec![
        format!("--urgency={}", urgency),
        "--".to_string(),
        title.to_string(),
        message.to_string(),
    ]
}

#[async_trait]
impl ActionHandler for NotificationHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Notify
    }

    async fn execute(
        &self,
        action: &Action,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let message = required_str(action, "message")?;
        let title = action.str_arg("title").unwrap_or("JARVIS");
        let urgency = action.str_arg("urgency").unwrap_or("normal");

        if !self.limiter.try_acquire() {
            return Err(ActionError::RateLimited(ActionKind::Notify));
        }

        tracing::info!(title = %title, message = %message, urgency = %urgency, "Notification shown");

        if self.desktop {
            let status = Command::new("notify-send")
                .args(desktop_args(title, message, urgency))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status()
                .await?;
            if !status.success() {
                return Err(ActionError::HandlerFailed(format!(
                    "notify-send exited with {}",
                    status
                )));
            }
        }

        Ok(json!({ "title": title, "message": message, "desktop": self.desktop }))
    }

    fn describe(&self, action: &Action) -> String {
        format!(
            "Show notification: {}",
            action.str_arg("message").unwrap_or("<no message>")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::{action, ctx};

    #[tokio::test]
    async fn test_notification_valid_payload() {
        let handler = NotificationHandler::new(10, false);
        let a = action(
            ActionKind::Notify,
            &[("title", json!("Meeting")), ("message", json!("Team sync in 5 min"))],
        );
        let out = handler.execute(&a, &ctx()).await.unwrap();
        assert_eq!(out["title"], "Meeting");
        assert_eq!(out["desktop"], false);
    }

    #[tokio::test]
    async fn test_notification_default_title() {
        let handler = NotificationHandler::new(10, false);
        let a = action(ActionKind::Notify, &[("message", json!("Alert"))]);
        let out = handler.execute(&a, &ctx()).await.unwrap();
        assert_eq!(out["title"], "JARVIS");
    }

    #[tokio::test]
    async fn test_notification_rate_limited() {
        let handler = NotificationHandler::new(2, false);
        let a = action(ActionKind::Notify, &[("message", json!("ping"))]);
        assert!(handler.execute(&a, &ctx()).await.is_ok());
        assert!(handler.execute(&a, &ctx()).await.is_ok());
        assert!(matches!(
            handler.execute(&a, &ctx()).await,
            Err(ActionError::RateLimited(ActionKind::Notify))
        ));
    }

    #[tokio::test]
    async fn test_invalid_payload_does_not_consume_token() {
        let handler = NotificationHandler::new(1, false);
        let empty = action(ActionKind::Notify, &[("message", json!(""))]);
        assert!(handler.execute(&empty, &ctx()).await.is_err());
        let ok = action(ActionKind::Notify, &[("message", json!("hi"))]);
        assert!(handler.execute(&ok, &ctx()).await.is_ok());
    }

    #[test]
    fn test_dash_prefixed_text_is_not_an_option() {
        let args = desktop_args("--app-name=evil", "-u critical", "low");
        assert_eq!(args, vec!["--urgency=low", "--", "--app-name=evil", "-u critical"]);
    }

    #[test]
    fn test_notification_describe() {
        let handler = NotificationHandler::new(10, false);
        let a = action(ActionKind::Notify, &[("message", json!("hello"))]);
        assert_eq!(handler.describe(&a), "Show notification: hello");
    }
}

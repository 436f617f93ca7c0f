//! IoT command adapter.
//!
//! Device control goes through an [`IotBridge`]; the concrete bridge (MQTT,
//! Home Assistant, vendor hub) is an external collaborator.

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

use crate::error::ActionError;
use crate::handler::{required_str, ActionHandler, ExecutionContext};
use crate::types::{Action, ActionKind, Arguments};

/// Transport to connected devices.
#[async_trait]
pub trait IotBridge: Send + Sync {
    async fn send(
        &self,
        device: &str,
        command: &str,
        params: &Arguments,
    ) -> Result<serde_json::Value, ActionError>;
}

/// Bridge that only logs commands. Used when no hub is configured.
pub struct LoggingBridge;

#[async_trait]
impl IotBridge for LoggingBridge {
    async fn send(
        &self,
        device: &str,
        command: &str,
        params: &Arguments,
    ) -> Result<serde_json::Value, ActionError> {
        tracing::info!(device = %device, command = %command, params = ?params, "IoT command sent");
        Ok(json!({ "device": device, "command": command, "status": "sent" }))
    }
}

pub struct IotCommandHandler {
    bridge: Arc<dyn IotBridge>,
}

impl IotCommandHandler {
    pub fn new(bridge: Arc<dyn IotBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl ActionHandler for IotCommandHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::IotCommand
    }

    async fn execute(
        &self,
        action: &Action,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let device = required_str(action, "device")?;
        let command = required_str(action, "command")?;
        let params: Arguments = action
            .arguments
            .iter()
            .filter(|(k, _)| k.as_str() != "device" && k.as_str() != "command")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.bridge.send(device, command, &params).await
    }

    fn describe(&self, action: &Action) -> String {
        format!(
            "Send '{}' to device {}",
            action.str_arg("command").unwrap_or("<no command>"),
            action.str_arg("device").unwrap_or("<no device>")
        )
    }

    fn needs_network(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::{action, ctx};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBridge {
        sent: Mutex<Vec<(String, String, Arguments)>>,
    }

    #[async_trait]
    impl IotBridge for RecordingBridge {
        async fn send(
            &self,
            device: &str,
            command: &str,
            params: &Arguments,
        ) -> Result<serde_json::Value, ActionError> {
            self.sent
                .lock()
                .unwrap()
                .push((device.to_string(), command.to_string(), params.clone()));
            Ok(json!({"ok": true}))
        }
    }

    #[tokio::test]
    async fn test_iot_forwards_params_to_bridge() {
        let bridge = Arc::new(RecordingBridge::default());
        let handler = IotCommandHandler::new(bridge.clone());
        let a = action(
            ActionKind::IotCommand,
            &[
                ("device", json!("thermostat")),
                ("command", json!("set_temperature")),
                ("temperature", json!(21)),
            ],
        );
        handler.execute(&a, &ctx()).await.unwrap();

        let sent = bridge.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "thermostat");
        assert_eq!(sent[0].1, "set_temperature");
        assert_eq!(sent[0].2.len(), 1);
        assert_eq!(sent[0].2["temperature"], json!(21));
    }

    #[tokio::test]
    async fn test_logging_bridge() {
        let handler = IotCommandHandler::new(Arc::new(LoggingBridge));
        let a = action(
            ActionKind::IotCommand,
            &[("device", json!("kitchen")), ("command", json!("toggle_light"))],
        );
        let out = handler.execute(&a, &ctx()).await.unwrap();
        assert_eq!(out["status"], "sent");
    }

    #[tokio::test]
    async fn test_iot_missing_device() {
        let handler = IotCommandHandler::new(Arc::new(LoggingBridge));
        let a = action(ActionKind::IotCommand, &[("command", json!("toggle_light"))]);
        assert!(matches!(
            handler.execute(&a, &ctx()).await,
            Err(ActionError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_iot_describe_and_network() {
        let handler = IotCommandHandler::new(Arc::new(LoggingBridge));
        let a = action(
            ActionKind::IotCommand,
            &[("device", json!("front_door")), ("command", json!("unlock_door"))],
        );
        assert_eq!(handler.describe(&a), "Send 'unlock_door' to device front_door");
        assert!(handler.needs_network());
    }
}

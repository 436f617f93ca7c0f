//! Action adapter registry and trait definition.
//!
//! Defines the `ActionHandler` async trait and the registry that maps each
//! action kind to exactly one execution adapter.

pub mod app_launch;
pub mod desktop;
pub mod file_ops;
pub mod iot;
pub mod notification;
pub mod shell_command;
pub mod web_search;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use jarvis_core::JarvisConfig;

use crate::error::ActionError;
use crate::sandbox::ResourceLimits;
use crate::types::{Action, ActionKind};

pub use app_launch::{CloseApplicationHandler, LaunchApplicationHandler};
pub use desktop::{ScreenshotHandler, VolumeChange, VolumeHandler};
pub use file_ops::{DeleteFileHandler, ReadFileHandler, WriteFileHandler};
pub use iot::{IotBridge, IotCommandHandler, LoggingBridge};
pub use notification::NotificationHandler;
pub use shell_command::ShellCommandHandler;
pub use web_search::WebSearchHandler;

/// What an adapter knows about the execution it is part of.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request_id: Uuid,
    pub plan_id: Uuid,
    pub index: usize,
    pub attempt: u32,
    pub limits: ResourceLimits,
}

/// A capability-specific execution adapter.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> ActionKind;

    async fn execute(
        &self,
        action: &Action,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError>;

    /// One-line human description of what executing `action` would do.
    fn describe(&self, action: &Action) -> String;

    /// Whether this adapter reaches the network.
    fn needs_network(&self) -> bool {
        false
    }

    /// Arguments holding filesystem paths, checked against the allow-list.
    fn path_arguments(&self) -> &'static [&'static str] {
        &[]
    }
}

/// One adapter per action kind.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapter for every kind.
    pub fn with_defaults(config: &JarvisConfig) -> Self {
        let mut registry = Self::new();
        registry.register_defaults(config);
        registry
    }

    pub fn register_defaults(&mut self, config: &JarvisConfig) {
        self.register(Arc::new(LaunchApplicationHandler));
        self.register(Arc::new(CloseApplicationHandler));
        self.register(Arc::new(ReadFileHandler));
        self.register(Arc::new(WriteFileHandler));
        self.register(Arc::new(DeleteFileHandler));
        self.register(Arc::new(ShellCommandHandler::new()));
        self.register(Arc::new(IotCommandHandler::new(Arc::new(LoggingBridge))));
        self.register(Arc::new(NotificationHandler::new(
            config.notifications.max_per_minute,
            config.notifications.desktop,
        )));
        self.register(Arc::new(match &config.search.fetch_url {
            Some(url) => WebSearchHandler::fetching(url.clone(), config.search.timeout()),
            None => WebSearchHandler::new(),
        }));
        self.register(Arc::new(ScreenshotHandler::new()));
        self.register(Arc::new(VolumeHandler));
    }

    /// Register an adapter, replacing any existing one for its kind.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<ActionKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Required string argument, or `InvalidPayload`.
pub(crate) fn required_str<'a>(action: &'a Action, name: &str) -> Result<&'a str, ActionError> {
    match action.str_arg(name) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ActionError::InvalidPayload(format!(
            "{} requires a non-empty '{}' argument",
            action.kind, name
        ))),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::Arguments;

    pub fn action(kind: ActionKind, pairs: &[(&str, serde_json::Value)]) -> Action {
        let args: Arguments = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        Action::new(kind, args)
    }

    pub fn ctx() -> ExecutionContext {
        ExecutionContext {
            request_id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            index: 0,
            attempt: 1,
            limits: ResourceLimits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::action;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults_cover_every_kind() {
        let registry = ActionRegistry::with_defaults(&JarvisConfig::default());
        assert_eq!(registry.kinds(), ActionKind::ALL.to_vec());
        for kind in ActionKind::ALL {
            assert_eq!(registry.get(kind).unwrap().kind(), kind);
        }
    }

    #[test]
    fn test_register_replaces_existing() {
        let mut registry = ActionRegistry::with_defaults(&JarvisConfig::default());
        registry.register(Arc::new(IotCommandHandler::new(Arc::new(LoggingBridge))));
        assert_eq!(registry.kinds().len(), ActionKind::ALL.len());
    }

    #[tokio::test]
    async fn test_configured_search_endpoint_is_fetched() {
        let mut config = JarvisConfig::default();
        config.search.fetch_url = Some("http://127.0.0.1:9/".to_string());
        config.search.timeout_secs = 1;
        let registry = ActionRegistry::with_defaults(&config);
        let handler = registry.get(ActionKind::WebSearch).unwrap();

        let a = action(ActionKind::WebSearch, &[("query", json!("rust"))]);
        let err = handler.execute(&a, &test_support::ctx()).await.unwrap_err();
        assert!(err.to_string().contains("Search request failed"), "{err}");

        let plain = ActionRegistry::with_defaults(&JarvisConfig::default());
        let out = plain
            .get(ActionKind::WebSearch)
            .unwrap()
            .execute(&a, &test_support::ctx())
            .await
            .unwrap();
        assert!(out["url"].as_str().unwrap().contains("q=rust"));
    }

    #[test]
    fn test_empty_registry() {
        assert!(ActionRegistry::new().get(ActionKind::Notify).is_none());
    }

    #[test]
    fn test_required_str() {
        let a = action(ActionKind::Notify, &[("message", json!("  "))]);
        assert!(matches!(
            required_str(&a, "message"),
            Err(ActionError::InvalidPayload(_))
        ));
        let a = action(ActionKind::Notify, &[("message", json!("hi"))]);
        assert_eq!(required_str(&a, "message").unwrap(), "hi");
    }
}

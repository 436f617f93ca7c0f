//! File read, write and delete adapters.
//!
//! Paths have already been checked against the sandbox allow-list before an
//! adapter runs.

use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;

use crate::error::ActionError;
use crate::handler::{required_str, ActionHandler, ExecutionContext};
use crate::types::{Action, ActionKind};

/// Largest file the read adapter returns inline.
const MAX_READ_BYTES: u64 = 1024 * 1024;

pub struct ReadFileHandler;

#[async_trait]
impl ActionHandler for ReadFileHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::ReadFile
    }

    async fn execute(
        &self,
        action: &Action,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let path = required_str(action, "path")?;
        let size = tokio::fs::metadata(path).await?.len();
        if size > MAX_READ_BYTES {
            return Err(ActionError::HandlerFailed(format!(
                "{} is {} bytes, larger than the {} byte read limit",
                path, size, MAX_READ_BYTES
            )));
        }
        let content = tokio::fs::read_to_string(path).await?;
        Ok(json!({ "path": path, "bytes": content.len(), "content": content }))
    }

    fn describe(&self, action: &Action) -> String {
        format!("Read file: {}", action.str_arg("path").unwrap_or("<no path>"))
    }

    fn path_arguments(&self) -> &'static [&'static str] {
        &["path"]
    }
}

pub struct WriteFileHandler;

#[async_trait]
impl ActionHandler for WriteFileHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::WriteFile
    }

    async fn execute(
        &self,
        action: &Action,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let path = required_str(action, "path")?;
        let content = action.str_arg("content").ok_or_else(|| {
            ActionError::InvalidPayload("write_file requires a string 'content' argument".to_string())
        })?;
        let append = action
            .arguments
            .get("append")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if let Some(parent) = std::path::Path::new(path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;

        tracing::info!(path = %path, bytes = content.len(), append, "File written");
        Ok(json!({ "path": path, "bytes": content.len(), "append": append }))
    }

    fn describe(&self, action: &Action) -> String {
        format!("Write file: {}", action.str_arg("path").unwrap_or("<no path>"))
    }

    fn path_arguments(&self) -> &'static [&'static str] {
        &["path"]
    }
}

pub struct DeleteFileHandler;

#[async_trait]
impl ActionHandler for DeleteFileHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::DeleteFile
    }

    async fn execute(
        &self,
        action: &Action,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let path = required_str(action, "path")?;
        let metadata = tokio::fs::symlink_metadata(path).await?;
        if metadata.is_dir() {
            return Err(ActionError::InvalidPayload(format!(
                "{} is a directory; only files can be deleted",
                path
            )));
        }
        tokio::fs::remove_file(path).await?;
        tracing::info!(path = %path, "File deleted");
        Ok(json!({ "path": path, "deleted": true }))
    }

    fn describe(&self, action: &Action) -> String {
        format!("Delete file: {}", action.str_arg("path").unwrap_or("<no path>"))
    }

    fn path_arguments(&self) -> &'static [&'static str] {
        &["path"]
    }
}

//! Web search adapter.
//!
//! Builds the search URL for a query. With a fetch endpoint configured the
//! adapter also performs the HTTP request and returns the response summary.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::error::ActionError;
use crate::handler::{required_str, ActionHandler, ExecutionContext};
use crate::types::{Action, ActionKind};

const DEFAULT_SEARCH_URL: &str = "https://duckduckgo.com/";

pub struct WebSearchHandler {
    base_url: String,
    client: Option<reqwest::Client>,
}

impl WebSearchHandler {
    /// Handler that only builds search URLs.
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_SEARCH_URL.to_string(),
            client: None,
        }
    }

    /// Handler that fetches results from `base_url`.
    pub fn fetching(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            client: Some(client),
        }
    }

    pub fn search_url(&self, query: &str) -> Result<reqwest::Url, ActionError> {
        reqwest::Url::parse_with_params(&self.base_url, &[("q", query)])
            .map_err(|e| ActionError::InvalidPayload(format!("Invalid search URL: {}", e)))
    }
}

impl Default for WebSearchHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionHandler for WebSearchHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::WebSearch
    }

    async fn execute(
        &self,
        action: &Action,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ActionError> {
        let query = required_str(action, "query")?;
        let url = self.search_url(query)?;

        let Some(client) = &self.client else {
            tracing::info!(query = %query, url = %url, "Search URL built");
            return Ok(json!({ "query": query, "url": url.as_str() }));
        };

        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| ActionError::HandlerFailed(format!("Search request failed: {}", e)))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ActionError::HandlerFailed(format!("Search response unreadable: {}", e)))?;
        if !status.is_success() {
            return Err(ActionError::HandlerFailed(format!(
                "Search returned HTTP {}",
                status.as_u16()
            )));
        }

        let summary: String = body.chars().take(4096).collect();
        Ok(json!({
            "query": query,
            "url": url.as_str(),
            "status": status.as_u16(),
            "body": summary,
        }))
    }

    fn describe(&self, action: &Action) -> String {
        format!(
            "Search the web for: {}",
            action.str_arg("query").unwrap_or("<no query>")
        )
    }

    fn needs_network(&self) -> bool {
        true
    }
}

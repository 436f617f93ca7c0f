//! Reasoning service over an Ollama-compatible `/api/generate` endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use jarvis_core::config::ReasoningConfig;

use crate::error::ReasoningError;
use crate::planner::{ReasoningRequest, ReasoningResponse, ReasoningService};

#[derive(Debug, Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct GenerateBody {
    model: String,
    prompt: String,
    stream: bool,
    format: &'static str,
    options: GenerateOptions,
}

#[derive(Debug, Deserialize)]
struct GenerateReply {
    response: String,
}

/// Sends the rendered planning prompt to a text-completion server.
pub struct HttpReasoningService {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
}

impl HttpReasoningService {
    pub fn new(endpoint: &str, config: &ReasoningConfig) -> Result<Self, ReasoningError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| ReasoningError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}/api/generate", endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    /// Service for the configured endpoint, if one is set.
    pub fn from_config(config: &ReasoningConfig) -> Option<Result<Self, ReasoningError>> {
        config
            .endpoint
            .as_deref()
            .map(|endpoint| Self::new(endpoint, config))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn body(&self, request: &ReasoningRequest) -> GenerateBody {
        GenerateBody {
            model: self.model.clone(),
            prompt: request.render_prompt(),
            stream: false,
            format: "json",
            options: GenerateOptions {
                temperature: self.temperature,
            },
        }
    }
}

#[async_trait]
impl ReasoningService for HttpReasoningService {
    async fn generate(
        &self,
        request: &ReasoningRequest,
    ) -> Result<ReasoningResponse, ReasoningError> {
        let response = self
            .client
            .post(&self.url)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| ReasoningError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Transport(format!("HTTP {}: {}", status, text)));
        }

        let reply: GenerateReply = response
            .json()
            .await
            .map_err(|e| ReasoningError::Transport(format!("unreadable reply: {}", e)))?;
        tracing::debug!(model = %self.model, chars = reply.response.len(), "Reasoning reply received");
        Ok(ReasoningResponse {
            raw_plan_text: reply.response,
        })
    }
}

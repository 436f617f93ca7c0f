//! Plan generation.
//!
//! Fetches context from the memory store, asks the reasoning service for a
//! plan and parses the raw response into typed steps. Both external calls
//! run under per-call timeouts.

pub mod http;
pub mod parser;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use jarvis_core::JarvisConfig;

use crate::error::{PlanError, ReasoningError};
use crate::memory::{ContextSnippet, MemoryStore};
use crate::plan::Plan;
use crate::types::{ActionKind, RequestContext};

pub use http::HttpReasoningService;
pub use parser::{parse_plan_text, ParsedPlan};

/// Input to the reasoning service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningRequest {
    pub intent_text: String,
    pub context: Vec<ContextSnippet>,
    /// Snapshot of the request the plan is for.
    pub state: serde_json::Value,
}

/// Output of the reasoning service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningResponse {
    pub raw_plan_text: String,
}

impl ReasoningRequest {
    pub fn new(context: &RequestContext, snippets: Vec<ContextSnippet>) -> Self {
        Self {
            intent_text: context.intent_text.clone(),
            context: snippets,
            state: serde_json::json!({
                "request_id": context.request_id,
                "requester": context.requester,
                "source": context.source,
                "sandboxed": context.sandboxed,
                "dry_run": context.dry_run,
            }),
        }
    }

    /// Planning prompt for text-completion backends.
    pub fn render_prompt(&self) -> String {
        let context = if self.context.is_empty() {
            "(none)".to_string()
        } else {
            self.context
                .iter()
                .map(|s| format!("- {}", s.text))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let actions = ActionKind::ALL
            .iter()
            .map(|k| match k {
                ActionKind::ControlVolume => format!("- {}(level | action)", k),
                _ => format!("- {}({})", k, k.required_arguments().join(", ")),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let state = serde_json::to_string_pretty(&self.state).unwrap_or_default();

        format!(
            "You are JARVIS, an assistant that turns requests into JSON execution plans.\n\n\
             ## User Request\n{}\n\n\
             ## Relevant Context\n{}\n\n\
             ## Available Actions\n{}\n\n\
             ## Current State\n{}\n\n\
             ## Your Task\n\
             Generate a JSON execution plan of the form \
             {{\"intent\": \"...\", \"actions\": [{{\"kind\": \"...\", \"arguments\": {{}}, \"description\": \"...\"}}]}}.",
            self.intent_text, context, actions, state
        )
    }
}

/// The external language-reasoning engine.
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn generate(&self, request: &ReasoningRequest)
        -> Result<ReasoningResponse, ReasoningError>;
}

/// Turns a request into a draft plan.
pub struct PlanGenerator {
    reasoning: Arc<dyn ReasoningService>,
    memory: Option<Arc<dyn MemoryStore>>,
    reasoning_timeout: Duration,
    memory_timeout: Duration,
    top_k: usize,
}

impl PlanGenerator {
    pub fn new(reasoning: Arc<dyn ReasoningService>) -> Self {
        let defaults = JarvisConfig::default();
        Self {
            reasoning,
            memory: None,
            reasoning_timeout: defaults.reasoning.timeout(),
            memory_timeout: defaults.memory.timeout(),
            top_k: defaults.memory.top_k,
        }
    }

    pub fn from_config(
        reasoning: Arc<dyn ReasoningService>,
        memory: Option<Arc<dyn MemoryStore>>,
        config: &JarvisConfig,
    ) -> Self {
        Self {
            reasoning,
            memory: memory.filter(|_| config.memory.enabled),
            reasoning_timeout: config.reasoning.timeout(),
            memory_timeout: config.memory.timeout(),
            top_k: config.memory.top_k,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn with_reasoning_timeout(mut self, timeout: Duration) -> Self {
        self.reasoning_timeout = timeout;
        self
    }

    /// Generate a draft plan for the request.
    pub async fn generate(&self, context: &RequestContext) -> Result<Plan, PlanError> {
        let snippets = self.fetch_context(&context.intent_text).await;
        let request = ReasoningRequest::new(context, snippets);

        let response = match tokio::time::timeout(
            self.reasoning_timeout,
            self.reasoning.generate(&request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    request_id = %context.request_id,
                    timeout_ms = self.reasoning_timeout.as_millis() as u64,
                    "Reasoning service timed out"
                );
                return Err(ReasoningError::Timeout(self.reasoning_timeout.as_millis() as u64).into());
            }
        };

        self.plan_from_response(&response.raw_plan_text, context)
    }

    /// Parse a reasoning response into a draft plan without calling out.
    pub fn plan_from_response(
        &self,
        raw_plan_text: &str,
        context: &RequestContext,
    ) -> Result<Plan, PlanError> {
        let parsed = parse_plan_text(raw_plan_text)?;
        let mut plan = Plan::new(context.clone(), parsed.steps);
        plan.intent_summary = parsed.intent_summary;
        info!(
            request_id = %context.request_id,
            plan_id = %plan.plan_id,
            steps = plan.steps.len(),
            "Generated plan"
        );
        Ok(plan)
    }

    /// Best-effort context lookup; failures degrade to no context.
    async fn fetch_context(&self, text: &str) -> Vec<ContextSnippet> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };

        match tokio::time::timeout(self.memory_timeout, memory.query(text, self.top_k)).await {
            Ok(Ok(snippets)) => {
                debug!(count = snippets.len(), "Fetched memory context");
                snippets
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Memory query failed; planning without context");
                Vec::new()
            }
            Err(_) => {
                warn!("Memory query timed out; planning without context");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;
    use crate::memory::{InMemoryMemoryStore, MemoryRecord};
    use std::sync::Mutex;

    struct FixedReasoning {
        text: String,
        seen: Mutex<Vec<ReasoningRequest>>,
    }

    impl FixedReasoning {
        fn new(text: &str) -> Self {
            Self {
                text: text.to_string(),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ReasoningService for FixedReasoning {
        async fn generate(
            &self,
            request: &ReasoningRequest,
        ) -> Result<ReasoningResponse, ReasoningError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(ReasoningResponse {
                raw_plan_text: self.text.clone(),
            })
        }
    }

    struct SlowReasoning;

    #[async_trait]
    impl ReasoningService for SlowReasoning {
        async fn generate(
            &self,
            _request: &ReasoningRequest,
        ) -> Result<ReasoningResponse, ReasoningError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ReasoningResponse {
                raw_plan_text: "[]".to_string(),
            })
        }
    }

    struct DownReasoning;

    #[async_trait]
    impl ReasoningService for DownReasoning {
        async fn generate(
            &self,
            _request: &ReasoningRequest,
        ) -> Result<ReasoningResponse, ReasoningError> {
            Err(ReasoningError::Transport("connection refused".to_string()))
        }
    }

    struct BrokenMemory;

    #[async_trait]
    impl MemoryStore for BrokenMemory {
        async fn query(&self, _: &str, _: usize) -> Result<Vec<ContextSnippet>, MemoryError> {
            Err(MemoryError::Unavailable("offline".to_string()))
        }
        async fn write(&self, _: MemoryRecord) -> Result<(), MemoryError> {
            Err(MemoryError::Unavailable("offline".to_string()))
        }
    }

    const NOTES_PLAN: &str =
        r#"{"intent": "open notes", "actions": [{"kind": "launch_application", "arguments": {"name": "notes"}}]}"#;

    #[tokio::test]
    async fn test_generate_builds_draft_plan() {
        let generator = PlanGenerator::new(Arc::new(FixedReasoning::new(NOTES_PLAN)));
        let ctx = RequestContext::new("open my notes");
        let plan = generator.generate(&ctx).await.unwrap();
        assert_eq!(plan.status, crate::plan::PlanStatus::Draft);
        assert_eq!(plan.context.request_id, ctx.request_id);
        assert_eq!(plan.intent_summary.as_deref(), Some("open notes"));
        assert!(plan.steps.iter().all(|s| s.verdict.is_none()));
    }

    #[tokio::test]
    async fn test_generate_passes_memory_context() {
        let memory = Arc::new(InMemoryMemoryStore::new());
        memory
            .write(MemoryRecord {
                request_id: uuid::Uuid::new_v4(),
                text: "notes app lives in the dock".to_string(),
                metadata: serde_json::Value::Null,
                recorded_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let reasoning = Arc::new(FixedReasoning::new(NOTES_PLAN));
        let generator = PlanGenerator::new(reasoning.clone()).with_memory(memory);
        generator
            .generate(&RequestContext::new("open notes"))
            .await
            .unwrap();

        let seen = reasoning.seen.lock().unwrap();
        assert_eq!(seen[0].context.len(), 1);
        assert!(seen[0].render_prompt().contains("notes app lives in the dock"));
    }

    #[tokio::test]
    async fn test_memory_failure_degrades_to_no_context() {
        let reasoning = Arc::new(FixedReasoning::new(NOTES_PLAN));
        let generator = PlanGenerator::new(reasoning.clone()).with_memory(Arc::new(BrokenMemory));
        assert!(generator
            .generate(&RequestContext::new("open notes"))
            .await
            .is_ok());
        assert!(reasoning.seen.lock().unwrap()[0].context.is_empty());
    }

    #[tokio::test]
    async fn test_reasoning_timeout_is_malformed_plan() {
        let generator = PlanGenerator::new(Arc::new(SlowReasoning))
            .with_reasoning_timeout(Duration::from_millis(20));
        let err = generator
            .generate(&RequestContext::new("anything"))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::MalformedPlan(_)));
    }

    #[tokio::test]
    async fn test_reasoning_transport_failure_is_malformed_plan() {
        let generator = PlanGenerator::new(Arc::new(DownReasoning));
        let err = generator
            .generate(&RequestContext::new("anything"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_render_prompt_sections() {
        let ctx = RequestContext::new("turn on the kitchen light");
        let prompt = ReasoningRequest::new(&ctx, Vec::new()).render_prompt();
        for section in [
            "## User Request",
            "## Relevant Context",
            "## Available Actions",
            "## Current State",
            "## Your Task",
        ] {
            assert!(prompt.contains(section), "{section}");
        }
        assert!(prompt.contains("iot_command(device, command)"));
        assert!(prompt.contains("turn on the kitchen light"));
    }
}

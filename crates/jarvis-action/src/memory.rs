//! Contextual memory store interface.
//!
//! The long-term store is an external collaborator; the pipeline only needs
//! ranked lookups while planning and a best-effort write after a request
//! finishes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::MemoryError;

/// A piece of context returned by a memory query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub text: String,
    pub score: f32,
}

/// Summary of a finished request written back to the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub request_id: Uuid,
    pub text: String,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Up to `top_k` snippets, best first.
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<ContextSnippet>, MemoryError>;

    async fn write(&self, record: MemoryRecord) -> Result<(), MemoryError>;
}

/// Process-local store ranking entries by word overlap with the query.
pub struct InMemoryMemoryStore {
    records: Mutex<Vec<MemoryRecord>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<ContextSnippet>, MemoryError> {
        let query_words = words(text);
        if query_words.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }

        let records = self
            .records
            .lock()
            .map_err(|e| MemoryError::Unavailable(format!("Lock poisoned: {}", e)))?;

        let mut scored: Vec<ContextSnippet> = records
            .iter()
            .filter_map(|record| {
                let overlap = words(&record.text).intersection(&query_words).count();
                (overlap > 0).then(|| ContextSnippet {
                    text: record.text.clone(),
                    score: overlap as f32 / query_words.len() as f32,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn write(&self, record: MemoryRecord) -> Result<(), MemoryError> {
        let mut records = self
            .records
            .lock()
            .map_err(|e| MemoryError::Unavailable(format!("Lock poisoned: {}", e)))?;
        records.push(record);
        Ok(())
    }
}

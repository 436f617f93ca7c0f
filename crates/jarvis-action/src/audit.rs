//! Audit trail.
//!
//! Every plan creation, policy verdict, execution outcome and terminal status
//! is appended to an [`AuditSink`] as an immutable [`AuditRecord`].
//!
//! [`JsonlAuditSink`] stores one JSON object per line. Each line carries the
//! SHA-256 of the previous line in `previous_hash`, so inserted, deleted or
//! edited lines break the chain and are caught by
//! [`JsonlAuditSink::verify_chain`].
//!
//! [`AuditRecorder::record`] never fails its caller. When the sink rejects a
//! record, or does not answer within the append timeout, the full record is
//! written to the local log under the `audit` target with
//! `signal = "audit_unavailable"` and the degraded state is published on a
//! watch channel. A sink that timed out is bypassed for a cool-off period.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::AuditError;
use crate::plan::{ExecutionResult, Plan, PlanStatus, PlanStep, Verdict};
use crate::types::{ActionKind, IntentSource, RequestContext};
use jarvis_core::config::AuditConfig;

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditEvent {
    PlanCreated,
    PlanningFailed,
    ActionValidated,
    ActionExecuted,
    PlanFinished,
}

/// Who asked, as seen when the record was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequesterSnapshot {
    pub requester: String,
    pub source: IntentSource,
    pub intent_text: String,
    pub sandboxed: bool,
    pub dry_run: bool,
}

impl From<&RequestContext> for RequesterSnapshot {
    fn from(ctx: &RequestContext) -> Self {
        Self {
            requester: ctx.requester.clone(),
            source: ctx.source,
            intent_text: ctx.intent_text.clone(),
            sandboxed: ctx.sandboxed,
            dry_run: ctx.dry_run,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub record_id: Uuid,
    /// Absent only for planning failures, which never produced a plan.
    pub plan_id: Option<Uuid>,
    pub request_id: Uuid,
    /// Position within the plan's (or failed request's) record stream.
    pub sequence: u64,
    pub event: AuditEvent,
    pub recorded_at: DateTime<Utc>,
    pub requester: RequesterSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_plan_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ActionKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_status: Option<PlanStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// SHA-256 of the previous line in a chained file sink.
    #[serde(default)]
    pub previous_hash: Option<String>,
}

impl AuditRecord {
    fn base(ctx: &RequestContext, plan_id: Option<Uuid>, event: AuditEvent) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            plan_id,
            request_id: ctx.request_id,
            sequence: 0,
            event,
            recorded_at: Utc::now(),
            requester: RequesterSnapshot::from(ctx),
            parent_plan_id: None,
            action_index: None,
            kind: None,
            verdict: None,
            result: None,
            plan_status: None,
            detail: None,
            previous_hash: None,
        }
    }

    pub fn plan_created(plan: &Plan) -> Self {
        let mut record = Self::base(&plan.context, Some(plan.plan_id), AuditEvent::PlanCreated);
        record.parent_plan_id = plan.parent_plan_id;
        record.plan_status = Some(plan.status);
        record.detail = Some(format!(
            "{} step(s): {}",
            plan.steps.len(),
            plan.steps
                .iter()
                .map(|s| s.label.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ));
        record
    }

    pub fn planning_failed(ctx: &RequestContext, error: impl fmt::Display) -> Self {
        let mut record = Self::base(ctx, None, AuditEvent::PlanningFailed);
        record.detail = Some(error.to_string());
        record
    }

    pub fn action_validated(plan: &Plan, step: &PlanStep) -> Self {
        let mut record =
            Self::base(&plan.context, Some(plan.plan_id), AuditEvent::ActionValidated);
        record.action_index = Some(step.index);
        record.kind = step.action.as_ref().map(|a| a.kind);
        record.verdict = step.verdict.clone();
        if step.action.is_none() {
            record.detail = Some(format!("label '{}'", step.label));
        }
        record
    }

    pub fn action_executed(plan: &Plan, result: &ExecutionResult) -> Self {
        let mut record = Self::base(&plan.context, Some(plan.plan_id), AuditEvent::ActionExecuted);
        record.action_index = Some(result.index);
        record.kind = plan
            .steps
            .get(result.index)
            .and_then(|s| s.action.as_ref())
            .map(|a| a.kind);
        record.result = Some(result.clone());
        record
    }

    pub fn plan_finished(plan: &Plan, summary: &str) -> Self {
        let mut record = Self::base(&plan.context, Some(plan.plan_id), AuditEvent::PlanFinished);
        record.parent_plan_id = plan.parent_plan_id;
        record.plan_status = Some(plan.status);
        record.detail = Some(summary.to_string());
        record
    }

    /// Key the per-stream sequence is counted under.
    fn stream(&self) -> Uuid {
        self.plan_id.unwrap_or(self.request_id)
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Append-only record store, queryable by plan or request.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError>;

    /// Records of one plan, in append order.
    async fn query_plan(&self, plan_id: Uuid) -> Result<Vec<AuditRecord>, AuditError>;

    /// Records of every plan (and planning failure) of one request.
    async fn query_request(&self, request_id: Uuid) -> Result<Vec<AuditRecord>, AuditError>;
}

/// SHA-256 of a string as lowercase hex.
pub fn hash_line(line: &str) -> String {
    format!("{:x}", Sha256::digest(line.as_bytes()))
}

/// Hash-chained JSON Lines file.
pub struct JsonlAuditSink {
    path: PathBuf,
    /// Hash of the last line written. Held across each append to serialise writers.
    last_hash: Arc<Mutex<Option<String>>>,
}

impl JsonlAuditSink {
    /// Open (or create) the log at `path`, recovering the chain head.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let last_hash = if path.exists() {
            Self::read_last_hash(&path)?
        } else {
            None
        };
        Ok(Self {
            path,
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record, oldest first. Blank lines are skipped.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, AuditError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    /// Check that every line links to the hash of the line before it.
    ///
    /// Returns the number of records verified.
    pub fn verify_chain(path: impl AsRef<Path>) -> Result<usize, AuditError> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let mut previous: Option<String> = None;
        let mut count = 0;

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(&line)?;
            if record.previous_hash != previous {
                return Err(AuditError::ChainBroken {
                    line: line_num + 1,
                    detail: format!(
                        "expected previous hash {}, found {}",
                        previous.as_deref().unwrap_or("none"),
                        record.previous_hash.as_deref().unwrap_or("none")
                    ),
                });
            }
            // Hash the raw line; re-serialising could reorder fields.
            previous = Some(hash_line(&line));
            count += 1;
        }
        Ok(count)
    }

    fn read_last_hash(path: &Path) -> Result<Option<String>, AuditError> {
        let reader = BufReader::new(File::open(path)?);
        let mut last_line: Option<String> = None;
        for line in reader.lines() {
            let line = line?;
            if !line.trim().is_empty() {
                last_line = Some(line);
            }
        }
        Ok(last_line.map(|line| hash_line(&line)))
    }

    fn filtered(
        path: &Path,
        keep: impl Fn(&AuditRecord) -> bool,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        Ok(Self::read_all(path)?
            .into_iter()
            .filter(|r| keep(r))
            .collect())
    }

    /// Read the file off the async runtime, excluding concurrent appends.
    async fn query(
        &self,
        keep: impl Fn(&AuditRecord) -> bool + Send + 'static,
    ) -> Result<Vec<AuditRecord>, AuditError> {
        let path = self.path.clone();
        let last_hash = Arc::clone(&self.last_hash);
        tokio::task::spawn_blocking(move || -> Result<Vec<AuditRecord>, AuditError> {
            let _guard = last_hash.lock().map_err(lock_poisoned)?;
            Self::filtered(&path, keep)
        })
        .await
        .map_err(writer_failed)?
    }
}

fn lock_poisoned<T>(e: std::sync::PoisonError<T>) -> AuditError {
    AuditError::Unavailable(format!("Lock poisoned: {}", e))
}

fn writer_failed(e: tokio::task::JoinError) -> AuditError {
    AuditError::Unavailable(format!("Audit writer task failed: {}", e))
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, mut record: AuditRecord) -> Result<(), AuditError> {
        let path = self.path.clone();
        let last_hash = Arc::clone(&self.last_hash);
        // Not cancelled with the caller: the chain head must track the file.
        tokio::task::spawn_blocking(move || -> Result<(), AuditError> {
            let mut last_hash = last_hash.lock().map_err(lock_poisoned)?;
            record.previous_hash = last_hash.clone();
            let line = serde_json::to_string(&record)?;

            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{}", line)?;
            file.flush()?;

            *last_hash = Some(hash_line(&line));
            Ok(())
        })
        .await
        .map_err(writer_failed)?
    }

    async fn query_plan(&self, plan_id: Uuid) -> Result<Vec<AuditRecord>, AuditError> {
        self.query(move |r| r.plan_id == Some(plan_id)).await
    }

    async fn query_request(&self, request_id: Uuid) -> Result<Vec<AuditRecord>, AuditError> {
        self.query(move |r| r.request_id == request_id).await
    }
}

/// In-memory sink. Used when file auditing is disabled and in tests.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn filtered(&self, keep: impl Fn(&AuditRecord) -> bool) -> Result<Vec<AuditRecord>, AuditError> {
        let records = self
            .records
            .lock()
            .map_err(|e| AuditError::Unavailable(format!("Lock poisoned: {}", e)))?;
        Ok(records.iter().filter(|r| keep(r)).cloned().collect())
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .map_err(|e| AuditError::Unavailable(format!("Lock poisoned: {}", e)))?
            .push(record);
        Ok(())
    }

    async fn query_plan(&self, plan_id: Uuid) -> Result<Vec<AuditRecord>, AuditError> {
        self.filtered(|r| r.plan_id == Some(plan_id))
    }

    async fn query_request(&self, request_id: Uuid) -> Result<Vec<AuditRecord>, AuditError> {
        self.filtered(|r| r.request_id == request_id)
    }
}

// =============================================================================
// Recorder
// =============================================================================

/// Operator-facing state of the audit sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditHealth {
    pub available: bool,
    /// Records the sink has rejected since startup.
    pub failures: u64,
    pub last_error: Option<String>,
}

impl Default for AuditHealth {
    fn default() -> Self {
        Self {
            available: true,
            failures: 0,
            last_error: None,
        }
    }
}

/// Default bound on one sink append.
pub const DEFAULT_APPEND_TIMEOUT: Duration = Duration::from_secs(2);
/// Default time records bypass a sink after it stalled.
pub const DEFAULT_STALL_COOL_OFF: Duration = Duration::from_secs(30);

pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
    sequences: Mutex<HashMap<Uuid, u64>>,
    health: watch::Sender<AuditHealth>,
    append_timeout: Duration,
    stall_cool_off: Duration,
    /// Set after a timed-out append; the sink is skipped until then.
    stalled_until: Mutex<Option<Instant>>,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        let (health, _) = watch::channel(AuditHealth::default());
        Self {
            sink,
            sequences: Mutex::new(HashMap::new()),
            health,
            append_timeout: DEFAULT_APPEND_TIMEOUT,
            stall_cool_off: DEFAULT_STALL_COOL_OFF,
            stalled_until: Mutex::new(None),
        }
    }

    pub fn from_config(sink: Arc<dyn AuditSink>, config: &AuditConfig) -> Self {
        Self::new(sink).with_timeouts(config.append_timeout(), config.stall_cool_off())
    }

    pub fn with_timeouts(mut self, append_timeout: Duration, stall_cool_off: Duration) -> Self {
        self.append_timeout = append_timeout;
        self.stall_cool_off = stall_cool_off;
        self
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    /// Append a record, stamping its per-stream sequence number.
    ///
    /// Returns whether the sink accepted it. A rejected or timed-out record
    /// is logged in full and flips the health state to unavailable. After a
    /// timeout the sink is bypassed for the cool-off period.
    pub async fn record(&self, mut record: AuditRecord) -> bool {
        record.sequence = self.next_sequence(record.stream());
        let event = record.event;
        let plan_id = record.plan_id;

        let snapshot = serde_json::to_string(&record)
            .unwrap_or_else(|e| format!("<unserializable record: {}>", e));

        if self.is_stalled() {
            let error = AuditError::Unavailable("sink stalled, bypassed during cool-off".to_string());
            self.degrade(event, plan_id, &snapshot, &error);
            return false;
        }

        let appended = match tokio::time::timeout(self.append_timeout, self.sink.append(record)).await {
            Ok(result) => result,
            Err(_) => {
                if let Ok(mut until) = self.stalled_until.lock() {
                    *until = Some(Instant::now() + self.stall_cool_off);
                }
                Err(AuditError::Timeout(self.append_timeout.as_millis() as u64))
            }
        };

        match appended {
            Ok(()) => {
                if !self.health.borrow().available {
                    tracing::info!(target: "audit", "Audit sink recovered");
                    self.health.send_modify(|h| {
                        h.available = true;
                        h.last_error = None;
                    });
                }
                true
            }
            Err(e) => {
                self.degrade(event, plan_id, &snapshot, &e);
                false
            }
        }
    }

    fn is_stalled(&self) -> bool {
        let Ok(mut until) = self.stalled_until.lock() else {
            return false;
        };
        match *until {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                *until = None;
                false
            }
            None => false,
        }
    }

    fn degrade(&self, event: AuditEvent, plan_id: Option<Uuid>, snapshot: &str, error: &AuditError) {
        tracing::error!(
            target: "audit",
            signal = "audit_unavailable",
            event = ?event,
            plan_id = ?plan_id,
            error = %error,
            record = %snapshot,
            "Audit sink unavailable, record kept in local log"
        );
        let message = error.to_string();
        self.health.send_modify(|h| {
            h.available = false;
            h.failures += 1;
            h.last_error = Some(message);
        });
    }

    /// Forget the sequence counter of a finished stream.
    pub fn close_stream(&self, stream: Uuid) {
        if let Ok(mut sequences) = self.sequences.lock() {
            sequences.remove(&stream);
        }
    }

    pub fn health(&self) -> AuditHealth {
        self.health.borrow().clone()
    }

    /// Watch the sink's health. Receivers see every availability change.
    pub fn subscribe(&self) -> watch::Receiver<AuditHealth> {
        self.health.subscribe()
    }

    fn next_sequence(&self, stream: Uuid) -> u64 {
        let Ok(mut sequences) = self.sequences.lock() else {
            return 0;
        };
        let next = sequences.entry(stream).or_insert(0);
        let current = *next;
        *next += 1;
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlanError;
    use crate::plan::VerdictReason;
    use crate::types::{Action, Arguments};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn append(&self, _record: AuditRecord) -> Result<(), AuditError> {
            Err(AuditError::Unavailable("disk full".to_string()))
        }
        async fn query_plan(&self, _plan_id: Uuid) -> Result<Vec<AuditRecord>, AuditError> {
            Ok(Vec::new())
        }
        async fn query_request(&self, _request_id: Uuid) -> Result<Vec<AuditRecord>, AuditError> {
            Ok(Vec::new())
        }
    }

    /// Sink whose appends never complete.
    #[derive(Default)]
    struct StalledSink {
        appends: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl AuditSink for StalledSink {
        async fn append(&self, _record: AuditRecord) -> Result<(), AuditError> {
            self.appends.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            std::future::pending().await
        }
        async fn query_plan(&self, _plan_id: Uuid) -> Result<Vec<AuditRecord>, AuditError> {
            Ok(Vec::new())
        }
        async fn query_request(&self, _request_id: Uuid) -> Result<Vec<AuditRecord>, AuditError> {
            Ok(Vec::new())
        }
    }

    fn plan() -> Plan {
        let mut args = Arguments::new();
        args.insert("message".to_string(), json!("hello"));
        let mut step = PlanStep::new(0, Action::new(ActionKind::Notify, args));
        step.verdict = Some(Verdict::approved(VerdictReason::RiskApproved, "low"));
        Plan::new(RequestContext::new("say hello").with_requester("alice"), vec![step])
    }

    #[tokio::test]
    async fn test_jsonl_append_and_query() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit").join("audit.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();
        let plan = plan();
        let other = self::plan();

        sink.append(AuditRecord::plan_created(&plan)).await.unwrap();
        sink.append(AuditRecord::action_validated(&plan, &plan.steps[0]))
            .await
            .unwrap();
        sink.append(AuditRecord::plan_created(&other)).await.unwrap();

        let records = sink.query_plan(plan.plan_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event, AuditEvent::PlanCreated);
        assert_eq!(records[1].event, AuditEvent::ActionValidated);
        assert_eq!(records[1].kind, Some(ActionKind::Notify));
        assert_eq!(records[0].requester.requester, "alice");

        let by_request = sink.query_request(other.context.request_id).await.unwrap();
        assert_eq!(by_request.len(), 1);

        assert_eq!(JsonlAuditSink::verify_chain(&path).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_jsonl_chain_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let plan = plan();
        {
            let sink = JsonlAuditSink::open(&path).unwrap();
            sink.append(AuditRecord::plan_created(&plan)).await.unwrap();
        }
        let sink = JsonlAuditSink::open(&path).unwrap();
        sink.append(AuditRecord::plan_finished(&plan, "done")).await.unwrap();

        let records = JsonlAuditSink::read_all(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].previous_hash.is_none());
        assert!(records[1].previous_hash.is_some());
        assert_eq!(JsonlAuditSink::verify_chain(&path).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_tampering_detected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = JsonlAuditSink::open(&path).unwrap();
        let plan = plan();
        for _ in 0..3 {
            sink.append(AuditRecord::plan_created(&plan)).await.unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        // Drop the middle record.
        std::fs::write(&path, format!("{}\n{}\n", lines[0], lines[2])).unwrap();

        let err = JsonlAuditSink::verify_chain(&path).unwrap_err();
        assert!(matches!(err, AuditError::ChainBroken { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_query_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let sink = JsonlAuditSink::open(dir.path().join("audit.jsonl")).unwrap();
        assert!(sink.query_plan(Uuid::new_v4()).await.unwrap().is_empty());
    }

    #[test]
    fn test_hash_line_is_sha256_hex() {
        assert_eq!(
            hash_line("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_recorder_assigns_per_plan_sequence() {
        let sink = Arc::new(MemoryAuditSink::new());
        let recorder = AuditRecorder::new(sink.clone());
        let a = plan();
        let b = plan();

        assert!(recorder.record(AuditRecord::plan_created(&a)).await);
        assert!(recorder.record(AuditRecord::plan_created(&b)).await);
        assert!(recorder.record(AuditRecord::plan_finished(&a, "ok")).await);

        let records = sink.query_plan(a.plan_id).await.unwrap();
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1]);
        assert_eq!(sink.query_plan(b.plan_id).await.unwrap()[0].sequence, 0);
        assert_eq!(recorder.health(), AuditHealth::default());
    }

    #[tokio::test]
    async fn test_recorder_degrades_without_failing() {
        let recorder = AuditRecorder::new(Arc::new(BrokenSink));
        let mut health = recorder.subscribe();

        assert!(!recorder.record(AuditRecord::plan_created(&plan())).await);
        assert!(health.has_changed().unwrap());
        let state = health.borrow_and_update().clone();
        assert!(!state.available);
        assert_eq!(state.failures, 1);
        assert!(state.last_error.unwrap().contains("disk full"));

        assert!(!recorder.record(AuditRecord::plan_created(&plan())).await);
        assert_eq!(recorder.health().failures, 2);
    }

    #[tokio::test]
    async fn test_stalled_sink_times_out_and_is_bypassed() {
        let sink = Arc::new(StalledSink::default());
        let recorder = AuditRecorder::new(sink.clone())
            .with_timeouts(Duration::from_millis(50), Duration::from_secs(60));

        let started = Instant::now();
        assert!(!recorder.record(AuditRecord::plan_created(&plan())).await);
        let health = recorder.health();
        assert!(!health.available);
        assert!(health.last_error.unwrap().contains("timed out"));

        // Cool-off: further records skip the sink entirely.
        for _ in 0..5 {
            assert!(!recorder.record(AuditRecord::plan_created(&plan())).await);
        }
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(sink.appends.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(recorder.health().failures, 6);
    }

    #[tokio::test]
    async fn test_stalled_sink_retried_after_cool_off() {
        let sink = Arc::new(StalledSink::default());
        let recorder = AuditRecorder::new(sink.clone())
            .with_timeouts(Duration::from_millis(20), Duration::from_millis(30));

        recorder.record(AuditRecord::plan_created(&plan())).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        recorder.record(AuditRecord::plan_created(&plan())).await;
        assert_eq!(sink.appends.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_jsonl_concurrent_appends_keep_chain() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = Arc::new(JsonlAuditSink::open(&path).unwrap());

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let sink = sink.clone();
            tasks.spawn(async move { sink.append(AuditRecord::plan_created(&plan())).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
        assert_eq!(JsonlAuditSink::verify_chain(&path).unwrap(), 20);
    }

    #[tokio::test]
    async fn test_planning_failed_record_has_no_plan() {
        let sink = Arc::new(MemoryAuditSink::new());
        let recorder = AuditRecorder::new(sink.clone());
        let ctx = RequestContext::new("???");
        let err = PlanError::MalformedPlan("not json".to_string());
        recorder.record(AuditRecord::planning_failed(&ctx, &err)).await;

        let records = sink.query_request(ctx.request_id).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].plan_id, None);
        assert_eq!(records[0].event, AuditEvent::PlanningFailed);
        assert_eq!(records[0].detail.as_deref(), Some("Malformed plan: not json"));
    }

    #[test]
    fn test_audit_event_serialization() {
        assert_eq!(
            serde_json::to_string(&AuditEvent::ActionExecuted).unwrap(),
            "\"action-executed\""
        );
    }
}

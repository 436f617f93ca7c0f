//! User confirmation flow for high-risk steps.
//!
//! Plans whose steps stopped at `NeedsConfirmation` are parked here after
//! execution. Approving a subset of those steps builds a follow-up plan that
//! goes back through validation and execution.

use jarvis_core::types::Timestamp;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::error::ConfirmationError;
use crate::plan::{ExecutionResult, Plan};

/// A plan with steps waiting for the user.
pub struct ParkedPlan {
    pub plan: Plan,
    /// Steps that already succeeded in the parked plan.
    pub succeeded: BTreeSet<usize>,
    /// Steps awaiting an explicit confirmation.
    pub awaiting: BTreeSet<usize>,
    pub parked_at: Timestamp,
}

/// Gate that holds plans pending confirmation.
///
/// Approval is single-shot: the parked plan is removed whether or not every
/// awaiting step was named.
pub struct ConfirmationGate {
    ttl: Duration,
    pending: Mutex<VecDeque<ParkedPlan>>,
}

impl ConfirmationGate {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Park `plan` if any of its steps await confirmation.
    ///
    /// Expired entries are swept on every call, so the queue stays bounded
    /// by what arrives within one TTL.
    ///
    /// Returns the awaiting step indices (empty when nothing was parked).
    pub fn park(&self, plan: &Plan, results: &[ExecutionResult]) -> Vec<usize> {
        self.expire_stale();
        let awaiting: BTreeSet<usize> = plan.awaiting_confirmation().into_iter().collect();
        if awaiting.is_empty() {
            return Vec::new();
        }
        let succeeded = results
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| r.index)
            .collect();

        let Ok(mut pending) = self.pending.lock() else {
            tracing::error!(plan_id = %plan.plan_id, "Confirmation queue lock poisoned");
            return Vec::new();
        };
        if let Some(pos) = pending.iter().position(|p| p.plan.plan_id == plan.plan_id) {
            pending.remove(pos);
        }
        let indices = awaiting.iter().copied().collect();
        pending.push_back(ParkedPlan {
            plan: plan.clone(),
            succeeded,
            awaiting,
            parked_at: Timestamp::now(),
        });
        tracing::info!(plan_id = %plan.plan_id, awaiting = ?indices, "Plan parked for confirmation");
        indices
    }

    /// Approve `indices` of a parked plan and build its follow-up plan.
    ///
    /// Every index must be awaiting confirmation. Awaiting steps not named
    /// are dismissed along with the parked plan.
    pub fn approve(&self, plan_id: Uuid, indices: &[usize]) -> Result<Plan, ConfirmationError> {
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| ConfirmationError::PlanNotFound(plan_id))?;
        let pos = pending
            .iter()
            .position(|p| p.plan.plan_id == plan_id)
            .ok_or(ConfirmationError::PlanNotFound(plan_id))?;

        let parked = &pending[pos];
        if parked.parked_at.age_secs() > self.ttl.as_secs() {
            pending.remove(pos);
            return Err(ConfirmationError::Expired(plan_id));
        }
        if let Some(index) = indices.iter().find(|i| !parked.awaiting.contains(i)) {
            return Err(ConfirmationError::StepNotPending {
                plan_id,
                index: *index,
            });
        }

        let parked = pending
            .remove(pos)
            .ok_or(ConfirmationError::PlanNotFound(plan_id))?;
        let confirmed: BTreeSet<usize> = indices.iter().copied().collect();
        let follow_up = parked.plan.follow_up(&confirmed, &parked.succeeded);
        tracing::info!(
            plan_id = %plan_id,
            follow_up = %follow_up.plan_id,
            confirmed = ?confirmed,
            steps = follow_up.steps.len(),
            "Confirmation approved"
        );
        Ok(follow_up)
    }

    /// Drop a parked plan. Returns `true` if it was pending.
    pub fn dismiss(&self, plan_id: Uuid) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        if let Some(pos) = pending.iter().position(|p| p.plan.plan_id == plan_id) {
            pending.remove(pos);
            true
        } else {
            false
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Awaiting step indices for a parked plan.
    pub fn pending_for(&self, plan_id: Uuid) -> Option<Vec<usize>> {
        let pending = self.pending.lock().ok()?;
        pending
            .iter()
            .find(|p| p.plan.plan_id == plan_id)
            .map(|p| p.awaiting.iter().copied().collect())
    }

    /// Remove parked plans older than the TTL. Returns how many were removed.
    pub fn expire_stale(&self) -> usize {
        let Ok(mut pending) = self.pending.lock() else {
            return 0;
        };
        let before = pending.len();
        let ttl = self.ttl.as_secs();
        pending.retain(|p| p.parked_at.age_secs() <= ttl);
        let removed = before - pending.len();
        if removed > 0 {
            tracing::info!(removed, "Expired stale confirmations");
        }
        removed
    }

    #[cfg(test)]
    fn backdate(&self, plan_id: Uuid, secs: i64) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(p) = pending.iter_mut().find(|p| p.plan.plan_id == plan_id) {
            p.parked_at = Timestamp(p.parked_at.0 - secs);
        }
    }
}

/// Token-bucket rate limiter for notification delivery.
///
/// Prevents notification flooding by limiting to N notifications per minute.
pub struct NotificationRateLimiter {
    max_per_minute: u32,
    tokens: Mutex<(u32, std::time::Instant)>,
}

impl NotificationRateLimiter {
    pub fn new(max_per_minute: u32) -> Self {
        Self {
            max_per_minute,
            tokens: Mutex::new((max_per_minute, std::time::Instant::now())),
        }
    }

    /// Try to acquire a token. Returns `true` if allowed, `false` if rate-limited.
    pub fn try_acquire(&self) -> bool {
        let Ok(mut state) = self.tokens.lock() else {
            return false;
        };
        if state.1.elapsed() >= Duration::from_secs(60) {
            // Refill
            state.0 = self.max_per_minute;
            state.1 = std::time::Instant::now();
        }
        if state.0 > 0 {
            state.0 -= 1;
            true
        } else {
            false
        }
    }
}

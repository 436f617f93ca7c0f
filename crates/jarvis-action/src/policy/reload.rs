//! Hot reload of policy rules.
//!
//! Polls the rule source's modification time and swaps the engine's rule set
//! when it changes. While the engine is fail-closed every tick retries the
//! load so a repaired file is picked up without a restart.

use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tracing::{error, info};

use super::PolicyEngine;

/// Background loop that keeps a [`PolicyEngine`] in sync with its source.
pub struct ReloadWatcher {
    engine: Arc<PolicyEngine>,
    interval: Duration,
    shutdown: Arc<Notify>,
}

impl ReloadWatcher {
    pub fn new(engine: Arc<PolicyEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Run until [`shutdown`](Self::shutdown) is called.
    pub async fn run(&self) {
        let mut last_seen = self.engine.source().modified();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.poll(&mut last_seen);
                }
                _ = self.shutdown.notified() => {
                    info!("Policy reload watcher stopped");
                    return;
                }
            }
        }
    }

    /// One reload check. Returns whether a reload was attempted.
    pub fn poll(&self, last_seen: &mut Option<SystemTime>) -> bool {
        let current = self.engine.source().modified();
        if current == *last_seen && !self.engine.is_fail_closed() {
            return false;
        }
        *last_seen = current;

        match self.engine.reload() {
            Ok(()) => info!(source = %self.engine.source().describe(), "Policy rules reloaded"),
            Err(e) => error!(error = %e, "Policy reload failed; rejecting all actions"),
        }
        true
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

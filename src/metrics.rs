use std::time::Duration;

use metrics::{counter, histogram};

/// Metric names emitted by the sync layer.
///
/// Nothing is recorded unless the embedding application installs a
/// `metrics` recorder.
#[derive(Debug, Clone)]
pub struct SyncMetrics {
    pub remote_calls_total: &'static str,
    pub remote_call_duration: &'static str,
    pub reconciliations_total: &'static str,
    pub optimistic_writes_total: &'static str,
    pub local_store_errors_total: &'static str,
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self {
            remote_calls_total: "workspace_sync_remote_calls_total",
            remote_call_duration: "workspace_sync_remote_call_duration_seconds",
            reconciliations_total: "workspace_sync_reconciliations_total",
            optimistic_writes_total: "workspace_sync_optimistic_writes_total",
            local_store_errors_total: "workspace_sync_local_store_errors_total",
        }
    }
}

/// Result of one background reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Fresh data reached observable state
    Published,
    /// Data was cached but the selection had moved on
    Stale,
    /// Remote fetch failed; cached state kept
    Failed,
}

impl ReconcileOutcome {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Stale => "stale",
            Self::Failed => "failed",
        }
    }
}

impl SyncMetrics {
    /// Record one remote call
    pub fn record_remote_call(&self, operation: &'static str, duration: Duration, success: bool) {
        let status = if success { "success" } else { "error" };
        counter!(self.remote_calls_total, "operation" => operation, "status" => status).increment(1);
        histogram!(self.remote_call_duration, "operation" => operation).record(duration.as_secs_f64());
    }

    /// Record how a reconciliation of `collection` ended
    pub fn record_reconciliation(&self, collection: &'static str, outcome: ReconcileOutcome) {
        counter!(
            self.reconciliations_total,
            "collection" => collection,
            "outcome" => outcome.as_str()
        )
        .increment(1);
    }

    /// Record an optimistic local write
    pub fn record_optimistic_write(&self, operation: &'static str) {
        counter!(self.optimistic_writes_total, "operation" => operation).increment(1);
    }

    /// Record a failed local store access
    pub fn record_local_store_error(&self, operation: &'static str) {
        counter!(self.local_store_errors_total, "operation" => operation).increment(1);
    }
}

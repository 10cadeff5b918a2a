//! Reconcile outcome types

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default interval between successful reconciles of the same cluster
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(300);

/// What the invoking loop should do next with a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Invoke again after `after`
    pub fn requeue(after: Duration) -> Self {
        Self {
            requeue_after: Some(after),
        }
    }

    /// Nothing to do until the declared topology changes
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Result of a single stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Continue,
    /// Not converged yet; stop this pass and try again later
    Requeue { after: Duration, reason: String },
}

impl StageOutcome {
    pub fn requeue(after: Duration, reason: impl Into<String>) -> Self {
        StageOutcome::Requeue {
            after,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum StageStatus {
    Completed,
    Requeued(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub status: StageStatus,
    pub elapsed_ms: u64,
}

/// Per-stage record of one reconcile pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub cluster: String,
    /// "active" or "terminating"
    pub phase: String,
    pub stages: Vec<StageReport>,
    /// Total execution time in milliseconds
    pub duration_ms: u64,
}

impl ReconcileReport {
    pub fn new(cluster: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            phase: phase.into(),
            stages: Vec::new(),
            duration_ms: 0,
        }
    }

    pub fn record(&mut self, stage: impl Into<String>, status: StageStatus, elapsed: Duration) {
        self.stages.push(StageReport {
            stage: stage.into(),
            status,
            elapsed_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn is_success(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.status == StageStatus::Completed)
    }

    pub fn summary(&self) -> ReportSummary {
        let count = |f: fn(&StageStatus) -> bool| self.stages.iter().filter(|s| f(&s.status)).count();
        ReportSummary {
            completed: count(|s| matches!(s, StageStatus::Completed)),
            requeued: count(|s| matches!(s, StageStatus::Requeued(_))),
            failed: count(|s| matches!(s, StageStatus::Failed(_))),
        }
    }
}

/// Summary of a reconcile pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportSummary {
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
}

impl std::fmt::Display for ReportSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} completed, {} requeued, {} failed",
            self.completed, self.requeued, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_constructors() {
        assert_eq!(
            Action::requeue(DEFAULT_RESYNC).requeue_after(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(Action::await_change().requeue_after(), None);
    }

    #[test]
    fn test_report_summary() {
        let mut report = ReconcileReport::new("prod", "active");
        report.record("ensure-finalizer", StageStatus::Completed, Duration::from_millis(3));
        report.record(
            "verify-zones",
            StageStatus::Requeued("Expected 3 Zones, but found 2".into()),
            Duration::from_millis(1),
        );

        assert!(!report.is_success());
        assert_eq!(report.stages[0].elapsed_ms, 3);
        assert_eq!(
            report.summary().to_string(),
            "1 completed, 1 requeued, 0 failed"
        );
    }

    #[test]
    fn test_stage_status_serialization() {
        let json = serde_json::to_value(StageStatus::Failed("boom".into())).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["detail"], "boom");
    }
}

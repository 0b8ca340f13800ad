//! Ingest run record and its status state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ── Status ───────────────────────────────────────────────────────────

/// Lifecycle status of an ingest run.
///
/// Serialized as the upper-case name (`"PENDING"`, `"RUNNING"`, ...), which is
/// also the value stored in the `ingest_runs.status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Allowed forward edges. Anything not listed here is rejected.
static TRANSITIONS: [(RunStatus, &[RunStatus]); 4] = [
    (RunStatus::Pending, &[RunStatus::Running]),
    (RunStatus::Running, &[RunStatus::Succeeded, RunStatus::Failed]),
    (RunStatus::Succeeded, &[]),
    (RunStatus::Failed, &[]),
];

impl RunStatus {
    pub const ALL: [RunStatus; 4] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Succeeded,
        RunStatus::Failed,
    ];

    /// Statuses reachable from `self` in one step.
    pub fn allowed_targets(self) -> &'static [RunStatus] {
        TRANSITIONS
            .iter()
            .find(|(from, _)| *from == self)
            .map(|(_, targets)| *targets)
            .unwrap_or(&[])
    }

    pub fn can_transition_to(self, target: RunStatus) -> bool {
        self.allowed_targets().contains(&target)
    }

    /// `SUCCEEDED` and `FAILED` have no outgoing edges.
    pub fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown ingest run status '{0}': must be one of PENDING, RUNNING, SUCCEEDED, FAILED")]
pub struct ParseStatusError(pub String);

impl FromStr for RunStatus {
    type Err = ParseStatusError;

    /// Case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        RunStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

// ── Run record ───────────────────────────────────────────────────────

/// One tracked unit of data-ingestion work.
///
/// `requested_user`, `months`, `dataset_id`, `note` and `created_at` are fixed
/// at creation. Only the tracker produces new versions of a run, through
/// [`IngestRun::advance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub requested_user: String,
    /// Ingestion periods in processing order.
    pub months: Vec<String>,
    #[serde(default)]
    pub dataset_id: String,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub report_uri: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl IngestRun {
    /// A fresh `PENDING` run.
    pub fn new(
        id: Uuid,
        requested_user: impl Into<String>,
        months: Vec<String>,
        dataset_id: impl Into<String>,
        note: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            status: RunStatus::Pending,
            requested_user: requested_user.into(),
            months,
            dataset_id: dataset_id.into(),
            note: note.into(),
            report_uri: None,
            error: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    /// Next version of this run in `target` status. Does not check the edge;
    /// callers validate with [`RunStatus::can_transition_to`] first.
    pub fn advance(
        &self,
        target: RunStatus,
        now: DateTime<Utc>,
        report_uri: Option<String>,
        error: Option<String>,
    ) -> Self {
        let mut next = self.clone();
        next.status = target;
        next.updated_at = now;
        if report_uri.is_some() {
            next.report_uri = report_uri;
        }
        if error.is_some() {
            next.error = error;
        }
        if target.is_terminal() {
            next.finished_at = Some(now);
        }
        next
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::record::{FailureKind, JobId, JobRecord, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Queued,
    Running,
    Progress,
    Succeeded,
    Failed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Queued => write!(f, "queued"),
            EventKind::Running => write!(f, "running"),
            EventKind::Progress => write!(f, "progress"),
            EventKind::Succeeded => write!(f, "succeeded"),
            EventKind::Failed => write!(f, "failed"),
        }
    }
}

/// Monotonically sequenced per-job record of a state-or-progress change.
/// Carries a snapshot of the record fields at emission time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    pub seq: i64,

    pub job_id: JobId,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub state: JobState,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_summary: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    pub fn snapshot(seq: i64, kind: EventKind, record: &JobRecord, at: DateTime<Utc>) -> Self {
        Self {
            seq,
            job_id: record.id.clone(),
            kind,
            state: record.state,
            step: record.current_step.clone(),
            message: record.message.clone(),
            error: record.error.clone(),
            failure_kind: record.failure_kind,
            failure_summary: record.failure_summary.clone(),
            heartbeat_at: record.heartbeat_at,
            exit_code: record.exit_code,
            at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Job identifier: 128 random bits rendered as 32 lowercase hex characters.
/// Doubles as the on-disk directory name and the URL path segment, so it is
/// validated to contain nothing but hex digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() != 32 {
            return None;
        }
        if !raw
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "QUEUED"),
            JobState::Running => write!(f, "RUNNING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Failure taxonomy assigned only to FAILED jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Syntax,
    Constraints,
    Timing,
    Synthesis,
    Implementation,
    Internal,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Syntax => "syntax",
            FailureKind::Constraints => "constraints",
            FailureKind::Timing => "timing",
            FailureKind::Synthesis => "synthesis",
            FailureKind::Implementation => "implementation",
            FailureKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance payload parsed from the uploaded bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub project: String,
    pub entry: String,
    pub request_sha256: String,
    pub request_size_bytes: u64,
}

#[derive(Error, Debug)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// The authoritative per-job document, persisted as `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,

    pub state: JobState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_step: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_summary: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    pub spec: JobSpec,
}

impl JobRecord {
    pub fn new(id: JobId, spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id,
            state: JobState::Queued,
            message: String::new(),
            error: String::new(),
            current_step: String::new(),
            failure_kind: None,
            failure_summary: String::new(),
            heartbeat_at: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            exit_code: None,
            spec,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply a state transition, updating the timestamp bookkeeping that goes
    /// with it. Self-transitions are permitted; terminal states are frozen.
    pub fn transition(
        &mut self,
        next: JobState,
        now: DateTime<Utc>,
        message: &str,
    ) -> Result<(), InvalidTransition> {
        if !valid_transition(self.state, next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = now;
        self.message = message.to_string();
        if next == JobState::Running {
            self.started_at = Some(now);
            self.finished_at = None;
            self.exit_code = None;
            self.error.clear();
            self.heartbeat_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
            self.heartbeat_at = Some(now);
        }
        Ok(())
    }

    pub fn mark_succeeded(
        &mut self,
        now: DateTime<Utc>,
        message: &str,
        exit_code: i32,
    ) -> Result<(), InvalidTransition> {
        if self.state != JobState::Running {
            return Err(InvalidTransition {
                from: self.state,
                to: JobState::Succeeded,
            });
        }
        self.transition(JobState::Succeeded, now, message)?;
        self.error.clear();
        self.exit_code = Some(exit_code);
        Ok(())
    }

    /// Record a failure. Valid from RUNNING or QUEUED (a job can fail before
    /// it ever starts, e.g. when recovery abandons it). An empty error text
    /// is replaced by a generic one so the record never carries a silent
    /// failure.
    pub fn mark_failed(
        &mut self,
        now: DateTime<Utc>,
        message: &str,
        error: &str,
        exit_code: i32,
    ) -> Result<(), InvalidTransition> {
        if self.state != JobState::Running && self.state != JobState::Queued {
            return Err(InvalidTransition {
                from: self.state,
                to: JobState::Failed,
            });
        }
        if self.state != JobState::Failed {
            self.transition(JobState::Failed, now, message)?;
        }
        self.error = if error.is_empty() {
            "job failed".to_string()
        } else {
            error.to_string()
        };
        self.exit_code = Some(exit_code);
        Ok(())
    }
}

fn valid_transition(from: JobState, to: JobState) -> bool {
    if from == to {
        return true;
    }
    match from {
        JobState::Queued => matches!(to, JobState::Running | JobState::Failed),
        JobState::Running => matches!(to, JobState::Succeeded | JobState::Failed),
        JobState::Succeeded | JobState::Failed => false,
    }
}

//! The queue's only view of the external tool.
//!
//! A [`Runner`] consumes one prepared job directory and reports a terminal
//! outcome. Progress is marshalled back over a bounded channel carried in
//! [`PreparedJob`]; the queue manager drains it and applies each update as
//! an atomic record mutation, so runners never touch the manager's lock.

pub mod command;
pub mod fake;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::job::{JobId, JobSpec};

pub use command::CommandRunner;
pub use fake::FakeRunner;

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub step: String,
    pub message: String,
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// Everything a runner needs to execute one job.
pub struct PreparedJob {
    pub id: JobId,
    pub work_dir: PathBuf,
    pub source_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub spec: JobSpec,
    pub progress: mpsc::Sender<ProgressUpdate>,
    pub cancel: CancellationToken,
}

impl PreparedJob {
    /// Report a progress step. Sends are best-effort: a closed channel means
    /// the job already left RUNNING and the update would be ignored anyway.
    pub async fn report(&self, step: &str, message: &str) {
        let _ = self
            .progress
            .send(ProgressUpdate {
                step: step.to_string(),
                message: message.to_string(),
                heartbeat_at: Some(Utc::now()),
            })
            .await;
    }
}

/// Terminal outcome of one run. `error == None` means the job succeeded and
/// `exit_code` is authoritative; otherwise the job failed with the given
/// error text and whatever exit code the tool reported.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub message: String,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn success(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
            error: None,
        }
    }

    pub fn failure(exit_code: i32, message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunnerInfo {
    pub name: String,
    pub version: String,
    pub binary: String,
}

#[async_trait]
pub trait Runner: Send + Sync {
    /// Execute one prepared job to completion. Must write a `console.log`
    /// into the artifacts dir capturing the tool's combined output, and must
    /// return promptly once `job.cancel` fires.
    async fn run(&self, job: PreparedJob) -> RunOutcome;

    fn describe(&self) -> RunnerInfo;
}

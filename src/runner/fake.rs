use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::fs;
use tokio::sync::Notify;

use super::{PreparedJob, RunOutcome, Runner, RunnerInfo};
use crate::job::JobId;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Deterministic runner for tests and local dry runs.
///
/// Writes canned logs and artifacts, optionally fails configured projects,
/// and can be gated so a run blocks until [`FakeRunner::release`] is called.
#[derive(Debug, Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<JobId>>,

    fail_projects: HashMap<String, String>,
    gate: Option<Arc<Notify>>,
    heartbeat_interval: Option<Duration>,
    console_log: Option<String>,
    tool_log: Option<String>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make runs for `project` fail with `error`.
    pub fn with_fail_project(mut self, project: impl Into<String>, error: impl Into<String>) -> Self {
        self.fail_projects.insert(project.into(), error.into());
        self
    }

    /// Gate runs: each run blocks (heartbeating) until `release` is called.
    pub fn with_gate(mut self) -> Self {
        self.gate = Some(Arc::new(Notify::new()));
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_console_log(mut self, contents: impl Into<String>) -> Self {
        self.console_log = Some(contents.into());
        self
    }

    pub fn with_tool_log(mut self, contents: impl Into<String>) -> Self {
        self.tool_log = Some(contents.into());
        self
    }

    /// Unblock one gated run.
    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    /// Job ids this runner has executed, in order.
    pub fn calls(&self) -> Vec<JobId> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Runner for FakeRunner {
    async fn run(&self, job: PreparedJob) -> RunOutcome {
        job.report("prepare", "fake run preparing workspace").await;

        if let Err(err) = fs::create_dir_all(&job.artifacts_dir).await {
            return RunOutcome::failure(1, "failed to prepare artifacts directory", err.to_string());
        }

        if let Ok(mut calls) = self.calls.lock() {
            calls.push(job.id.clone());
        }

        if let Some(gate) = &self.gate {
            job.report("compile", "fake compile step running").await;
            let interval = self
                .heartbeat_interval
                .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL);
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = job.cancel.cancelled() => {
                        return RunOutcome::failure(-1, "fake run canceled", "job canceled");
                    }
                    _ = ticker.tick() => {
                        job.report("compile", "fake heartbeat").await;
                    }
                    _ = gate.notified() => break,
                }
            }
        }
        job.report("package", "fake package step running").await;

        let fail_error = self.fail_projects.get(&job.spec.project);
        let mut console_log = self
            .console_log
            .clone()
            .unwrap_or_else(|| "fake run\n".to_string());
        let mut tool_log = self
            .tool_log
            .clone()
            .unwrap_or_else(|| "tool fake\n".to_string());
        if fail_error.is_some() {
            if !console_log.contains("ERROR:") {
                console_log.push_str("ERROR: [Synth 8-2716] syntax error near 'input' [src/top.v:1]\n");
            }
            if !tool_log.contains("ERROR:") {
                tool_log.push_str("ERROR: [Common 17-69] Command failed: Synthesis failed\n");
            }
        }

        let console_path = job.artifacts_dir.join(crate::store::CONSOLE_LOG_NAME);
        if let Err(err) = fs::write(&console_path, console_log).await {
            return RunOutcome::failure(1, "failed to write console log", err.to_string());
        }
        if let Err(err) = fs::write(job.artifacts_dir.join("tool.log"), tool_log).await {
            return RunOutcome::failure(1, "failed to write tool log", err.to_string());
        }

        if let Some(error) = fail_error {
            job.report("failed", "fake run failed").await;
            return RunOutcome::failure(2, "fake run failed", error.clone());
        }

        if let Err(err) = fs::write(job.artifacts_dir.join("output.bin"), b"fake-output").await {
            return RunOutcome::failure(1, "failed to write output", err.to_string());
        }
        job.report("output", "fake output written").await;
        RunOutcome::success(0, format!("fake run succeeded for {}", job.id))
    }

    fn describe(&self) -> RunnerInfo {
        RunnerInfo {
            name: "fake".to_string(),
            version: "fake".to_string(),
            binary: "fake".to_string(),
        }
    }
}

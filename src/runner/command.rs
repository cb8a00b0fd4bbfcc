use std::process::Stdio;
use std::time::Duration;

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use super::{PreparedJob, RunOutcome, Runner, RunnerInfo};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const STEP_MARKER: &str = "==> ";
const TOOL_LOG_NAME: &str = "tool.log";

/// Runs the configured external tool binary against the extracted bundle.
///
/// The tool is invoked as `<bin> <entry>` with the job's work directory as
/// its working directory. Combined stdout/stderr is streamed into
/// `console.log`; lines beginning with `==> ` mark step transitions and are
/// forwarded as progress updates. A secondary `tool.log` written by the tool
/// into the work directory is copied into the artifacts dir when present.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    bin: String,
    heartbeat_interval: Duration,
}

impl CommandRunner {
    pub fn new(bin: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

#[async_trait::async_trait]
impl Runner for CommandRunner {
    async fn run(&self, job: PreparedJob) -> RunOutcome {
        if let Err(err) = fs::create_dir_all(&job.artifacts_dir).await {
            return RunOutcome::failure(-1, "failed to prepare artifacts directory", err.to_string());
        }
        if let Err(err) = fs::create_dir_all(&job.work_dir).await {
            return RunOutcome::failure(-1, "failed to prepare work directory", err.to_string());
        }

        let console_path = job.artifacts_dir.join(crate::store::CONSOLE_LOG_NAME);
        let console = match fs::File::create(&console_path).await {
            Ok(file) => file,
            Err(err) => {
                return RunOutcome::failure(-1, "failed to create console log", err.to_string())
            }
        };

        let entry_path = job.source_dir.join(&job.spec.entry);
        job.report("launch", &format!("starting {}", self.bin)).await;

        let mut child = match Command::new(&self.bin)
            .arg(&entry_path)
            .current_dir(&job.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                tracing::error!(job_id = %job.id, bin = %self.bin, error = %err, "Tool spawn failed");
                return RunOutcome::failure(-1, "tool invocation failed", err.to_string());
            }
        };

        // All output funnels through one writer task so console.log stays
        // line-coherent even though stdout and stderr race.
        let (line_tx, line_rx) = mpsc::channel::<String>(256);
        let mut reader_handles = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            reader_handles.push(tokio::spawn(pump_lines(stdout, line_tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            reader_handles.push(tokio::spawn(pump_lines(stderr, line_tx.clone())));
        }
        drop(line_tx);

        let writer_handle = tokio::spawn(write_console(console, line_rx, job.progress.clone()));

        let heartbeat = {
            let job_progress = job.progress.clone();
            let interval = self.heartbeat_interval;
            let done = job.cancel.child_token();
            let handle_token = done.clone();
            let handle = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = done.cancelled() => return,
                        _ = ticker.tick() => {
                            let _ = job_progress
                                .send(super::ProgressUpdate {
                                    step: String::new(),
                                    message: String::new(),
                                    heartbeat_at: Some(chrono::Utc::now()),
                                })
                                .await;
                        }
                    }
                }
            });
            (handle_token, handle)
        };

        let status = tokio::select! {
            status = child.wait() => status,
            _ = job.cancel.cancelled() => {
                let _ = child.kill().await;
                heartbeat.0.cancel();
                let _ = heartbeat.1.await;
                for handle in reader_handles {
                    let _ = handle.await;
                }
                let _ = writer_handle.await;
                return RunOutcome::failure(-1, "tool run canceled", "job canceled");
            }
        };

        heartbeat.0.cancel();
        let _ = heartbeat.1.await;
        for handle in reader_handles {
            let _ = handle.await;
        }
        let _ = writer_handle.await;

        copy_if_exists(
            &job.work_dir.join(TOOL_LOG_NAME),
            &job.artifacts_dir.join(TOOL_LOG_NAME),
        )
        .await;

        match status {
            Ok(status) => {
                let exit_code = status.code().unwrap_or(-1);
                if status.success() {
                    RunOutcome::success(exit_code, "tool run succeeded")
                } else {
                    RunOutcome::failure(
                        exit_code,
                        "tool exited non-zero",
                        format!("tool exited {exit_code}"),
                    )
                }
            }
            Err(err) => RunOutcome::failure(-1, "tool invocation failed", err.to_string()),
        }
    }

    fn describe(&self) -> RunnerInfo {
        RunnerInfo {
            name: "tool".to_string(),
            version: "unknown".to_string(),
            binary: self.bin.clone(),
        }
    }
}

async fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).await.is_err() {
            return;
        }
    }
}

async fn write_console(
    mut console: fs::File,
    mut line_rx: mpsc::Receiver<String>,
    progress: mpsc::Sender<super::ProgressUpdate>,
) {
    while let Some(line) = line_rx.recv().await {
        if console.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        let _ = console.write_all(b"\n").await;

        if let Some(step) = line.strip_prefix(STEP_MARKER) {
            let step = step.trim();
            if !step.is_empty() {
                let _ = progress
                    .send(super::ProgressUpdate {
                        step: step.to_string(),
                        message: line.clone(),
                        heartbeat_at: Some(chrono::Utc::now()),
                    })
                    .await;
            }
        }
    }
    let _ = console.flush().await;
}

async fn copy_if_exists(from: &std::path::Path, to: &std::path::Path) {
    if fs::try_exists(from).await.unwrap_or(false) {
        if let Err(err) = fs::copy(from, to).await {
            tracing::warn!(from = %from.display(), error = %err, "Failed to copy tool log");
        }
    }
}

//! Per-job artifact outputs: diagnostics report, artifact manifest, and
//! console log access.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::diagnostics::{self, DiagnosticsReport};
use crate::error::{ForgeError, Result};
use crate::job::{FailureKind, JobId, JobState};
use crate::runner::RunOutcome;
use crate::store::CONSOLE_LOG_NAME;

use super::QueueManager;

pub const DIAGNOSTICS_FILE_NAME: &str = "diagnostics.json";
pub const ARTIFACT_MANIFEST_NAME: &str = "artifact_manifest.json";
const TOOL_LOG_NAME: &str = "tool.log";

const DEFAULT_CONSOLE_TAIL_LINES: usize = 200;
const MAX_CONSOLE_TAIL_LINES: usize = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestRunner {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub binary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestDiagnostics {
    pub errors: usize,
    pub warnings: usize,
    pub info: usize,
}

/// Summary of everything a terminal job left behind, written next to the
/// artifacts themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub schema: u32,

    pub job_id: JobId,
    pub generated_at: DateTime<Utc>,
    pub state: JobState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_summary: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub result_message: String,
    pub exit_code: i32,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_sha256: String,

    pub runner: ManifestRunner,
    pub diagnostics: ManifestDiagnostics,

    pub files: Vec<ArtifactFile>,
}

impl QueueManager {
    pub async fn read_console_log(&self, id: &JobId) -> Result<Vec<u8>> {
        Ok(fs::read(self.store().console_log_path(id)).await?)
    }

    pub async fn read_console_tail(&self, id: &JobId, lines: usize) -> Result<Vec<u8>> {
        let raw = self.read_console_log(id).await?;
        let lines = if lines == 0 {
            DEFAULT_CONSOLE_TAIL_LINES
        } else {
            lines.min(MAX_CONSOLE_TAIL_LINES)
        };
        Ok(tail_last_lines(&raw, lines))
    }

    pub async fn read_diagnostics(&self, id: &JobId) -> Result<Vec<u8>> {
        let path = self.store().artifacts_job_dir(id).join(DIAGNOSTICS_FILE_NAME);
        Ok(fs::read(path).await?)
    }

    /// Zip the job's artifacts directory into memory. Only terminal jobs
    /// have a stable artifact tree to hand out.
    pub async fn download_artifacts(&self, id: &JobId) -> Result<Vec<u8>> {
        let record = self
            .get(id)
            .await
            .ok_or_else(|| ForgeError::JobNotFound(id.to_string()))?;
        if !record.is_terminal() {
            return Err(ForgeError::JobNotTerminal(id.to_string()));
        }
        let dir = self.store().artifacts_job_dir(id);
        let bytes = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let mut cursor = io::Cursor::new(Vec::new());
            crate::archive::write_zip_from_dir(&dir, &mut cursor)?;
            Ok(cursor.into_inner())
        })
        .await
        .map_err(|err| ForgeError::Internal(format!("artifact pack task failed: {err}")))??;
        Ok(bytes)
    }

    /// Scan the job's logs and persist `diagnostics.json`. Failures here are
    /// logged, not fatal: the report is a secondary artifact.
    pub(crate) async fn write_diagnostics_report(&self, id: &JobId) -> DiagnosticsReport {
        let art_dir = self.store().artifacts_job_dir(id);
        if let Err(err) = fs::create_dir_all(&art_dir).await {
            tracing::warn!(job_id = %id, error = %err, "Failed to create artifacts dir");
        }

        let mut logs = Vec::new();
        for name in [TOOL_LOG_NAME, CONSOLE_LOG_NAME] {
            if let Ok(raw) = fs::read(art_dir.join(name)).await {
                logs.push((name.to_string(), raw));
            }
        }
        let report = diagnostics::build_report(&logs);

        match serde_json::to_vec_pretty(&report) {
            Ok(raw) => {
                if let Err(err) = fs::write(art_dir.join(DIAGNOSTICS_FILE_NAME), raw).await {
                    tracing::warn!(job_id = %id, error = %err, "Failed to write diagnostics report");
                }
            }
            Err(err) => {
                tracing::warn!(job_id = %id, error = %err, "Failed to serialize diagnostics report");
            }
        }
        report
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn write_artifact_manifest(
        &self,
        id: &JobId,
        final_state: JobState,
        outcome: &RunOutcome,
        report: &DiagnosticsReport,
        failure_kind: Option<FailureKind>,
        failure_summary: &str,
        request_sha256: &str,
    ) -> Result<()> {
        let art_dir = self.store().artifacts_job_dir(id);
        fs::create_dir_all(&art_dir).await?;

        let files = {
            let dir = art_dir.clone();
            tokio::task::spawn_blocking(move || collect_artifact_files(&dir))
                .await
                .map_err(|err| ForgeError::Internal(format!("artifact scan task failed: {err}")))??
        };

        let info = self.runner().describe();
        let manifest = ArtifactManifest {
            schema: 1,
            job_id: id.clone(),
            generated_at: Utc::now(),
            state: final_state,
            failure_kind,
            failure_summary: failure_summary.to_string(),
            result_message: outcome.message.clone(),
            exit_code: outcome.exit_code,
            request_sha256: request_sha256.to_string(),
            runner: ManifestRunner {
                name: info.name,
                version: info.version,
                binary: info.binary,
            },
            diagnostics: ManifestDiagnostics {
                errors: report.error_count,
                warnings: report.warning_count,
                info: report.info_count,
            },
            files,
        };

        let raw = serde_json::to_vec_pretty(&manifest)?;
        fs::write(art_dir.join(ARTIFACT_MANIFEST_NAME), raw).await?;
        Ok(())
    }
}

/// Every file under the artifacts dir (except the manifest itself) with its
/// size and SHA-256, sorted by path.
fn collect_artifact_files(art_dir: &Path) -> Result<Vec<ArtifactFile>> {
    let mut files = Vec::new();
    collect_into(art_dir, art_dir, &mut files)?;
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn collect_into(root: &Path, dir: &Path, out: &mut Vec<ArtifactFile>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_into(root, &path, out)?;
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map(|p| {
                p.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_else(|_| path.display().to_string());
        if rel == ARTIFACT_MANIFEST_NAME {
            continue;
        }
        let raw = std::fs::read(&path)?;
        out.push(ArtifactFile {
            path: rel,
            size: raw.len() as u64,
            sha256: hex::encode(Sha256::digest(&raw)),
        });
    }
    Ok(())
}

fn tail_last_lines(raw: &[u8], lines: usize) -> Vec<u8> {
    if lines == 0 {
        return raw.to_vec();
    }
    let text = String::from_utf8_lossy(raw);
    let mut parts: Vec<&str> = text.split('\n').collect();
    if parts.last() == Some(&"") {
        parts.pop();
    }
    if parts.is_empty() {
        return Vec::new();
    }
    let start = parts.len().saturating_sub(lines);
    let mut out = parts[start..].join("\n");
    out.push('\n');
    out.into_bytes()
}

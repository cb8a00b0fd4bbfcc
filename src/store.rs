//! On-disk layout for jobs.
//!
//! ```text
//! jobs/<id>/state.json      authoritative record
//! jobs/<id>/request.zip     verbatim upload
//! work/<id>/src/            extracted bundle, ephemeral
//! artifacts/<id>/           console.log, diagnostics.json, tool outputs
//! history/recent.json       bounded history tail
//! ```

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::config::Config;
use crate::error::Result;
use crate::job::{JobId, JobRecord};

pub const STATE_FILE_NAME: &str = "state.json";
pub const REQUEST_FILE_NAME: &str = "request.zip";
pub const CONSOLE_LOG_NAME: &str = "console.log";

#[derive(Debug, Clone)]
pub struct Store {
    cfg: Config,
}

impl Store {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }

    pub async fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.cfg.base_dir.clone(),
            self.cfg.jobs_dir(),
            self.cfg.work_dir(),
            self.cfg.artifacts_dir(),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        if let Some(history_dir) = self.cfg.history_path().parent() {
            fs::create_dir_all(history_dir).await?;
        }
        Ok(())
    }

    pub async fn create_job_layout(&self, id: &JobId) -> Result<()> {
        for dir in [
            self.job_dir(id),
            self.work_job_dir(id),
            self.source_dir(id),
            self.artifacts_job_dir(id),
        ] {
            fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Stream the request payload to disk, computing its SHA-256 and size in
    /// the same pass.
    pub async fn write_request<R>(&self, id: &JobId, reader: &mut R) -> Result<(String, u64)>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut file = fs::File::create(self.request_path(id)).await?;
        let mut hasher = Sha256::new();
        let mut size: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        file.flush().await?;
        Ok((hex::encode(hasher.finalize()), size))
    }

    /// Persist the record. Writes go to a sibling temp file which is then
    /// renamed into place, so a concurrent `load` never observes a torn file.
    pub async fn save(&self, record: &JobRecord) -> Result<()> {
        let path = self.state_path(&record.id);
        let raw = serde_json::to_vec_pretty(record)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &raw).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load(&self, id: &JobId) -> Result<JobRecord> {
        let raw = fs::read(self.state_path(id)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Load every persisted record, ordered by `created_at` ascending for
    /// deterministic recovery replay. Directories that do not look like job
    /// dirs, or that have no readable state file, are skipped with a log.
    pub async fn load_all(&self) -> Result<Vec<JobRecord>> {
        let jobs_dir = self.cfg.jobs_dir();
        let mut entries = match fs::read_dir(&jobs_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(id) = JobId::parse(&name) else {
                tracing::warn!(dir = %name, "Skipping non-job directory in jobs dir");
                continue;
            };
            match self.load(&id).await {
                Ok(rec) => records.push(rec),
                Err(err) => {
                    tracing::warn!(job_id = %id, error = %err, "Skipping unreadable job state");
                }
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    pub async fn remove_work_dir(&self, id: &JobId) -> Result<()> {
        remove_dir_if_exists(self.work_job_dir(id)).await
    }

    /// Remove every on-disk trace of a job: its record, upload, artifacts
    /// and workspace.
    pub async fn remove_job_data(&self, id: &JobId) -> Result<()> {
        for dir in [
            self.job_dir(id),
            self.artifacts_job_dir(id),
            self.work_job_dir(id),
        ] {
            remove_dir_if_exists(dir).await?;
        }
        Ok(())
    }

    pub fn job_dir(&self, id: &JobId) -> PathBuf {
        self.cfg.jobs_dir().join(id.as_str())
    }

    pub fn state_path(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join(STATE_FILE_NAME)
    }

    pub fn request_path(&self, id: &JobId) -> PathBuf {
        self.job_dir(id).join(REQUEST_FILE_NAME)
    }

    pub fn work_job_dir(&self, id: &JobId) -> PathBuf {
        self.cfg.work_dir().join(id.as_str())
    }

    pub fn source_dir(&self, id: &JobId) -> PathBuf {
        self.work_job_dir(id).join("src")
    }

    pub fn artifacts_job_dir(&self, id: &JobId) -> PathBuf {
        self.cfg.artifacts_dir().join(id.as_str())
    }

    pub fn console_log_path(&self, id: &JobId) -> PathBuf {
        self.artifacts_job_dir(id).join(CONSOLE_LOG_NAME)
    }
}

async fn remove_dir_if_exists(dir: PathBuf) -> Result<()> {
    match fs::remove_dir_all(&dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

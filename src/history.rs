//! Bounded, atomically persisted tail of completed jobs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::job::{JobId, JobState};

const CURRENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryItem {
    pub job_id: JobId,
    pub project: String,
    pub request_sha256: String,
    pub request_size_bytes: u64,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub state: JobState,
}

#[derive(Debug, Serialize, Deserialize)]
struct FilePayload {
    version: u32,
    items: Vec<HistoryItem>,
}

/// Most-recent-first list of terminal jobs, capped at `limit` entries and
/// persisted as a whole file via temp + rename. Loaded lazily on first use.
#[derive(Debug)]
pub struct HistoryStore {
    path: PathBuf,
    limit: usize,
    items: Mutex<Option<Vec<HistoryItem>>>,
}

impl HistoryStore {
    pub fn new(path: PathBuf, limit: usize) -> Self {
        let limit = if limit == 0 { 100 } else { limit };
        Self {
            path,
            limit,
            items: Mutex::new(None),
        }
    }

    /// Prepend an item, dropping any older entry for the same job id and
    /// trimming to the limit.
    pub async fn append(&self, item: HistoryItem) -> Result<()> {
        let mut guard = self.items.lock().await;
        let items = self.load_locked(&mut *guard).await?;

        let mut next = Vec::with_capacity(items.len() + 1);
        next.push(item.clone());
        next.extend(
            items
                .iter()
                .filter(|existing| existing.job_id != item.job_id)
                .cloned(),
        );
        next.truncate(self.limit);
        *guard = Some(next);
        self.persist_locked(guard.as_deref().unwrap_or_default()).await
    }

    pub async fn list(&self, limit: usize) -> Result<Vec<HistoryItem>> {
        let mut guard = self.items.lock().await;
        let items = self.load_locked(&mut *guard).await?;
        let limit = if limit == 0 { 20 } else { limit };
        let limit = limit.min(self.limit).min(items.len());
        Ok(items[..limit].to_vec())
    }

    async fn load_locked<'a>(
        &self,
        guard: &'a mut Option<Vec<HistoryItem>>,
    ) -> Result<&'a mut Vec<HistoryItem>> {
        if guard.is_none() {
            let items = match fs::read(&self.path).await {
                Ok(raw) => {
                    let payload: FilePayload = serde_json::from_slice(&raw)?;
                    let mut items = payload.items;
                    items.truncate(self.limit);
                    items
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
                Err(err) => return Err(err.into()),
            };
            *guard = Some(items);
        }
        Ok(guard.get_or_insert_with(Vec::new))
    }

    async fn persist_locked(&self, items: &[HistoryItem]) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let payload = FilePayload {
            version: CURRENT_VERSION,
            items: items.to_vec(),
        };
        let raw = serde_json::to_vec_pretty(&payload)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &raw).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

//! The persistent job queue: in-memory index, single worker, event fan-out,
//! restart recovery and history-capped pruning.

pub mod artifacts;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tokio::fs;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::diagnostics;
use crate::error::{ForgeError, Result};
use crate::history::{HistoryItem, HistoryStore};
use crate::job::{EventKind, JobEvent, JobId, JobRecord, JobSpec, JobState};
use crate::runner::{PreparedJob, ProgressUpdate, RunOutcome, Runner};
use crate::store::Store;

const QUEUE_CAPACITY: usize = 4096;
const MAX_EVENTS_PER_JOB: usize = 512;
const SUBSCRIBER_BUFFER: usize = 128;
const PROGRESS_BUFFER: usize = 64;

const BUNDLE_SPEC_NAME: &str = "bundle.json";
const MAX_PROJECT_LEN: usize = 64;

/// Result of subscribing to a job's event stream: the stored backlog, plus a
/// live receiver unless the job is already terminal.
pub struct EventSubscription {
    pub backlog: Vec<JobEvent>,
    pub live: Option<broadcast::Receiver<JobEvent>>,
}

#[derive(Debug, Deserialize)]
struct BundleSpec {
    project: String,
    entry: String,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, JobRecord>,
    events: HashMap<JobId, VecDeque<JobEvent>>,
    next_seq: HashMap<JobId, i64>,
    live: HashMap<JobId, broadcast::Sender<JobEvent>>,
}

impl Inner {
    /// Allocate the next sequence number, append the event to the job's ring
    /// and fan it out. Must run with the manager's write lock held so that
    /// sequence numbers linearize with record mutations.
    fn emit_event(&mut self, record: &JobRecord, kind: EventKind) {
        let seq = self.next_seq.get(&record.id).copied().unwrap_or(0) + 1;
        self.next_seq.insert(record.id.clone(), seq);

        let event = JobEvent::snapshot(seq, kind, record, Utc::now());

        let ring = self.events.entry(record.id.clone()).or_default();
        ring.push_back(event.clone());
        while ring.len() > MAX_EVENTS_PER_JOB {
            ring.pop_front();
        }

        let terminal = event.is_terminal();
        if let Some(tx) = self.live.get(&record.id) {
            // Slow subscribers lose overwritten non-terminal events; the
            // terminal event is emitted last and the sender is dropped right
            // after, so every receiver that keeps reading observes it.
            let _ = tx.send(event);
        }
        if terminal {
            self.live.remove(&record.id);
        }
    }

    fn backlog_since(&self, id: &JobId, since: i64) -> Vec<JobEvent> {
        self.events
            .get(id)
            .map(|ring| ring.iter().filter(|e| e.seq > since).cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the oldest terminal jobs until at most `limit` remain. Returns
    /// the ids whose on-disk data should be removed by the caller.
    fn prune_terminal(&mut self, limit: usize) -> Vec<JobId> {
        let mut terminal: Vec<(chrono::DateTime<Utc>, JobId)> = self
            .jobs
            .values()
            .filter(|r| r.is_terminal())
            .map(|r| (r.created_at, r.id.clone()))
            .collect();
        if terminal.len() <= limit {
            return Vec::new();
        }
        terminal.sort_by_key(|(created_at, _)| *created_at);

        let excess = terminal.len() - limit;
        let mut removed = Vec::with_capacity(excess);
        for (_, id) in terminal.into_iter().take(excess) {
            self.jobs.remove(&id);
            self.events.remove(&id);
            self.next_seq.remove(&id);
            self.live.remove(&id);
            removed.push(id);
        }
        removed
    }
}

pub struct QueueManager {
    cfg: Config,
    store: Store,
    runner: Arc<dyn Runner>,
    history: HistoryStore,

    inner: RwLock<Inner>,
    queue_tx: mpsc::Sender<JobId>,
    queue_rx: std::sync::Mutex<Option<mpsc::Receiver<JobId>>>,
}

impl QueueManager {
    pub fn new(cfg: Config, store: Store, runner: Arc<dyn Runner>, history: HistoryStore) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            cfg,
            store,
            runner,
            history,
            inner: RwLock::new(Inner::default()),
            queue_tx,
            queue_rx: std::sync::Mutex::new(Some(queue_rx)),
        }
    }

    /// Recover persisted jobs and start the single worker. Calling `start`
    /// again is a no-op.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        self.store.ensure_dirs().await?;
        self.recover().await?;

        let rx = self
            .queue_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(rx) = rx {
            let manager = Arc::clone(self);
            tokio::spawn(async move { manager.worker_loop(rx, shutdown).await });
        }
        Ok(())
    }

    /// Register a new job from an uploaded bundle. The payload is written to
    /// disk verbatim, extracted, and validated before the record is created;
    /// a failure at any point leaves no trace on disk.
    pub async fn submit(&self, bundle: &[u8]) -> Result<JobRecord> {
        let id = JobId::generate();
        self.store.create_job_layout(&id).await?;
        match self.ingest(&id, bundle).await {
            Ok(record) => Ok(record),
            Err(err) => {
                if let Err(cleanup_err) = self.store.remove_job_data(&id).await {
                    tracing::warn!(job_id = %id, error = %cleanup_err, "Failed to clean up rejected job");
                }
                Err(err)
            }
        }
    }

    async fn ingest(&self, id: &JobId, bundle: &[u8]) -> Result<JobRecord> {
        let mut reader = bundle;
        let (sha256, size) = self.store.write_request(id, &mut reader).await?;
        self.extract_bundle(id).await?;
        let spec = self.load_bundle_spec(id, sha256, size).await?;

        let record = JobRecord::new(id.clone(), spec, Utc::now());
        self.store.save(&record).await?;
        self.register(record.clone()).await?;
        tracing::info!(job_id = %id, project = %record.spec.project, "Job queued");
        Ok(record)
    }

    /// Create a brand-new job from the stored upload of an existing terminal
    /// job. The new job gets a fresh id and event timeline.
    pub async fn resubmit(&self, source_id: &JobId) -> Result<JobRecord> {
        let source = self
            .get(source_id)
            .await
            .ok_or_else(|| ForgeError::JobNotFound(source_id.to_string()))?;
        if !source.is_terminal() {
            return Err(ForgeError::JobNotTerminal(source_id.to_string()));
        }

        let id = JobId::generate();
        self.store.create_job_layout(&id).await?;
        match self.ingest_resubmit(&id, &source).await {
            Ok(record) => {
                tracing::info!(job_id = %id, resubmit_of = %source_id, "Job resubmitted");
                Ok(record)
            }
            Err(err) => {
                if let Err(cleanup_err) = self.store.remove_job_data(&id).await {
                    tracing::warn!(job_id = %id, error = %cleanup_err, "Failed to clean up rejected job");
                }
                Err(err)
            }
        }
    }

    async fn ingest_resubmit(&self, id: &JobId, source: &JobRecord) -> Result<JobRecord> {
        let mut file = fs::File::open(self.store.request_path(&source.id)).await?;
        let (sha256, size) = self.store.write_request(id, &mut file).await?;
        self.extract_bundle(id).await?;

        let spec = JobSpec {
            project: source.spec.project.clone(),
            entry: source.spec.entry.clone(),
            request_sha256: sha256,
            request_size_bytes: size,
        };
        let record = JobRecord::new(id.clone(), spec, Utc::now());
        self.store.save(&record).await?;
        self.register(record.clone()).await?;
        Ok(record)
    }

    async fn register(&self, record: JobRecord) -> Result<()> {
        {
            let mut inner = self.inner.write().await;
            inner.jobs.insert(record.id.clone(), record.clone());
            inner.emit_event(&record, EventKind::Queued);
        }
        self.enqueue(record.id).await
    }

    /// Defensive copy of the job record, if known.
    pub async fn get(&self, id: &JobId) -> Option<JobRecord> {
        self.inner.read().await.jobs.get(id).cloned()
    }

    /// Known jobs, most recently created first.
    pub async fn list_jobs(&self, limit: usize) -> Vec<JobRecord> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<JobRecord> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs.truncate(limit);
        jobs
    }

    /// Subscribe to a job's events. Returns the backlog with `seq > since`;
    /// the live receiver is `None` when the job is already terminal.
    pub async fn subscribe_events(&self, id: &JobId, since: i64) -> Option<EventSubscription> {
        let mut inner = self.inner.write().await;
        let terminal = inner.jobs.get(id)?.is_terminal();
        let backlog = inner.backlog_since(id, since);
        if terminal {
            return Some(EventSubscription {
                backlog,
                live: None,
            });
        }
        let tx = inner
            .live
            .entry(id.clone())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0);
        Some(EventSubscription {
            backlog,
            live: Some(tx.subscribe()),
        })
    }

    pub async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryItem>> {
        self.history.list(limit).await
    }

    pub fn history_limit(&self) -> usize {
        self.cfg.history_limit
    }

    async fn recover(&self) -> Result<()> {
        let records = self.store.load_all().await?;
        let mut to_enqueue = Vec::new();
        let pruned = {
            let mut inner = self.inner.write().await;
            for mut record in records {
                match record.state {
                    JobState::Queued => {
                        to_enqueue.push(record.id.clone());
                        inner.jobs.insert(record.id.clone(), record);
                    }
                    JobState::Running => {
                        // A RUNNING record cannot be trusted across process
                        // boundaries: the process that owned the child died.
                        let now = Utc::now();
                        record.state = JobState::Queued;
                        record.updated_at = now;
                        record.message = "requeued after restart".to_string();
                        record.error.clear();
                        record.failure_kind = None;
                        record.failure_summary.clear();
                        record.current_step.clear();
                        record.started_at = None;
                        record.finished_at = None;
                        record.heartbeat_at = None;
                        record.exit_code = None;
                        self.store.save(&record).await?;
                        tracing::info!(job_id = %record.id, "Requeued interrupted job after restart");
                        to_enqueue.push(record.id.clone());
                        inner.jobs.insert(record.id.clone(), record);
                    }
                    JobState::Succeeded | JobState::Failed => {
                        inner.jobs.insert(record.id.clone(), record);
                    }
                }
            }
            inner.prune_terminal(self.cfg.history_limit)
        };
        self.remove_pruned(&pruned).await;
        for id in to_enqueue {
            self.enqueue(id).await?;
        }
        Ok(())
    }

    async fn worker_loop(self: Arc<Self>, mut rx: mpsc::Receiver<JobId>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Worker loop stopping");
                    return;
                }
                id = rx.recv() => {
                    match id {
                        Some(id) => self.process(id, &shutdown).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn process(self: &Arc<Self>, id: JobId, shutdown: &CancellationToken) {
        let Some(claimed) = self.claim(&id).await else {
            return;
        };
        tracing::info!(job_id = %id, project = %claimed.spec.project, "Job started");

        let (progress_tx, mut progress_rx) = mpsc::channel::<ProgressUpdate>(PROGRESS_BUFFER);
        let prepared = PreparedJob {
            id: id.clone(),
            work_dir: self.store.work_job_dir(&id),
            source_dir: self.store.source_dir(&id),
            artifacts_dir: self.store.artifacts_job_dir(&id),
            spec: claimed.spec.clone(),
            progress: progress_tx,
            cancel: shutdown.child_token(),
        };

        let drain = {
            let manager = Arc::clone(self);
            let id = id.clone();
            tokio::spawn(async move {
                while let Some(update) = progress_rx.recv().await {
                    manager.apply_progress(&id, update).await;
                }
            })
        };

        let outcome = match tokio::time::timeout(self.cfg.worker_timeout, self.runner.run(prepared))
            .await
        {
            Ok(outcome) => outcome,
            Err(_) => RunOutcome::failure(
                -1,
                format!(
                    "job timed out after {}s",
                    self.cfg.worker_timeout.as_secs()
                ),
                "deadline exceeded",
            ),
        };
        // The run future (and with it every progress sender) is gone; wait
        // for the drain task so no progress event can trail the terminal one.
        let _ = drain.await;

        let report = self.write_diagnostics_report(&id).await;
        let failed = outcome.error.is_some();
        let (failure_kind, failure_summary) = if failed {
            let (kind, summary) =
                diagnostics::infer_failure(&report, &outcome.message, outcome.error.as_deref());
            (Some(kind), summary)
        } else {
            (None, String::new())
        };

        let final_state = if failed {
            JobState::Failed
        } else {
            JobState::Succeeded
        };
        if let Err(err) = self
            .write_artifact_manifest(
                &id,
                final_state,
                &outcome,
                &report,
                failure_kind,
                &failure_summary,
                &claimed.spec.request_sha256,
            )
            .await
        {
            tracing::warn!(job_id = %id, error = %err, "Failed to write artifact manifest");
        }

        let (snapshot, pruned) = {
            let mut inner = self.inner.write().await;
            let Some(record) = inner.jobs.get_mut(&id) else {
                return;
            };
            let now = Utc::now();
            if failed {
                let error_text = outcome.error.clone().unwrap_or_default();
                if let Err(err) =
                    record.mark_failed(now, &outcome.message, &error_text, outcome.exit_code)
                {
                    // Callers must never observe a terminal record resurrected;
                    // force the failure fields in place instead.
                    tracing::error!(job_id = %id, error = %err, "Forcing failed state");
                    record.state = JobState::Failed;
                    record.updated_at = now;
                    record.message = outcome.message.clone();
                    record.error = error_text;
                    record.exit_code = Some(outcome.exit_code);
                    record.finished_at = Some(now);
                }
                record.failure_kind = failure_kind;
                record.failure_summary = failure_summary.clone();
                record.current_step = "failed".to_string();
            } else {
                if let Err(err) = record.mark_succeeded(now, &outcome.message, outcome.exit_code) {
                    tracing::error!(job_id = %id, error = %err, "Forcing succeeded state");
                    record.state = JobState::Succeeded;
                    record.updated_at = now;
                    record.message = outcome.message.clone();
                    record.error.clear();
                    record.exit_code = Some(outcome.exit_code);
                    record.finished_at = Some(now);
                }
                record.failure_kind = None;
                record.failure_summary.clear();
                record.current_step = "done".to_string();
            }
            let snapshot = record.clone();
            if let Err(err) = self.store.save(&snapshot).await {
                tracing::error!(job_id = %id, error = %err, "Failed to persist terminal state");
            }
            inner.emit_event(
                &snapshot,
                if failed {
                    EventKind::Failed
                } else {
                    EventKind::Succeeded
                },
            );
            let pruned = inner.prune_terminal(self.cfg.history_limit);
            (snapshot, pruned)
        };

        if failed {
            tracing::info!(
                job_id = %id,
                exit_code = snapshot.exit_code,
                failure_kind = snapshot.failure_kind.map(|k| k.as_str()),
                "Job failed"
            );
        } else {
            tracing::info!(job_id = %id, exit_code = snapshot.exit_code, "Job succeeded");
        }

        let history_item = HistoryItem {
            job_id: snapshot.id.clone(),
            project: snapshot.spec.project.clone(),
            request_sha256: snapshot.spec.request_sha256.clone(),
            request_size_bytes: snapshot.spec.request_size_bytes,
            submitted_at: snapshot.created_at,
            finished_at: snapshot.finished_at,
            state: snapshot.state,
        };
        if let Err(err) = self.history.append(history_item).await {
            tracing::warn!(job_id = %id, error = %err, "Failed to append history");
        }

        self.remove_pruned(&pruned).await;

        if !self.cfg.preserve_work_dir {
            if let Err(err) = self.store.remove_work_dir(&id).await {
                tracing::warn!(job_id = %id, error = %err, "Failed to remove work dir");
            }
        }
    }

    /// Flip a queued job to RUNNING under the lock; returns a snapshot of the
    /// claimed record, or `None` when the job was pruned or already picked up.
    async fn claim(&self, id: &JobId) -> Option<JobRecord> {
        let mut inner = self.inner.write().await;
        let record = inner.jobs.get_mut(id)?;
        if record.state != JobState::Queued {
            return None;
        }
        record
            .transition(JobState::Running, Utc::now(), "run started")
            .ok()?;
        record.current_step = "launch".to_string();
        let snapshot = record.clone();
        if let Err(err) = self.store.save(&snapshot).await {
            tracing::warn!(job_id = %id, error = %err, "Failed to persist running state");
        }
        inner.emit_event(&snapshot, EventKind::Running);
        Some(snapshot)
    }

    /// Apply one progress update atomically. Updates arriving after the job
    /// left RUNNING are ignored silently.
    async fn apply_progress(&self, id: &JobId, update: ProgressUpdate) {
        let mut inner = self.inner.write().await;
        let Some(record) = inner.jobs.get_mut(id) else {
            return;
        };
        if record.state != JobState::Running {
            return;
        }
        let now = update.heartbeat_at.unwrap_or_else(Utc::now);
        record.updated_at = now;
        record.heartbeat_at = Some(now);
        if !update.step.is_empty() {
            record.current_step = update.step;
        }
        if !update.message.is_empty() {
            record.message = update.message;
        }
        let snapshot = record.clone();
        if let Err(err) = self.store.save(&snapshot).await {
            tracing::warn!(job_id = %id, error = %err, "Failed to persist progress");
        }
        inner.emit_event(&snapshot, EventKind::Progress);
    }

    async fn remove_pruned(&self, pruned: &[JobId]) {
        for id in pruned {
            match self.store.remove_job_data(id).await {
                Ok(()) => tracing::debug!(job_id = %id, "Pruned terminal job"),
                Err(err) => {
                    tracing::warn!(job_id = %id, error = %err, "Failed to remove pruned job data");
                }
            }
        }
    }

    async fn enqueue(&self, id: JobId) -> Result<()> {
        self.queue_tx
            .send(id)
            .await
            .map_err(|_| ForgeError::QueueClosed)
    }

    async fn extract_bundle(&self, id: &JobId) -> Result<()> {
        let zip_path = self.store.request_path(id);
        let dest = self.store.source_dir(id);
        let limits = crate::archive::ExtractLimits {
            max_files: self.cfg.max_extracted_files,
            max_total_bytes: self.cfg.max_extracted_total_bytes,
            max_file_bytes: self.cfg.max_extracted_file_bytes,
        };
        tokio::task::spawn_blocking(move || crate::archive::extract_zip(&zip_path, &dest, limits))
            .await
            .map_err(|err| ForgeError::Internal(format!("extraction task failed: {err}")))??;
        Ok(())
    }

    async fn load_bundle_spec(&self, id: &JobId, sha256: String, size: u64) -> Result<JobSpec> {
        let path = self.store.source_dir(id).join(BUNDLE_SPEC_NAME);
        let raw = fs::read(&path)
            .await
            .map_err(|_| ForgeError::InvalidBundle(format!("missing {BUNDLE_SPEC_NAME}")))?;
        let parsed: BundleSpec = serde_json::from_slice(&raw)
            .map_err(|err| ForgeError::InvalidBundle(format!("parse {BUNDLE_SPEC_NAME}: {err}")))?;

        let project = parsed.project.trim().to_string();
        if project.is_empty() || project.len() > MAX_PROJECT_LEN {
            return Err(ForgeError::InvalidBundle(format!(
                "project must be between 1 and {MAX_PROJECT_LEN} characters"
            )));
        }
        if !project
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
        {
            return Err(ForgeError::InvalidBundle(
                "project may only contain letters, digits, '.', '_' and '-'".to_string(),
            ));
        }

        let entry = parsed.entry.trim().to_string();
        if entry.is_empty() {
            return Err(ForgeError::InvalidBundle("entry is required".to_string()));
        }
        if entry.starts_with('/') || entry.split('/').any(|part| part == "..") {
            return Err(ForgeError::InvalidBundle(format!(
                "entry must be a relative path inside the bundle: {entry}"
            )));
        }
        let entry_path = self.store.source_dir(id).join(&entry);
        if !fs::try_exists(&entry_path).await.unwrap_or(false) {
            return Err(ForgeError::InvalidBundle(format!(
                "entry {entry} not found in bundle"
            )));
        }

        Ok(JobSpec {
            project,
            entry,
            request_sha256: sha256,
            request_size_bytes: size,
        })
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn runner(&self) -> &Arc<dyn Runner> {
        &self.runner
    }
}

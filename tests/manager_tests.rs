
use std::time::Duration;

use tempfile::TempDir;

use jobforge::job::{FailureKind, JobState};
use jobforge::queue::artifacts::ARTIFACT_MANIFEST_NAME;
use jobforge::runner::FakeRunner;
use jobforge::store::Store;

use test_harness::{
    make_bundle, simple_bundle, start_queue, start_queue_in, start_queue_with, test_config,
    wait_for_terminal,
};

const TERMINAL_WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_happy_path() {
    let queue = start_queue(FakeRunner::new()).await;

    let record = queue
        .manager
        .submit(&simple_bundle("blinky"))
        .await
        .expect("submit");
    assert_eq!(record.state, JobState::Queued);
    assert_eq!(record.spec.project, "blinky");
    assert!(!record.spec.request_sha256.is_empty());

    let finished = wait_for_terminal(&queue.manager, &record.id, TERMINAL_WAIT).await;
    assert_eq!(finished.state, JobState::Succeeded);
    assert_eq!(finished.exit_code, Some(0));
    assert!(finished.failure_kind.is_none());
    assert!(finished.finished_at.is_some());
    assert!(finished.started_at.is_some());
    assert!(finished.started_at >= Some(finished.created_at));

    let console = queue
        .manager
        .read_console_log(&record.id)
        .await
        .expect("console log");
    assert!(!console.is_empty());

    let raw = queue
        .manager
        .read_diagnostics(&record.id)
        .await
        .expect("diagnostics");
    let report: serde_json::Value = serde_json::from_slice(&raw).expect("parse diagnostics");
    assert_eq!(report["schema"], 1);
    assert_eq!(report["error_count"], 0);
}

#[tokio::test]
async fn test_tool_failure_is_classified() {
    let runner = FakeRunner::new()
        .with_fail_project("broken", "synthesis blew up")
        .with_console_log("ERROR: [Synth 8-2716] syntax error near 'fake' [hdl/spade.sv:1]\n");
    let queue = start_queue(runner).await;

    let record = queue
        .manager
        .submit(&simple_bundle("broken"))
        .await
        .expect("submit");
    let finished = wait_for_terminal(&queue.manager, &record.id, TERMINAL_WAIT).await;

    assert_eq!(finished.state, JobState::Failed);
    assert_eq!(finished.exit_code, Some(2));
    assert_eq!(finished.error, "synthesis blew up");
    assert_eq!(finished.failure_kind, Some(FailureKind::Syntax));
    assert!(
        finished.failure_summary.contains("hdl/spade.sv:1"),
        "summary: {}",
        finished.failure_summary
    );
}

#[tokio::test]
async fn test_sequential_queueing() {
    let queue = start_queue(
        FakeRunner::new()
            .with_gate()
            .with_heartbeat_interval(Duration::from_millis(20)),
    )
    .await;

    let a = queue
        .manager
        .submit(&simple_bundle("first"))
        .await
        .expect("submit a");
    // Wait until A is actually running before submitting B.
    test_harness::expect_eventually(
        TERMINAL_WAIT,
        || async {
            queue
                .manager
                .get(&a.id)
                .await
                .map(|rec| rec.state == JobState::Running)
                .unwrap_or(false)
        },
        "job A never started",
    )
    .await;

    let b = queue
        .manager
        .submit(&simple_bundle("second"))
        .await
        .expect("submit b");

    // A is blocked on the gate; B must stay queued.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let a_now = queue.manager.get(&a.id).await.expect("job a");
    let b_now = queue.manager.get(&b.id).await.expect("job b");
    assert_eq!(a_now.state, JobState::Running);
    assert_eq!(b_now.state, JobState::Queued);

    queue.runner.release();
    let a_done = wait_for_terminal(&queue.manager, &a.id, TERMINAL_WAIT).await;
    queue.runner.release();
    let b_done = wait_for_terminal(&queue.manager, &b.id, TERMINAL_WAIT).await;

    assert_eq!(a_done.state, JobState::Succeeded);
    assert_eq!(b_done.state, JobState::Succeeded);
    assert_eq!(queue.runner.calls(), vec![a.id, b.id]);
}

#[tokio::test]
async fn test_progress_updates_record() {
    let queue = start_queue(FakeRunner::new()).await;

    let record = queue
        .manager
        .submit(&simple_bundle("blinky"))
        .await
        .expect("submit");
    let finished = wait_for_terminal(&queue.manager, &record.id, TERMINAL_WAIT).await;

    // The fake reports prepare/package/output steps; the terminal
    // transition then stamps the final step.
    assert_eq!(finished.current_step, "done");
    assert!(finished.heartbeat_at.is_some());
    assert!(finished.heartbeat_at >= Some(finished.created_at));
}

#[tokio::test]
async fn test_crash_recovery_requeues_running_jobs() {
    let base = TempDir::new().expect("temp dir");
    let cfg = test_config(&base);
    let store = Store::new(cfg.clone());
    store.ensure_dirs().await.expect("ensure dirs");

    // Persist two records stuck in RUNNING, as if the process died mid-run.
    let now = chrono::Utc::now();
    let mut ids = Vec::new();
    for offset in [20i64, 10] {
        let id = jobforge::job::JobId::generate();
        store.create_job_layout(&id).await.expect("create layout");
        let mut rec = jobforge::job::JobRecord::new(
            id.clone(),
            jobforge::job::JobSpec {
                project: "blinky".to_string(),
                entry: "top.v".to_string(),
                request_sha256: "cafe".to_string(),
                request_size_bytes: 4,
            },
            now - chrono::Duration::seconds(offset),
        );
        rec.transition(JobState::Running, rec.created_at, "run started")
            .expect("queued -> running");
        store.save(&rec).await.expect("save running record");

        let bundle = simple_bundle("blinky");
        let mut reader: &[u8] = &bundle;
        store.write_request(&id, &mut reader).await.expect("write request");
        ids.push(id);
    }

    // A gated runner keeps the first recovered job busy, so the second one
    // stays QUEUED with the recovery message observable.
    let queue = start_queue_in(
        base,
        cfg,
        FakeRunner::new()
            .with_gate()
            .with_heartbeat_interval(Duration::from_millis(20)),
    )
    .await;

    test_harness::expect_eventually(
        TERMINAL_WAIT,
        || async {
            queue
                .manager
                .get(&ids[0])
                .await
                .map(|rec| rec.state == JobState::Running)
                .unwrap_or(false)
        },
        "first recovered job never started",
    )
    .await;

    let second = queue.manager.get(&ids[1]).await.expect("second recovered job");
    assert_eq!(second.state, JobState::Queued);
    assert_eq!(second.message, "requeued after restart");
    assert!(second.started_at.is_none());
    assert!(second.heartbeat_at.is_none());
    assert!(second.exit_code.is_none());

    queue.runner.release();
    let first_done = wait_for_terminal(&queue.manager, &ids[0], TERMINAL_WAIT).await;
    queue.runner.release();
    let second_done = wait_for_terminal(&queue.manager, &ids[1], TERMINAL_WAIT).await;
    assert!(first_done.is_terminal());
    assert!(second_done.is_terminal());
    assert_eq!(queue.runner.calls(), ids);
}

#[tokio::test]
async fn test_recovery_requeues_queued_job() {
    let base = TempDir::new().expect("temp dir");
    let cfg = test_config(&base);
    let store = Store::new(cfg.clone());
    store.ensure_dirs().await.expect("ensure dirs");

    let id = jobforge::job::JobId::generate();
    store.create_job_layout(&id).await.expect("create layout");
    let rec = jobforge::job::JobRecord::new(
        id.clone(),
        jobforge::job::JobSpec {
            project: "blinky".to_string(),
            entry: "top.v".to_string(),
            request_sha256: "cafe".to_string(),
            request_size_bytes: 4,
        },
        chrono::Utc::now(),
    );
    store.save(&rec).await.expect("save queued record");

    let queue = start_queue_in(base, cfg, FakeRunner::new()).await;
    let finished = wait_for_terminal(&queue.manager, &id, TERMINAL_WAIT).await;
    assert!(finished.is_terminal());
}

#[tokio::test]
async fn test_invalid_bundle_leaves_no_job() {
    let queue = start_queue(FakeRunner::new()).await;

    // Not a zip at all.
    let err = queue.manager.submit(b"definitely not a zip").await;
    assert!(err.is_err());

    // A zip without bundle.json.
    let bundle = make_bundle("blinky", "top.v", &[("top.v", b"module top; endmodule\n")]);
    queue.manager.submit(&bundle).await.expect("valid bundle accepted");

    let missing_spec = {
        use std::io::Write;
        let mut zw = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        zw.start_file("top.v", zip::write::SimpleFileOptions::default())
            .expect("start file");
        zw.write_all(b"module top; endmodule\n").expect("write file");
        zw.finish().expect("finish").into_inner()
    };
    let err = queue.manager.submit(&missing_spec).await;
    assert!(err.is_err());

    // Entry that does not exist in the bundle.
    let bad_entry = make_bundle("blinky", "missing.v", &[("top.v", b"x")]);
    assert!(queue.manager.submit(&bad_entry).await.is_err());

    // Rejected submissions leave nothing behind in the jobs dir.
    let jobs = queue.manager.list_jobs(50).await;
    assert_eq!(jobs.len(), 1);
}

#[tokio::test]
async fn test_worker_timeout_fails_job() {
    // Gate never released: the job can only end via the worker timeout.
    let queue = start_queue_with(
        FakeRunner::new()
            .with_gate()
            .with_heartbeat_interval(Duration::from_millis(20)),
        |cfg| cfg.worker_timeout = Duration::from_millis(250),
    )
    .await;

    let record = queue
        .manager
        .submit(&simple_bundle("stuck"))
        .await
        .expect("submit");
    let finished = wait_for_terminal(&queue.manager, &record.id, TERMINAL_WAIT).await;

    assert_eq!(finished.state, JobState::Failed);
    assert_eq!(finished.exit_code, Some(-1));
    assert!(
        finished.message.contains("timed out"),
        "message: {}",
        finished.message
    );
    assert_eq!(finished.failure_kind, Some(FailureKind::Internal));
}

#[tokio::test]
async fn test_resubmit_creates_fresh_job() {
    let queue = start_queue(FakeRunner::new()).await;

    let original = queue
        .manager
        .submit(&simple_bundle("blinky"))
        .await
        .expect("submit");

    // Resubmitting a non-terminal job is refused.
    let early = queue.manager.resubmit(&original.id).await;
    if let Ok(rec) = early {
        // The original may already have finished on a fast machine; then the
        // resubmit is legitimate and produces a new id.
        assert_ne!(rec.id, original.id);
    }

    let finished = wait_for_terminal(&queue.manager, &original.id, TERMINAL_WAIT).await;
    assert_eq!(finished.state, JobState::Succeeded);

    let clone = queue.manager.resubmit(&original.id).await.expect("resubmit");
    assert_ne!(clone.id, original.id);
    assert_eq!(clone.spec.project, finished.spec.project);
    assert_eq!(clone.spec.request_sha256, finished.spec.request_sha256);

    let clone_done = wait_for_terminal(&queue.manager, &clone.id, TERMINAL_WAIT).await;
    assert_eq!(clone_done.state, JobState::Succeeded);

    let missing = jobforge::job::JobId::generate();
    assert!(queue.manager.resubmit(&missing).await.is_err());
}

#[tokio::test]
async fn test_pruning_keeps_most_recent_terminal_jobs() {
    let queue = start_queue_with(FakeRunner::new(), |cfg| cfg.history_limit = 2).await;

    let mut submitted = Vec::new();
    for index in 0..4 {
        let record = queue
            .manager
            .submit(&simple_bundle(&format!("proj-{index}")))
            .await
            .expect("submit");
        wait_for_terminal(&queue.manager, &record.id, TERMINAL_WAIT).await;
        submitted.push(record.id);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let jobs = queue.manager.list_jobs(10).await;
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].id, submitted[3]);
    assert_eq!(jobs[1].id, submitted[2]);

    let store = Store::new(test_config_for(&queue));
    for id in &submitted[..2] {
        assert!(queue.manager.get(id).await.is_none(), "{id} not pruned");
        assert!(!store.job_dir(id).exists(), "{id} job dir not removed");
        assert!(
            !store.artifacts_job_dir(id).exists(),
            "{id} artifacts dir not removed"
        );
        // Pruned jobs have no event timeline left to subscribe to.
        assert!(queue.manager.subscribe_events(id, 0).await.is_none());
    }
    for id in &submitted[2..] {
        assert!(queue.manager.get(id).await.is_some(), "{id} wrongly pruned");
    }
}

#[tokio::test]
async fn test_pruning_on_startup() {
    let base = TempDir::new().expect("temp dir");
    let mut cfg = test_config(&base);
    cfg.history_limit = 1;
    let store = Store::new(cfg.clone());
    store.ensure_dirs().await.expect("ensure dirs");

    let now = chrono::Utc::now();
    let mut ids = Vec::new();
    for (offset, state) in [(300i64, JobState::Succeeded), (200, JobState::Failed)] {
        let id = jobforge::job::JobId::generate();
        store.create_job_layout(&id).await.expect("create layout");
        let mut rec = jobforge::job::JobRecord::new(
            id.clone(),
            jobforge::job::JobSpec {
                project: "old".to_string(),
                entry: "top.v".to_string(),
                request_sha256: "cafe".to_string(),
                request_size_bytes: 4,
            },
            now - chrono::Duration::seconds(offset),
        );
        rec.transition(JobState::Running, rec.created_at, "run started")
            .expect("queued -> running");
        if state == JobState::Succeeded {
            rec.mark_succeeded(rec.created_at, "done", 0).expect("succeed");
        } else {
            rec.mark_failed(rec.created_at, "broke", "broke", 1).expect("fail");
        }
        store.save(&rec).await.expect("save record");
        ids.push(id);
    }

    let queue = start_queue_in(base, cfg, FakeRunner::new()).await;

    assert!(queue.manager.get(&ids[0]).await.is_none(), "oldest kept");
    assert!(queue.manager.get(&ids[1]).await.is_some(), "newest pruned");
}

#[tokio::test]
async fn test_history_records_terminal_jobs() {
    let queue = start_queue(FakeRunner::new().with_fail_project("bad", "boom")).await;

    let ok = queue
        .manager
        .submit(&simple_bundle("good"))
        .await
        .expect("submit good");
    wait_for_terminal(&queue.manager, &ok.id, TERMINAL_WAIT).await;

    let bad = queue
        .manager
        .submit(&simple_bundle("bad"))
        .await
        .expect("submit bad");
    wait_for_terminal(&queue.manager, &bad.id, TERMINAL_WAIT).await;

    let items = queue.manager.recent_history(10).await.expect("history");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].job_id, bad.id);
    assert_eq!(items[0].state, JobState::Failed);
    assert_eq!(items[1].job_id, ok.id);
    assert_eq!(items[1].state, JobState::Succeeded);
    assert!(items.iter().all(|item| item.finished_at.is_some()));
}

#[tokio::test]
async fn test_artifact_manifest_contents() {
    let queue = start_queue(FakeRunner::new()).await;

    let record = queue
        .manager
        .submit(&simple_bundle("blinky"))
        .await
        .expect("submit");
    let finished = wait_for_terminal(&queue.manager, &record.id, TERMINAL_WAIT).await;

    let store = Store::new(test_config_for(&queue));
    let raw = tokio::fs::read(store.artifacts_job_dir(&record.id).join(ARTIFACT_MANIFEST_NAME))
        .await
        .expect("read manifest");
    let manifest: jobforge::queue::artifacts::ArtifactManifest =
        serde_json::from_slice(&raw).expect("parse manifest");

    assert_eq!(manifest.schema, 1);
    assert_eq!(manifest.job_id, record.id);
    assert_eq!(manifest.state, JobState::Succeeded);
    assert_eq!(manifest.exit_code, 0);
    assert_eq!(manifest.request_sha256, finished.spec.request_sha256);
    assert_eq!(manifest.runner.name, "fake");

    // Every artifact except the manifest itself is listed, sorted by path.
    let paths: Vec<&str> = manifest.files.iter().map(|f| f.path.as_str()).collect();
    assert!(paths.contains(&"console.log"));
    assert!(paths.contains(&"diagnostics.json"));
    assert!(!paths.contains(&ARTIFACT_MANIFEST_NAME));
    let mut sorted = paths.clone();
    sorted.sort();
    assert_eq!(paths, sorted);
    assert!(manifest
        .files
        .iter()
        .all(|f| f.sha256.len() == 64 && f.sha256.bytes().all(|b| b.is_ascii_hexdigit())));
}

#[tokio::test]
async fn test_work_dir_removed_after_terminal() {
    let queue = start_queue(FakeRunner::new()).await;

    let record = queue
        .manager
        .submit(&simple_bundle("blinky"))
        .await
        .expect("submit");
    wait_for_terminal(&queue.manager, &record.id, TERMINAL_WAIT).await;

    let store = Store::new(test_config_for(&queue));
    test_harness::expect_eventually(
        TERMINAL_WAIT,
        || async { !store.work_job_dir(&record.id).exists() },
        "work dir was not removed",
    )
    .await;
    assert!(store.artifacts_job_dir(&record.id).exists());
}

#[tokio::test]
async fn test_preserve_work_dir() {
    let queue = start_queue_with(FakeRunner::new(), |cfg| cfg.preserve_work_dir = true).await;

    let record = queue
        .manager
        .submit(&simple_bundle("blinky"))
        .await
        .expect("submit");
    wait_for_terminal(&queue.manager, &record.id, TERMINAL_WAIT).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let store = Store::new(test_config_for(&queue));
    assert!(store.work_job_dir(&record.id).exists());
}

fn test_config_for(queue: &test_harness::TestQueue) -> jobforge::config::Config {
    let mut cfg = jobforge::config::Config::with_base_dir(queue.base.path());
    cfg.use_fake_runner = true;
    cfg
}

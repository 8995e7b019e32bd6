use super::*;
use crate::config::{RetryConfig, StallPolicy};
use crate::db::{NewLease, lease_status};
use crate::error::{Error, TaskError};
use crate::testing::{FakeProbe, FakeProvider, FakeStorage, FakeTransfer, eventually, fast_relay_config};
use crate::transfer::TransferState;
use crate::types::{Decision, LeaseId, LeaseState};
use crate::cost::month_start;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::NamedTempFile;

struct Fakes {
    provider: Arc<FakeProvider>,
    probe: Arc<FakeProbe>,
    storage: Arc<FakeStorage>,
    transfer: Arc<FakeTransfer>,
}

impl Fakes {
    fn new() -> Self {
        Self {
            provider: FakeProvider::new(),
            probe: FakeProbe::new(),
            storage: FakeStorage::new(),
            transfer: FakeTransfer::new(),
        }
    }

    fn services(&self) -> Services {
        Services {
            provider: self.provider.clone(),
            probe: self.probe.clone(),
            storage: self.storage.clone(),
            transfer: self.transfer.clone(),
        }
    }
}

struct Harness {
    _file: NamedTempFile,
    orchestrator: Orchestrator,
    fakes: Fakes,
}

fn test_config(file: &NamedTempFile) -> Config {
    let mut config = Config::default();
    config.persistence.database_path = file.path().to_path_buf();
    config.relay = fast_relay_config();
    config.monitor.poll_interval = Duration::from_millis(20);
    config.orchestrator.maintenance_interval = Duration::from_millis(50);
    config.storage.ready_poll_interval = Duration::from_millis(10);
    config.orchestrator.shutdown_timeout = Duration::from_secs(1);
    config.orchestrator.submit_retry = RetryConfig {
        max_attempts: 1,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        jitter: false,
    };
    config
}

async fn open(file: NamedTempFile, fakes: Fakes, edit: impl FnOnce(&mut Config)) -> Harness {
    let mut config = test_config(&file);
    edit(&mut config);
    let orchestrator = Orchestrator::with_services(config, fakes.services())
        .await
        .unwrap();
    orchestrator.start();
    Harness {
        _file: file,
        orchestrator,
        fakes,
    }
}

async fn harness_with(edit: impl FnOnce(&mut Config)) -> Harness {
    open(NamedTempFile::new().unwrap(), Fakes::new(), edit).await
}

async fn harness() -> Harness {
    harness_with(|_| {}).await
}

fn candidate(uri: &str) -> NewTask {
    NewTask {
        uri: uri.to_string(),
        title: format!("title for {uri}"),
        description: None,
        size_bytes: 1_000,
        preview_images: vec![],
        source_chat_id: Some(-100),
        source_msg_id: Some(1),
    }
}

async fn wait_for_status(orchestrator: &Orchestrator, id: TaskId, status: TaskStatus) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let task = orchestrator.get_task(id).await.unwrap();
        if task.status == status {
            return task;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("task {id} stuck in {} waiting for {status}", task.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Enqueue and confirm, then wait until the download is running
async fn start_download(h: &Harness, uri: &str) -> Task {
    let task = h.orchestrator.enqueue(candidate(uri)).await.unwrap();
    let confirmed = h
        .orchestrator
        .decide(task.id, Decision::Confirm)
        .await
        .unwrap();
    assert_eq!(confirmed.status, TaskStatus::Confirmed);
    wait_for_status(&h.orchestrator, task.id, TaskStatus::Downloading).await
}

#[tokio::test]
async fn confirmed_task_downloads_through_relay_and_relay_is_reclaimed() {
    let h = harness().await;
    let task = start_download(&h, "magnet:?xt=urn:btih:aaaa").await;

    let lease_id = task.lease_id.unwrap();
    let transfer_id = task.transfer_id.clone().unwrap();
    assert_eq!(task.offline_task_id.as_deref(), Some("off-1"));
    assert_eq!(
        *h.fakes.storage.submissions.lock().unwrap(),
        vec!["magnet:?xt=urn:btih:aaaa".to_string()]
    );
    let proxies = h.fakes.transfer.proxies.lock().unwrap().clone();
    assert_eq!(proxies.len(), 1);
    assert!(proxies[0].contains("203.0.113.1"));

    let relay = h.orchestrator.relay_status();
    assert_eq!(relay.state, LeaseState::Active);
    assert_eq!(relay.holders, vec![task.id]);

    h.fakes
        .transfer
        .set(&transfer_id, TransferState::Complete, 1_000, 1_000);
    let done = wait_for_status(&h.orchestrator, task.id, TaskStatus::Complete).await;
    assert!(done.lease_id.is_none());
    assert!(done.completed_at.is_some());

    assert!(eventually(|| h.orchestrator.relay_status().state == LeaseState::Absent).await);
    assert!(h.fakes.provider.live().is_empty());
    let row = h.orchestrator.db.get_lease(lease_id).await.unwrap().unwrap();
    assert_eq!(row.status, lease_status::DESTROYED);

    let kinds: Vec<String> = h
        .orchestrator
        .task_history(task.id)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|e| e.to_status.map(|s| s.to_string()))
        .collect();
    assert_eq!(kinds, vec!["CONFIRMED", "DOWNLOADING", "COMPLETE"]);
}

#[tokio::test]
async fn concurrent_downloads_share_one_relay() {
    let h = harness().await;
    let a = start_download(&h, "magnet:?xt=urn:btih:share-a").await;
    let b = start_download(&h, "magnet:?xt=urn:btih:share-b").await;

    assert_eq!(h.fakes.provider.creates.load(Ordering::SeqCst), 1);
    assert_eq!(a.lease_id, b.lease_id);
    assert_eq!(h.orchestrator.relay_status().holders, vec![a.id, b.id]);

    h.fakes
        .transfer
        .set(a.transfer_id.as_deref().unwrap(), TransferState::Complete, 1, 1);
    wait_for_status(&h.orchestrator, a.id, TaskStatus::Complete).await;
    assert_eq!(h.orchestrator.relay_status().holders, vec![b.id]);
    assert_eq!(h.orchestrator.relay_status().state, LeaseState::Active);

    h.fakes
        .transfer
        .set(b.transfer_id.as_deref().unwrap(), TransferState::Complete, 1, 1);
    wait_for_status(&h.orchestrator, b.id, TaskStatus::Complete).await;
    assert!(eventually(|| h.orchestrator.relay_status().state == LeaseState::Absent).await);
    assert_eq!(h.fakes.provider.creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn provisioning_failure_fails_task_and_leaves_no_relay() {
    let h = harness().await;
    h.fakes.provider.fail_create.store(true, Ordering::SeqCst);

    let task = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:nocap"))
        .await
        .unwrap();
    h.orchestrator.decide(task.id, Decision::Confirm).await.unwrap();

    let failed = wait_for_status(&h.orchestrator, task.id, TaskStatus::Error).await;
    assert!(failed.error.unwrap().contains("quota exceeded"));
    assert_eq!(h.orchestrator.relay_status().state, LeaseState::Absent);
    assert!(h.fakes.storage.submissions.lock().unwrap().is_empty());
    assert!(h.fakes.transfer.ids().is_empty());
}

#[tokio::test]
async fn rejected_submission_fails_task_and_releases_relay() {
    let h = harness().await;
    *h.fakes.storage.reject_containing.lock().unwrap() = Some("filtered".into());

    let task = h
        .orchestrator
        .enqueue(candidate("https://host.example/filtered.iso"))
        .await
        .unwrap();
    h.orchestrator.decide(task.id, Decision::Confirm).await.unwrap();

    let failed = wait_for_status(&h.orchestrator, task.id, TaskStatus::Error).await;
    assert!(failed.error.unwrap().contains("resource is filtered"));
    assert!(h.fakes.transfer.ids().is_empty());
    assert!(eventually(|| h.orchestrator.relay_status().state == LeaseState::Absent).await);
}

#[tokio::test]
async fn transient_submission_failure_exhausts_retries() {
    let h = harness().await;
    h.fakes.storage.fail_transient.store(true, Ordering::SeqCst);

    let task = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:busy"))
        .await
        .unwrap();
    h.orchestrator.decide(task.id, Decision::Confirm).await.unwrap();

    let failed = wait_for_status(&h.orchestrator, task.id, TaskStatus::Error).await;
    assert!(failed.error.unwrap().contains("503"));
}

#[tokio::test]
async fn download_waits_for_offline_job_to_be_ready() {
    let h = harness().await;
    h.fakes.storage.pending_polls.store(3, Ordering::SeqCst);

    let task = start_download(&h, "magnet:?xt=urn:btih:slowjob").await;
    assert!(task.transfer_id.is_some());
    assert_eq!(h.fakes.storage.status_calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn failed_offline_job_fails_task_before_transfer() {
    let h = harness().await;
    h.fakes.storage.fail_jobs.store(true, Ordering::SeqCst);

    let task = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:deadjob"))
        .await
        .unwrap();
    h.orchestrator.decide(task.id, Decision::Confirm).await.unwrap();

    let failed = wait_for_status(&h.orchestrator, task.id, TaskStatus::Error).await;
    assert!(failed.error.unwrap().contains("failed in phase failed"));
    assert!(h.fakes.transfer.ids().is_empty());
    assert!(eventually(|| h.orchestrator.relay_status().state == LeaseState::Absent).await);
}

#[tokio::test]
async fn offline_job_that_never_finishes_times_out() {
    let h = harness_with(|c| c.storage.ready_timeout = Duration::from_millis(100)).await;
    h.fakes.storage.pending_polls.store(u32::MAX, Ordering::SeqCst);

    let task = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:forever"))
        .await
        .unwrap();
    h.orchestrator.decide(task.id, Decision::Confirm).await.unwrap();

    let failed = wait_for_status(&h.orchestrator, task.id, TaskStatus::Error).await;
    assert!(failed.error.unwrap().contains("not ready"));
    assert!(h.fakes.transfer.ids().is_empty());
}

#[tokio::test]
async fn cancel_during_provisioning_is_prompt_and_submits_nothing() {
    let h = harness().await;
    *h.fakes.provider.create_delay.lock().unwrap() = Some(Duration::from_millis(300));

    let task = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:changedmind"))
        .await
        .unwrap();
    h.orchestrator.decide(task.id, Decision::Confirm).await.unwrap();
    assert!(eventually(|| h.orchestrator.relay_status().state == LeaseState::Provisioning).await);

    let cancelled = tokio::time::timeout(Duration::from_millis(100), h.orchestrator.cancel(task.id))
        .await
        .expect("cancel waited on provisioning")
        .unwrap();
    assert_eq!(cancelled.status, TaskStatus::Error);

    // Provisioning finishes, the worker backs off and the relay idles out
    assert!(eventually(|| h.fakes.provider.creates.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| h.orchestrator.relay_status().state == LeaseState::Absent).await);
    assert!(h.fakes.storage.submissions.lock().unwrap().is_empty());
    assert!(h.fakes.transfer.ids().is_empty());
    assert_eq!(
        h.orchestrator.get_task(task.id).await.unwrap().status,
        TaskStatus::Error
    );
}

#[tokio::test]
async fn unrecorded_download_start_fails_task_and_removes_transfer() {
    let h = harness().await;
    sqlx::query(
        "CREATE TRIGGER refuse_downloading BEFORE UPDATE OF status ON tasks \
         WHEN NEW.status = 'DOWNLOADING' \
         BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
    )
    .execute(h.orchestrator.db.pool())
    .await
    .unwrap();

    let task = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:nowrite"))
        .await
        .unwrap();
    h.orchestrator.decide(task.id, Decision::Confirm).await.unwrap();

    let failed = wait_for_status(&h.orchestrator, task.id, TaskStatus::Error).await;
    assert!(failed.error.unwrap().contains("could not record download start"));
    assert_eq!(
        *h.fakes.transfer.removed.lock().unwrap(),
        vec!["gid-1".to_string()]
    );
    assert!(eventually(|| h.orchestrator.relay_status().state == LeaseState::Absent).await);
}

#[tokio::test]
async fn emergency_destroy_fails_every_dependent_task() {
    let h = harness().await;
    let a = start_download(&h, "magnet:?xt=urn:btih:em-a").await;
    let b = start_download(&h, "magnet:?xt=urn:btih:em-b").await;
    let mut events = h.orchestrator.subscribe();

    let report = h.orchestrator.emergency_destroy().await;
    assert_eq!(report.failed_tasks, vec![a.id, b.id]);
    assert_eq!(report.destroyed_instances.len(), 1);
    assert!(report.destroy_pending.is_empty());

    for task in [&a, &b] {
        let failed = h.orchestrator.get_task(task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert_eq!(failed.error.as_deref(), Some("relay destroyed by operator"));
    }
    assert_eq!(h.orchestrator.relay_status().state, LeaseState::Absent);
    assert!(h.fakes.provider.live().is_empty());
    assert_eq!(h.fakes.transfer.removed.lock().unwrap().len(), 2);
    assert!(h.orchestrator.monitor.tracked().is_empty());

    let announced = std::iter::from_fn(|| events.try_recv().ok()).any(|e| {
        matches!(e, Event::EmergencyDestroy { ref failed_tasks } if *failed_tasks == vec![a.id, b.id])
    });
    assert!(announced);
}

#[tokio::test]
async fn duplicate_candidate_is_refused() {
    let h = harness().await;
    let first = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:dup"))
        .await
        .unwrap();

    let err = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:dup"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Task(TaskError::DuplicateResource { existing_id, .. }) if existing_id == first.id.get()
    ));
    assert_eq!(h.orchestrator.counts().await.unwrap().pending, 1);
}

#[tokio::test]
async fn daemon_error_fails_download() {
    let h = harness().await;
    let task = start_download(&h, "magnet:?xt=urn:btih:neterr").await;

    h.fakes
        .transfer
        .set(task.transfer_id.as_deref().unwrap(), TransferState::Error, 0, 0);
    let failed = wait_for_status(&h.orchestrator, task.id, TaskStatus::Error).await;
    assert_eq!(failed.error.as_deref(), Some("network failure"));
    assert!(eventually(|| h.orchestrator.relay_status().state == LeaseState::Absent).await);
}

#[tokio::test]
async fn stalled_download_fails_under_fail_policy() {
    let h = harness_with(|c| {
        c.monitor.stall_grace = Duration::from_millis(150);
        c.monitor.stall_policy = StallPolicy::Fail;
    })
    .await;
    let task = start_download(&h, "magnet:?xt=urn:btih:stuck").await;

    let failed = wait_for_status(&h.orchestrator, task.id, TaskStatus::Error).await;
    assert!(failed.error.unwrap().contains("stalled"));
    assert_eq!(
        *h.fakes.transfer.removed.lock().unwrap(),
        vec![task.transfer_id.clone().unwrap()]
    );
    let history = h.orchestrator.task_history(task.id).await.unwrap();
    assert!(history.iter().any(|e| e.kind == "stalled"));
}

#[tokio::test]
async fn stalled_download_is_surfaced_and_can_be_cancelled() {
    let h = harness_with(|c| {
        c.monitor.stall_grace = Duration::from_millis(150);
        c.monitor.stall_policy = StallPolicy::Surface;
    })
    .await;
    let mut events = h.orchestrator.subscribe();
    let task = start_download(&h, "magnet:?xt=urn:btih:slow").await;

    let stalled = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            if let Ok(Event::DownloadStalled { id, .. }) = events.recv().await
                && id == task.id
            {
                break;
            }
        }
    })
    .await;
    assert!(stalled.is_ok());
    assert_eq!(
        h.orchestrator.get_task(task.id).await.unwrap().status,
        TaskStatus::Downloading
    );

    let cancelled = h.orchestrator.cancel(task.id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Error);
    assert_eq!(cancelled.error.as_deref(), Some("cancelled by operator"));
    assert_eq!(h.fakes.transfer.removed.lock().unwrap().len(), 1);
    assert!(eventually(|| h.orchestrator.relay_status().state == LeaseState::Absent).await);
}

#[tokio::test]
async fn cancel_requires_confirmed_or_downloading() {
    let h = harness().await;
    let task = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:pending"))
        .await
        .unwrap();

    let err = h.orchestrator.cancel(task.id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Task(TaskError::InvalidTransition {
            from: TaskStatus::Pending,
            ..
        })
    ));

    let err = h.orchestrator.cancel(TaskId(999)).await.unwrap_err();
    assert!(matches!(err, Error::Task(TaskError::NotFound { id: 999 })));
}

#[tokio::test]
async fn ignore_never_touches_the_relay() {
    let h = harness().await;
    let task = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:skip"))
        .await
        .unwrap();
    let ignored = h.orchestrator.decide(task.id, Decision::Ignore).await.unwrap();
    assert_eq!(ignored.status, TaskStatus::Ignored);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.fakes.provider.creates.load(Ordering::SeqCst), 0);

    // Terminal: a second decision is refused
    assert!(
        h.orchestrator
            .decide(task.id, Decision::Confirm)
            .await
            .is_err()
    );
}

#[tokio::test]
async fn confirmation_is_refused_while_shutting_down() {
    let h = harness().await;
    let task = h
        .orchestrator
        .enqueue(candidate("magnet:?xt=urn:btih:late"))
        .await
        .unwrap();

    h.orchestrator.shutdown().await.unwrap();
    let err = h
        .orchestrator
        .decide(task.id, Decision::Confirm)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ShuttingDown));
    assert_eq!(
        h.orchestrator.get_task(task.id).await.unwrap().status,
        TaskStatus::Pending
    );
    assert!(!h.orchestrator.db.was_unclean_shutdown().await.unwrap());
}

#[tokio::test]
async fn shutdown_keeps_relay_used_by_downloads() {
    let h = harness().await;
    start_download(&h, "magnet:?xt=urn:btih:keep").await;

    h.orchestrator.shutdown().await.unwrap();
    assert_eq!(h.fakes.provider.live().len(), 1);
}

#[tokio::test]
async fn dashboard_reports_month_to_date_spend() {
    let h = harness().await;
    let db = &h.orchestrator.db;
    let now = Utc::now();

    let this_month = db
        .insert_lease(&NewLease {
            region: "r".into(),
            instance_type: "t".into(),
            hourly_rate: 0.6,
            created_at: month_start(now).timestamp() + 1,
        })
        .await
        .unwrap();
    db.close_lease(this_month, lease_status::DESTROYED, Some(now.timestamp()), 60, None)
        .await
        .unwrap();

    let last_month = db
        .insert_lease(&NewLease {
            region: "r".into(),
            instance_type: "t".into(),
            hourly_rate: 0.6,
            created_at: (month_start(now) - ChronoDuration::days(1)).timestamp(),
        })
        .await
        .unwrap();
    db.close_lease(last_month, lease_status::DESTROYED, Some(now.timestamp()), 500, None)
        .await
        .unwrap();

    let snapshot = h.orchestrator.dashboard().await.unwrap();
    assert_eq!(snapshot.monthly_minutes, 60);
    assert!((snapshot.monthly_cost - 0.6).abs() < 1e-9);
    assert_eq!(snapshot.relay.state, LeaseState::Absent);
    assert!(snapshot.transfer.is_some());
    assert!(snapshot.alerts.is_empty());

    h.fakes.transfer.unreachable.store(true, Ordering::SeqCst);
    let snapshot = h.orchestrator.dashboard().await.unwrap();
    assert!(snapshot.transfer.is_none());
}

#[tokio::test]
async fn channel_changes_touch_reload_flag() {
    let dir = tempfile::tempdir().unwrap();
    let flag = dir.path().join("reload.flag");
    let flag_path = flag.clone();
    let h = harness_with(move |c| c.settings.reload_flag_path = Some(flag_path)).await;

    h.orchestrator
        .add_channel(crate::types::Channel {
            id: "@feed".into(),
            name: Some("Feed".into()),
            enabled: true,
        })
        .await
        .unwrap();
    assert!(flag.exists());

    let updated = h
        .orchestrator
        .update_channel("@feed", None, Some(false))
        .await
        .unwrap();
    assert!(!updated.enabled);
    assert_eq!(h.orchestrator.channels().await.unwrap(), vec![updated]);

    assert!(matches!(
        h.orchestrator.remove_channel("@missing").await,
        Err(Error::NotFound(_))
    ));
    h.orchestrator.remove_channel("@feed").await.unwrap();
    assert!(h.orchestrator.channels().await.unwrap().is_empty());
}

// Recovery

/// Write a DOWNLOADING task on `lease` into the database, as a previous run would have
async fn seed_downloading(db: Arc<Database>, uri: &str, lease: LeaseId, gid: &str) -> TaskId {
    let (tx, _rx) = broadcast::channel(16);
    let registry = TaskRegistry::new(db, tx);
    let task = registry.enqueue(candidate(uri)).await.unwrap();
    let guard = registry.lock(task.id).await;
    registry.decide(&guard, Decision::Confirm).await.unwrap();
    registry
        .mark_downloading(&guard, lease, "off-old", gid)
        .await
        .unwrap();
    task.id
}

async fn seed_lease(db: &Database, instance_id: &str, active: bool) -> LeaseId {
    let id = db
        .insert_lease(&NewLease {
            region: "r".into(),
            instance_type: "t".into(),
            hourly_rate: 0.0075,
            created_at: Utc::now().timestamp() - 300,
        })
        .await
        .unwrap();
    db.set_lease_instance(id, instance_id, "swipe-old", "old-secret")
        .await
        .unwrap();
    if active {
        db.set_lease_active(id, "203.0.113.50", Utc::now().timestamp() - 240)
            .await
            .unwrap();
    }
    id
}

async fn previous_run() -> (NamedTempFile, Arc<Database>) {
    let file = NamedTempFile::new().unwrap();
    let db = Arc::new(Database::new(file.path()).await.unwrap());
    db.set_clean_start().await.unwrap();
    (file, db)
}

#[tokio::test]
async fn surviving_relay_is_adopted_and_download_resumes() {
    let (file, db) = previous_run().await;
    let fakes = Fakes::new();
    fakes.provider.seed("i-surv", "swipe-old");
    fakes.transfer.set("gid-r", TransferState::Active, 5, 10);
    let lease = seed_lease(&db, "i-surv", true).await;
    let id = seed_downloading(db.clone(), "magnet:?xt=urn:btih:resume", lease, "gid-r").await;
    drop(db);

    let h = open(file, fakes, |_| {}).await;
    let relay = h.orchestrator.relay_status();
    assert_eq!(relay.state, LeaseState::Active);
    assert_eq!(relay.lease_id, Some(lease));
    assert_eq!(relay.holders, vec![id]);
    assert_eq!(h.orchestrator.monitor.tracked(), vec![id]);
    assert_eq!(h.fakes.provider.creates.load(Ordering::SeqCst), 0);

    h.fakes.transfer.set("gid-r", TransferState::Complete, 10, 10);
    wait_for_status(&h.orchestrator, id, TaskStatus::Complete).await;
    assert!(eventually(|| h.fakes.provider.live().is_empty()).await);
}

#[tokio::test]
async fn download_whose_relay_vanished_is_failed() {
    let (file, db) = previous_run().await;
    let fakes = Fakes::new();
    fakes.transfer.set("gid-l", TransferState::Active, 5, 10);
    let lease = seed_lease(&db, "i-gone", true).await;
    let id = seed_downloading(db.clone(), "magnet:?xt=urn:btih:lost", lease, "gid-l").await;
    drop(db);

    let h = open(file, fakes, |_| {}).await;
    let task = h.orchestrator.get_task(id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert_eq!(task.error.as_deref(), Some("relay lost across restart"));
    assert_eq!(
        *h.fakes.transfer.removed.lock().unwrap(),
        vec!["gid-l".to_string()]
    );

    let row = h.orchestrator.db.get_lease(lease).await.unwrap().unwrap();
    assert_eq!(row.status, lease_status::DESTROYED);
    assert_eq!(h.orchestrator.relay_status().state, LeaseState::Absent);
}

#[tokio::test]
async fn download_finished_while_down_is_completed() {
    let (file, db) = previous_run().await;
    let fakes = Fakes::new();
    fakes.provider.seed("i-done", "swipe-old");
    fakes.transfer.set("gid-d", TransferState::Complete, 10, 10);
    let lease = seed_lease(&db, "i-done", true).await;
    let id = seed_downloading(db.clone(), "magnet:?xt=urn:btih:done", lease, "gid-d").await;
    drop(db);

    let h = open(file, fakes, |_| {}).await;
    assert_eq!(
        h.orchestrator.get_task(id).await.unwrap().status,
        TaskStatus::Complete
    );
    assert!(eventually(|| h.fakes.provider.live().is_empty()).await);
}

#[tokio::test]
async fn unused_relay_from_previous_run_is_deleted() {
    let (file, db) = previous_run().await;
    let fakes = Fakes::new();
    fakes.provider.seed("i-idle", "swipe-old");
    let lease = seed_lease(&db, "i-idle", true).await;
    drop(db);

    let h = open(file, fakes, |_| {}).await;
    assert!(h.fakes.provider.live().is_empty());
    let row = h.orchestrator.db.get_lease(lease).await.unwrap().unwrap();
    assert_eq!(row.status, lease_status::DESTROYED);
    assert_eq!(h.orchestrator.relay_status().state, LeaseState::Absent);
}

#[tokio::test]
async fn unknown_labelled_instance_raises_alert_until_deleted() {
    let file = NamedTempFile::new().unwrap();
    let fakes = Fakes::new();
    fakes.provider.seed("i-stray", "swipe-stray");
    fakes.provider.seed("i-other", "someone-else");
    fakes.provider.failing_deletes.store(100, Ordering::SeqCst);

    let h = open(file, fakes, |c| {
        c.orchestrator.maintenance_interval = Duration::from_secs(3600);
    })
    .await;
    let alerts = h.orchestrator.alerts().await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, "orphan_found");
    assert_eq!(alerts[0].instance_id.as_deref(), Some("i-stray"));
    assert_eq!(h.orchestrator.relay_status().destroy_pending, 1);

    h.fakes.provider.failing_deletes.store(0, Ordering::SeqCst);
    let (destroyed, pending) = h.orchestrator.relay().retry_orphans().await;
    assert_eq!(destroyed, vec!["i-stray".to_string()]);
    assert!(pending.is_empty());
    assert!(h.orchestrator.alerts().await.unwrap().is_empty());
    assert_eq!(h.fakes.provider.live(), vec!["i-other".to_string()]);
}

#[tokio::test]
async fn maintenance_sweep_catches_instances_appearing_later() {
    let h = harness().await;
    assert!(h.orchestrator.alerts().await.unwrap().is_empty());
    h.fakes.provider.failing_deletes.store(100, Ordering::SeqCst);

    h.fakes.provider.seed("i-late", "swipe-late");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.orchestrator.alerts().await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "stray instance never noticed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Later ticks keep retrying without raising it again
    tokio::time::sleep(Duration::from_millis(200)).await;
    let alerts = h.orchestrator.alerts().await.unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, "orphan_found");
    assert_eq!(alerts[0].instance_id.as_deref(), Some("i-late"));

    h.fakes.provider.failing_deletes.store(0, Ordering::SeqCst);
    assert!(eventually(|| h.fakes.provider.live().is_empty()).await);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !h.orchestrator.alerts().await.unwrap().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "alert never resolved");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn maintenance_sweep_leaves_live_relay_alone() {
    let h = harness().await;
    let task = start_download(&h, "magnet:?xt=urn:btih:busyrelay").await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.fakes.provider.live().len(), 1);
    assert!(h.orchestrator.alerts().await.unwrap().is_empty());
    assert_eq!(
        h.orchestrator.get_task(task.id).await.unwrap().status,
        TaskStatus::Downloading
    );
}

#[tokio::test]
async fn confirmed_tasks_are_requeued_after_restart() {
    let (file, db) = previous_run().await;
    let id = {
        let (tx, _rx) = broadcast::channel(16);
        let registry = TaskRegistry::new(db.clone(), tx);
        let task = registry
            .enqueue(candidate("magnet:?xt=urn:btih:queued"))
            .await
            .unwrap();
        let guard = registry.lock(task.id).await;
        registry.decide(&guard, Decision::Confirm).await.unwrap();
        task.id
    };
    drop(db);

    let h = open(file, Fakes::new(), |_| {}).await;
    let task = wait_for_status(&h.orchestrator, id, TaskStatus::Downloading).await;
    assert!(task.transfer_id.is_some());
}

#[tokio::test]
async fn resolving_unknown_alert_is_not_found() {
    let h = harness().await;
    assert!(matches!(
        h.orchestrator.resolve_alert(42).await,
        Err(Error::NotFound(_))
    ));
}

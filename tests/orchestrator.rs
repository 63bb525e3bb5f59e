mod common;

use async_trait::async_trait;
use bksched::context::AppContext;
use bksched::core::{
    CommandOutput, JobState, Lock, LockManager, LogLevel, Orchestrator, OrchestratorError,
    RepositoryKind,
};
use bksched::db::SqliteLockManager;
use chrono::Duration;
use common::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[tokio::test]
async fn vm_snapshot_waits_for_image_then_completes() {
    let h = Harness::new(vec![vm_template("web")]).await;
    let cloud = FakeCloud::install(&h.executor, 4096, "queued");
    let orchestrator = h.orchestrator();

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(summary.backuped, 0);

    let job = h.latest("web").await;
    assert_eq!(job.state, JobState::Dump);
    assert_eq!(cloud.image_count(), 1);
    assert!(h.logs(&job.id).await.iter().any(|l| {
        l.level == LogLevel::Warning && l.message.contains("'queued', waiting for 'active'")
    }));

    cloud.set_status("active");
    h.clock.advance(Duration::hours(1));

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.backuped, 1);

    let done = h.latest("web").await;
    assert_eq!(done.id, job.id);
    assert_eq!(done.state, JobState::Backuped);
    assert_eq!(done.raw_size, 4096);
    assert_eq!(done.snapshot_id.as_deref(), Some("img-1"));
    assert_eq!(done.checksum, Some(format!("md5:{}", IMAGE_MD5)));
    assert_eq!(done.metrics.unwrap().deduplicated_size, 512);

    assert_eq!(h.executor.count("borg init"), 1);
    assert_eq!(h.executor.count("server image create"), 1);
    assert_eq!(h.executor.count("image save"), 1);
    assert_eq!(h.executor.count("borg prune"), 1);
    assert_eq!(cloud.image_count(), 0);
    assert!(!h.staged_path("web", &done).await.exists());
}

#[tokio::test]
async fn settled_period_creates_nothing_until_the_next_day() {
    let h = Harness::new(vec![sftp_template("nightly")]).await;
    let orchestrator = h.orchestrator();

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(h.latest("nightly").await.state, JobState::Backuped);

    h.clock.advance(Duration::hours(6));
    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.settled, 1);
    assert_eq!(summary.created, 0);
    assert_eq!(h.jobs("nightly").await.len(), 1);
    assert_eq!(h.executor.count("borg create"), 1);

    h.clock.set(at(2026, 3, 11, 1));
    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.created, 1);
    assert_eq!(h.jobs("nightly").await.len(), 2);
    assert_eq!(h.latest("nightly").await.state, JobState::Backuped);
}

#[tokio::test]
async fn stale_in_flight_job_is_superseded() {
    let h = Harness::new(vec![vm_template("web")]).await;
    FakeCloud::install(&h.executor, 4096, "saving");
    let orchestrator = h.orchestrator();

    orchestrator.run().await.unwrap();
    let stale = h.latest("web").await;
    assert_eq!(stale.state, JobState::Dump);

    h.clock.advance(Duration::days(1));
    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.superseded, 1);

    let jobs = h.jobs("web").await;
    assert_eq!(jobs.len(), 2);

    let old = jobs.iter().find(|j| j.id == stale.id).unwrap();
    assert_eq!(old.state, JobState::Failed);
    assert!(h.logs(&old.id).await.iter().any(|l| {
        l.level == LogLevel::Error && l.message.contains("abandoned in 'dump'")
    }));

    let fresh = h.latest("web").await;
    assert_ne!(fresh.id, stale.id);
    assert_eq!(fresh.state, JobState::Dump);
    assert_eq!(h.executor.count("server image create"), 2);
}

#[tokio::test]
async fn upload_failure_fails_the_job_and_the_batch_continues() {
    let h = Harness::new(vec![mysql_template("main-db"), sftp_template("nightly")]).await;
    h.script_dump(2048);
    h.executor.clear("borg create");
    h.executor
        .on("main-db.sql.gz", CommandOutput::failed(2, "Connection closed by remote host"))
        .on("borg create", CommandOutput::ok(BORG_CREATE));
    let orchestrator = h.orchestrator();

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.backuped, 1);

    let failed = h.latest("main-db").await;
    assert_eq!(failed.state, JobState::Failed);
    let logs = h.logs(&failed.id).await;
    assert!(logs.iter().any(|l| {
        l.level == LogLevel::Error && l.message.contains("Connection closed by remote host")
    }));
    assert!(logs.iter().any(|l| l.message.contains("Entered state 'failed' from 'download'")));

    assert!(!h.staged_path("main-db", &failed).await.exists());
    assert!(logs.iter().any(|l| l.message.contains("Removed staged artifact")));

    assert_eq!(h.latest("nightly").await.state, JobState::Backuped);

    // Failed this period: left alone until tomorrow.
    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.settled, 2);
    assert_eq!(h.jobs("main-db").await.len(), 1);
}

#[tokio::test]
async fn streamed_dump_records_blake3_checksum() {
    let h = Harness::new(vec![mysql_template("main-db")]).await;
    h.script_dump(4096);

    h.orchestrator().run().await.unwrap();

    let job = h.latest("main-db").await;
    assert_eq!(job.state, JobState::Backuped);
    assert_eq!(job.raw_size, 4096);
    assert!(job.checksum.unwrap().starts_with("blake3:"));

    let dump = h
        .executor
        .calls()
        .into_iter()
        .find(|c| c.contains("gzip -c"))
        .unwrap();
    assert!(dump.starts_with("set -o pipefail; "));
    assert!(dump.contains("backup@db1.internal"));
    assert!(dump.contains("mysqldump --all-databases"));
}

#[tokio::test]
async fn undersized_dump_fails_and_is_removed() {
    let h = Harness::new(vec![mysql_template("main-db")]).await;
    h.script_dump(100);

    let summary = h.orchestrator().run().await.unwrap();
    assert_eq!(summary.failed, 1);

    let job = h.latest("main-db").await;
    assert_eq!(job.state, JobState::Failed);
    assert!(!h.staged_path("main-db", &job).await.exists());
    assert_eq!(h.executor.count("borg create"), 0);
}

#[tokio::test]
async fn timed_out_upload_is_a_failure() {
    let h = Harness::new(vec![sftp_template("nightly")]).await;
    h.executor.clear("borg create");
    h.executor.on(
        "borg create",
        CommandOutput::timeout(std::time::Duration::from_secs(43200)),
    );

    h.orchestrator().run().await.unwrap();

    let job = h.latest("nightly").await;
    assert_eq!(job.state, JobState::Failed);
    assert!(h
        .logs(&job.id)
        .await
        .iter()
        .any(|l| l.message.contains("timed out after 43200s")));
}

#[tokio::test]
async fn start_accepts_an_existing_repository() {
    let h = Harness::new(vec![sftp_template("nightly")]).await;
    h.executor.on(
        "borg init",
        CommandOutput::failed(2, "A repository already exists at /srv/repo."),
    );

    h.orchestrator().run().await.unwrap();

    let job = h.latest("nightly").await;
    assert_eq!(job.state, JobState::Backuped);
    assert!(h
        .logs(&job.id)
        .await
        .iter()
        .any(|l| l.message.contains("already initialized")));
}

#[tokio::test]
async fn repeated_upload_of_existing_archive_reads_archive_info() {
    let h = Harness::new(vec![sftp_template("nightly")]).await;
    h.executor.clear("borg create");
    h.executor
        .on("borg create", CommandOutput::failed(2, "Archive nightly-2026-03-10-x already exists"))
        .on("borg info", CommandOutput::ok(BORG_INFO));

    h.orchestrator().run().await.unwrap();

    let job = h.latest("nightly").await;
    assert_eq!(job.state, JobState::Backuped);
    let metrics = job.metrics.unwrap();
    assert_eq!(metrics.transferred_size, 4096);
    assert_eq!(metrics.deduplicated_size, 0);
    assert_eq!(h.executor.count("borg info"), 1);
}

#[tokio::test]
async fn matching_staged_copy_is_not_downloaded_again() {
    let h = Harness::new(vec![vm_template("web")]).await;
    let cloud = FakeCloud::install(&h.executor, 4096, "queued");
    let orchestrator = h.orchestrator();

    orchestrator.run().await.unwrap();
    let job = h.latest("web").await;

    // A previous attempt already transferred the image.
    let path = h.staged_path("web", &job).await;
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, vec![0u8; 4096]).unwrap();

    cloud.set_status("active");
    orchestrator.run().await.unwrap();

    let job = h.latest("web").await;
    assert_eq!(job.state, JobState::Backuped);
    assert_eq!(h.executor.count("md5sum"), 1);
    assert_eq!(h.executor.count("image save"), 0);
    assert!(h
        .logs(&job.id)
        .await
        .iter()
        .any(|l| l.message.contains("skipping transfer")));
}

#[tokio::test]
async fn stale_staged_copy_is_replaced() {
    let h = Harness::new(vec![vm_template("web")]).await;
    let cloud = FakeCloud::install(&h.executor, 4096, "queued");
    h.executor.clear("md5sum");
    h.executor
        .on("md5sum", CommandOutput::ok("00000000000000000000000000000000  staged"));
    let orchestrator = h.orchestrator();

    orchestrator.run().await.unwrap();
    let job = h.latest("web").await;
    let path = h.staged_path("web", &job).await;
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, vec![1u8; 4096]).unwrap();

    cloud.set_status("active");
    orchestrator.run().await.unwrap();

    assert_eq!(h.latest("web").await.state, JobState::Backuped);
    assert_eq!(h.executor.count("image save"), 1);
}

#[tokio::test]
async fn start_waits_for_not_before_hour() {
    let mut template = mysql_template("main-db");
    template.not_before_hour = Some(22);
    let h = Harness::new(vec![template]).await;
    h.script_dump(2048);
    let orchestrator = h.orchestrator();

    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.created, 1);

    let job = h.latest("main-db").await;
    assert_eq!(job.state, JobState::Initialized);
    assert!(h.logs(&job.id).await.iter().any(|l| {
        l.level == LogLevel::Warning && l.message.contains("not before 22:00 UTC")
    }));
    assert_eq!(h.executor.count("borg init"), 0);

    h.clock.set(at(2026, 3, 10, 22));
    let summary = orchestrator.run().await.unwrap();
    assert_eq!(summary.resumed, 1);
    assert_eq!(summary.backuped, 1);
    assert_eq!(h.latest("main-db").await.id, job.id);
}

#[tokio::test]
async fn mirror_template_syncs_with_rsync() {
    let h = Harness::with_repository(vec![mirror_template("media")], RepositoryKind::Mirror).await;
    h.executor.on(
        "rsync",
        CommandOutput::ok(
            "Number of files: 12\nTotal file size: 10,240 bytes\nTotal transferred file size: 2,048 bytes\n",
        ),
    );

    let summary = h.orchestrator().run().await.unwrap();
    assert_eq!(summary.backuped, 1);

    let job = h.latest("media").await;
    let metrics = job.metrics.unwrap();
    assert_eq!(metrics.transferred_size, 2048);
    assert_eq!(metrics.repository_size, 10240);
    assert_eq!(h.executor.count("mkdir -p"), 1);
    assert_eq!(h.executor.count("borg"), 0);
}

#[tokio::test]
async fn second_run_is_refused_while_the_lock_is_held() {
    let h = Harness::new(vec![sftp_template("nightly")]).await;
    let lock = h
        .ctx
        .locks
        .acquire(&h.ctx.config.lock_name, std::time::Duration::from_secs(600))
        .await
        .unwrap()
        .unwrap();

    let err = h.orchestrator().run().await.unwrap_err();
    assert!(matches!(err, OrchestratorError::LockUnavailable(_)));
    assert!(h.executor.calls().is_empty());

    h.ctx.locks.release(&lock).await.unwrap();
    h.orchestrator().run().await.unwrap();

    // The run released its own lease.
    let again = h
        .ctx
        .locks
        .acquire(&h.ctx.config.lock_name, std::time::Duration::from_secs(600))
        .await
        .unwrap();
    assert!(again.is_some());
}

#[tokio::test]
async fn abandoned_snapshot_jobs_release_their_images() {
    let h = Harness::new(vec![vm_template("web")]).await;
    let cloud = FakeCloud::install(&h.executor, 4096, "saving");
    let orchestrator = h.orchestrator();

    for _ in 0..3 {
        orchestrator.run().await.unwrap();
        h.clock.advance(Duration::days(1));
    }

    let jobs = h.jobs("web").await;
    assert_eq!(jobs.len(), 3);

    let failed: Vec<_> = jobs.iter().filter(|j| j.state == JobState::Failed).collect();
    assert_eq!(failed.len(), 2);
    for job in failed {
        assert!(h
            .logs(&job.id)
            .await
            .iter()
            .any(|l| l.message.contains("Deleted snapshot")));
    }

    assert_eq!(h.executor.count("image delete"), 2);
    assert_eq!(cloud.image_count(), 1);
}

#[tokio::test]
async fn prune_only_reaches_the_templates_own_archives() {
    let full = sftp_template("nightly-full");
    let full = bksched::core::JobTemplate {
        name: "nightly-full".into(),
        slug: "nightly-full".into(),
        ..full
    };
    let h = Harness::new(vec![sftp_template("nightly"), full]).await;

    h.orchestrator().run().await.unwrap();

    let calls = h.executor.calls();
    let archives: Vec<&str> = calls
        .iter()
        .filter(|c| c.contains("borg create"))
        .map(|c| c.split("::").nth(1).unwrap().split_whitespace().next().unwrap())
        .collect();
    let globs: Vec<&str> = calls
        .iter()
        .filter(|c| c.contains("borg prune"))
        .map(|c| {
            let mut words = c.split_whitespace();
            words.find(|w| *w == "--glob-archives");
            words.next().unwrap().trim_matches('\'').trim_end_matches('*')
        })
        .collect();

    assert_eq!(archives.len(), 2);
    assert_eq!(globs.len(), 2);
    for glob in globs {
        let matched = archives.iter().filter(|a| a.starts_with(glob)).count();
        assert_eq!(matched, 1, "{} matches {:?}", glob, archives);
    }
}

/// Grants the lease but reports it lost on every refresh.
struct LeaseLosingLocks {
    inner: SqliteLockManager,
    refreshes: AtomicUsize,
}

#[async_trait]
impl LockManager for LeaseLosingLocks {
    async fn acquire(&self, name: &str, ttl: std::time::Duration) -> anyhow::Result<Option<Lock>> {
        self.inner.acquire(name, ttl).await
    }

    async fn refresh(&self, _lock: &Lock) -> anyhow::Result<bool> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }

    async fn release(&self, lock: &Lock) -> anyhow::Result<()> {
        self.inner.release(lock).await
    }
}

#[tokio::test]
async fn lease_is_refreshed_before_every_template_in_both_phases() {
    let h = Harness::new(vec![sftp_template("nightly"), mysql_template("main-db")]).await;
    h.script_dump(2048);

    let locks = Arc::new(LeaseLosingLocks {
        inner: SqliteLockManager::new(h.conn.clone()),
        refreshes: AtomicUsize::new(0),
    });
    let ctx = AppContext::new(
        (*h.ctx.config).clone(),
        h.ctx.store.clone(),
        h.ctx.executor.clone(),
        locks.clone(),
        None,
        h.ctx.clock.clone(),
    );

    let summary = Orchestrator::new(ctx).run().await.unwrap();

    assert_eq!(locks.refreshes.load(Ordering::SeqCst), 4);
    assert_eq!(summary.backuped, 2);
    assert_eq!(summary.errors, 0);
}

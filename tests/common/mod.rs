#![allow(dead_code)]

use bksched::config::AppConfig;
use bksched::context::AppContext;
use bksched::core::{
    CommandOutput, FixedClock, Host, Job, JobTemplate, LogEntry, Orchestrator, Periodicity,
    Repository, RepositoryKind, RetentionPolicy, ScriptedExecutor, SourceType,
};
use bksched::core::staging;
use bksched::db::{self, SqliteLockManager, SqliteStore};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_rusqlite::Connection;

pub const BORG_CREATE: &str = r#"{
  "archive": {"name": "x", "stats": {"original_size": 4096, "deduplicated_size": 512}},
  "cache": {"stats": {"total_size": 81920, "unique_csize": 20480}}
}"#;

/// `borg info --json` for an archive that was uploaded before.
pub const BORG_INFO: &str = r#"{
  "archives": [{"name": "x", "stats": {"original_size": 4096, "deduplicated_size": 0}}],
  "cache": {"stats": {"total_size": 81920, "unique_csize": 20480}}
}"#;

pub fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

pub struct Harness {
    pub dir: TempDir,
    pub conn: Connection,
    pub executor: Arc<ScriptedExecutor>,
    pub clock: Arc<FixedClock>,
    pub ctx: AppContext,
}

impl Harness {
    pub async fn new(templates: Vec<JobTemplate>) -> Self {
        Self::with_repository(templates, RepositoryKind::Borg).await
    }

    pub async fn with_repository(templates: Vec<JobTemplate>, kind: RepositoryKind) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let conn = db::init(&dir.path().join("bksched.db")).await.unwrap();

        let repository = Repository {
            id: "vault".into(),
            name: "Vault".into(),
            kind,
            location: dir.path().join("repo").to_string_lossy().into_owned(),
            passphrase: Some("secret".into()),
        };
        db::templates::sync_catalog(&conn, vec![repository], vec![host()], templates)
            .await
            .unwrap();

        let mut config = AppConfig::default();
        config.database_path = dir.path().join("bksched.db");
        config.staging_directory = dir.path().join("staging");
        config.snapshot.poll_attempts = 2;
        config.snapshot.poll_interval_secs = 0;

        let executor = Arc::new(ScriptedExecutor::new());
        executor.on("borg create", CommandOutput::ok(BORG_CREATE));
        let clock = Arc::new(FixedClock::new(at(2026, 3, 10, 8)));
        let ctx = AppContext::new(
            config,
            Arc::new(SqliteStore::new(conn.clone())),
            executor.clone(),
            Arc::new(SqliteLockManager::new(conn.clone())),
            None,
            clock.clone(),
        );

        Self {
            dir,
            conn,
            executor,
            clock,
            ctx,
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.ctx.clone())
    }

    pub async fn latest(&self, template_id: &str) -> Job {
        db::jobs::find_latest_by_template(&self.conn, template_id.to_string())
            .await
            .unwrap()
            .expect("template has a job")
    }

    pub async fn jobs(&self, template_id: &str) -> Vec<Job> {
        db::jobs::list_by_template(&self.conn, template_id.to_string())
            .await
            .unwrap()
    }

    pub async fn logs(&self, job_id: &str) -> Vec<LogEntry> {
        db::jobs::logs(&self.conn, job_id.to_string()).await.unwrap()
    }

    pub async fn template(&self, id: &str) -> JobTemplate {
        db::templates::get(&self.conn, id.to_string())
            .await
            .unwrap()
            .expect("template exists")
    }

    pub async fn staged_path(&self, template_id: &str, job: &Job) -> PathBuf {
        let template = self.template(template_id).await;
        staging::staged_path(&self.ctx.config.staging_directory, &template, job)
    }

    /// Make the streamed dump pipeline produce a staged file of `size` bytes.
    pub fn script_dump(&self, size: usize) {
        self.executor.on_with("gzip -c", move |req| {
            let path = req
                .command_line
                .split_whitespace()
                .last()
                .unwrap()
                .to_string();
            std::fs::write(path, vec![7u8; size]).unwrap();
            CommandOutput::ok("")
        });
    }
}

pub fn host() -> Host {
    Host {
        id: "db1".into(),
        name: "db1".into(),
        hostname: "db1.internal".into(),
        port: 22,
        user: "backup".into(),
        identity_file: None,
    }
}

fn template(id: &str, slug: &str, source_type: SourceType) -> JobTemplate {
    JobTemplate {
        id: id.into(),
        name: slug.into(),
        slug: slug.into(),
        source_type,
        periodicity: Periodicity::Daily,
        retention: RetentionPolicy {
            keep_daily: 7,
            keep_weekly: 4,
        },
        repository_id: "vault".into(),
        sub_path: None,
        enabled: true,
        host_id: None,
        vm_instance: None,
        remote_command: None,
        min_artifact_size: 0,
        file_extension: None,
        not_before_hour: None,
    }
}

pub fn vm_template(id: &str) -> JobTemplate {
    JobTemplate {
        vm_instance: Some("vm-web-1".into()),
        ..template(id, "web", SourceType::VmSnapshot)
    }
}

pub fn mysql_template(id: &str) -> JobTemplate {
    JobTemplate {
        host_id: Some("db1".into()),
        min_artifact_size: 1024,
        ..template(id, "main-db", SourceType::MysqlDump)
    }
}

pub fn sftp_template(id: &str) -> JobTemplate {
    JobTemplate {
        host_id: Some("db1".into()),
        remote_command: Some("/var/backups/nightly.tar".into()),
        ..template(id, "nightly", SourceType::SftpCopy)
    }
}

pub fn mirror_template(id: &str) -> JobTemplate {
    JobTemplate {
        host_id: Some("db1".into()),
        remote_command: Some("/srv/media".into()),
        ..template(id, "media", SourceType::ReadOnlyDedupMirror)
    }
}

#[derive(Debug, Clone)]
struct FakeImage {
    id: String,
    name: String,
    status: String,
    size: u64,
}

/// In-memory image service answering the `openstack` command lines.
#[derive(Clone)]
pub struct FakeCloud {
    images: Arc<Mutex<HashMap<String, FakeImage>>>,
    initial_status: Arc<Mutex<String>>,
    size: u64,
}

pub const IMAGE_MD5: &str = "9e107d9d372bb6826bd81d3542a419d6";

fn arg_after<'a>(line: &'a str, flag: &str) -> &'a str {
    let mut words = line.split_whitespace();
    words.find(|w| *w == flag);
    words.next().unwrap()
}

fn last_arg(line: &str) -> String {
    line.split_whitespace().last().unwrap().to_string()
}

impl FakeCloud {
    pub fn install(executor: &ScriptedExecutor, size: u64, initial_status: &str) -> Self {
        let cloud = Self {
            images: Arc::default(),
            initial_status: Arc::new(Mutex::new(initial_status.to_string())),
            size,
        };

        let c = cloud.clone();
        executor.on_with("server image create", move |req| {
            let name = arg_after(&req.command_line, "--name").to_string();
            let mut images = c.images.lock().unwrap();
            let id = format!("img-{}", images.len() + 1);
            let status = c.initial_status.lock().unwrap().clone();
            images.insert(
                name.clone(),
                FakeImage {
                    id,
                    name,
                    status,
                    size: c.size,
                },
            );
            CommandOutput::ok("")
        });

        let c = cloud.clone();
        executor.on_with("image show", move |req| {
            let key = last_arg(&req.command_line);
            match c.lookup(&key) {
                Some(image) => CommandOutput::ok(
                    serde_json::json!({
                        "id": image.id,
                        "name": image.name,
                        "status": image.status,
                        "checksum": IMAGE_MD5,
                        "size": image.size,
                    })
                    .to_string(),
                ),
                None => CommandOutput::failed(1, format!("No Image found for {}", key)),
            }
        });

        let c = cloud.clone();
        executor.on_with("image save", move |req| {
            let path = arg_after(&req.command_line, "--file").to_string();
            std::fs::write(path, vec![0u8; c.size as usize]).unwrap();
            CommandOutput::ok("")
        });

        let c = cloud.clone();
        executor.on_with("image delete", move |req| {
            let id = last_arg(&req.command_line);
            c.images.lock().unwrap().retain(|_, image| image.id != id);
            CommandOutput::ok("")
        });

        executor.on("md5sum", CommandOutput::ok(format!("{}  staged", IMAGE_MD5)));
        cloud
    }

    fn lookup(&self, key: &str) -> Option<FakeImage> {
        let images = self.images.lock().unwrap();
        images
            .values()
            .find(|image| image.name == key || image.id == key)
            .cloned()
    }

    /// Move every image, and images created from now on, to `status`.
    pub fn set_status(&self, status: &str) {
        *self.initial_status.lock().unwrap() = status.to_string();
        for image in self.images.lock().unwrap().values_mut() {
            image.status = status.to_string();
        }
    }

    pub fn image_count(&self) -> usize {
        self.images.lock().unwrap().len()
    }
}

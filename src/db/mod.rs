use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::Path;
use std::str::FromStr;
use tokio_rusqlite::{Connection, rusqlite};

use crate::core::models::{Host, Job, JobTemplate, LogEntry, Repository};
use crate::core::store::JobStore;

pub mod jobs;
pub mod locks;
pub mod templates;

pub use locks::SqliteLockManager;

pub async fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let conn = Connection::open(path)
        .await
        .with_context(|| format!("Failed to open database {}", path.display()))?;

    conn.call(|conn| {
        // Enable foreign keys (SQLite disables them by default!)
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to initialize schema: {}", e))?;

    Ok(conn)
}

/// Timestamps are stored as fixed-width RFC 3339 so that text order is time order.
pub(crate) fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_col<T: FromStr<Err = String>>(idx: usize, value: String) -> rusqlite::Result<T> {
    value.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
    })
}

/// [`JobStore`] backed by the SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn find_all_enabled_templates(&self) -> Result<Vec<JobTemplate>> {
        templates::find_all_enabled(&self.conn).await
    }

    async fn find_latest_by_template(&self, template_id: &str) -> Result<Option<Job>> {
        jobs::find_latest_by_template(&self.conn, template_id.to_string()).await
    }

    async fn save(&self, job: &Job) -> Result<()> {
        jobs::save(&self.conn, job.clone()).await
    }

    async fn repository(&self, id: &str) -> Result<Repository> {
        templates::repository(&self.conn, id.to_string()).await
    }

    async fn host(&self, id: &str) -> Result<Host> {
        templates::host(&self.conn, id.to_string()).await
    }

    async fn append_log(&self, job_id: &str, entry: &LogEntry) -> Result<()> {
        jobs::append_log(&self.conn, job_id.to_string(), entry.clone()).await
    }

    async fn logs(&self, job_id: &str) -> Result<Vec<LogEntry>> {
        jobs::logs(&self.conn, job_id.to_string()).await
    }
}

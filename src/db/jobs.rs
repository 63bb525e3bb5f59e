use anyhow::{Result, anyhow};
use serde::Serialize;
use tokio_rusqlite::{
    Connection,
    rusqlite::{self, OptionalExtension, params},
};
use uuid::Uuid;

use super::{parse_col, parse_ts, ts};
use crate::core::models::{Job, LogEntry, TransferMetrics};

const JOB_COLUMNS: &str = "id, template_id, state, created_at, updated_at, snapshot_id, checksum,
    raw_size, transferred_size, deduplicated_size, repository_size, repository_deduplicated_size";

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let transferred: Option<i64> = row.get(8)?;
    let metrics = match transferred {
        Some(transferred) => Some(TransferMetrics {
            transferred_size: transferred as u64,
            deduplicated_size: row.get::<_, Option<i64>>(9)?.unwrap_or(0) as u64,
            repository_size: row.get::<_, Option<i64>>(10)?.unwrap_or(0) as u64,
            repository_deduplicated_size: row.get::<_, Option<i64>>(11)?.unwrap_or(0) as u64,
        }),
        None => None,
    };

    Ok(Job {
        id: row.get(0)?,
        template_id: row.get(1)?,
        state: parse_col(2, row.get(2)?)?,
        created_at: parse_ts(3, row.get(3)?)?,
        updated_at: parse_ts(4, row.get(4)?)?,
        snapshot_id: row.get(5)?,
        checksum: row.get(6)?,
        raw_size: row.get::<_, i64>(7)? as u64,
        metrics,
    })
}

/// Insert the job or overwrite its mutable fields.
pub async fn save(conn: &Connection, job: Job) -> Result<()> {
    conn.call(move |c| {
        let m = job.metrics;
        c.execute(
            "INSERT INTO jobs (id, template_id, state, created_at, updated_at, snapshot_id,
                checksum, raw_size, transferred_size, deduplicated_size, repository_size,
                repository_deduplicated_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at,
                snapshot_id = excluded.snapshot_id,
                checksum = excluded.checksum,
                raw_size = excluded.raw_size,
                transferred_size = excluded.transferred_size,
                deduplicated_size = excluded.deduplicated_size,
                repository_size = excluded.repository_size,
                repository_deduplicated_size = excluded.repository_deduplicated_size",
            params![
                &job.id,
                &job.template_id,
                job.state.as_str(),
                ts(&job.created_at),
                ts(&job.updated_at),
                &job.snapshot_id,
                &job.checksum,
                job.raw_size as i64,
                m.map(|m| m.transferred_size as i64),
                m.map(|m| m.deduplicated_size as i64),
                m.map(|m| m.repository_size as i64),
                m.map(|m| m.repository_deduplicated_size as i64),
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to save job: {}", e))
}

pub async fn find_latest_by_template(conn: &Connection, template_id: String) -> Result<Option<Job>> {
    conn.call(move |c| {
        c.query_row(
            &format!(
                "SELECT {} FROM jobs WHERE template_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT 1",
                JOB_COLUMNS
            ),
            params![template_id],
            job_from_row,
        )
        .optional()
    })
    .await
    .map_err(|e| anyhow!("Failed to find latest job: {}", e))
}

pub async fn get(conn: &Connection, job_id: String) -> Result<Option<Job>> {
    conn.call(move |c| {
        c.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            params![job_id],
            job_from_row,
        )
        .optional()
    })
    .await
    .map_err(|e| anyhow!("Failed to get job: {}", e))
}

/// All jobs of a template, newest first.
pub async fn list_by_template(conn: &Connection, template_id: String) -> Result<Vec<Job>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(&format!(
            "SELECT {} FROM jobs WHERE template_id = ?1 ORDER BY created_at DESC, id DESC",
            JOB_COLUMNS
        ))?;
        let rows = stmt.query_map(params![template_id], job_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to list jobs: {}", e))
}

pub async fn append_log(conn: &Connection, job_id: String, entry: LogEntry) -> Result<()> {
    conn.call(move |c| {
        let log_id = Uuid::now_v7().to_string();
        c.execute(
            "INSERT INTO job_logs (id, job_id, level, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                log_id,
                job_id,
                entry.level.as_str(),
                entry.message,
                ts(&entry.created_at)
            ],
        )?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to append job log: {}", e))
}

/// Audit trail in insertion order.
pub async fn logs(conn: &Connection, job_id: String) -> Result<Vec<LogEntry>> {
    conn.call(move |c| {
        let mut stmt = c.prepare(
            "SELECT level, message, created_at FROM job_logs WHERE job_id = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![job_id], |row| {
            Ok(LogEntry {
                level: parse_col(0, row.get(0)?)?,
                message: row.get(1)?,
                created_at: parse_ts(2, row.get(2)?)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to read job logs: {}", e))
}

/// Latest job of every enabled template, for status output.
#[derive(Debug, Serialize)]
pub struct TemplateStatus {
    pub template_id: String,
    pub slug: String,
    pub source_type: String,
    pub job: Option<Job>,
}

pub async fn latest_per_template(conn: &Connection) -> Result<Vec<TemplateStatus>> {
    let templates = super::templates::find_all_enabled(conn).await?;
    let mut statuses = Vec::with_capacity(templates.len());

    for template in templates {
        let job = find_latest_by_template(conn, template.id.clone()).await?;
        statuses.push(TemplateStatus {
            template_id: template.id,
            slug: template.slug,
            source_type: template.source_type.to_string(),
            job,
        });
    }

    Ok(statuses)
}

use anyhow::{Result, anyhow};
use tokio_rusqlite::{
    Connection,
    rusqlite::{self, OptionalExtension, params},
};

use super::parse_col;
use crate::core::models::{Host, JobTemplate, Repository, RetentionPolicy};

/// Upsert the configured catalog. Templates missing from it are disabled,
/// not deleted, so their job history stays intact.
pub async fn sync_catalog(
    conn: &Connection,
    repositories: Vec<Repository>,
    hosts: Vec<Host>,
    templates: Vec<JobTemplate>,
) -> Result<()> {
    conn.call(move |c| {
        let tx = c.transaction()?;

        for repo in &repositories {
            tx.execute(
                "INSERT INTO repositories (id, name, kind, location, passphrase)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    kind = excluded.kind,
                    location = excluded.location,
                    passphrase = excluded.passphrase",
                params![
                    &repo.id,
                    &repo.name,
                    repo.kind.as_str(),
                    &repo.location,
                    &repo.passphrase
                ],
            )?;
        }

        for host in &hosts {
            tx.execute(
                "INSERT INTO hosts (id, name, hostname, port, user, identity_file)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    hostname = excluded.hostname,
                    port = excluded.port,
                    user = excluded.user,
                    identity_file = excluded.identity_file",
                params![
                    &host.id,
                    &host.name,
                    &host.hostname,
                    host.port,
                    &host.user,
                    &host.identity_file
                ],
            )?;
        }

        tx.execute("UPDATE templates SET enabled = 0", [])?;

        for t in &templates {
            tx.execute(
                "INSERT INTO templates (id, name, slug, source_type, periodicity, keep_daily,
                    keep_weekly, repository_id, sub_path, enabled, host_id, vm_instance,
                    remote_command, min_artifact_size, file_extension, not_before_hour)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    slug = excluded.slug,
                    source_type = excluded.source_type,
                    periodicity = excluded.periodicity,
                    keep_daily = excluded.keep_daily,
                    keep_weekly = excluded.keep_weekly,
                    repository_id = excluded.repository_id,
                    sub_path = excluded.sub_path,
                    enabled = excluded.enabled,
                    host_id = excluded.host_id,
                    vm_instance = excluded.vm_instance,
                    remote_command = excluded.remote_command,
                    min_artifact_size = excluded.min_artifact_size,
                    file_extension = excluded.file_extension,
                    not_before_hour = excluded.not_before_hour",
                params![
                    &t.id,
                    &t.name,
                    &t.slug,
                    t.source_type.as_str(),
                    t.periodicity.as_str(),
                    t.retention.keep_daily,
                    t.retention.keep_weekly,
                    &t.repository_id,
                    &t.sub_path,
                    t.enabled,
                    &t.host_id,
                    &t.vm_instance,
                    &t.remote_command,
                    t.min_artifact_size as i64,
                    &t.file_extension,
                    t.not_before_hour
                ],
            )?;
        }

        tx.commit()?;
        Ok::<(), rusqlite::Error>(())
    })
    .await
    .map_err(|e| anyhow!("Failed to sync catalog: {}", e))
}

const TEMPLATE_COLUMNS: &str = "id, name, slug, source_type, periodicity, keep_daily, keep_weekly,
    repository_id, sub_path, enabled, host_id, vm_instance, remote_command, min_artifact_size,
    file_extension, not_before_hour";

fn template_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobTemplate> {
    Ok(JobTemplate {
        id: row.get(0)?,
        name: row.get(1)?,
        slug: row.get(2)?,
        source_type: parse_col(3, row.get(3)?)?,
        periodicity: parse_col(4, row.get(4)?)?,
        retention: RetentionPolicy {
            keep_daily: row.get(5)?,
            keep_weekly: row.get(6)?,
        },
        repository_id: row.get(7)?,
        sub_path: row.get(8)?,
        enabled: row.get(9)?,
        host_id: row.get(10)?,
        vm_instance: row.get(11)?,
        remote_command: row.get(12)?,
        min_artifact_size: row.get::<_, i64>(13)?.max(0) as u64,
        file_extension: row.get(14)?,
        not_before_hour: row.get(15)?,
    })
}

pub async fn find_all_enabled(conn: &Connection) -> Result<Vec<JobTemplate>> {
    conn.call(|c| {
        let mut stmt = c.prepare(&format!(
            "SELECT {} FROM templates WHERE enabled = 1 ORDER BY slug",
            TEMPLATE_COLUMNS
        ))?;
        let rows = stmt.query_map([], template_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })
    .await
    .map_err(|e| anyhow!("Failed to load templates: {}", e))
}

pub async fn get(conn: &Connection, id: String) -> Result<Option<JobTemplate>> {
    conn.call(move |c| {
        c.query_row(
            &format!("SELECT {} FROM templates WHERE id = ?1", TEMPLATE_COLUMNS),
            params![id],
            template_from_row,
        )
        .optional()
    })
    .await
    .map_err(|e| anyhow!("Failed to get template: {}", e))
}

pub async fn repository(conn: &Connection, id: String) -> Result<Repository> {
    let lookup = id.clone();
    conn.call(move |c| {
        c.query_row(
            "SELECT id, name, kind, location, passphrase FROM repositories WHERE id = ?1",
            params![lookup],
            |row| {
                Ok(Repository {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    kind: parse_col(2, row.get(2)?)?,
                    location: row.get(3)?,
                    passphrase: row.get(4)?,
                })
            },
        )
        .optional()
    })
    .await
    .map_err(|e| anyhow!("Failed to get repository: {}", e))?
    .ok_or_else(|| anyhow!("Repository not found: {}", id))
}

pub async fn host(conn: &Connection, id: String) -> Result<Host> {
    let lookup = id.clone();
    conn.call(move |c| {
        c.query_row(
            "SELECT id, name, hostname, port, user, identity_file FROM hosts WHERE id = ?1",
            params![lookup],
            |row| {
                Ok(Host {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    hostname: row.get(2)?,
                    port: row.get(3)?,
                    user: row.get(4)?,
                    identity_file: row.get(5)?,
                })
            },
        )
        .optional()
    })
    .await
    .map_err(|e| anyhow!("Failed to get host: {}", e))?
    .ok_or_else(|| anyhow!("Host not found: {}", id))
}

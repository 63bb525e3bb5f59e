use anyhow::Result;
use async_trait::async_trait;

use crate::core::models::{Host, Job, JobTemplate, LogEntry, Repository};

/// Persistence of templates, jobs and their audit trail.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn find_all_enabled_templates(&self) -> Result<Vec<JobTemplate>>;

    async fn find_latest_by_template(&self, template_id: &str) -> Result<Option<Job>>;

    /// Insert or update a job.
    async fn save(&self, job: &Job) -> Result<()>;

    async fn repository(&self, id: &str) -> Result<Repository>;

    async fn host(&self, id: &str) -> Result<Host>;

    async fn append_log(&self, job_id: &str, entry: &LogEntry) -> Result<()>;

    /// Audit trail of a job, oldest first.
    async fn logs(&self, job_id: &str) -> Result<Vec<LogEntry>>;
}

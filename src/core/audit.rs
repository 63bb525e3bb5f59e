//! Durable per-job audit trail, mirrored to the process log.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::clock::Clock;
use crate::core::models::{Job, LogEntry, LogLevel};
use crate::core::store::JobStore;

#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append an entry to the job's trail.
    ///
    /// Storage failures go to the process log only.
    pub async fn record(&self, job: &Job, level: LogLevel, message: impl Into<String>) {
        let message = message.into();

        match level {
            LogLevel::Debug => debug!(job_id = %job.id, template = %job.template_id, "{}", message),
            LogLevel::Info => info!(job_id = %job.id, template = %job.template_id, "{}", message),
            LogLevel::Warning => warn!(job_id = %job.id, template = %job.template_id, "{}", message),
            LogLevel::Error => error!(job_id = %job.id, template = %job.template_id, "{}", message),
        }

        let entry = LogEntry {
            level,
            message,
            created_at: self.clock.now(),
        };

        if let Err(e) = self.store.append_log(&job.id, &entry).await {
            error!(job_id = %job.id, error = %e, "Failed to persist audit entry");
        }
    }

    pub async fn info(&self, job: &Job, message: impl Into<String>) {
        self.record(job, LogLevel::Info, message).await
    }

    pub async fn warning(&self, job: &Job, message: impl Into<String>) {
        self.record(job, LogLevel::Warning, message).await
    }

    pub async fn error(&self, job: &Job, message: impl Into<String>) {
        self.record(job, LogLevel::Error, message).await
    }

    pub async fn debug(&self, job: &Job, message: impl Into<String>) {
        self.record(job, LogLevel::Debug, message).await
    }
}

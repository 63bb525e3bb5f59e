mod slack;

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{NotificationChannelType, NotificationConfig};

/// What went wrong with a job, for humans.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub job_id: String,
    pub template_name: String,
    pub template_slug: String,
    /// State the job was in when it failed.
    pub failed_in: String,
    pub reason: String,
}

/// Trait for notification channel implementations (Slack, ...)
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send_failure_report(&self, report: FailureReport) -> Result<()>;
}

/// Factory function to create a notifier based on config
pub fn create_notifier(config: &NotificationConfig) -> Option<Arc<dyn NotificationChannel>> {
    match &config.channel {
        NotificationChannelType::None => None,
        NotificationChannelType::Slack => {
            let webhook = config.slack_webhook.as_ref()?;
            if webhook.is_empty() {
                return None;
            }
            Some(Arc::new(slack::SlackNotifier::new(webhook.clone())))
        }
    }
}

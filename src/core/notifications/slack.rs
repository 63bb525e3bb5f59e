use super::{FailureReport, NotificationChannel};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;

pub struct SlackNotifier {
    webhook_url: String,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            webhook_url,
            client: reqwest::Client::new(),
        }
    }

    fn format_message(&self, report: &FailureReport) -> serde_json::Value {
        let short_id = &report.job_id[report.job_id.len().saturating_sub(12)..];
        json!({
            "blocks": [
                {
                    "type": "header",
                    "text": {
                        "type": "plain_text",
                        "text": "Backup Failed",
                        "emoji": true
                    }
                },
                {
                    "type": "section",
                    "fields": [
                        {
                            "type": "mrkdwn",
                            "text": format!("*Template:*\n{} (`{}`)", report.template_name, report.template_slug)
                        },
                        {
                            "type": "mrkdwn",
                            "text": format!("*Job ID:*\n`{}`", short_id)
                        },
                        {
                            "type": "mrkdwn",
                            "text": format!("*Failed in:*\n{}", report.failed_in)
                        }
                    ]
                },
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": format!("*Error:*\n```{}```", report.reason)
                    }
                }
            ]
        })
    }
}

#[async_trait]
impl NotificationChannel for SlackNotifier {
    async fn send_failure_report(&self, report: FailureReport) -> Result<()> {
        let payload = self.format_message(&report);
        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

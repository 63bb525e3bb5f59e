use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::models::{Host, JobTemplate, Repository};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/bksched/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub staging_directory: PathBuf,
    pub lock_name: String,
    pub lock_ttl_secs: u64,
    pub daemon_interval_secs: u64,
    pub verbose: bool,
    pub json_logs: bool,
    pub timeouts: Timeouts,
    pub tools: ToolsConfig,
    pub snapshot: SnapshotConfig,
    pub notifications: NotificationConfig,
    pub repositories: Vec<Repository>,
    pub hosts: Vec<Host>,
    pub templates: Vec<JobTemplate>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("/var/lib/bksched/bksched.db"),
            staging_directory: PathBuf::from("/var/lib/bksched/staging"),
            lock_name: "bksched-run".to_string(),
            lock_ttl_secs: 6 * 3600,
            daemon_interval_secs: 3600,
            verbose: false,
            json_logs: false,
            timeouts: Timeouts::default(),
            tools: ToolsConfig::default(),
            snapshot: SnapshotConfig::default(),
            notifications: NotificationConfig::default(),
            repositories: Vec::new(),
            hosts: Vec::new(),
            templates: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration: defaults, then the TOML file, then `BKSCHED_*`
    /// environment variables, then whatever the CLI sets.
    pub fn new<T: Serialize>(config_path: Option<&Path>, cli_args: Option<&T>) -> Result<Self> {
        let path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("BKSCHED_").split("__"));

        if let Some(args) = cli_args {
            figment = figment.merge(Serialized::defaults(args));
        }

        let config: AppConfig = figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    fn validate(&self) -> Result<()> {
        for template in &self.templates {
            template.validate().map_err(anyhow::Error::msg)?;

            if !self.repositories.iter().any(|r| r.id == template.repository_id) {
                anyhow::bail!(
                    "template '{}' references unknown repository '{}'",
                    template.slug,
                    template.repository_id
                );
            }

            if let Some(host_id) = &template.host_id {
                if !self.hosts.iter().any(|h| &h.id == host_id) {
                    anyhow::bail!(
                        "template '{}' references unknown host '{}'",
                        template.slug,
                        host_id
                    );
                }
            }
        }
        Ok(())
    }
}

/// Hard caps for external commands, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub repository_init: u64,
    pub snapshot_create: u64,
    pub snapshot_query: u64,
    pub snapshot_download: u64,
    pub snapshot_delete: u64,
    pub source_dump: u64,
    pub upload: u64,
    pub prune: u64,
    pub checksum: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            repository_init: 300,
            snapshot_create: 600,
            snapshot_query: 60,
            snapshot_download: 6 * 3600,
            snapshot_delete: 300,
            source_dump: 6 * 3600,
            upload: 12 * 3600,
            prune: 3600,
            checksum: 3600,
        }
    }
}

impl Timeouts {
    pub fn of(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Runs every command line; must understand `set -o pipefail`.
    pub shell: String,
    pub ssh: String,
    pub borg: String,
    pub restic: String,
    pub rsync: String,
    pub openstack: String,
    pub md5sum: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
            ssh: "ssh".to_string(),
            borg: "borg".to_string(),
            restic: "restic".to_string(),
            rsync: "rsync".to_string(),
            openstack: "openstack".to_string(),
            md5sum: "md5sum".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// How many times `download` asks for image details before giving up.
    pub poll_attempts: u32,
    pub poll_interval_secs: u64,
    /// Passed to the image CLI, e.g. `OS_AUTH_URL`, `OS_CLOUD`.
    pub environment: BTreeMap<String, String>,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            poll_attempts: 30,
            poll_interval_secs: 20,
            environment: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    #[default]
    None,
    Slack,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub channel: NotificationChannelType,
    pub slack_webhook: Option<String>,
}

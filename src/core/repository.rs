//! Command lines and output parsing for destination repositories.
//!
//! `borg` and `restic` repositories deduplicate content, so a repeated upload
//! of the same artifact only costs metadata. `mirror` targets are plain
//! directories kept in sync with rsync and have no retention of their own.

use regex::Regex;
use serde::Deserialize;
use std::sync::LazyLock;

use crate::config::ToolsConfig;
use crate::core::error::{OrchestratorError, Result};
use crate::core::executor::{CommandRequest, quote};
use crate::core::models::{
    RepositoryKind, Repository, RetentionPolicy, TransferMetrics, archive_prefix,
};

pub static ALREADY_INITIALIZED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)repository already exists|already initialized|config file already exists")
        .expect("valid regex")
});

pub static ARCHIVE_EXISTS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)archive \S+ already exists").expect("valid regex")
});

/// Bytes parsed from `rsync --stats`, e.g. `Total file size: 1,234 bytes`.
static RSYNC_TOTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Total file size: ([\d,]+) bytes").expect("valid regex")
});

static RSYNC_TRANSFERRED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^Total transferred file size: ([\d,]+) bytes").expect("valid regex")
});

pub struct RepositoryDriver<'a> {
    repo: &'a Repository,
    location: String,
    tools: &'a ToolsConfig,
}

impl<'a> RepositoryDriver<'a> {
    pub fn new(repo: &'a Repository, sub_path: Option<&str>, tools: &'a ToolsConfig) -> Self {
        Self {
            repo,
            location: repo.location_for(sub_path),
            tools,
        }
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    fn env(&self) -> Vec<(String, String)> {
        let passphrase = self.repo.passphrase.clone().unwrap_or_default();
        match self.repo.kind {
            RepositoryKind::Borg => vec![
                ("BORG_PASSPHRASE".into(), passphrase),
                ("BORG_RELOCATED_REPO_ACCESS_IS_OK".into(), "yes".into()),
            ],
            RepositoryKind::Restic => vec![("RESTIC_PASSWORD".into(), passphrase)],
            RepositoryKind::Mirror => Vec::new(),
        }
    }

    fn request(&self, label: &str, line: String, timeout: std::time::Duration) -> CommandRequest {
        CommandRequest::new(label, line, timeout).envs(self.env())
    }

    fn restic(&self) -> String {
        format!("{} -r {}", quote(&self.tools.restic), quote(&self.location))
    }

    /// One-time repository bootstrap. `None` when the target needs none.
    pub fn init_request(&self, timeout: std::time::Duration) -> Option<CommandRequest> {
        let line = match self.repo.kind {
            RepositoryKind::Borg => format!(
                "{} init --encryption=repokey-blake2 {}",
                quote(&self.tools.borg),
                quote(&self.location)
            ),
            RepositoryKind::Restic => format!("{} init", self.restic()),
            RepositoryKind::Mirror if !self.location.contains(':') => {
                format!("mkdir -p {}", quote(&self.location))
            }
            RepositoryKind::Mirror => return None,
        };
        Some(self.request("repository init", line, timeout))
    }

    /// Store the output of `input` (a shell pipeline or `< file` redirect)
    /// as `archive`, with the artifact named `stdin_name` inside it.
    pub fn upload_request(
        &self,
        input: &Input,
        archive: &str,
        stdin_name: &str,
        tags: &[(&str, &str)],
        timeout: std::time::Duration,
    ) -> Result<CommandRequest> {
        let tool = match self.repo.kind {
            RepositoryKind::Borg => {
                let comment = tags
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(" ");
                format!(
                    "{} create --json --stdin-name {} --comment {} {} -",
                    quote(&self.tools.borg),
                    quote(stdin_name),
                    quote(&comment),
                    quote(&format!("{}::{}", self.location, archive)),
                )
            }
            RepositoryKind::Restic => {
                let mut line = format!(
                    "{} backup --json --stdin --stdin-filename {} --tag {}",
                    self.restic(),
                    quote(stdin_name),
                    quote(&format!("archive={}", archive)),
                );
                for (k, v) in tags {
                    line.push_str(&format!(" --tag {}", quote(&format!("{}={}", k, v))));
                }
                line
            }
            RepositoryKind::Mirror => {
                return Err(OrchestratorError::command(
                    "upload",
                    format!("repository '{}' is a mirror and cannot store archives", self.repo.name),
                ));
            }
        };

        let line = match input {
            Input::File(path) => format!("{} < {}", tool, quote(path)),
            Input::Pipeline(producer) => format!("set -o pipefail; {} | {}", producer, tool),
        };
        Ok(self.request("repository upload", line, timeout))
    }

    /// Details of an archive that already exists, used when an upload is repeated.
    pub fn archive_info_request(&self, archive: &str, timeout: std::time::Duration) -> Option<CommandRequest> {
        match self.repo.kind {
            RepositoryKind::Borg => Some(self.request(
                "repository info",
                format!(
                    "{} info --json {}",
                    quote(&self.tools.borg),
                    quote(&format!("{}::{}", self.location, archive))
                ),
                timeout,
            )),
            _ => None,
        }
    }

    /// Cumulative repository statistics, for tools whose upload output lacks them.
    pub fn stats_request(&self, timeout: std::time::Duration) -> Option<CommandRequest> {
        match self.repo.kind {
            RepositoryKind::Restic => Some(self.request(
                "repository stats",
                format!("{} stats --json --mode raw-data", self.restic()),
                timeout,
            )),
            _ => None,
        }
    }

    pub fn mirror_request(
        &self,
        rsync_shell: &str,
        source: &str,
        timeout: std::time::Duration,
    ) -> Result<CommandRequest> {
        if self.repo.kind != RepositoryKind::Mirror {
            return Err(OrchestratorError::command(
                "mirror",
                format!("repository '{}' is not a mirror target", self.repo.name),
            ));
        }

        let line = format!(
            "{} -a --delete --stats -e {} {} {}/",
            quote(&self.tools.rsync),
            quote(rsync_shell),
            quote(source),
            quote(self.location.trim_end_matches('/')),
        );
        Ok(self.request("repository mirror", line, timeout))
    }

    /// Apply the retention policy to archives of one template. `None` for mirrors.
    pub fn prune_request(
        &self,
        slug: &str,
        retention: &RetentionPolicy,
        timeout: std::time::Duration,
    ) -> Option<CommandRequest> {
        let line = match self.repo.kind {
            RepositoryKind::Borg => {
                let borg = quote(&self.tools.borg);
                format!(
                    "{borg} prune --keep-daily {} --keep-weekly {} --glob-archives {} {loc} && {borg} compact {loc}",
                    retention.keep_daily,
                    retention.keep_weekly,
                    quote(&format!("{}*", archive_prefix(slug))),
                    loc = quote(&self.location),
                )
            }
            RepositoryKind::Restic => format!(
                "{} forget --prune --tag {} --keep-daily {} --keep-weekly {}",
                self.restic(),
                quote(&format!("template={}", slug)),
                retention.keep_daily,
                retention.keep_weekly,
            ),
            RepositoryKind::Mirror => return None,
        };
        Some(self.request("repository prune", line, timeout))
    }
}

/// What feeds an upload.
#[derive(Debug, Clone)]
pub enum Input {
    File(String),
    Pipeline(String),
}

#[derive(Debug, Deserialize)]
struct BorgArchiveStats {
    original_size: u64,
    deduplicated_size: u64,
}

#[derive(Debug, Deserialize)]
struct BorgArchive {
    stats: BorgArchiveStats,
}

#[derive(Debug, Deserialize)]
struct BorgCacheStats {
    total_size: u64,
    unique_csize: u64,
}

#[derive(Debug, Deserialize)]
struct BorgCache {
    stats: BorgCacheStats,
}

/// `borg create --json` reports `archive`, `borg info --json` reports `archives`.
#[derive(Debug, Deserialize)]
struct BorgReport {
    #[serde(default)]
    archive: Option<BorgArchive>,
    #[serde(default)]
    archives: Vec<BorgArchive>,
    cache: BorgCache,
}

pub fn parse_borg_stats(stdout: &str) -> Result<TransferMetrics> {
    let report: BorgReport = serde_json::from_str(stdout.trim())
        .map_err(|e| OrchestratorError::command("borg", format!("malformed stats: {}", e)))?;

    let archive = report
        .archive
        .or_else(|| report.archives.into_iter().next())
        .ok_or_else(|| OrchestratorError::command("borg", "stats contain no archive"))?;

    Ok(TransferMetrics {
        transferred_size: archive.stats.original_size,
        deduplicated_size: archive.stats.deduplicated_size,
        repository_size: report.cache.stats.total_size,
        repository_deduplicated_size: report.cache.stats.unique_csize,
    })
}

#[derive(Debug, Deserialize)]
struct ResticMessage {
    message_type: String,
    #[serde(default)]
    data_added: u64,
    #[serde(default)]
    total_bytes_processed: u64,
}

#[derive(Debug, Deserialize)]
struct ResticStats {
    total_size: u64,
    #[serde(default)]
    total_uncompressed_size: Option<u64>,
}

/// Combine the `summary` line of `restic backup --json` with `restic stats --json`.
pub fn parse_restic_stats(backup_stdout: &str, stats_stdout: &str) -> Result<TransferMetrics> {
    let summary = backup_stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<ResticMessage>(line).ok())
        .find(|m| m.message_type == "summary")
        .ok_or_else(|| OrchestratorError::command("restic backup", "no summary in output"))?;

    let stats: ResticStats = serde_json::from_str(stats_stdout.trim())
        .map_err(|e| OrchestratorError::command("restic stats", format!("malformed stats: {}", e)))?;

    Ok(TransferMetrics {
        transferred_size: summary.total_bytes_processed,
        deduplicated_size: summary.data_added,
        repository_size: stats.total_uncompressed_size.unwrap_or(stats.total_size),
        repository_deduplicated_size: stats.total_size,
    })
}

pub fn parse_rsync_stats(stdout: &str) -> Result<TransferMetrics> {
    let bytes = |re: &Regex| -> Result<u64> {
        re.captures(stdout)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().replace(',', "").parse().ok())
            .ok_or_else(|| OrchestratorError::command("rsync", "no transfer statistics in output"))
    };

    let total = bytes(&RSYNC_TOTAL)?;
    let transferred = bytes(&RSYNC_TRANSFERRED)?;

    Ok(TransferMetrics {
        transferred_size: transferred,
        deduplicated_size: transferred,
        repository_size: total,
        repository_deduplicated_size: total,
    })
}

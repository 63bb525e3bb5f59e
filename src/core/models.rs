use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle states of a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Initialized,
    Start,
    Dump,
    Download,
    Upload,
    Cleanup,
    Backuped,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 8] = [
        Self::Initialized,
        Self::Start,
        Self::Dump,
        Self::Download,
        Self::Upload,
        Self::Cleanup,
        Self::Backuped,
        Self::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Backuped | Self::Failed)
    }

    /// In-flight: neither freshly created nor finished.
    pub fn is_in_flight(self) -> bool {
        !self.is_terminal() && self != Self::Initialized
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Start => "start",
            Self::Dump => "dump",
            Self::Download => "download",
            Self::Upload => "upload",
            Self::Cleanup => "cleanup",
            Self::Backuped => "backuped",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown job state: {}", s))
    }
}

/// Where the backup data comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceType {
    VmSnapshot,
    MysqlDump,
    MssqlDump,
    PostgresDump,
    RemoteFsCopy,
    RemoteSshCommand,
    SftpCopy,
    ReadOnlyDedupMirror,
}

impl SourceType {
    pub const ALL: [SourceType; 8] = [
        Self::VmSnapshot,
        Self::MysqlDump,
        Self::MssqlDump,
        Self::PostgresDump,
        Self::RemoteFsCopy,
        Self::RemoteSshCommand,
        Self::SftpCopy,
        Self::ReadOnlyDedupMirror,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VmSnapshot => "vm-snapshot",
            Self::MysqlDump => "mysql-dump",
            Self::MssqlDump => "mssql-dump",
            Self::PostgresDump => "postgres-dump",
            Self::RemoteFsCopy => "remote-fs-copy",
            Self::RemoteSshCommand => "remote-ssh-command",
            Self::SftpCopy => "sftp-copy",
            Self::ReadOnlyDedupMirror => "read-only-dedup-mirror",
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, Self::VmSnapshot)
    }

    /// Sources streamed over SSH into the staging directory during `download`.
    pub fn is_streamed(&self) -> bool {
        matches!(
            self,
            Self::MysqlDump
                | Self::MssqlDump
                | Self::PostgresDump
                | Self::RemoteFsCopy
                | Self::RemoteSshCommand
        )
    }

    /// Sources that are already a finished artifact and go `start -> upload`.
    pub fn is_direct(&self) -> bool {
        matches!(self, Self::SftpCopy | Self::ReadOnlyDedupMirror)
    }

    /// Whether a job of this type ever holds a locally staged artifact.
    pub fn stages_locally(&self) -> bool {
        !self.is_direct()
    }

    pub fn visits(&self, state: JobState) -> bool {
        match state {
            JobState::Dump | JobState::Download => !self.is_direct(),
            _ => true,
        }
    }

    pub fn default_command(&self) -> Option<&'static str> {
        match self {
            Self::MysqlDump => Some("mysqldump --all-databases --single-transaction"),
            Self::PostgresDump => Some("pg_dumpall"),
            _ => None,
        }
    }

    pub fn default_extension(&self) -> &'static str {
        match self {
            Self::VmSnapshot => "qcow2",
            Self::MysqlDump | Self::MssqlDump | Self::PostgresDump => "sql.gz",
            Self::RemoteFsCopy => "tar.gz",
            Self::RemoteSshCommand => "out.gz",
            Self::SftpCopy => "bin",
            Self::ReadOnlyDedupMirror => "mirror",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown source type: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Periodicity {
    #[default]
    Daily,
}

impl Periodicity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
        }
    }

    /// Whether two instants fall into the same scheduling period (UTC calendar day).
    pub fn same_period(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        match self {
            Self::Daily => a.date_naive() == b.date_naive(),
        }
    }
}

impl FromStr for Periodicity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily" => Ok(Self::Daily),
            other => Err(format!("unknown periodicity: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub keep_daily: u32,
    pub keep_weekly: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryKind {
    Borg,
    Restic,
    Mirror,
}

impl RepositoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Borg => "borg",
            Self::Restic => "restic",
            Self::Mirror => "mirror",
        }
    }
}

impl FromStr for RepositoryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "borg" => Ok(Self::Borg),
            "restic" => Ok(Self::Restic),
            "mirror" => Ok(Self::Mirror),
            other => Err(format!("unknown repository kind: {}", other)),
        }
    }
}

/// A backup destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub kind: RepositoryKind,
    /// Local path, SSH URL or object storage URL understood by the tool.
    pub location: String,
    #[serde(default, skip_serializing)]
    pub passphrase: Option<String>,
}

impl Repository {
    pub fn location_for(&self, sub_path: Option<&str>) -> String {
        match sub_path.map(|p| p.trim_matches('/')).filter(|p| !p.is_empty()) {
            Some(sub) => format!("{}/{}", self.location.trim_end_matches('/'), sub),
            None => self.location.clone(),
        }
    }
}

/// A machine reachable over SSH.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub hostname: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default)]
    pub identity_file: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_user() -> String {
    "root".to_string()
}

/// Long-lived description of what to back up, how often, and where.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub source_type: SourceType,
    #[serde(default)]
    pub periodicity: Periodicity,
    pub retention: RetentionPolicy,
    pub repository_id: String,
    #[serde(default)]
    pub sub_path: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub vm_instance: Option<String>,
    #[serde(default)]
    pub remote_command: Option<String>,
    #[serde(default)]
    pub min_artifact_size: u64,
    #[serde(default)]
    pub file_extension: Option<String>,
    #[serde(default)]
    pub not_before_hour: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

impl JobTemplate {
    /// Check the structural invariants of a template.
    pub fn validate(&self) -> Result<(), String> {
        if self.slug.is_empty()
            || !self
                .slug
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(format!("template '{}' has an invalid slug", self.name));
        }

        if self.repository_id.is_empty() {
            return Err(format!("template '{}' has no destination repository", self.slug));
        }

        match (self.source_type.is_snapshot(), &self.vm_instance, &self.host_id) {
            (true, Some(_), None) | (false, None, Some(_)) => {}
            (true, _, _) => {
                return Err(format!(
                    "template '{}': {} needs a VM instance and no host",
                    self.slug, self.source_type
                ));
            }
            (false, _, _) => {
                return Err(format!(
                    "template '{}': {} needs a host and no VM instance",
                    self.slug, self.source_type
                ));
            }
        }

        if !self.source_type.is_snapshot() && self.source_command().is_none() {
            return Err(format!(
                "template '{}': {} requires remote_command",
                self.slug, self.source_type
            ));
        }

        if let Some(hour) = self.not_before_hour {
            if hour > 23 {
                return Err(format!(
                    "template '{}': not_before_hour must be 0-23, got {}",
                    self.slug, hour
                ));
            }
        }

        Ok(())
    }

    /// The command (or path, for copy types) run against the source host.
    pub fn source_command(&self) -> Option<&str> {
        self.remote_command
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .or_else(|| self.source_type.default_command())
    }

    pub fn extension(&self) -> &str {
        self.file_extension
            .as_deref()
            .map(|e| e.trim_start_matches('.'))
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| self.source_type.default_extension())
    }
}

/// One execution attempt of a template.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: String,
    pub template_id: String,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub snapshot_id: Option<String>,
    pub checksum: Option<String>,
    pub raw_size: u64,
    pub metrics: Option<TransferMetrics>,
}

impl Job {
    pub fn new(template_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            template_id: template_id.to_string(),
            state: JobState::Initialized,
            created_at: now,
            updated_at: now,
            snapshot_id: None,
            checksum: None,
            raw_size: 0,
            metrics: None,
        }
    }

    /// Stable name of this job's archive in the destination repository.
    pub fn archive_name(&self, template: &JobTemplate) -> String {
        format!(
            "{}{}-{}",
            archive_prefix(&template.slug),
            self.created_at.format("%Y-%m-%d"),
            self.short_id()
        )
    }

    /// Stable name of the remote VM image created for this job.
    pub fn snapshot_name(&self, template: &JobTemplate) -> String {
        format!("bksched-{}-{}", template.slug, self.short_id())
    }

    pub fn short_id(&self) -> &str {
        // uuid v7 leads with the timestamp, so use the random tail
        let start = self.id.len().saturating_sub(12);
        &self.id[start..]
    }
}

/// Leading part shared by every archive of a template. The `.` cannot occur
/// in a slug, so no other template's archives share the prefix.
pub fn archive_prefix(slug: &str) -> String {
    format!("{}.", slug)
}

/// Post-upload size statistics reported by the destination repository.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferMetrics {
    pub transferred_size: u64,
    pub deduplicated_size: u64,
    pub repository_size: u64,
    pub repository_deduplicated_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

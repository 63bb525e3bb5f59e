//! External command execution.
//!
//! Every interaction with a snapshot service, a remote host or a backup
//! repository goes through a [`CommandExecutor`]. A command is a shell
//! command line plus environment and a hard timeout; the result is a
//! success flag with captured output. Handlers decide what counts as
//! failure with [`ensure_success`].

mod scripted;
mod shell;

use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;

use crate::core::error::{OrchestratorError, Result};

pub use scripted::ScriptedExecutor;
pub use shell::ShellExecutor;

#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Short name used in logs and errors, e.g. `borg create`.
    pub label: String,
    pub command_line: String,
    /// Passed to the child only. Values are never logged.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandRequest {
    pub fn new(label: impl Into<String>, command_line: impl Into<String>, timeout: Duration) -> Self {
        Self {
            label: label.into(),
            command_line: command_line.into(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            stderr: stderr.into(),
            ..Default::default()
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self {
            success: false,
            exit_code: None,
            stderr: format!("timed out after {}s", after.as_secs()),
            timed_out: true,
            ..Default::default()
        }
    }

    fn describe_failure(&self) -> String {
        let stderr = self.stderr.trim();
        let detail = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };
        let detail: String = detail.chars().take(500).collect();

        match self.exit_code {
            _ if self.timed_out => detail,
            Some(code) => format!("exit status {}: {}", code, detail),
            None => format!("terminated by signal: {}", detail),
        }
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion or until its timeout expires.
    ///
    /// Never fails itself: spawn errors and timeouts come back as an
    /// unsuccessful [`CommandOutput`].
    async fn run(&self, request: CommandRequest) -> CommandOutput;
}

/// Classify a command result.
///
/// A non-zero exit whose output matches one of `benign` is treated as success.
pub fn ensure_success(
    request: &CommandRequest,
    output: CommandOutput,
    benign: &[&Regex],
) -> Result<CommandOutput> {
    if output.success {
        return Ok(output);
    }

    if !output.timed_out
        && benign
            .iter()
            .any(|re| re.is_match(&output.stderr) || re.is_match(&output.stdout))
    {
        return Ok(output);
    }

    Err(OrchestratorError::command(
        &request.label,
        output.describe_failure(),
    ))
}

/// Quote a value for a POSIX shell.
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }

    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CommandRequest {
        CommandRequest::new("borg init", "borg init repo", Duration::from_secs(5))
    }

    #[test]
    fn benign_failure_is_absorbed() {
        let re = Regex::new("already exists").unwrap();
        let output = CommandOutput::failed(2, "A repository already exists at repo.");

        assert!(ensure_success(&request(), output, &[&re]).is_ok());
    }

    #[test]
    fn unexpected_failure_is_an_error() {
        let re = Regex::new("already exists").unwrap();
        let output = CommandOutput::failed(2, "Permission denied");

        let err = ensure_success(&request(), output, &[&re]).unwrap_err();
        assert!(err.to_string().contains("exit status 2: Permission denied"));
    }

    #[test]
    fn timeout_is_never_benign() {
        let re = Regex::new(".*").unwrap();
        let output = CommandOutput::timeout(Duration::from_secs(5));

        assert!(ensure_success(&request(), output, &[&re]).is_err());
    }

    #[test]
    fn quote_leaves_plain_words_alone() {
        assert_eq!(quote("/var/backups/web.sql.gz"), "/var/backups/web.sql.gz");
        assert_eq!(quote("two words"), "'two words'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
    }
}

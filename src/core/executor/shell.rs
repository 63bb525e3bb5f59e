use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{CommandExecutor, CommandOutput, CommandRequest};

/// Runs command lines through `bash -c` (or another configured shell).
///
/// Each command gets its own process group so that a timeout kills the
/// whole pipeline (`ssh ... | gzip > file`), not only the shell.
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "/bin/bash".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, request: CommandRequest) -> CommandOutput {
        debug!(command = %request.label, timeout_secs = request.timeout.as_secs(), "Running command");

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(&request.command_line)
            .envs(request.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %request.label, error = %e, "Failed to spawn command");
                return CommandOutput {
                    success: false,
                    exit_code: None,
                    stderr: format!("failed to spawn {}: {}", self.shell, e),
                    ..Default::default()
                };
            }
        };

        let pgid = child.id();

        match tokio::time::timeout(request.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => CommandOutput {
                success: output.status.success(),
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                timed_out: false,
            },
            Ok(Err(e)) => CommandOutput {
                success: false,
                exit_code: None,
                stderr: format!("failed to wait for command: {}", e),
                ..Default::default()
            },
            Err(_) => {
                warn!(command = %request.label, "Command timed out, killing process group");
                if let Some(pgid) = pgid {
                    // SAFETY: signalling a process group we created; a stale id only yields ESRCH.
                    unsafe {
                        libc::kill(-(pgid as libc::pid_t), libc::SIGKILL);
                    }
                }
                CommandOutput::timeout(request.timeout)
            }
        }
    }
}

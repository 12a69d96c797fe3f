//! Shell target system.
//!
//! Runs the operation reference with `sh -c`, bounded by a timeout. Shell
//! commands cannot share a transaction with the audit write, so this
//! adapter is always non-transactional.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{AdapterError, TargetSystem};
use crate::domain::ChangeUnit;

/// Default per-command timeout
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(300);

/// Target system executing shell commands
pub struct ShellTargetSystem {
    id: String,

    /// Shell binary (default: "sh")
    shell: String,

    /// Upper bound for a single command
    timeout: Duration,

    /// Working directory for commands
    working_dir: Option<PathBuf>,
}

impl ShellTargetSystem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            shell: "sh".to_string(),
            timeout: DEFAULT_SHELL_TIMEOUT,
            working_dir: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Run a command and return its stdout
    async fn run_command(&self, change_id: &str, command: &str) -> Result<String, AdapterError> {
        let mut cmd = Command::new(&self.shell);
        cmd.args(["-c", command])
            .env("CHANGEFLOW_CHANGE_ID", change_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = cmd.spawn()?;
        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AdapterError::Timeout(self.timeout))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(AdapterError::Operation(format!(
                "command exited with code {}: {}",
                exit_code,
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl TargetSystem for ShellTargetSystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_transactional(&self) -> bool {
        false
    }

    async fn execute(&self, change: &ChangeUnit) -> Result<(), AdapterError> {
        let stdout = self.run_command(&change.id, &change.execute).await?;
        debug!(change_id = %change.id, output = %stdout.trim(), "Shell change finished");
        Ok(())
    }

    async fn rollback(&self, change: &ChangeUnit) -> Result<(), AdapterError> {
        let command = change
            .rollback
            .as_deref()
            .ok_or_else(|| AdapterError::NoRollback(change.id.clone()))?;
        self.run_command(&change.id, command).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        self.run_command("health-check", "true").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_execute_sees_change_id() {
        let temp = TempDir::new().unwrap();
        let shell = ShellTargetSystem::new("sh").with_working_dir(temp.path());
        let change = ChangeUnit::new("c-42", 1, "sh", "echo \"$CHANGEFLOW_CHANGE_ID\" > out.txt");

        shell.execute(&change).await.unwrap();

        let written = std::fs::read_to_string(temp.path().join("out.txt")).unwrap();
        assert_eq!(written.trim(), "c-42");
    }

    #[tokio::test]
    async fn test_non_zero_exit_reports_stderr() {
        let shell = ShellTargetSystem::new("sh");
        let change = ChangeUnit::new("c1", 1, "sh", "echo oops >&2; exit 3");

        let err = shell.execute(&change).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("code 3"));
        assert!(message.contains("oops"));
    }
}

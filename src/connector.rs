//! Running external batch-system commands.
//!
//! Every queue interaction (`sbatch`, `squeue`, `scancel`, or a user-supplied
//! template) goes through a [`Connector`]. The default [`ShellConnector`]
//! executes the command directly, bounded by a timeout, and captures stdout
//! and stderr as one text blob. Tests substitute a scripted connector.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::adapter::{AdapterError, AdapterResult};

/// Output of one external command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The command line as it would be typed in a shell.
    pub command: String,
    pub exit_code: i32,
    /// Combined stdout and stderr, trimmed.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes argv-style commands on behalf of a batch adapter.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn run(&self, argv: &[String], cwd: Option<&Path>) -> AdapterResult<CommandOutput>;

    /// Splits a shell-quoted command line and runs it.
    async fn run_line(&self, line: &str, cwd: Option<&Path>) -> AdapterResult<CommandOutput> {
        let argv = shell_words::split(line)
            .map_err(|e| AdapterError::Exec(format!("cannot parse command '{}': {}", line, e)))?;
        self.run(&argv, cwd).await
    }
}

/// Runs commands as local child processes.
pub struct ShellConnector {
    working_dir: Option<PathBuf>,
    timeout_secs: u64,
}

impl ShellConnector {
    pub fn new() -> Self {
        Self {
            working_dir: None,
            timeout_secs: 60,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

impl Default for ShellConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for ShellConnector {
    async fn run(&self, argv: &[String], cwd: Option<&Path>) -> AdapterResult<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            return Err(AdapterError::Exec("empty command".to_string()));
        };
        let command = shell_words::join(argv);

        debug!("Running command: {}", command);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(dir) = cwd.or(self.working_dir.as_deref()) {
            cmd.current_dir(dir);
        }

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output())
            .await
            .map_err(|_| AdapterError::Timeout(format!("'{}' timed out", command)))?
            .map_err(|e| AdapterError::Exec(format!("failed to run '{}': {}", command, e)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let exit_code = output.status.code().unwrap_or(1);
        if exit_code != 0 {
            warn!("Command '{}' exited with {}", command, exit_code);
        }

        Ok(CommandOutput {
            command,
            exit_code,
            output: text.trim().to_string(),
        })
    }
}

//! Lifecycle of one running test process.
//!
//! A [`ProcessRunner`] launches a test's command with `sh -c` in the test's
//! execute directory, as the leader of a new process group, and is then
//! polled without blocking until the process exits. Signals are delivered to
//! the whole group so that anything the test spawned goes down with it.
//!
//! # Timeout Escalation
//!
//! ```text
//!   Started ──timeout──► Interrupted ──30s──► Terminated ──5s──► Killed
//!      │   (SIGINT)          │       (SIGTERM)     │      (SIGKILL)  │
//!      └────────────────────┴────────exit─────────┴─────────────────┴──► Finished
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::pool::Allocation;
use crate::testcase::TestCase;

/// Grace period between SIGINT and SIGTERM for a timed-out test.
pub const INTERRUPT_GRACE: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL for a timed-out test.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Name of the combined stdout/stderr file in the execute directory.
pub const EXECUTE_LOG: &str = "execute.log";

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors launching or polling a test process.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The execute directory or its log file could not be prepared.
    #[error("failed to prepare {path}: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The shell could not be spawned.
    #[error("failed to spawn test process: {0}")]
    Spawn(#[source] std::io::Error),

    /// Waiting on the child failed.
    #[error("failed to poll test process: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotStarted,
    Started,
    Interrupted { at: Instant },
    Terminated { at: Instant },
    Killed,
    Finished,
}

/// Runs and monitors one test command.
pub struct ProcessRunner {
    command: String,
    exec_dir: PathBuf,
    shell: String,
    env: Vec<(String, String)>,
    timeout: Option<Duration>,
    interrupt_grace: Duration,
    terminate_grace: Duration,
    header: Vec<String>,

    child: Option<Child>,
    started_at: Option<Instant>,
    phase: Phase,
    timed_out: bool,
    exit_code: Option<i32>,
}

impl ProcessRunner {
    /// A timeout of zero means no limit.
    pub fn new(command: impl Into<String>, exec_dir: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            command: command.into(),
            exec_dir: exec_dir.into(),
            shell: "/bin/sh".to_string(),
            env: Vec::new(),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            interrupt_grace: INTERRUPT_GRACE,
            terminate_grace: TERMINATE_GRACE,
            header: Vec::new(),
            child: None,
            started_at: None,
            phase: Phase::NotStarted,
            timed_out: false,
            exit_code: None,
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_grace_periods(mut self, interrupt: Duration, terminate: Duration) -> Self {
        self.interrupt_grace = interrupt;
        self.terminate_grace = terminate;
        self
    }

    /// Lines written at the top of the execute log before the command runs.
    pub fn with_header(mut self, lines: Vec<String>) -> Self {
        self.header = lines;
        self
    }

    pub fn exec_dir(&self) -> &Path {
        &self.exec_dir
    }

    pub fn is_started(&self) -> bool {
        self.phase != Phase::NotStarted
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Finished
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    /// Exit code once finished. A process killed by a signal reports 1.
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Creates the execute directory and log, then spawns the command.
    pub fn start(&mut self) -> RunnerResult<()> {
        fs::create_dir_all(&self.exec_dir).map_err(|source| RunnerError::Prepare {
            path: self.exec_dir.clone(),
            source,
        })?;

        let log_path = self.exec_dir.join(EXECUTE_LOG);
        let prepare_err = |source| RunnerError::Prepare {
            path: log_path.clone(),
            source,
        };
        let mut log = File::create(&log_path).map_err(prepare_err)?;
        for line in &self.header {
            writeln!(log, "{}", line).map_err(prepare_err)?;
        }
        let stderr = log.try_clone().map_err(prepare_err)?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.exec_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .process_group(0);

        debug!("Spawning in {}: {}", self.exec_dir.display(), self.command);
        let child = cmd.spawn().map_err(RunnerError::Spawn)?;

        self.child = Some(child);
        self.started_at = Some(Instant::now());
        self.phase = Phase::Started;
        Ok(())
    }

    /// Non-blocking check. Returns `true` only on the call that observes
    /// the process exit.
    pub fn poll(&mut self) -> RunnerResult<bool> {
        if matches!(self.phase, Phase::NotStarted | Phase::Finished) {
            return Ok(false);
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(false);
        };

        if let Some(status) = child.try_wait().map_err(RunnerError::Wait)? {
            self.exit_code = Some(status.code().unwrap_or(1));
            self.phase = Phase::Finished;
            return Ok(true);
        }

        let now = Instant::now();
        match self.phase {
            Phase::Started => {
                let expired = match (self.timeout, self.started_at) {
                    (Some(limit), Some(t0)) => now.duration_since(t0) > limit,
                    _ => false,
                };
                if expired {
                    debug!("Timeout reached in {}, interrupting", self.exec_dir.display());
                    self.timed_out = true;
                    self.signal(libc::SIGINT);
                    self.phase = Phase::Interrupted { at: now };
                }
            }
            Phase::Interrupted { at } if now.duration_since(at) > self.interrupt_grace => {
                self.signal(libc::SIGTERM);
                self.phase = Phase::Terminated { at: now };
            }
            Phase::Terminated { at } if now.duration_since(at) > self.terminate_grace => {
                self.signal(libc::SIGKILL);
                self.phase = Phase::Killed;
            }
            _ => {}
        }

        Ok(false)
    }

    /// Stops the process: SIGINT, then SIGTERM, then SIGKILL, polling in
    /// between. Returns `true` if the process was seen to exit.
    pub async fn kill_job(&mut self) -> bool {
        if !self.is_started() || self.is_done() {
            return false;
        }

        self.signal(libc::SIGINT);
        tokio::time::sleep(Duration::from_secs(2)).await;
        if self.poll_quietly() {
            return true;
        }

        self.signal(libc::SIGTERM);
        tokio::time::sleep(Duration::from_secs(5)).await;
        if self.poll_quietly() {
            return true;
        }

        self.signal(libc::SIGKILL);
        self.phase = Phase::Killed;
        if let Some(child) = self.child.as_mut() {
            if let Ok(status) = child.wait().await {
                self.exit_code = Some(status.code().unwrap_or(1));
                self.phase = Phase::Finished;
                return true;
            }
        }
        false
    }

    fn poll_quietly(&mut self) -> bool {
        match self.poll() {
            Ok(done) => done,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    fn signal(&self, sig: libc::c_int) {
        let Some(pid) = self.child.as_ref().and_then(Child::id) else {
            return;
        };
        // SAFETY: kill(2) on a process group id has no memory-safety
        // preconditions.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), sig) };
        if rc != 0 {
            debug!(
                "Signal {} to process group {} failed: {}",
                sig,
                pid,
                std::io::Error::last_os_error()
            );
        }
    }
}

/// Environment exported to a test process.
pub fn test_environment(
    tc: &TestCase,
    alloc: &Allocation,
    timeout: u64,
    results_dir: &Path,
) -> Vec<(String, String)> {
    let (np, nd) = tc.size();
    let join = |ids: &[usize]| {
        ids.iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    };
    let dep_dirs: Vec<String> = tc
        .dep_directories()
        .iter()
        .map(|(_, d)| results_dir.join(d).display().to_string())
        .collect();

    vec![
        ("VVRUN_TEST_ID".into(), tc.display_string()),
        ("VVRUN_TIMEOUT".into(), timeout.to_string()),
        ("VVRUN_NP".into(), np.to_string()),
        ("VVRUN_NDEVICE".into(), nd.to_string()),
        ("VVRUN_PROC_IDS".into(), join(&alloc.procs)),
        ("VVRUN_DEVICE_IDS".into(), join(&alloc.devices)),
        ("VVRUN_MAX_PROCS".into(), alloc.maxprocs.0.to_string()),
        ("VVRUN_DEP_DIRS".into(), dep_dirs.join(":")),
    ]
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::testcase::{Dependency, TestId, TestSpec};

    async fn run_to_end(runner: &mut ProcessRunner) {
        for _ in 0..200 {
            if runner.poll().unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("process did not finish");
    }

    #[tokio::test]
    async fn test_exit_code_and_log() {
        let dir = TempDir::new().unwrap();
        let xdir = dir.path().join("sub/t");
        let mut runner = ProcessRunner::new("echo hello $VVRUN_NP; exit 64", &xdir, 0)
            .with_env(vec![("VVRUN_NP".into(), "3".into())])
            .with_header(vec!["Starting test: t".into()]);

        assert!(!runner.is_started());
        runner.start().unwrap();
        run_to_end(&mut runner).await;

        assert!(runner.is_done());
        assert_eq!(runner.exit_code(), Some(64));
        assert!(!runner.timed_out());
        assert!(!runner.poll().unwrap());

        let log = fs::read_to_string(xdir.join(EXECUTE_LOG)).unwrap();
        assert!(log.starts_with("Starting test: t\n"));
        assert!(log.contains("hello 3"));
    }

    #[tokio::test]
    async fn test_timeout_interrupts_group() {
        let dir = TempDir::new().unwrap();
        let mut runner = ProcessRunner::new("sleep 30", dir.path(), 1)
            .with_grace_periods(Duration::from_millis(200), Duration::from_millis(200));

        runner.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        run_to_end(&mut runner).await;

        assert!(runner.timed_out());
        assert_eq!(runner.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn test_escalates_when_interrupt_ignored() {
        let dir = TempDir::new().unwrap();
        let mut runner = ProcessRunner::new("trap '' INT; sleep 30 & wait", dir.path(), 1)
            .with_grace_periods(Duration::from_millis(100), Duration::from_millis(100));

        runner.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        run_to_end(&mut runner).await;

        assert!(runner.timed_out());
        assert!(runner.is_done());
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let dir = TempDir::new().unwrap();
        let mut runner = ProcessRunner::new("true", dir.path(), 0).with_shell("/nonexistent/sh");
        assert!(matches!(runner.start(), Err(RunnerError::Spawn(_))));
        assert!(!runner.is_started());
    }

    #[tokio::test]
    async fn test_prepare_failure() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain");
        fs::write(&file, "").unwrap();
        let mut runner = ProcessRunner::new("true", file.join("x"), 0);
        assert!(matches!(runner.start(), Err(RunnerError::Prepare { .. })));
    }

    #[tokio::test]
    async fn test_kill_job() {
        let dir = TempDir::new().unwrap();
        let mut runner = ProcessRunner::new("sleep 30", dir.path(), 0);
        runner.start().unwrap();
        assert!(runner.kill_job().await);
        assert!(runner.is_done());
        assert_eq!(runner.exit_code(), Some(1));
    }

    #[test]
    fn test_environment_contents() {
        let pre = TestCase::new(TestSpec::new(TestId::new("d/pre.vvt", "pre"), "true"));
        let mut tc = TestCase::new(TestSpec::new(TestId::new("d/t.vvt", "t"), "true"));
        tc.add_dependency(Dependency::on(pre.key()), Some("d/pre".into()));

        let alloc = Allocation {
            procs: vec![0, 1],
            devices: vec![],
            maxprocs: (8, 8),
        };
        let env = test_environment(&tc, &alloc, 120, Path::new("/res"));
        let get = |k: &str| env.iter().find(|(n, _)| n == k).map(|(_, v)| v.clone());

        assert_eq!(get("VVRUN_TIMEOUT").as_deref(), Some("120"));
        assert_eq!(get("VVRUN_PROC_IDS").as_deref(), Some("0 1"));
        assert_eq!(get("VVRUN_DEVICE_IDS").as_deref(), Some(""));
        assert_eq!(get("VVRUN_DEP_DIRS").as_deref(), Some("/res/d/pre"));
        assert_eq!(get("VVRUN_TEST_ID").as_deref(), Some("d/t"));
    }
}

//! Local background process adapter.
//!
//! Each "submitted" job script runs as `sh <script>` in its own process
//! group on this machine, with stdout and stderr going to the job's output
//! file. Useful for trying out batch mode, and for machines without a queue.
//!
//! | Feature | Support |
//! |---------|---------|
//! | Header | None |
//! | Query | `try_wait` on the child |
//! | Cancel | SIGINT to the process group |

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::debug;

use super::{AdapterError, AdapterResult, BatchSystemAdapter, QueryOutcome, QueueState, SubmitOutcome};
use crate::config::LocalAdapterConfig;
use crate::testcase::Size;

/// Runs job scripts as local child processes.
pub struct LocalAdapter {
    config: LocalAdapterConfig,
    children: Mutex<HashMap<String, Child>>,
    next_id: AtomicUsize,
}

impl LocalAdapter {
    pub fn new(config: LocalAdapterConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    fn spawn(&self, script: &Path, workdir: &Path, output: &Path) -> AdapterResult<Child> {
        let out = File::create(output)?;
        let err = out.try_clone()?;

        let child = Command::new(&self.config.shell)
            .arg(script)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .process_group(0)
            .spawn()
            .map_err(|e| AdapterError::Exec(format!("{}: {}", self.config.shell, e)))?;
        Ok(child)
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new(LocalAdapterConfig::default())
    }
}

#[async_trait]
impl BatchSystemAdapter for LocalAdapter {
    fn name(&self) -> &str {
        "local"
    }

    fn header(&self, _size: Size, _walltime: u64, _output: &Path) -> String {
        String::new()
    }

    async fn submit(&self, script: &Path, workdir: &Path, output: &Path) -> SubmitOutcome {
        let mut outcome = SubmitOutcome {
            command: format!("{} {}", self.config.shell, script.display()),
            ..Default::default()
        };

        match self.spawn(script, workdir, output) {
            Ok(child) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
                debug!("Local job {} is pid {:?}", id, child.id());
                self.children.lock().await.insert(id.clone(), child);
                outcome.job_id = Some(id);
            }
            Err(e) => outcome.error = e.to_string(),
        }
        outcome
    }

    async fn query(&self, job_ids: &[String]) -> QueryOutcome {
        let mut outcome = QueryOutcome {
            command: "try_wait".to_string(),
            ..Default::default()
        };

        let mut children = self.children.lock().await;
        for id in job_ids {
            let Some(child) = children.get_mut(id) else {
                continue;
            };
            match child.try_wait() {
                Ok(None) => {
                    outcome.states.insert(id.clone(), QueueState::Running);
                }
                Ok(Some(status)) => {
                    debug!("Local job {} exited with {}", id, status);
                    children.remove(id);
                }
                Err(e) => {
                    outcome.error.push_str(&format!("job {}: {}\n", id, e));
                    children.remove(id);
                }
            }
        }
        outcome
    }

    async fn cancel(&self, job_id: &str) -> AdapterResult<()> {
        let children = self.children.lock().await;
        let Some(pid) = children.get(job_id).and_then(Child::id) else {
            return Ok(());
        };
        // SAFETY: kill(2) on a process group id has no memory-safety
        // preconditions.
        let rc = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGINT) };
        if rc != 0 {
            return Err(AdapterError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

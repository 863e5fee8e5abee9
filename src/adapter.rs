//! Batch queue adapters.
//!
//! The batch orchestrator only talks to an external queue through the
//! [`BatchSystemAdapter`] trait. An adapter renders the scheduler directives
//! for a job script header, submits scripts, reports which submitted jobs
//! are still known to the queue, and optionally cancels them.
//!
//! ```text
//!  BatchJobMonitor ──header()──► "#SBATCH --time=1:00:00 ..."
//!        │
//!        ├──submit(script)──► SubmitOutcome { job_id: Some("4711"), .. }
//!        ├──query([ids])────► QueryOutcome  { "4711" => Running, .. }
//!        └──cancel(id)
//! ```
//!
//! # Built-in Adapters
//!
//! | Adapter | Module | Description |
//! |---------|--------|-------------|
//! | Slurm | [`slurm`] | `sbatch` / `squeue` / `scancel` |
//! | Local | [`local`] | Background `sh` processes on this machine |
//! | Shell | [`shell`] | User-defined command templates |
//!
//! Adapters never fail a run: submission and query problems are carried in
//! the outcome's `error` text and the monitor decides what to do with them.

pub mod local;
pub mod shell;
pub mod slurm;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use crate::testcase::Size;

/// Result type for adapter operations.
pub type AdapterResult<T> = Result<T, AdapterError>;

/// Errors talking to a batch system.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// A queue command could not be run.
    #[error("Failed to execute queue command: {0}")]
    Exec(String),

    /// A queue command did not finish in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The adapter does not implement the operation.
    #[error("Unsupported by the {0} adapter")]
    Unsupported(String),

    /// A configured pattern or template is invalid.
    #[error("Invalid adapter configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a submitted job stands according to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Running,
    Pending,
    /// Not listed: finished, failed or never seen.
    Absent,
}

/// Result of a submission attempt.
#[derive(Debug, Clone, Default)]
pub struct SubmitOutcome {
    pub command: String,
    pub output: String,
    /// Queue job id, `None` if submission failed.
    pub job_id: Option<String>,
    pub error: String,
}

/// Result of a queue status query.
#[derive(Debug, Clone, Default)]
pub struct QueryOutcome {
    pub command: String,
    pub output: String,
    pub error: String,

    /// The query command itself failed, so `states` says nothing.
    pub failed: bool,

    pub states: HashMap<String, QueueState>,
}

impl QueryOutcome {
    /// State of a job; jobs missing from the listing are `Absent`.
    pub fn state(&self, job_id: &str) -> QueueState {
        self.states
            .get(job_id)
            .copied()
            .unwrap_or(QueueState::Absent)
    }
}

/// Interface to an external batch queue.
#[async_trait]
pub trait BatchSystemAdapter: Send + Sync {
    /// Adapter name for logs.
    fn name(&self) -> &str;

    /// Scheduler directives placed after the `#!/bin/sh` line of a job
    /// script. `walltime` is in seconds.
    fn header(&self, size: Size, walltime: u64, output: &Path) -> String;

    async fn submit(&self, script: &Path, workdir: &Path, output: &Path) -> SubmitOutcome;

    async fn query(&self, job_ids: &[String]) -> QueryOutcome;

    async fn cancel(&self, _job_id: &str) -> AdapterResult<()> {
        Err(AdapterError::Unsupported(self.name().to_string()))
    }
}

/// Number of nodes needed for `size` given per-node processor and device
/// counts. A device count per node of zero ignores devices.
pub fn compute_num_nodes(size: Size, procs_per_node: usize, devices_per_node: usize) -> usize {
    let (np, nd) = size;
    let by_procs = div_ceil(np, procs_per_node.max(1));
    let by_devices = if devices_per_node > 0 && nd > 0 {
        div_ceil(nd, devices_per_node)
    } else {
        0
    };
    by_procs.max(by_devices)
}

fn div_ceil(num: usize, per: usize) -> usize {
    num.div_ceil(per)
}

/// Formats seconds as `H:MM:SS`, or `M:SS` below one hour.
pub fn hms_format(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours == 0 {
        format!("{}:{:02}", minutes, secs)
    } else {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    }
}

//! One batch job and its state machine.
//!
//! ```text
//!   ToDo ──submit ok──► Started ──left queue──► Stopped ──clean finish──► Done(Clean)
//!    │                                             │
//!    ├──submit failed / flush──► Done(NotRun)      └──check timeout──► Done(NotRun | NotDone | Fail)
//! ```

use std::fmt;
use std::path::PathBuf;

use super::namer::BatchFileNamer;
use crate::testcase::{Size, TestKey};

/// How a finished job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The script ran to its end and the results log is finished.
    Clean,
    /// The job never ran.
    NotRun,
    /// The job started but its results are incomplete.
    NotDone,
    /// The job left output but no results.
    Fail,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Clean => "clean",
            JobOutcome::NotRun => "notrun",
            JobOutcome::NotDone => "notdone",
            JobOutcome::Fail => "fail",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    ToDo,
    Started,
    Stopped,
    Done(JobOutcome),
}

/// A group of tests submitted together.
///
/// Times are seconds since the Unix epoch.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub batch_id: usize,
    pub tests: Vec<TestKey>,
    pub max_size: Size,

    /// Requested walltime in seconds.
    pub queue_time: u64,

    /// Queue-assigned id, once submitted.
    pub job_id: Option<String>,

    pub testlist_file: PathBuf,
    pub script_file: PathBuf,
    pub output_file: PathBuf,
    pub results_file: PathBuf,

    /// `results_file` relative to the results root.
    pub include_name: String,

    t_start: Option<f64>,
    t_seen: Option<f64>,
    t_stop: Option<f64>,
    t_check: f64,
    state: JobState,
}

impl BatchJob {
    pub fn new(
        batch_id: usize,
        tests: Vec<TestKey>,
        max_size: Size,
        queue_time: u64,
        namer: &BatchFileNamer,
        rundate: &str,
    ) -> Self {
        Self {
            batch_id,
            tests,
            max_size,
            queue_time,
            job_id: None,
            testlist_file: namer.testlist_path(batch_id),
            script_file: namer.script_path(batch_id),
            output_file: namer.output_path(batch_id),
            results_file: namer.results_path(batch_id, rundate),
            include_name: BatchFileNamer::relative_results_path(batch_id, rundate),
            t_start: None,
            t_seen: None,
            t_stop: None,
            t_check: 0.0,
            state: JobState::ToDo,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn is_todo(&self) -> bool {
        self.state == JobState::ToDo
    }

    pub fn is_started(&self) -> bool {
        self.state == JobState::Started
    }

    pub fn is_stopped(&self) -> bool {
        self.state == JobState::Stopped
    }

    pub fn outcome(&self) -> Option<JobOutcome> {
        match self.state {
            JobState::Done(o) => Some(o),
            _ => None,
        }
    }

    pub fn start_time(&self) -> Option<f64> {
        self.t_start
    }

    pub fn stop_time(&self) -> Option<f64> {
        self.t_stop
    }

    pub fn outfile_seen(&self) -> bool {
        self.t_seen.is_some()
    }

    pub fn set_outfile_seen(&mut self, now: f64) {
        self.t_seen.get_or_insert(now);
    }

    pub fn mark_started(&mut self, job_id: String, now: f64) {
        if self.state != JobState::ToDo {
            return;
        }
        self.job_id = Some(job_id);
        self.t_start = Some(now);
        self.t_check = now;
        self.state = JobState::Started;
    }

    pub fn mark_stopped(&mut self, now: f64) {
        if self.state != JobState::Started {
            return;
        }
        self.t_stop = Some(now);
        self.t_check = now;
        self.state = JobState::Stopped;
    }

    /// Finishes the job. A job that never started can only end as
    /// [`JobOutcome::NotRun`]; a started job must stop first.
    pub fn mark_done(&mut self, outcome: JobOutcome) {
        let allowed = match self.state {
            JobState::ToDo => outcome == JobOutcome::NotRun,
            JobState::Stopped => true,
            JobState::Started | JobState::Done(_) => false,
        };
        if allowed {
            self.state = JobState::Done(outcome);
        }
    }

    /// Whether `check_interval` has passed since the last check.
    pub fn time_to_check(&self, now: f64, check_interval: u64) -> bool {
        now > self.t_check + check_interval as f64
    }

    pub fn reset_check_time(&mut self, now: f64) {
        self.t_check = now;
    }

    /// Pushes the next finish check out, unless `check_timeout` has passed
    /// since the job stopped. Returns `false` when the job should be forced.
    pub fn extend_finish_check(&mut self, now: f64, check_timeout: u64) -> bool {
        let stopped = self.t_stop.unwrap_or(now);
        if now < stopped + check_timeout as f64 {
            self.t_check = now;
            true
        } else {
            false
        }
    }
}

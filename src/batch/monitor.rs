//! Submitting batch jobs and following them through the queue.
//!
//! The monitor owns every [`BatchJob`] of a run. The batch orchestrator
//! drives it with three calls per loop iteration:
//!
//! | Call | Effect |
//! |------|--------|
//! | [`checkstart`](BatchJobMonitor::checkstart) | submits at most one runnable job |
//! | [`checkdone`](BatchJobMonitor::checkdone) | queries the queue, harvests child results, resolves stopped jobs |
//! | [`flush`](BatchJobMonitor::flush) | gives up on jobs that never started |
//!
//! A job that has left the queue is not trusted to be finished until its
//! output ends with the clean exit marker and its results log carries a
//! `Finish` line. Past `check_timeout` it is resolved from whatever files it
//! left behind.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use tracing::{debug, info, warn};

use super::grouper::{BatchGrouper, single_test_timeout};
use super::job::{BatchJob, JobOutcome, JobState};
use super::namer::BatchFileNamer;
use super::script::{JobScript, job_command, output_has_clean_exit};
use crate::adapter::{AdapterError, BatchSystemAdapter, QueueState};
use crate::config::Config;
use crate::orchestrator::scheduler::DirectScheduler;
use crate::resultlog::{LogAttrs, ResultLogReader, ResultLogWriter, file_is_marked_finished};
use crate::testcase::{TestKey, TestList};

/// A job the queue no longer lists is only taken as stopped once it has
/// been submitted this long, unless its output file already exists.
const QUEUE_SETTLE_SECS: f64 = 30.0;

/// Tunables for a batch run.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Jobs allowed in the queue at once.
    pub max_jobs: usize,
    pub check_interval: u64,
    pub check_timeout: u64,
    pub batch_length: u64,
    pub max_timeout: Option<u64>,
    pub shim: Option<String>,
    pub env: Vec<(String, String)>,

    /// Directory the job scripts `cd` into.
    pub workdir: PathBuf,

    /// Leading argv of the command a job runs, without the `run` part.
    pub job_command: Vec<String>,
}

impl MonitorSettings {
    pub fn from_config(config: &Config, job_command: Vec<String>) -> Self {
        let mut env: Vec<(String, String)> = config
            .vvrun
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();

        Self {
            max_jobs: config.batch.max_jobs.max(1),
            check_interval: config.batch.check_interval,
            check_timeout: config.batch.check_timeout,
            batch_length: config.batch.batch_length,
            max_timeout: config.vvrun.timeouts.max_timeout,
            shim: config.batch.shim.clone(),
            env,
            workdir: config.vvrun.results_dir.clone(),
            job_command,
        }
    }
}

/// Tests a flushed job leaves behind, with the reason each did not run.
pub type NotRunTests = Vec<(TestKey, String)>;

/// Tracks batch jobs from grouping to completion.
pub struct BatchJobMonitor<A: BatchSystemAdapter> {
    adapter: A,
    settings: MonitorSettings,
    namer: BatchFileNamer,
    parent_log: Option<ResultLogWriter>,
    rundate: String,
    jobs: IndexMap<usize, BatchJob>,
    next_batch_id: usize,
}

impl<A: BatchSystemAdapter> BatchJobMonitor<A> {
    /// `results_dir` holds the batch directories; `rundate` names the
    /// results files the jobs write.
    pub fn new(
        adapter: A,
        settings: MonitorSettings,
        results_dir: impl Into<PathBuf>,
        rundate: impl Into<String>,
    ) -> Self {
        Self {
            adapter,
            settings,
            namer: BatchFileNamer::new(results_dir),
            parent_log: None,
            rundate: rundate.into(),
            jobs: IndexMap::new(),
            next_batch_id: 0,
        }
    }

    /// Log that receives `Include`/`Completed` lines for each job.
    pub fn with_parent_log(mut self, log: ResultLogWriter) -> Self {
        self.parent_log = Some(log);
        self
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn jobs(&self) -> impl Iterator<Item = &BatchJob> {
        self.jobs.values()
    }

    pub fn job(&self, batch_id: usize) -> Option<&BatchJob> {
        self.jobs.get(&batch_id)
    }

    /// Clears old batch directories and groups the scheduler backlog into
    /// jobs.
    pub fn prepare(&mut self, sched: &mut DirectScheduler) {
        self.namer.remove_batch_directories();

        let mut grouper = BatchGrouper::new(Some(self.settings.batch_length), self.settings.max_timeout);
        for group in grouper.construct(sched) {
            let members: Vec<_> = group
                .tests
                .iter()
                .filter_map(|k| sched.tests().get(k))
                .collect();
            let qtime = grouper.compute_queue_time(members.iter().map(|tc| tc.status.timeout_secs()));
            let max_size = members.iter().fold((0, 0), |(np, nd), tc| {
                let (tnp, tnd) = tc.size();
                (np.max(tnp), nd.max(tnd))
            });

            let id = self.next_batch_id;
            self.next_batch_id += 1;
            let job = BatchJob::new(id, group.tests, max_size, qtime, &self.namer, &self.rundate);
            debug!(
                "Batch {}: {} tests, np={}, queue time {}s",
                id,
                job.tests.len(),
                max_size.0,
                qtime
            );
            self.jobs.insert(id, job);
        }
        info!("Prepared {} batch jobs", self.jobs.len());
    }

    /// Submits the first to-do job none of whose tests is blocked, if fewer
    /// than `max_jobs` jobs are started or stopped. Returns the id of the job
    /// taken off the to-do list, whether or not its submission succeeded.
    pub async fn checkstart(&mut self, tests: &TestList, now: f64) -> Option<usize> {
        if self.num_in_progress() >= self.settings.max_jobs {
            return None;
        }
        let id = self
            .jobs
            .values()
            .find(|j| j.is_todo() && !j.tests.iter().any(|k| tests.is_blocked(k)))?
            .batch_id;

        self.start_job(id, tests, now).await;
        Some(id)
    }

    async fn start_job(&mut self, id: usize, tests: &TestList, now: f64) {
        let Some(job) = self.jobs.get(&id) else {
            return;
        };

        if let Err(e) = self.write_job_files(job, tests) {
            warn!("Could not prepare batch {}: {:#}", id, e);
            self.resolve(id, JobOutcome::NotRun);
            return;
        }
        if let Some(log) = &self.parent_log {
            if let Err(e) = log.add_include(&job.include_name) {
                warn!("{}", e);
            }
        }

        let outcome = self
            .adapter
            .submit(&job.script_file, &self.settings.workdir, &job.output_file)
            .await;

        match outcome.job_id {
            Some(job_id) => {
                info!("Submitted batch {} as {} job {}", id, self.adapter.name(), job_id);
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.mark_started(job_id, now);
                }
            }
            None => {
                warn!(
                    "Batch submission failed for batch {}\n  command: {}\n  output: {}\n  error: {}",
                    id,
                    outcome.command,
                    outcome.output.trim_end(),
                    outcome.error.trim_end()
                );
                self.resolve(id, JobOutcome::NotRun);
            }
        }
    }

    fn write_job_files(&self, job: &BatchJob, tests: &TestList) -> Result<()> {
        let subdir = self.namer.subdir(job.batch_id);
        fs::create_dir_all(&subdir)
            .with_context(|| format!("Failed to create {}", subdir.display()))?;

        let mut attrs = LogAttrs::new();
        attrs.insert("rundate".into(), self.rundate.clone().into());
        attrs.insert("batch_id".into(), job.batch_id.into());
        let list = ResultLogWriter::new(&job.testlist_file);
        list.start(&attrs)?;
        for key in &job.tests {
            if let Some(tc) = tests.get(key) {
                list.append(tc, true)?;
            }
        }

        let timeout = (job.tests.len() == 1).then(|| single_test_timeout(job.queue_time));
        let script = JobScript {
            header: self
                .adapter
                .header(job.max_size, job.queue_time, &job.output_file),
            output_file: job.output_file.clone(),
            workdir: self.settings.workdir.clone(),
            shim: self.settings.shim.clone(),
            queue_time: job.queue_time,
            env: self.settings.env.clone(),
            command: job_command(&self.settings.job_command, job.batch_id, timeout),
        };
        script
            .write(&job.script_file)
            .with_context(|| format!("Failed to write {}", job.script_file.display()))
    }

    /// Polls the queue and the jobs' files.
    ///
    /// Returns the ids of jobs that left the queue during this call and the
    /// tests whose final results arrived.
    pub async fn checkdone(
        &mut self,
        sched: &mut DirectScheduler,
        now: f64,
    ) -> (Vec<usize>, Vec<TestKey>) {
        let mut stopped = Vec::new();
        let mut finished = Vec::new();

        let started: Vec<usize> = self.ids_where(BatchJob::is_started);
        for id in &started {
            if let Some(job) = self.jobs.get_mut(id) {
                if job.output_file.exists() {
                    job.set_outfile_seen(now);
                }
            }
        }

        let queue_ids: Vec<String> = started
            .iter()
            .filter_map(|id| self.jobs.get(id)?.job_id.clone())
            .collect();
        if !queue_ids.is_empty() {
            let q = self.adapter.query(&queue_ids).await;
            if q.failed {
                warn!("Queue query failed: {}\n  {}", q.command, q.error.trim_end());
            } else {
                if !q.error.is_empty() {
                    debug!("Queue query reported: {}", q.error.trim_end());
                }
                for id in &started {
                    let Some(job) = self.jobs.get_mut(id) else {
                        continue;
                    };
                    let Some(job_id) = job.job_id.as_deref() else {
                        continue;
                    };
                    let elapsed = now - job.start_time().unwrap_or(now);
                    if q.state(job_id) == QueueState::Absent
                        && (elapsed > QUEUE_SETTLE_SECS || job.outfile_seen())
                    {
                        debug!("Batch {} (job {}) left the queue", id, job_id);
                        job.mark_stopped(now);
                        harvest_results(job, sched, &mut finished);
                        stopped.push(*id);
                    }
                }
            }
        }

        let interval = self.settings.check_interval;
        for id in self.ids_where(BatchJob::is_started) {
            if let Some(job) = self.jobs.get_mut(&id) {
                if job.time_to_check(now, interval) {
                    job.reset_check_time(now);
                    harvest_results(job, sched, &mut finished);
                }
            }
        }

        for id in self.ids_where(BatchJob::is_stopped) {
            self.check_stopped(id, sched, now, &mut finished);
        }

        (stopped, finished)
    }

    fn check_stopped(
        &mut self,
        id: usize,
        sched: &mut DirectScheduler,
        now: f64,
        finished: &mut Vec<TestKey>,
    ) {
        let (interval, timeout) = (self.settings.check_interval, self.settings.check_timeout);
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        if !job.time_to_check(now, interval) {
            return;
        }

        let outcome = if output_has_clean_exit(&job.output_file)
            && file_is_marked_finished(&job.results_file)
        {
            harvest_results(job, sched, finished);
            JobOutcome::Clean
        } else if job.extend_finish_check(now, timeout) {
            return;
        } else if !job.output_file.exists() {
            JobOutcome::NotRun
        } else if job.results_file.exists() {
            harvest_results(job, sched, finished);
            JobOutcome::NotDone
        } else {
            JobOutcome::Fail
        };

        if outcome != JobOutcome::Clean {
            warn!(
                "Batch {} did not finish cleanly ({}), see {}",
                id,
                outcome,
                job.output_file.display()
            );
        }
        self.resolve(id, outcome);
    }

    fn resolve(&mut self, id: usize, outcome: JobOutcome) {
        let Some(job) = self.jobs.get_mut(&id) else {
            return;
        };
        job.mark_done(outcome);
        if let Some(log) = &self.parent_log {
            if let Err(e) = log.include_completed(&job.include_name) {
                warn!("{}", e);
            }
        }
    }

    fn ids_where(&self, pred: fn(&BatchJob) -> bool) -> Vec<usize> {
        self.jobs
            .values()
            .filter(|j| pred(j))
            .map(|j| j.batch_id)
            .collect()
    }

    /// Marks every job still to do as not run and reports its tests.
    pub fn flush(&mut self, tests: &TestList) -> NotRunTests {
        let mut notrun = Vec::new();
        for id in self.ids_where(BatchJob::is_todo) {
            let Some(job) = self.jobs.get_mut(&id) else {
                continue;
            };
            job.mark_done(JobOutcome::NotRun);
            for key in &job.tests {
                let reason = match tests.blocked_reason(key) {
                    r if r.is_empty() => format!("batch number {} did not run", id),
                    r => format!("failed dependency: {}", r),
                };
                notrun.push((key.clone(), reason));
            }
        }
        notrun
    }

    /// Ids of jobs that never ran, and of jobs that ran but did not finish
    /// cleanly (including any still in the queue).
    pub fn unfinished_job_ids(&self) -> (Vec<usize>, Vec<usize>) {
        let mut notrun = Vec::new();
        let mut notdone = Vec::new();
        for job in self.jobs.values() {
            match job.state() {
                JobState::Done(JobOutcome::Clean) | JobState::ToDo => {}
                JobState::Done(JobOutcome::NotRun) => notrun.push(job.batch_id),
                _ => notdone.push(job.batch_id),
            }
        }
        (notrun, notdone)
    }

    /// Cancels jobs still in the queue. With `completed`, the parent log
    /// is marked finished.
    pub async fn shutdown(&mut self, completed: bool) {
        for job in self.jobs.values().filter(|j| j.is_started()) {
            let Some(job_id) = job.job_id.as_deref() else {
                continue;
            };
            match self.adapter.cancel(job_id).await {
                Ok(()) => info!("Cancelled batch {} (job {})", job.batch_id, job_id),
                Err(AdapterError::Unsupported(_)) => {
                    debug!("{} cannot cancel job {}", self.adapter.name(), job_id)
                }
                Err(e) => warn!("Failed to cancel job {}: {}", job_id, e),
            }
        }

        if completed {
            if let Some(log) = &self.parent_log {
                if let Err(e) = log.finish() {
                    warn!("{}", e);
                }
            }
        }
    }

    pub fn num_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn num_todo(&self) -> usize {
        self.count(|j| j.is_todo())
    }

    /// Jobs handed to the queue at some point.
    pub fn num_submitted(&self) -> usize {
        self.count(|j| j.job_id.is_some())
    }

    pub fn num_started(&self) -> usize {
        self.count(BatchJob::is_started)
    }

    pub fn num_stopped(&self) -> usize {
        self.count(BatchJob::is_stopped)
    }

    pub fn num_done(&self) -> usize {
        self.count(|j| j.outcome().is_some())
    }

    pub fn num_in_progress(&self) -> usize {
        self.num_started() + self.num_stopped()
    }

    pub fn num_past_queue(&self) -> usize {
        self.num_stopped() + self.num_done()
    }

    fn count(&self, pred: impl Fn(&BatchJob) -> bool) -> usize {
        self.jobs.values().filter(|j| pred(j)).count()
    }
}

/// Applies whatever the job's results log holds to the scheduler.
fn harvest_results(job: &BatchJob, sched: &mut DirectScheduler, finished: &mut Vec<TestKey>) {
    let Some(log) = ResultLogReader::read_lenient(&job.results_file) else {
        return;
    };
    for record in log.tests.values() {
        let Some(key) = sched.check_state_change(record) else {
            continue;
        };
        if sched.tests().get(&key).is_some_and(|tc| tc.status.is_done()) {
            finished.push(key);
        }
    }
}

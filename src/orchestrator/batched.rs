//! Batch mode control loop.

use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::scheduler::DirectScheduler;
use super::{RunResult, epoch_seconds};
use crate::adapter::{BatchSystemAdapter, hms_format};
use crate::batch::BatchJobMonitor;
use crate::report::Reporter;

/// Sleep between loop iterations when no job was submitted.
pub const DEFAULT_BATCH_SLEEP: Duration = Duration::from_secs(15);

/// Drives a [`BatchJobMonitor`] until every job is resolved.
pub struct BatchOrchestrator<A: BatchSystemAdapter, R> {
    monitor: BatchJobMonitor<A>,
    reporter: R,
    sleep: Duration,
    total_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl<A: BatchSystemAdapter, R: Reporter> BatchOrchestrator<A, R> {
    pub fn new(monitor: BatchJobMonitor<A>, reporter: R) -> Self {
        Self {
            monitor,
            reporter,
            sleep: DEFAULT_BATCH_SLEEP,
            total_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.sleep = sleep;
        self
    }

    pub fn with_total_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn monitor(&self) -> &BatchJobMonitor<A> {
        &self.monitor
    }

    /// Groups the backlog into jobs and runs them through the queue.
    ///
    /// Interrupting cancels every job still in the queue and leaves the
    /// parent log without a `Finish` line.
    pub async fn run(&mut self, mut sched: DirectScheduler) -> Result<RunResult> {
        let start = Instant::now();
        let total = sched.backlog().len();
        self.monitor.prepare(&mut sched);
        info!(
            "Running {} tests in {} batch jobs through {}",
            total,
            self.monitor.num_jobs(),
            self.monitor.adapter().name()
        );
        self.reporter.on_run_start(total).await;

        let mut interrupted = false;
        loop {
            if self.cancel.is_cancelled() {
                warn!("Run interrupted");
                interrupted = true;
                break;
            }
            if self.total_timeout.is_some_and(|limit| start.elapsed() > limit) {
                warn!("Total timeout expired, stopping the run");
                interrupted = true;
                break;
            }

            let submitted = self.monitor.checkstart(sched.tests(), epoch_seconds()).await;

            let (stopped, finished) = self.monitor.checkdone(&mut sched, epoch_seconds()).await;
            if !stopped.is_empty() {
                let ids: Vec<String> = stopped.iter().map(usize::to_string).collect();
                self.reporter
                    .on_message(&format!("Finished batch IDS: {}", ids.join(" ")))
                    .await;
            }
            for key in &finished {
                if let Some(tc) = sched.tests().get(key) {
                    self.reporter.on_test_complete(tc).await;
                }
            }
            if submitted.is_some() || !stopped.is_empty() {
                let line = self.progress_line(&sched, total, start.elapsed());
                self.reporter.on_message(&line).await;
            }

            if submitted.is_none() {
                if self.monitor.num_in_progress() == 0 {
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.sleep) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        if !interrupted {
            for (key, reason) in self.monitor.flush(sched.tests()) {
                if let Some(tc) = sched.tests().get(&key) {
                    self.reporter.on_notrun(tc, &reason).await;
                }
            }
            let (notrun, notdone) = self.monitor.unfinished_job_ids();
            if !notrun.is_empty() {
                self.reporter
                    .on_message(&format!(
                        "*** Warning: these batch numbers did not run: {}",
                        join_ids(&notrun)
                    ))
                    .await;
            }
            if !notdone.is_empty() {
                self.reporter
                    .on_message(&format!(
                        "*** Warning: these batch numbers did not seem to finish: {}",
                        join_ids(&notdone)
                    ))
                    .await;
            }
        }

        self.monitor.shutdown(!interrupted).await;

        let result = RunResult::from_tests(sched.into_tests(), start.elapsed(), interrupted);
        self.reporter.on_run_complete(&result).await;
        Ok(result)
    }

    fn progress_line(&self, sched: &DirectScheduler, total: usize, elapsed: Duration) -> String {
        let done = sched.tests().iter().filter(|tc| tc.status.is_done()).count();
        let pct = if total == 0 {
            100.0
        } else {
            100.0 * done as f64 / total as f64
        };
        format!(
            "Progress: jobs running={} completed={}, tests {}/{} = {:.1}%, time = {}",
            self.monitor.num_started(),
            self.monitor.num_done(),
            done,
            total,
            pct,
            hms_format(elapsed.as_secs())
        )
    }
}

fn join_ids(ids: &[usize]) -> String {
    ids.iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::adapter::{QueryOutcome, SubmitOutcome};
    use crate::batch::{JobOutcome, MonitorSettings};
    use crate::resultlog::{LogAttrs, ResultLogReader, ResultLogWriter};
    use crate::testcase::{DependencySpec, ResultStatus, Size, TestCase, TestId, TestList, TestSpec};

    /// A queue whose jobs run to completion the moment they are submitted:
    /// every test gets `exit_code` and the output ends cleanly.
    struct InstantQueue {
        exit_code: i32,
        submitted: Mutex<usize>,
    }

    impl InstantQueue {
        fn new(exit_code: i32) -> Self {
            Self {
                exit_code,
                submitted: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl BatchSystemAdapter for InstantQueue {
        fn name(&self) -> &str {
            "instant"
        }

        fn header(&self, _size: Size, _walltime: u64, _output: &Path) -> String {
            String::new()
        }

        async fn submit(&self, script: &Path, _workdir: &Path, output: &Path) -> SubmitOutcome {
            let testlist = script.with_file_name(
                script
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.replace("qbat.", "testlist."))
                    .unwrap(),
            );
            let sent = ResultLogReader::read(&testlist).unwrap();
            let rundate = sent.attr_str("rundate").unwrap().to_string();

            let results = crate::resultlog::results_file_path(&testlist, &rundate);
            let log = ResultLogWriter::new(&results);
            log.start(&LogAttrs::new()).unwrap();
            for tc in sent.tests.values() {
                let mut tc = tc.clone();
                tc.status.mark_started(epoch_seconds());
                tc.status.mark_done(self.exit_code, epoch_seconds());
                log.append(&tc, false).unwrap();
            }
            log.finish().unwrap();
            fs::write(output, "queue job finished cleanly\n").unwrap();

            let mut n = self.submitted.lock().unwrap();
            *n += 1;
            SubmitOutcome {
                job_id: Some(n.to_string()),
                ..Default::default()
            }
        }

        async fn query(&self, _job_ids: &[String]) -> QueryOutcome {
            QueryOutcome::default()
        }
    }

    #[derive(Default, Clone)]
    struct Messages(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Reporter for Messages {
        async fn on_run_start(&self, _n: usize) {}
        async fn on_test_start(&self, _t: &TestCase) {}
        async fn on_test_complete(&self, _t: &TestCase) {}
        async fn on_message(&self, m: &str) {
            self.0.lock().unwrap().push(m.to_string());
        }
        async fn on_notrun(&self, t: &TestCase, reason: &str) {
            self.0
                .lock()
                .unwrap()
                .push(format!("notrun {} {}", t.display_string(), reason));
        }
        async fn on_run_complete(&self, _r: &RunResult) {}
    }

    fn spec(name: &str) -> TestSpec {
        let mut p = BTreeMap::new();
        p.insert("np".to_string(), "1".to_string());
        TestSpec::new(TestId::new(format!("{}.vvt", name), name).with_params(p), "true")
            .with_timeout(Some(200))
    }

    fn orchestrator(
        dir: &Path,
        specs: Vec<TestSpec>,
        exit_code: i32,
        reporter: Messages,
    ) -> (BatchOrchestrator<InstantQueue, Messages>, DirectScheduler, ResultLogWriter) {
        let mut list = TestList::new();
        for s in specs {
            list.insert(TestCase::new(s)).unwrap();
        }
        let parent = ResultLogWriter::new(dir.join("testlist.R"));
        parent.start(&LogAttrs::new()).unwrap();
        let sched = DirectScheduler::new(list, true)
            .unwrap()
            .with_log(parent.clone());

        let settings = MonitorSettings {
            max_jobs: 2,
            check_interval: 0,
            check_timeout: 60,
            batch_length: 1000,
            max_timeout: None,
            shim: None,
            env: Vec::new(),
            workdir: dir.to_path_buf(),
            job_command: vec!["vvrun".into()],
        };
        let monitor = BatchJobMonitor::new(InstantQueue::new(exit_code), settings, dir, "R")
            .with_parent_log(parent.clone());
        let orch = BatchOrchestrator::new(monitor, reporter).with_sleep(Duration::from_millis(20));
        (orch, sched, parent)
    }

    #[tokio::test]
    async fn test_batch_run_completes() {
        let dir = TempDir::new().unwrap();
        let specs = (0..10).map(|i| spec(&format!("t{}", i))).collect();
        let messages = Messages::default();
        let (mut orch, sched, parent) = orchestrator(dir.path(), specs, 0, messages.clone());

        let result = orch.run(sched).await.unwrap();

        assert_eq!(orch.monitor().num_jobs(), 2);
        assert!(orch
            .monitor()
            .jobs()
            .all(|j| j.outcome() == Some(JobOutcome::Clean)));
        assert_eq!(result.passed, 10);
        assert!(result.success());

        let log = ResultLogReader::read(parent.path()).unwrap();
        assert!(log.is_finished());
        assert_eq!(log.tests.len(), 10);
        assert!(
            messages
                .0
                .lock()
                .unwrap()
                .iter()
                .any(|m| m.starts_with("Finished batch IDS:"))
        );
    }

    #[tokio::test]
    async fn test_failed_prerequisite_flushes_dependent_job() {
        let dir = TempDir::new().unwrap();
        let specs = vec![
            spec("pre"),
            spec("post").with_dependency(DependencySpec::new("pre*")),
        ];
        let messages = Messages::default();
        let (mut orch, sched, _) = orchestrator(dir.path(), specs, 1, messages.clone());

        let result = orch.run(sched).await.unwrap();

        let status = |name: &str| {
            result
                .tests
                .iter()
                .find(|t| t.spec().id.name == name)
                .unwrap()
                .status
                .result_status()
        };
        assert_eq!(status("pre"), ResultStatus::Fail);
        assert_eq!(status("post"), ResultStatus::NotRun);
        assert_eq!(result.exit_code(), 4 | 32);

        let messages = messages.0.lock().unwrap();
        assert!(messages.contains(&"notrun post.np=1 failed dependency: pre.np=1".to_string()));
        assert!(
            messages
                .iter()
                .any(|m| m.starts_with("*** Warning: these batch numbers did not run:"))
        );
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let dir = TempDir::new().unwrap();
        let (orch, sched, parent) =
            orchestrator(dir.path(), vec![spec("a")], 0, Messages::default());
        let token = CancellationToken::new();
        token.cancel();
        let mut orch = orch.with_cancel_token(token);

        let result = orch.run(sched).await.unwrap();
        assert!(result.interrupted);
        assert_eq!(result.not_run, 1);
        assert!(!ResultLogReader::read(parent.path()).unwrap().is_finished());
    }
}

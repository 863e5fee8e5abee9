//! Control loops for direct and batch runs.
//!
//! Both loops are single-threaded and cooperative: each iteration starts at
//! most one unit of work, polls everything in flight without blocking, then
//! sleeps if nothing was started.
//!
//! ```text
//!                       ┌──────────── DirectOrchestrator ────────────┐
//!   TestList ──► DirectScheduler ──pop_next──► ProcessRunner ×N ──poll─┤
//!                       │              ▲                              │
//!                       │        MachinePool                    test_done ──► ResultLog
//!                       │
//!                       └──────────── BatchOrchestrator ─────────────┐
//!                          BatchJobMonitor ──checkstart/checkdone────┘
//! ```
//!
//! # Exit status
//!
//! [`RunResult::exit_code`] is a bitmask over the non-skipped tests:
//!
//! | Bit | Value | Set when any test is |
//! |-----|-------|----------------------|
//! | 1 | 2 | diff |
//! | 2 | 4 | fail |
//! | 3 | 8 | timeout |
//! | 4 | 16 | notdone |
//! | 5 | 32 | notrun |

pub mod batched;
pub mod pool;
pub mod runner;
pub mod scheduler;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::hms_format;
use crate::batch::BatchFileNamer;
use crate::config::Config;
use crate::resultlog::{LogAttrs, ResultLogReader, ResultLogWriter, results_file_path};
use crate::report::Reporter;
use crate::testcase::{ResultStatus, Size, TestCase, TestKey, TestList};

pub use batched::BatchOrchestrator;
pub use pool::{Allocation, MachinePool, ResourcePool};
pub use runner::{ProcessRunner, test_environment};
pub use scheduler::DirectScheduler;

/// Poll interval of the direct loop when nothing was started.
pub const DIRECT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Seconds since the Unix epoch.
pub fn epoch_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Exit status bits for a set of tests. Skipped tests do not count.
pub fn exit_status_bitmask<'a>(tests: impl IntoIterator<Item = &'a TestCase>) -> i32 {
    tests
        .into_iter()
        .filter(|tc| !tc.status.is_skipped())
        .fold(0, |mask, tc| {
            mask | match tc.status.result_status() {
                ResultStatus::Pass => 0,
                ResultStatus::Diff => 2,
                ResultStatus::Fail => 4,
                ResultStatus::Timeout => 8,
                ResultStatus::NotDone => 16,
                ResultStatus::NotRun => 32,
            }
        })
}

/// Aggregated results of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    /// Tests in the list, skipped ones included.
    pub total_tests: usize,
    pub passed: usize,
    pub diffed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub not_done: usize,
    pub not_run: usize,
    pub skipped: usize,

    /// Wall-clock duration of the run.
    pub duration: Duration,

    /// The run stopped early on an interrupt or the total timeout.
    pub interrupted: bool,

    pub tests: TestList,
}

impl RunResult {
    pub fn from_tests(tests: TestList, duration: Duration, interrupted: bool) -> Self {
        let mut r = Self {
            total_tests: tests.len(),
            passed: 0,
            diffed: 0,
            failed: 0,
            timed_out: 0,
            not_done: 0,
            not_run: 0,
            skipped: 0,
            duration,
            interrupted,
            tests: TestList::new(),
        };
        for tc in tests.iter() {
            if tc.status.is_skipped() {
                r.skipped += 1;
                continue;
            }
            match tc.status.result_status() {
                ResultStatus::Pass => r.passed += 1,
                ResultStatus::Diff => r.diffed += 1,
                ResultStatus::Fail => r.failed += 1,
                ResultStatus::Timeout => r.timed_out += 1,
                ResultStatus::NotDone => r.not_done += 1,
                ResultStatus::NotRun => r.not_run += 1,
            }
        }
        r.tests = tests;
        r
    }

    pub fn exit_code(&self) -> i32 {
        exit_status_bitmask(self.tests.iter())
    }

    pub fn success(&self) -> bool {
        !self.interrupted && self.exit_code() == 0
    }
}

/// Line printed after tests finish in a direct run.
fn direct_progress_line(done: usize, total: usize, elapsed: Duration) -> String {
    let pct = if total == 0 {
        100.0
    } else {
        100.0 * done as f64 / total as f64
    };
    format!(
        "Progress: {}/{} = {:.1}%, time = {}",
        done,
        total,
        pct,
        hms_format(elapsed.as_secs())
    )
}

/// A test with its process and the slots it holds.
struct ActiveTest {
    key: TestKey,
    runner: ProcessRunner,
    alloc: Allocation,
}

/// Runs tests as local processes within a processor/device budget.
///
/// # Example
///
/// ```text
/// use vvrun::orchestrator::{DirectOrchestrator, DirectScheduler, MachinePool};
/// use vvrun::report::NullReporter;
///
/// let sched = DirectScheduler::new(tests, true)?;
/// let orchestrator = DirectOrchestrator::new(MachinePool::new(8, 8, 0, 0), "TestResults", NullReporter);
/// let result = orchestrator.run(sched).await?;
/// std::process::exit(result.exit_code());
/// ```
pub struct DirectOrchestrator<R> {
    pool: MachinePool,
    results_dir: PathBuf,
    reporter: R,
    shell: String,
    env: Vec<(String, String)>,
    total_timeout: Option<Duration>,
    poll_interval: Duration,
    grace: Option<(Duration, Duration)>,
    cancel: CancellationToken,
}

impl<R: Reporter> DirectOrchestrator<R> {
    /// Execute directories are created under `results_dir`.
    pub fn new(pool: MachinePool, results_dir: impl Into<PathBuf>, reporter: R) -> Self {
        Self {
            pool,
            results_dir: results_dir.into(),
            reporter,
            shell: "/bin/sh".to_string(),
            env: Vec::new(),
            total_timeout: None,
            poll_interval: DIRECT_POLL_INTERVAL,
            grace: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Takes shell, extra environment and total timeout from the config.
    pub fn configured(mut self, config: &Config) -> Self {
        self.shell = config.vvrun.shell.clone();
        let mut env: Vec<(String, String)> = config
            .vvrun
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.sort();
        self.env = env;
        self.total_timeout = config
            .vvrun
            .timeouts
            .total_timeout
            .filter(|t| *t > 0)
            .map(Duration::from_secs);
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_total_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.total_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Interrupt and terminate grace periods for timed out tests.
    pub fn with_grace_periods(mut self, interrupt: Duration, terminate: Duration) -> Self {
        self.grace = Some((interrupt, terminate));
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn reporter(&self) -> &R {
        &self.reporter
    }

    /// Runs the scheduler's backlog to completion.
    ///
    /// On an interrupt or the total timeout every running test is killed
    /// and the result log is left without a `Finish` line.
    pub async fn run(&self, mut sched: DirectScheduler) -> Result<RunResult> {
        let start = Instant::now();
        let total = sched.backlog().len();
        let mut pool = self.pool.clone();
        let mut active: Vec<ActiveTest> = Vec::new();
        let mut interrupted = false;

        info!("Running {} tests directly, pool size {:?}", total, pool.total_size());
        self.reporter.on_run_start(total).await;

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

            let started = self.start_next(&mut sched, &mut pool, &mut active).await;

            let finished = self.poll_active(&mut sched, &mut pool, &mut active).await;
            if finished > 0 {
                let line = direct_progress_line(sched.num_done(), total, start.elapsed());
                self.reporter.on_message(&line).await;
            }

            if !started && active.is_empty() {
                break;
            }
            if !started {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        if interrupted {
            self.kill_active(&mut pool, &mut active).await;
        } else {
            for key in sched.pop_remaining() {
                let Some(tc) = sched.tests().get(&key) else {
                    continue;
                };
                let reason = match sched.tests().blocked_reason(&key) {
                    r if r.is_empty() => "unknown".to_string(),
                    r => format!("failed dependency: {}", r),
                };
                self.reporter.on_notrun(tc, &reason).await;
            }
            if let Some(log) = sched.log() {
                log.finish().context("Failed to finish result log")?;
            }
        }

        let result = RunResult::from_tests(sched.into_tests(), start.elapsed(), interrupted);
        self.reporter.on_run_complete(&result).await;
        Ok(result)
    }

    /// Starts the next runnable test, if one fits. Returns whether a test
    /// was taken from the backlog.
    async fn start_next(
        &self,
        sched: &mut DirectScheduler,
        pool: &mut MachinePool,
        active: &mut Vec<ActiveTest>,
    ) -> bool {
        let Some(key) = sched.pop_next(pool.size_available()) else {
            return false;
        };
        let Some(tc) = sched.tests_mut().get_mut(&key) else {
            return true;
        };

        let alloc = pool.get_resources(tc.size());
        let now = epoch_seconds();
        tc.status.mark_started(now);

        let mut runner = self.build_runner(tc, &alloc);
        self.reporter.on_test_start(tc).await;

        match runner.start() {
            Ok(()) => {
                debug!("Started {}", tc.display_string());
                active.push(ActiveTest { key, runner, alloc });
            }
            Err(e) => {
                warn!("Failed to start {}: {}", tc.display_string(), e);
                tc.status.mark_done(1, epoch_seconds());
                pool.return_resources(&alloc);
                sched.test_done(&key);
                if let Some(tc) = sched.tests().get(&key) {
                    self.reporter.on_test_complete(tc).await;
                }
            }
        }
        true
    }

    fn build_runner(&self, tc: &TestCase, alloc: &Allocation) -> ProcessRunner {
        let spec = tc.spec();
        let timeout = tc.status.timeout_secs();
        let exec_dir = self.results_dir.join(spec.id.execute_directory());
        let srcdir = Path::new(&spec.root).join(
            Path::new(&spec.id.filepath)
                .parent()
                .unwrap_or(Path::new("")),
        );

        let mut env = test_environment(tc, alloc, timeout, &self.results_dir);
        env.push(("VVRUN_SRCDIR".into(), srcdir.display().to_string()));
        env.extend(self.env.iter().cloned());

        let header = vec![
            format!("Test: {}", tc.display_string()),
            format!("Command: {}", spec.command),
            format!("Timeout: {}", timeout),
            format!("Start: {}", chrono::Local::now().format("%a %b %e %H:%M:%S %Y")),
            String::new(),
        ];

        let runner = ProcessRunner::new(spec.command.clone(), exec_dir, timeout)
            .with_shell(self.shell.clone())
            .with_env(env)
            .with_header(header);
        match self.grace {
            Some((interrupt, terminate)) => runner.with_grace_periods(interrupt, terminate),
            None => runner,
        }
    }

    /// Polls every running test, finalizing those that exited. Returns how
    /// many finished.
    async fn poll_active(
        &self,
        sched: &mut DirectScheduler,
        pool: &mut MachinePool,
        active: &mut Vec<ActiveTest>,
    ) -> usize {
        let mut finished = 0;
        let mut i = 0;
        while i < active.len() {
            let exited = match active[i].runner.poll() {
                Ok(exited) => exited,
                Err(e) => {
                    warn!("{}", e);
                    true
                }
            };
            if !exited {
                i += 1;
                continue;
            }

            let done = active.remove(i);
            pool.return_resources(&done.alloc);
            if let Some(tc) = sched.tests_mut().get_mut(&done.key) {
                let now = epoch_seconds();
                if done.runner.timed_out() {
                    tc.status.mark_timed_out(now);
                } else {
                    tc.status.mark_done(done.runner.exit_code().unwrap_or(1), now);
                }
            }
            sched.test_done(&done.key);
            if let Some(tc) = sched.tests().get(&done.key) {
                self.reporter.on_test_complete(tc).await;
            }
            finished += 1;
        }
        finished
    }

    async fn kill_active(&self, pool: &mut MachinePool, active: &mut Vec<ActiveTest>) {
        if active.is_empty() {
            return;
        }
        info!("Killing {} running tests", active.len());
        join_all(active.iter_mut().map(|t| t.runner.kill_job())).await;
        for t in active.drain(..) {
            pool.return_resources(&t.alloc);
        }
    }
}

/// Test list of one batch job, as read by `run --job-id`.
#[derive(Debug)]
pub struct JobTests {
    pub tests: TestList,

    /// Rundate of the parent run.
    pub rundate: String,

    /// Where the job writes its results.
    pub results_file: PathBuf,

    /// Largest test size in the job.
    pub max_size: Size,
}

/// Loads the test list written for batch job `batch_id`.
pub fn load_job_tests(results_dir: &Path, batch_id: usize) -> Result<JobTests> {
    let namer = BatchFileNamer::new(results_dir);
    let path = namer.testlist_path(batch_id);
    let log = ResultLogReader::read(&path)
        .with_context(|| format!("Failed to read batch test list {}", path.display()))?;
    let rundate = log
        .attr_str("rundate")
        .map(str::to_string)
        .with_context(|| format!("No rundate in {}", path.display()))?;

    let tests = log.into_test_list();
    let max_size = tests.max_size();
    Ok(JobTests {
        results_file: results_file_path(&path, &rundate),
        tests,
        rundate,
        max_size,
    })
}

/// Creates a results log with the standard attributes.
pub fn start_results_log(path: &Path, rundate: &str, extra: LogAttrs) -> Result<ResultLogWriter> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let mut attrs = LogAttrs::new();
    attrs.insert("rundate".into(), rundate.into());
    attrs.extend(extra);
    let log = ResultLogWriter::new(path);
    log.start(&attrs)
        .with_context(|| format!("Failed to start result log {}", path.display()))?;
    Ok(log)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;
    use crate::report::NullReporter;
    use crate::testcase::{DependencySpec, SkipReason, TestId, TestSpec};

    /// Collects not-run warnings.
    #[derive(Default, Clone)]
    struct NotRunLog(Arc<Mutex<Vec<(String, String)>>>);

    #[async_trait]
    impl Reporter for NotRunLog {
        async fn on_run_start(&self, _n: usize) {}
        async fn on_test_start(&self, _t: &TestCase) {}
        async fn on_test_complete(&self, _t: &TestCase) {}
        async fn on_message(&self, _m: &str) {}
        async fn on_notrun(&self, t: &TestCase, reason: &str) {
            self.0
                .lock()
                .unwrap()
                .push((t.display_string(), reason.to_string()));
        }
        async fn on_run_complete(&self, _r: &RunResult) {}
    }

    fn spec(name: &str, command: &str) -> TestSpec {
        let mut p = BTreeMap::new();
        p.insert("np".to_string(), "1".to_string());
        TestSpec::new(TestId::new(format!("{}.vvt", name), name).with_params(p), command)
            .with_timeout(Some(60))
    }

    fn list(specs: Vec<TestSpec>) -> TestList {
        let mut l = TestList::new();
        for s in specs {
            l.insert(TestCase::new(s)).unwrap();
        }
        l
    }

    fn by_name<'a>(tests: &'a TestList, name: &str) -> &'a TestCase {
        tests.iter().find(|t| t.spec().id.name == name).unwrap()
    }

    fn orchestrator<R: Reporter>(np: usize, dir: &Path, reporter: R) -> DirectOrchestrator<R> {
        DirectOrchestrator::new(MachinePool::new(np, np, 0, 0), dir, reporter)
            .with_poll_interval(Duration::from_millis(20))
    }

    #[test]
    fn test_exit_bitmask() {
        let mut l = list(vec![
            spec("a", "true"),
            spec("b", "true"),
            spec("c", "true"),
            spec("d", "true"),
        ]);
        let keys: Vec<TestKey> = l.keys().cloned().collect();
        fn st<'a>(l: &'a mut TestList, key: &TestKey) -> &'a mut crate::testcase::TestStatus {
            &mut l.get_mut(key).unwrap().status
        }

        st(&mut l, &keys[0]).mark_started(0.0);
        st(&mut l, &keys[0]).mark_done(0, 1.0);
        st(&mut l, &keys[1]).mark_started(0.0);
        st(&mut l, &keys[1]).mark_done(64, 1.0);
        st(&mut l, &keys[2]).mark_started(0.0);
        st(&mut l, &keys[2]).mark_timed_out(1.0);
        st(&mut l, &keys[3]).mark_skipped(SkipReason::Keyword);
        assert_eq!(exit_status_bitmask(l.iter()), 2 | 8);

        st(&mut l, &keys[3]).clear_skip();
        let r = RunResult::from_tests(l, Duration::ZERO, false);
        assert_eq!(r.exit_code(), 2 | 8 | 32);
        assert_eq!((r.passed, r.diffed, r.timed_out, r.not_run), (1, 1, 1, 1));
        assert!(!r.success());
    }

    #[test]
    fn test_progress_line() {
        assert_eq!(
            direct_progress_line(1, 3, Duration::from_secs(75)),
            "Progress: 1/3 = 33.3%, time = 1:15"
        );
        assert_eq!(
            direct_progress_line(0, 0, Duration::ZERO),
            "Progress: 0/0 = 100.0%, time = 0:00"
        );
    }

    #[tokio::test]
    async fn test_pool_limits_concurrency() {
        let dir = TempDir::new().unwrap();
        let tests = list(vec![
            spec("a", "sleep 1"),
            spec("b", "sleep 1"),
            spec("c", "sleep 1"),
        ]);
        let sched = DirectScheduler::new(tests, true).unwrap();
        let result = orchestrator(2, dir.path(), NullReporter)
            .run(sched)
            .await
            .unwrap();

        assert_eq!(result.passed, 3);
        let starts: Vec<f64> = ["a", "b", "c"]
            .iter()
            .map(|n| by_name(&result.tests, n).status.start_date().unwrap())
            .collect();
        let first_two = starts[0].max(starts[1]);
        assert!(first_two - starts[0].min(starts[1]) < 0.5);
        assert!(starts[2] >= starts[0].min(starts[1]) + 0.9);
        assert!(dir.path().join("a.np=1").join("execute.log").exists());
    }

    #[tokio::test]
    async fn test_failed_prerequisite_blocks_dependent() {
        let dir = TempDir::new().unwrap();
        let mut dep = DependencySpec::new("a*");
        dep.result = Some("pass".into());
        let tests = list(vec![spec("a", "exit 1"), spec("b", "true").with_dependency(dep)]);

        let log = start_results_log(&dir.path().join("testlist.R"), "R", LogAttrs::new()).unwrap();
        let sched = DirectScheduler::new(tests, true).unwrap().with_log(log.clone());
        let reporter = NotRunLog::default();
        let result = orchestrator(4, dir.path(), reporter.clone())
            .run(sched)
            .await
            .unwrap();

        let a = by_name(&result.tests, "a");
        let b = by_name(&result.tests, "b");
        assert_eq!(a.status.result_status(), ResultStatus::Fail);
        assert!(b.status.is_notrun());
        assert!(result.tests.will_never_run(&b.key()));
        assert_eq!(
            *reporter.0.lock().unwrap(),
            vec![("b.np=1".to_string(), "failed dependency: a.np=1".to_string())]
        );
        assert_eq!(result.exit_code(), 4 | 32);

        let read = ResultLogReader::read(log.path()).unwrap();
        assert!(read.is_finished());
        assert_eq!(read.tests.len(), 1);
    }

    #[tokio::test]
    async fn test_exit_codes_and_timeout() {
        let dir = TempDir::new().unwrap();
        let tests = list(vec![
            spec("pass", "echo $VVRUN_NP > np.txt"),
            spec("diff", "exit 64"),
            spec("slow", "sleep 30").with_timeout(Some(1)),
        ]);
        let sched = DirectScheduler::new(tests, true).unwrap();
        let result = orchestrator(4, dir.path(), NullReporter)
            .with_grace_periods(Duration::from_millis(200), Duration::from_millis(200))
            .run(sched)
            .await
            .unwrap();

        let status = |n| by_name(&result.tests, n).status.result_status();
        assert_eq!(status("pass"), ResultStatus::Pass);
        assert_eq!(status("diff"), ResultStatus::Diff);
        assert_eq!(status("slow"), ResultStatus::Timeout);
        let np = std::fs::read_to_string(dir.path().join("pass.np=1/np.txt")).unwrap();
        assert_eq!(np.trim(), "1");
    }

    #[tokio::test]
    async fn test_cancel_kills_running_tests() {
        let dir = TempDir::new().unwrap();
        let log = start_results_log(&dir.path().join("testlist.R"), "R", LogAttrs::new()).unwrap();
        let sched = DirectScheduler::new(list(vec![spec("hang", "sleep 60")]), true)
            .unwrap()
            .with_log(log.clone());

        let token = CancellationToken::new();
        let orch = orchestrator(1, dir.path(), NullReporter).with_cancel_token(token.clone());
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            token.cancel();
        });

        let t0 = Instant::now();
        let result = orch.run(sched).await.unwrap();
        canceller.await.unwrap();

        assert!(result.interrupted);
        assert!(t0.elapsed() < Duration::from_secs(30));
        assert_eq!(result.not_done, 1);
        assert!(!ResultLogReader::read(log.path()).unwrap().is_finished());
    }

    #[test]
    fn test_load_job_tests() {
        let dir = TempDir::new().unwrap();
        let namer = BatchFileNamer::new(dir.path());
        std::fs::create_dir_all(namer.subdir(4)).unwrap();

        let mut extra = LogAttrs::new();
        extra.insert("batch_id".into(), 4.into());
        let w = start_results_log(&namer.testlist_path(4), "2026-10-15_08:00:00", extra).unwrap();
        let mut big = spec("big", "true");
        big.id.params.insert("np".into(), "3".into());
        w.append(&TestCase::new(big), true).unwrap();
        w.append(&TestCase::new(spec("small", "true")), true).unwrap();

        let job = load_job_tests(dir.path(), 4).unwrap();
        assert_eq!(job.tests.len(), 2);
        assert_eq!(job.rundate, "2026-10-15_08:00:00");
        assert_eq!(job.max_size, (3, 0));
        assert_eq!(job.results_file, namer.results_path(4, "2026-10-15_08:00:00"));

        assert!(load_job_tests(dir.path(), 5).is_err());
    }
}

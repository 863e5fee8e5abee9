//! Backlog ordering and dispatch of tests.
//!
//! The [`DirectScheduler`] owns the [`TestList`] for a run and tracks where
//! each active test is:
//!
//! ```text
//!   backlog ──pop_next──────────────────────► started ──test_done──► stopped
//!      │                                         ▲                      ▲
//!      └──get_next_test──► waiting ──Running─────┘                      │
//!                             └────────────Done─────────────────────────┘
//! ```
//!
//! Direct runs use [`pop_next`](DirectScheduler::pop_next). Batch runs drain
//! the backlog into `waiting` with
//! [`get_next_test`](DirectScheduler::get_next_test) while grouping, then
//! move tests along with [`check_state_change`](DirectScheduler::check_state_change)
//! as results arrive from the batch jobs' logs.
//!
//! # Ordering
//!
//! The backlog is sorted largest first, `(np, runtime)` descending for
//! direct runs and `(np, timeout)` descending for batching, so a big or slow
//! test is not left to run alone at the end. Sorts are stable: tests that
//! compare equal keep their list order.

use indexmap::IndexSet;
use tracing::{debug, warn};

use crate::resultlog::ResultLogWriter;
use crate::testcase::{ModelResult, Size, TestCase, TestKey, TestList};

/// Dispatches tests from a size-ordered backlog.
pub struct DirectScheduler {
    tests: TestList,
    log: Option<ResultLogWriter>,
    backlog: Vec<TestKey>,
    waiting: IndexSet<TestKey>,
    started: IndexSet<TestKey>,
    stopped: IndexSet<TestKey>,
}

impl DirectScheduler {
    /// Seeds the backlog with every non-skipped test, sorts it and wires up
    /// the dependency graph.
    pub fn new(mut tests: TestList, strict: bool) -> ModelResult<Self> {
        tests.connect_dependencies(strict)?;

        let backlog = tests
            .iter()
            .filter(|tc| !tc.status.is_skipped())
            .map(TestCase::key)
            .collect();

        let mut sched = Self {
            tests,
            log: None,
            backlog,
            waiting: IndexSet::new(),
            started: IndexSet::new(),
            stopped: IndexSet::new(),
        };
        sched.sort_by(runtime_sort_key);
        debug!("Scheduler backlog holds {} tests", sched.backlog.len());
        Ok(sched)
    }

    /// Appends finished tests to this log.
    pub fn with_log(mut self, log: ResultLogWriter) -> Self {
        self.log = Some(log);
        self
    }

    pub fn tests(&self) -> &TestList {
        &self.tests
    }

    pub fn tests_mut(&mut self) -> &mut TestList {
        &mut self.tests
    }

    pub fn into_tests(self) -> TestList {
        self.tests
    }

    pub fn log(&self) -> Option<&ResultLogWriter> {
        self.log.as_ref()
    }

    pub fn backlog(&self) -> &[TestKey] {
        &self.backlog
    }

    pub fn running(&self) -> impl Iterator<Item = &TestKey> {
        self.started.iter()
    }

    pub fn num_running(&self) -> usize {
        self.started.len()
    }

    pub fn num_done(&self) -> usize {
        self.stopped.len()
    }

    /// Re-sorts the backlog by `(np, timeout)` for batching.
    pub fn sort_by_size_and_timeout(&mut self) {
        self.sort_by(timeout_sort_key);
    }

    fn sort_by(&mut self, key: fn(&TestCase) -> (usize, u64)) {
        let tests = &self.tests;
        let sort_key = |k: &TestKey| tests.get(k).map(key).unwrap_or((0, 0));
        self.backlog.sort_by(|a, b| sort_key(b).cmp(&sort_key(a)));
    }

    /// Removes and returns the next test to start, moving it to `started`.
    ///
    /// Picks the first test that fits `max_size` and is not blocked. If none
    /// qualifies and nothing is running, the size limit is dropped so an
    /// oversized test can still make progress on an idle machine.
    pub fn pop_next(&mut self, max_size: Size) -> Option<TestKey> {
        let key = match self.pop_fitting(Some(max_size)) {
            Some(key) => Some(key),
            None if self.started.is_empty() => self.pop_fitting(None),
            None => None,
        }?;

        self.started.insert(key.clone());
        Some(key)
    }

    fn pop_fitting(&mut self, max_size: Option<Size>) -> Option<TestKey> {
        let start = match max_size {
            Some((maxnp, _)) => self
                .backlog
                .partition_point(|k| self.np_of(k) > maxnp),
            None => 0,
        };

        let idx = (start..self.backlog.len()).find(|&i| {
            let key = &self.backlog[i];
            let Some(tc) = self.tests.get(key) else {
                return false;
            };
            let fits = match max_size {
                Some((maxnp, maxnd)) => {
                    let (np, nd) = tc.size();
                    np <= maxnp && nd <= maxnd
                }
                None => true,
            };
            fits && !self.tests.is_blocked(key)
        })?;

        Some(self.backlog.remove(idx))
    }

    fn np_of(&self, key: &TestKey) -> usize {
        self.tests.get(key).map_or(0, |tc| tc.size().0)
    }

    /// Pops the backlog head into `waiting`.
    pub fn get_next_test(&mut self) -> Option<TestKey> {
        if self.backlog.is_empty() {
            return None;
        }
        let key = self.backlog.remove(0);
        self.waiting.insert(key.clone());
        Some(key)
    }

    /// Drains the backlog. Whatever is left here cannot run.
    pub fn pop_remaining(&mut self) -> Vec<TestKey> {
        std::mem::take(&mut self.backlog)
    }

    /// Moves a finished test to `stopped` and records it in the log.
    pub fn test_done(&mut self, key: &TestKey) {
        self.append_to_log(key);
        self.started.shift_remove(key);
        self.stopped.insert(key.clone());
    }

    /// Appends the test's current status to the log, if there is one.
    pub fn append_to_log(&self, key: &TestKey) {
        let (Some(log), Some(tc)) = (self.log.as_ref(), self.tests.get(key)) else {
            return;
        };
        if let Err(e) = log.append(tc, false) {
            warn!("Failed to record {} in result log: {}", tc.display_string(), e);
        }
    }

    /// Applies a status read back from a batch job's log.
    ///
    /// Returns the key of the test when it changed set.
    pub fn check_state_change(&mut self, record: &TestCase) -> Option<TestKey> {
        let key = record.key();
        let status = &record.status;

        let moved = if self.waiting.contains(&key) {
            if status.is_running() {
                self.waiting.shift_remove(&key);
                self.started.insert(key.clone());
                true
            } else if status.is_done() {
                self.waiting.shift_remove(&key);
                self.stopped.insert(key.clone());
                true
            } else {
                false
            }
        } else if self.started.contains(&key) && status.is_done() {
            self.started.shift_remove(&key);
            self.stopped.insert(key.clone());
            true
        } else {
            false
        };

        if !moved {
            return None;
        }

        if let Some(tc) = self.tests.get_mut(&key) {
            tc.status.copy_results_from(status);
        }
        self.append_to_log(&key);
        Some(key)
    }
}

fn runtime_sort_key(tc: &TestCase) -> (usize, u64) {
    let secondary = tc
        .status
        .runtime()
        .unwrap_or_else(|| tc.status.timeout_secs());
    (tc.size().0, secondary)
}

fn timeout_sort_key(tc: &TestCase) -> (usize, u64) {
    (tc.size().0, tc.status.timeout_secs())
}

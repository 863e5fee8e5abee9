//! Test status: the run state machine, result words and skip reasons.
//!
//! A test moves through `NotRun → Running → Done`. Skipping is orthogonal
//! and is only set while the test is still `NotRun`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ModelError;

/// Exit status a test uses to signal a diff rather than a failure.
pub const DIFF_EXIT_STATUS: i32 = 64;

/// Outcome of a test that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestResult {
    Pass,
    Diff,
    Fail,
    Timeout,
}

impl TestResult {
    /// Maps a process exit code to a result.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => TestResult::Pass,
            DIFF_EXIT_STATUS => TestResult::Diff,
            _ => TestResult::Fail,
        }
    }
}

/// Run state of a test.
///
/// Times are seconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum RunState {
    /// Not started.
    NotRun,

    /// Started but not finished. Serialized as `notdone`.
    #[serde(rename = "notdone")]
    Running { xdate: f64 },

    /// Finished, either by exiting or by being timed out.
    Done {
        xdate: f64,
        xvalue: i32,
        result: TestResult,
        xtime: u64,
    },
}

/// The word a status reduces to for reporting and dependency matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResultStatus {
    NotRun,
    NotDone,
    Pass,
    Diff,
    Fail,
    Timeout,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultStatus::NotRun => "notrun",
            ResultStatus::NotDone => "notdone",
            ResultStatus::Pass => "pass",
            ResultStatus::Diff => "diff",
            ResultStatus::Fail => "fail",
            ResultStatus::Timeout => "timeout",
        }
    }
}

impl From<TestResult> for ResultStatus {
    fn from(result: TestResult) -> Self {
        match result {
            TestResult::Pass => ResultStatus::Pass,
            TestResult::Diff => ResultStatus::Diff,
            TestResult::Fail => ResultStatus::Fail,
            TestResult::Timeout => ResultStatus::Timeout,
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResultStatus {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notrun" => Ok(ResultStatus::NotRun),
            "notdone" | "running" => Ok(ResultStatus::NotDone),
            "pass" => Ok(ResultStatus::Pass),
            "diff" => Ok(ResultStatus::Diff),
            "fail" => Ok(ResultStatus::Fail),
            "timeout" => Ok(ResultStatus::Timeout),
            other => Err(ModelError::InvalidResultWord(other.to_string())),
        }
    }
}

/// Why a test was excluded from the run.
///
/// Each code maps to a fixed human-readable string, see
/// [`description`](Self::description).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipReason {
    Param,
    RestartParam,
    Keyword,
    ResultsKeyword,
    Subdir,
    Enabled,
    Platform,
    Option,
    Tdd,
    Search,
    MaxProcs,
    MaxDevices,
    Runtime,
    NoBaseline,
    DepSkip,
    Tsum,
}

impl SkipReason {
    pub fn description(&self) -> &'static str {
        match self {
            SkipReason::Param | SkipReason::RestartParam => "excluded by parameter expression",
            SkipReason::Keyword => "excluded by keyword expression",
            SkipReason::ResultsKeyword => "previous result keyword expression",
            SkipReason::Subdir => "current working directory",
            SkipReason::Enabled => "disabled",
            SkipReason::Platform => "excluded by platform expression",
            SkipReason::Option => "excluded by option expression",
            SkipReason::Tdd => "TDD test",
            SkipReason::Search => "excluded by file search expression",
            SkipReason::MaxProcs => "exceeds max processors",
            SkipReason::MaxDevices => "exceeds max devices",
            SkipReason::Runtime => "runtime too low or too high",
            SkipReason::NoBaseline => "no rebaseline specification",
            SkipReason::DepSkip => "analyze dependency skipped",
            SkipReason::Tsum => "cummulative runtime exceeded",
        }
    }

    /// Whether this skip, on a family member, should also skip the
    /// family's analyze test.
    pub fn causes_analyze_skip(&self) -> bool {
        !matches!(
            self,
            SkipReason::Param
                | SkipReason::RestartParam
                | SkipReason::ResultsKeyword
                | SkipReason::Subdir
        )
    }
}

/// Full status of one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStatus {
    #[serde(flatten)]
    pub state: RunState,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipReason>,

    /// Effective timeout in seconds. Zero means no limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    /// Runtime observed in an earlier run, used only for ordering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_runtime: Option<u64>,
}

impl Default for TestStatus {
    fn default() -> Self {
        Self {
            state: RunState::NotRun,
            skip: None,
            timeout: None,
            prior_runtime: None,
        }
    }
}

impl TestStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_notrun(&self) -> bool {
        matches!(self.state, RunState::NotRun)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running { .. })
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, RunState::Done { .. })
    }

    pub fn is_skipped(&self) -> bool {
        self.skip.is_some()
    }

    pub fn passed(&self) -> bool {
        matches!(
            self.state,
            RunState::Done {
                result: TestResult::Pass,
                ..
            }
        )
    }

    /// Marks the test skipped. Has no effect once the test has started.
    pub fn mark_skipped(&mut self, reason: SkipReason) {
        if self.is_notrun() {
            self.skip = Some(reason);
        }
    }

    pub fn clear_skip(&mut self) {
        self.skip = None;
    }

    pub fn skip_description(&self) -> Option<&'static str> {
        self.skip.as_ref().map(SkipReason::description)
    }

    pub fn result_status(&self) -> ResultStatus {
        match &self.state {
            RunState::NotRun => ResultStatus::NotRun,
            RunState::Running { .. } => ResultStatus::NotDone,
            RunState::Done { result, .. } => (*result).into(),
        }
    }

    pub fn start_date(&self) -> Option<f64> {
        match &self.state {
            RunState::NotRun => None,
            RunState::Running { xdate } | RunState::Done { xdate, .. } => Some(*xdate),
        }
    }

    /// Runtime of the finished run, falling back to the prior-run hint.
    pub fn runtime(&self) -> Option<u64> {
        match &self.state {
            RunState::Done { xtime, .. } => Some(*xtime),
            _ => self.prior_runtime,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match &self.state {
            RunState::Done { xvalue, .. } => Some(*xvalue),
            _ => None,
        }
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(0)
    }

    pub fn mark_started(&mut self, now: f64) {
        self.state = RunState::Running {
            xdate: (now * 100.0).trunc() / 100.0,
        };
    }

    pub fn mark_done(&mut self, exit_code: i32, now: f64) {
        self.finish(exit_code, TestResult::from_exit_code(exit_code), now);
    }

    pub fn mark_timed_out(&mut self, now: f64) {
        self.finish(1, TestResult::Timeout, now);
    }

    fn finish(&mut self, exit_code: i32, result: TestResult, now: f64) {
        let xdate = self.start_date().unwrap_or(now);
        let elapsed = (now - xdate).max(0.0);
        self.state = RunState::Done {
            xdate,
            xvalue: exit_code,
            result,
            xtime: elapsed as u64,
        };
    }

    /// Returns the test to `NotRun`, keeping skip and timeout settings.
    pub fn reset(&mut self) {
        self.state = RunState::NotRun;
    }

    /// Copies the run state from a status read back from a log.
    pub fn copy_results_from(&mut self, other: &TestStatus) {
        self.state = other.state.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_translation() {
        assert_eq!(TestResult::from_exit_code(0), TestResult::Pass);
        assert_eq!(TestResult::from_exit_code(64), TestResult::Diff);
        assert_eq!(TestResult::from_exit_code(1), TestResult::Fail);
        assert_eq!(TestResult::from_exit_code(-9), TestResult::Fail);
    }

    #[test]
    fn test_state_transitions() {
        let mut st = TestStatus::new();
        assert_eq!(st.result_status(), ResultStatus::NotRun);

        st.mark_started(1000.129);
        assert!(st.is_running());
        assert_eq!(st.result_status(), ResultStatus::NotDone);
        assert_eq!(st.start_date(), Some(1000.12));

        st.mark_done(64, 1010.5);
        assert!(st.is_done());
        assert_eq!(st.result_status(), ResultStatus::Diff);
        assert_eq!(st.runtime(), Some(10));
        assert_eq!(st.exit_code(), Some(64));
    }

    #[test]
    fn test_timed_out_is_failure_exit() {
        let mut st = TestStatus::new();
        st.mark_started(0.0);
        st.mark_timed_out(30.0);
        assert_eq!(st.result_status(), ResultStatus::Timeout);
        assert_eq!(st.exit_code(), Some(1));
    }

    #[test]
    fn test_skip_only_from_notrun() {
        let mut st = TestStatus::new();
        st.mark_started(0.0);
        st.mark_skipped(SkipReason::Keyword);
        assert!(!st.is_skipped());

        let mut st = TestStatus::new();
        st.mark_skipped(SkipReason::MaxProcs);
        assert_eq!(st.skip_description(), Some("exceeds max processors"));
    }

    #[test]
    fn test_skip_descriptions() {
        assert_eq!(SkipReason::Enabled.description(), "disabled");
        assert_eq!(
            SkipReason::RestartParam.description(),
            SkipReason::Param.description()
        );
        assert_eq!(SkipReason::Tsum.description(), "cummulative runtime exceeded");
        assert!(!SkipReason::Subdir.causes_analyze_skip());
        assert!(SkipReason::Platform.causes_analyze_skip());
    }

    #[test]
    fn test_status_serde_shape() {
        let mut st = TestStatus::new();
        st.timeout = Some(120);
        st.mark_started(5.0);
        st.mark_done(0, 7.0);

        let json = serde_json::to_value(&st).unwrap();
        assert_eq!(json["state"], "done");
        assert_eq!(json["result"], "pass");
        assert_eq!(json["xtime"], 2);
        assert_eq!(json["timeout"], 120);

        let back: TestStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, st);
    }

    #[test]
    fn test_running_serializes_as_notdone() {
        let mut st = TestStatus::new();
        st.mark_started(3.0);
        let json = serde_json::to_string(&st).unwrap();
        assert!(json.contains("\"state\":\"notdone\""));
    }
}

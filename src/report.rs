//! Run progress and result reporting.
//!
//! Orchestrators push events into a [`Reporter`]. [`ConsoleReporter`] drives
//! an `indicatif` bar and prints the final summary; [`MultiReporter`] fans
//! events out to several reporters.

use async_trait::async_trait;
use console::style;

use crate::orchestrator::RunResult;
use crate::testcase::{ResultStatus, TestCase};

/// Receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called once the tests to run are known.
    async fn on_run_start(&self, num_tests: usize);

    async fn on_test_start(&self, test: &TestCase);

    /// Called when a test's final status is known.
    async fn on_test_complete(&self, test: &TestCase);

    /// A free-form progress or status line.
    async fn on_message(&self, message: &str);

    /// Called for each test that will not run, with the reason.
    async fn on_notrun(&self, test: &TestCase, reason: &str);

    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_run_start(&self, _num_tests: usize) {}
    async fn on_test_start(&self, _test: &TestCase) {}
    async fn on_test_complete(&self, _test: &TestCase) {}
    async fn on_message(&self, _message: &str) {}
    async fn on_notrun(&self, _test: &TestCase, _reason: &str) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that combines multiple reporters.
#[derive(Default)]
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_run_start(&self, num_tests: usize) {
        for r in &self.reporters {
            r.on_run_start(num_tests).await;
        }
    }

    async fn on_test_start(&self, test: &TestCase) {
        for r in &self.reporters {
            r.on_test_start(test).await;
        }
    }

    async fn on_test_complete(&self, test: &TestCase) {
        for r in &self.reporters {
            r.on_test_complete(test).await;
        }
    }

    async fn on_message(&self, message: &str) {
        for r in &self.reporters {
            r.on_message(message).await;
        }
    }

    async fn on_notrun(&self, test: &TestCase, reason: &str) {
        for r in &self.reporters {
            r.on_notrun(test, reason).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for r in &self.reporters {
            r.on_run_complete(result).await;
        }
    }
}

/// Console reporter with an optional progress bar.
pub struct ConsoleReporter {
    progress: std::sync::Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
    show_progress: bool,
    list_tests: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: std::sync::Mutex::new(None),
            verbose,
            show_progress: true,
            list_tests: false,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// List every test in the final summary, not only the failures.
    pub fn with_test_list(mut self, list: bool) -> Self {
        self.list_tests = list;
        self
    }

    fn println(&self, line: String) {
        let guard = self.progress.lock().ok();
        match guard.as_ref().and_then(|g| g.as_ref()) {
            Some(pb) => pb.println(line),
            None => println!("{}", line),
        }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_run_start(&self, num_tests: usize) {
        println!("Running {} tests", num_tests);
        if !self.show_progress || num_tests == 0 {
            return;
        }

        let pb = indicatif::ProgressBar::new(num_tests as u64);
        if let Ok(st) = indicatif::ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        ) {
            pb.set_style(st.progress_chars("#>-"));
        }
        if let Ok(mut guard) = self.progress.lock() {
            *guard = Some(pb);
        }
    }

    async fn on_test_start(&self, test: &TestCase) {
        if self.verbose {
            self.println(format!("Starting: {}", test.display_string()));
        }
    }

    async fn on_test_complete(&self, test: &TestCase) {
        if let Ok(guard) = self.progress.lock() {
            if let Some(pb) = guard.as_ref() {
                pb.inc(1);
            }
        }
        let status = test.status.result_status();
        if self.verbose || status != ResultStatus::Pass {
            self.println(format!(
                "Finished: {} {}",
                styled_status(status),
                test.display_string()
            ));
        }
    }

    async fn on_message(&self, message: &str) {
        self.println(message.to_string());
    }

    async fn on_notrun(&self, test: &TestCase, reason: &str) {
        self.println(format!(
            "*** Warning: test \"{}\" notrun due to \"{}\"",
            test.display_string(),
            reason
        ));
    }

    async fn on_run_complete(&self, result: &RunResult) {
        if let Ok(mut guard) = self.progress.lock() {
            if let Some(pb) = guard.take() {
                pb.finish_and_clear();
            }
        }
        print_summary(result, self.list_tests);
    }
}

fn styled_status(status: ResultStatus) -> console::StyledObject<&'static str> {
    let word = status.as_str();
    match status {
        ResultStatus::Pass => style(word).green(),
        ResultStatus::Diff | ResultStatus::NotDone => style(word).yellow(),
        ResultStatus::Fail | ResultStatus::Timeout => style(word).red(),
        ResultStatus::NotRun => style(word).red().bold(),
    }
}

/// Prints a summary of a run. With `list_all`, every test is listed;
/// otherwise only tests that did not pass.
pub fn print_summary(result: &RunResult, list_all: bool) {
    let listed: Vec<&TestCase> = result
        .tests
        .iter()
        .filter(|tc| !tc.status.is_skipped())
        .filter(|tc| list_all || tc.status.result_status() != ResultStatus::Pass)
        .collect();
    if !listed.is_empty() {
        println!();
        for tc in listed {
            println!(
                "  {:<8} {}",
                styled_status(tc.status.result_status()),
                tc.display_string()
            );
        }
    }

    println!();
    println!("Test Results:");
    println!("  Total:    {}", result.total_tests);
    println!("  Passed:   {}", style(result.passed).green());
    if result.diffed > 0 {
        println!("  Diffed:   {}", style(result.diffed).yellow());
    }
    println!("  Failed:   {}", style(result.failed).red());
    if result.timed_out > 0 {
        println!("  Timeout:  {}", style(result.timed_out).red());
    }
    if result.not_done > 0 {
        println!("  Not Done: {}", style(result.not_done).yellow());
    }
    if result.not_run > 0 {
        println!("  Not Run:  {}", style(result.not_run).red().bold());
    }
    println!("  Skipped:  {}", style(result.skipped).dim());
    println!("  Duration: {:?}", result.duration);

    println!();
    if result.interrupted {
        println!("{}", style("Run was interrupted.").red().bold());
    } else if result.success() {
        println!("{}", style("All tests passed!").green().bold());
    } else {
        println!(
            "{}",
            style(format!("Some tests did not pass (exit status {}).", result.exit_code()))
                .red()
                .bold()
        );
    }
}

//! Append-only, restart-safe result log.
//!
//! A result log is a line-oriented text file. Header lines carry the
//! `#VVR:` prefix, every other non-blank line is one JSON test record:
//!
//! ```text
//! #VVR: Version = 1
//! #VVR: Start = ["Tue Oct 13 09:12:44 2026", 1791882764.2]
//! #VVR: Attrs = {"rundate":"2026-10-13_09:12:44"}
//!
//! #VVR: Include = batchset0/testlist.3.2026-10-13_09:12:44
//! {"name":"heat","root":".","path":"heat.vvt",...,"attrs":{"state":"notdone",...}}
//! {"name":"heat","root":".","path":"heat.vvt",...,"attrs":{"state":"done",...}}
//! #VVR: Completed = batchset0/testlist.3.2026-10-13_09:12:44
//!
//! #VVR: Finish = ["Tue Oct 13 09:40:02 2026", 1791884402.9]
//! ```
//!
//! A test may appear several times; the last record wins. A parent run adds
//! an `Include` line when a batch job starts so that a reader of an
//! interrupted parent can still pick up the job's results, and a matching
//! `Completed` line once the job's results have been copied into the parent.
//! A missing `Finish` line means the run was interrupted or crashed.

mod reader;
mod writer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};

use crate::testcase::{
    DependencySpec, Staging, TestCase, TestId, TestSpec, TestStatus,
};

pub use reader::{ResultLog, ResultLogReader, file_is_marked_finished};
pub use writer::ResultLogWriter;

/// Header line prefix.
pub const LOG_PREFIX: &str = "#VVR:";

/// Format version written and accepted.
pub const LOG_VERSION: u32 = 1;

/// Date stamp appended to a results file name.
pub const RUNDATE_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Result type for result log operations.
pub type ResultLogResult<T> = Result<T, ResultLogError>;

/// Errors reading or writing a result log.
#[derive(Debug, thiserror::Error)]
pub enum ResultLogError {
    /// Filesystem error on a log file.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A record or header could not be encoded or decoded.
    #[error("malformed result log entry in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The file declares a format version this reader does not accept.
    #[error("unsupported result log version {found} in {path} (expected {LOG_VERSION})")]
    UnsupportedVersion { path: PathBuf, found: String },

    /// The file has no version header at all.
    #[error("corrupt result log or older format: {0}")]
    MissingVersion(PathBuf),
}

/// File-level attributes stored on the `Attrs` line.
pub type LogAttrs = serde_json::Map<String, serde_json::Value>;

/// One serialized test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    pub name: String,
    pub root: String,
    pub path: String,

    #[serde(default)]
    pub keywords: Vec<String>,

    #[serde(default)]
    pub params: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub paramset: BTreeMap<String, Vec<Vec<String>>>,

    #[serde(default)]
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,

    #[serde(default)]
    pub analyze: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Staging>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencySpec>,

    pub attrs: TestStatus,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub hasdependent: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depdirs: Vec<(Option<String>, String)>,
}

impl TestRecord {
    /// Captures a test. With `extended`, the dependent flag and dependency
    /// directories are included too.
    pub fn from_case(tc: &TestCase, extended: bool) -> Self {
        let spec = tc.spec();
        Self {
            name: spec.id.name.clone(),
            root: spec.root.clone(),
            path: spec.id.filepath.clone(),
            keywords: spec.keywords.clone(),
            params: spec.id.params.clone(),
            paramset: spec.paramset.clone(),
            command: spec.command.clone(),
            timeout: spec.timeout,
            analyze: spec.analyze,
            stage: spec.id.staged.clone(),
            depends_on: spec.depends_on.clone(),
            attrs: tc.status.clone(),
            hasdependent: extended && tc.has_dependent(),
            depdirs: if extended {
                tc.dep_directories().to_vec()
            } else {
                Vec::new()
            },
        }
    }

    pub fn into_case(self) -> TestCase {
        let id = TestId::new(self.path, self.name)
            .with_params(self.params)
            .with_staging(self.stage);

        let mut spec = TestSpec::new(id, self.command)
            .with_root(self.root)
            .with_keywords(self.keywords)
            .with_timeout(self.timeout)
            .with_analyze(self.analyze);
        spec.paramset = self.paramset;
        spec.depends_on = self.depends_on;

        let mut tc = TestCase::new(spec);
        tc.status = self.attrs;
        if self.hasdependent {
            tc.set_has_dependent();
        }
        for (pattern, xdir) in self.depdirs {
            tc.add_dep_directory(pattern, xdir);
        }
        tc
    }
}

/// Formats a timestamp as a results-file rundate.
pub fn format_rundate<Tz: TimeZone>(when: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    when.format(RUNDATE_FORMAT).to_string()
}

/// Rundate for the current local time.
pub fn current_rundate() -> String {
    format_rundate(&Local::now())
}

/// `base.rundate`
pub fn results_file_path(base: &Path, rundate: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(rundate);
    PathBuf::from(name)
}

/// Newest `testlist.<rundate>` file directly under `dir`.
///
/// Rundates sort lexically, so the greatest name is the latest run.
pub fn latest_results_file(dir: &Path) -> Option<PathBuf> {
    let matcher = globset::Glob::new("testlist.*").ok()?.compile_matcher();
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
        .map(|entry| entry.path())
        .filter(|path| path.file_name().is_some_and(|n| matcher.is_match(n)))
        .max_by(|a, b| a.file_name().cmp(&b.file_name()))
}

/// `["<ctime>", <epoch>]` as written on `Start` and `Finish` lines.
pub(crate) fn datestamp() -> serde_json::Value {
    let now = Local::now();
    let ctime = now.format("%a %b %e %H:%M:%S %Y").to_string();
    let epoch = now.timestamp_millis() as f64 / 1000.0;
    serde_json::json!([ctime, epoch])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcase::Dependency;

    #[test]
    fn test_results_file_path() {
        let p = results_file_path(Path::new("/tmp/run/testlist"), "2026-01-02_03:04:05");
        assert_eq!(p, PathBuf::from("/tmp/run/testlist.2026-01-02_03:04:05"));
    }

    #[test]
    fn test_latest_results_file() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(latest_results_file(dir.path()), None);

        for name in ["testlist.2026-01-02_03:04:05", "testlist.2026-02-01_00:00:00", "other.txt"] {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        std::fs::create_dir(dir.path().join("testlist.2099-01-01_00:00:00")).unwrap();

        assert_eq!(
            latest_results_file(dir.path()),
            Some(dir.path().join("testlist.2026-02-01_00:00:00"))
        );
    }

    #[test]
    fn test_format_rundate() {
        let when = chrono::Utc.with_ymd_and_hms(2026, 3, 7, 14, 5, 9).unwrap();
        assert_eq!(format_rundate(&when), "2026-03-07_14:05:09");
    }

    #[test]
    fn test_record_keeps_extended_info() {
        let a = TestCase::new(TestSpec::new(TestId::new("d/a.vvt", "a"), "true"));
        let mut b = TestCase::new(
            TestSpec::new(TestId::new("d/b.vvt", "b"), "./run.sh")
                .with_keywords(vec!["fast".into()])
                .with_timeout(Some(30)),
        );
        b.set_has_dependent();
        b.add_dependency(Dependency::on(a.key()).with_pattern("a"), Some("d/a".into()));

        let plain = TestRecord::from_case(&b, false);
        assert!(!plain.hasdependent);
        assert!(plain.depdirs.is_empty());

        let rec = TestRecord::from_case(&b, true);
        let line = serde_json::to_string(&rec).unwrap();
        assert!(!line.contains('\n'));

        let back: TestRecord = serde_json::from_str(&line).unwrap();
        let tc = back.into_case();
        assert_eq!(tc.key(), b.key());
        assert!(tc.has_dependent());
        assert_eq!(tc.dep_directories(), &[(Some("a".to_string()), "d/a".to_string())]);
        assert_eq!(tc.spec().timeout, Some(30));
        assert_eq!(tc.spec().command, "./run.sh");
    }
}

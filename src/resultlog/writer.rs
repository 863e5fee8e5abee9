use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{
    LOG_PREFIX, LOG_VERSION, LogAttrs, ResultLogError, ResultLogResult, TestRecord, datestamp,
};
use crate::testcase::TestCase;

/// Writes a result log.
///
/// The file is reopened in append mode for every record, so a crash at any
/// point leaves every completed line on disk.
#[derive(Debug, Clone)]
pub struct ResultLogWriter {
    path: PathBuf,
}

impl ResultLogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates (or truncates) the file and writes the header.
    pub fn start(&self, attrs: &LogAttrs) -> ResultLogResult<()> {
        let attrs_json = serde_json::to_string(attrs).map_err(|source| self.json_err(source))?;

        let mut fp = File::create(&self.path).map_err(|source| self.io_err(source))?;
        let header = format!(
            "{p} Version = {v}\n{p} Start = {s}\n{p} Attrs = {a}\n\n",
            p = LOG_PREFIX,
            v = LOG_VERSION,
            s = datestamp(),
            a = attrs_json,
        );
        fp.write_all(header.as_bytes())
            .map_err(|source| self.io_err(source))
    }

    pub fn add_include(&self, include: &str) -> ResultLogResult<()> {
        self.append_line(&format!("{} Include = {}", LOG_PREFIX, include))
    }

    pub fn include_completed(&self, include: &str) -> ResultLogResult<()> {
        self.append_line(&format!("{} Completed = {}", LOG_PREFIX, include))
    }

    pub fn append(&self, tc: &TestCase, extended: bool) -> ResultLogResult<()> {
        let rec = TestRecord::from_case(tc, extended);
        let line = serde_json::to_string(&rec).map_err(|source| self.json_err(source))?;
        self.append_line(&line)
    }

    pub fn finish(&self) -> ResultLogResult<()> {
        self.append_line(&format!("\n{} Finish = {}", LOG_PREFIX, datestamp()))
    }

    fn append_line(&self, line: &str) -> ResultLogResult<()> {
        let mut fp = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|source| self.io_err(source))?;
        writeln!(fp, "{}", line).map_err(|source| self.io_err(source))
    }

    fn io_err(&self, source: std::io::Error) -> ResultLogError {
        ResultLogError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn json_err(&self, source: serde_json::Error) -> ResultLogError {
        ResultLogError::Json {
            path: self.path.clone(),
            source,
        }
    }
}

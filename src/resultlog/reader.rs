use std::fs;
use std::path::{Path, PathBuf};

use indexmap::{IndexMap, IndexSet};
use tracing::{debug, warn};

use super::{
    LOG_PREFIX, LOG_VERSION, LogAttrs, ResultLogError, ResultLogResult, TestRecord,
};
use crate::testcase::{TestCase, TestKey, TestList};

/// Contents of a result log after merging its open includes.
#[derive(Debug, Clone, Default)]
pub struct ResultLog {
    pub version: Option<u32>,

    /// Epoch seconds of the `Start` line.
    pub start: Option<f64>,

    pub attrs: LogAttrs,

    /// Epoch seconds of the `Finish` line.
    pub finish: Option<f64>,

    /// Last record seen for each test.
    pub tests: IndexMap<TestKey, TestCase>,
}

impl ResultLog {
    pub fn is_finished(&self) -> bool {
        self.finish.is_some()
    }

    pub fn attr_str(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).and_then(|v| v.as_str())
    }

    /// Moves the tests into a [`TestList`].
    pub fn into_test_list(self) -> TestList {
        let mut list = TestList::new();
        for (_, tc) in self.tests {
            list.upsert(tc);
        }
        list
    }
}

enum Line<'a> {
    Header(&'a str, &'a str),
    Record(&'a str),
}

fn classify(line: &str) -> Option<Line<'_>> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix(LOG_PREFIX) {
        let (key, value) = rest.split_once('=')?;
        Some(Line::Header(key.trim(), value.trim()))
    } else if line.is_empty() {
        None
    } else {
        Some(Line::Record(line))
    }
}

/// Reads result logs.
pub struct ResultLogReader;

impl ResultLogReader {
    /// Reads a log, merging included child logs that are not marked
    /// completed. Missing or unreadable children are ignored.
    pub fn read(path: &Path) -> ResultLogResult<ResultLog> {
        let text = fs::read_to_string(path).map_err(|source| ResultLogError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut log = ResultLog::default();
        let mut includes: IndexSet<String> = IndexSet::new();

        for line in text.lines().filter_map(classify) {
            match line {
                Line::Header("Version", v) => {
                    let found = v.parse::<u32>().ok();
                    if found != Some(LOG_VERSION) {
                        return Err(ResultLogError::UnsupportedVersion {
                            path: path.to_path_buf(),
                            found: v.to_string(),
                        });
                    }
                    log.version = found;
                }
                Line::Header("Start", v) => log.start = parse_datestamp(v),
                Line::Header("Attrs", v) => {
                    log.attrs =
                        serde_json::from_str(v).map_err(|source| ResultLogError::Json {
                            path: path.to_path_buf(),
                            source,
                        })?;
                }
                Line::Header("Include", v) => {
                    includes.insert(v.to_string());
                }
                Line::Header("Completed", v) => {
                    includes.shift_remove(v);
                }
                Line::Header("Finish", v) => log.finish = parse_datestamp(v),
                Line::Header(other, _) => debug!("Ignoring unknown header '{}'", other),
                Line::Record(json) => match serde_json::from_str::<TestRecord>(json) {
                    Ok(rec) => {
                        let tc = rec.into_case();
                        log.tests.insert(tc.key(), tc);
                    }
                    Err(e) => warn!("Skipping malformed record in {}: {}", path.display(), e),
                },
            }
        }

        if log.version.is_none() {
            return Err(ResultLogError::MissingVersion(path.to_path_buf()));
        }

        for incl in includes {
            let child = resolve_include(path, &incl);
            if !child.exists() {
                continue;
            }
            if let Some(sub) = Self::read_lenient(&child) {
                log.tests.extend(sub.tests);
            }
        }

        Ok(log)
    }

    /// Like [`read`](Self::read), but any failure reads as an empty log.
    ///
    /// Used while polling logs that a batch job may be writing concurrently.
    pub fn read_lenient(path: &Path) -> Option<ResultLog> {
        match Self::read(path) {
            Ok(log) => Some(log),
            Err(e) => {
                debug!("Ignoring unreadable result log: {}", e);
                None
            }
        }
    }
}

fn resolve_include(log_path: &Path, incl: &str) -> PathBuf {
    let p = Path::new(incl);
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match log_path.parent() {
        Some(dir) => dir.join(p),
        None => p.to_path_buf(),
    }
}

fn parse_datestamp(value: &str) -> Option<f64> {
    let v: serde_json::Value = serde_json::from_str(value).ok()?;
    v.get(1)?.as_f64()
}

/// Whether the file exists and carries a `Finish` line. Never fails.
pub fn file_is_marked_finished(path: &Path) -> bool {
    let Ok(text) = fs::read_to_string(path) else {
        return false;
    };
    text.lines().filter_map(classify).any(|line| {
        matches!(line, Line::Header("Finish", v) if parse_datestamp(v).is_some())
    })
}

//! Batch file layout under the results directory.
//!
//! ```text
//! TestResults/
//! ├── testlist.<rundate>          parent result log
//! ├── batchset0/                  batch ids 0..=24
//! │   ├── testlist.3              tests of job 3
//! │   ├── testlist.3.<rundate>    results written by job 3
//! │   ├── qbat.3                  job script
//! │   └── qbat-out.3              job stdout/stderr
//! └── batchset1/                  batch ids 25..=74
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::resultlog::results_file_path;

const SUBDIR_PREFIX: &str = "batchset";

/// Computes batch file paths from a batch id.
#[derive(Debug, Clone)]
pub struct BatchFileNamer {
    root: PathBuf,
}

impl BatchFileNamer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `batchset<round(id / 50)>`
    pub fn subdir_name(batch_id: usize) -> String {
        let n = (batch_id as f64 / 50.0 + 0.5) as usize;
        format!("{}{}", SUBDIR_PREFIX, n)
    }

    pub fn subdir(&self, batch_id: usize) -> PathBuf {
        self.root.join(Self::subdir_name(batch_id))
    }

    pub fn testlist_path(&self, batch_id: usize) -> PathBuf {
        self.file(batch_id, "testlist")
    }

    pub fn script_path(&self, batch_id: usize) -> PathBuf {
        self.file(batch_id, "qbat")
    }

    pub fn output_path(&self, batch_id: usize) -> PathBuf {
        self.file(batch_id, "qbat-out")
    }

    /// Results file a job writes for the given parent rundate.
    pub fn results_path(&self, batch_id: usize, rundate: &str) -> PathBuf {
        results_file_path(&self.testlist_path(batch_id), rundate)
    }

    /// Results file path relative to the root, as recorded in the parent
    /// log's `Include` lines.
    pub fn relative_results_path(batch_id: usize, rundate: &str) -> String {
        format!("{}/testlist.{}.{}", Self::subdir_name(batch_id), batch_id, rundate)
    }

    fn file(&self, batch_id: usize, base: &str) -> PathBuf {
        self.subdir(batch_id).join(format!("{}.{}", base, batch_id))
    }

    /// Existing `batchset*` directories.
    pub fn glob_batch_directories(&self) -> io::Result<Vec<PathBuf>> {
        let mut dirs = Vec::new();
        if !self.root.is_dir() {
            return Ok(dirs);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(SUBDIR_PREFIX) && entry.path().is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// Removes batch directories left by an earlier run. Failures are
    /// logged and skipped.
    pub fn remove_batch_directories(&self) {
        let dirs = match self.glob_batch_directories() {
            Ok(d) => d,
            Err(e) => {
                warn!("Cannot list {}: {}", self.root.display(), e);
                return;
            }
        };
        for d in dirs {
            info!("rm -rf {}", d.display());
            if let Err(e) = fs::remove_dir_all(&d) {
                warn!("Failed to remove {}: {}", d.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_subdir_bucketing() {
        assert_eq!(BatchFileNamer::subdir_name(0), "batchset0");
        assert_eq!(BatchFileNamer::subdir_name(24), "batchset0");
        assert_eq!(BatchFileNamer::subdir_name(25), "batchset1");
        assert_eq!(BatchFileNamer::subdir_name(74), "batchset1");
        assert_eq!(BatchFileNamer::subdir_name(75), "batchset2");
    }

    #[test]
    fn test_paths() {
        let n = BatchFileNamer::new("/r");
        assert_eq!(n.testlist_path(3), PathBuf::from("/r/batchset0/testlist.3"));
        assert_eq!(n.script_path(30), PathBuf::from("/r/batchset1/qbat.30"));
        assert_eq!(n.output_path(3), PathBuf::from("/r/batchset0/qbat-out.3"));
        assert_eq!(
            n.results_path(3, "2026-01-01_00:00:00"),
            PathBuf::from("/r/batchset0/testlist.3.2026-01-01_00:00:00")
        );
        assert_eq!(
            n.root().join(BatchFileNamer::relative_results_path(3, "x")),
            n.results_path(3, "x")
        );
    }

    #[test]
    fn test_remove_batch_directories() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("batchset0/sub")).unwrap();
        fs::create_dir(dir.path().join("batchset3")).unwrap();
        fs::create_dir(dir.path().join("heat")).unwrap();
        fs::write(dir.path().join("batchset.txt"), "").unwrap();

        let n = BatchFileNamer::new(dir.path());
        assert_eq!(n.glob_batch_directories().unwrap().len(), 2);

        n.remove_batch_directories();
        assert!(n.glob_batch_directories().unwrap().is_empty());
        assert!(dir.path().join("heat").exists());
        assert!(dir.path().join("batchset.txt").exists());
    }

    #[test]
    fn test_missing_root() {
        let n = BatchFileNamer::new("/nonexistent/vvrun/results");
        assert!(n.glob_batch_directories().unwrap().is_empty());
    }
}

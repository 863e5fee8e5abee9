//! Test and dependency model.
//!
//! A [`TestCase`] pairs an immutable [`TestSpec`] (identity, command, size,
//! declared dependencies) with a mutable [`TestStatus`] and the dependency
//! edges wired up at scheduling time. Test cases live in a [`TestList`],
//! which owns them and answers graph questions such as
//! [`is_blocked`](TestList::is_blocked) that need to look across tests.
//!
//! ```text
//!  TestList ──owns──► TestCase ──spec──► TestSpec (TestId, command, size)
//!                        │
//!                        ├──status──► TestStatus (NotRun/Running/Done, skip)
//!                        │
//!                        └──deps────► Dependency ──target──► TestKey
//! ```

pub mod depend;
pub mod id;
pub mod list;
pub mod status;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use depend::{Dependency, DependencySpec, Multiplicity, ResultExpr};
pub use id::{Staging, TestId, TestKey};
pub use list::TestList;
pub use status::{ResultStatus, RunState, SkipReason, TestResult, TestStatus};

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while building or wiring up the test model.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A result expression contained a word that is not a result status.
    #[error("invalid result word in dependency expression: {0}")]
    InvalidResultWord(String),

    /// A dependency multiplicity was not `*`, `?`, `+` or an integer.
    #[error("invalid dependency match count: {0}")]
    InvalidMultiplicity(String),

    /// Two tests resolved to the same identity.
    #[error("duplicate test identity: {0}")]
    DuplicateTest(String),
}

/// Processor and device count of a test or a job.
pub type Size = (usize, usize);

/// Static description of a test instance.
#[derive(Debug, Clone)]
pub struct TestSpec {
    pub id: TestId,

    /// Directory the file path is relative to.
    pub root: String,

    pub keywords: Vec<String>,

    /// Shell command line run from the execute directory.
    pub command: String,

    /// Timeout declared by the test itself, if any.
    pub timeout: Option<u64>,

    /// Aggregator over the other members of its parameterized family.
    pub analyze: bool,

    /// For analyze tests: the parameter sets of the family.
    pub paramset: BTreeMap<String, Vec<Vec<String>>>,

    pub depends_on: Vec<DependencySpec>,
}

impl TestSpec {
    pub fn new(id: TestId, command: impl Into<String>) -> Self {
        Self {
            id,
            root: ".".to_string(),
            keywords: Vec::new(),
            command: command.into(),
            timeout: None,
            analyze: false,
            paramset: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_keywords(mut self, keywords: Vec<String>) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<u64>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_analyze(mut self, analyze: bool) -> Self {
        self.analyze = analyze;
        self
    }

    pub fn with_dependency(mut self, dep: DependencySpec) -> Self {
        self.depends_on.push(dep);
        self
    }

    pub fn has_keyword(&self, word: &str) -> bool {
        self.keywords.iter().any(|k| k == word)
    }

    pub fn is_last_stage(&self) -> bool {
        self.id.staged.as_ref().is_some_and(|s| s.last)
    }

    /// Declared size, `np >= 1` and `ndevice >= 0`.
    pub fn size(&self) -> Size {
        let np = parse_count(self.id.params.get("np"), 1).max(1);
        let nd = parse_count(self.id.params.get("ndevice"), 0);
        (np as usize, nd as usize)
    }
}

fn parse_count(value: Option<&String>, default: i64) -> i64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(default)
        .max(0)
}

/// A test plus its run status and wired dependencies.
#[derive(Debug, Clone)]
pub struct TestCase {
    spec: TestSpec,
    pub status: TestStatus,
    deps: Vec<Dependency>,
    has_dependent: bool,
    dep_dirs: Vec<(Option<String>, String)>,
}

impl TestCase {
    pub fn new(spec: TestSpec) -> Self {
        let mut status = TestStatus::new();
        status.timeout = spec.timeout;
        Self {
            spec,
            status,
            deps: Vec::new(),
            has_dependent: false,
            dep_dirs: Vec::new(),
        }
    }

    pub fn spec(&self) -> &TestSpec {
        &self.spec
    }

    pub fn key(&self) -> TestKey {
        self.spec.id.key()
    }

    pub fn display_string(&self) -> String {
        self.spec.id.display_string()
    }

    pub fn size(&self) -> Size {
        self.spec.size()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.deps
    }

    pub fn num_dependencies(&self) -> usize {
        self.deps.len()
    }

    /// Adds a dependency, replacing any existing edge to the same test.
    pub fn add_dependency(&mut self, dep: Dependency, target_exec_dir: Option<String>) {
        if let Some(target) = dep.target() {
            if let Some(existing) = self
                .deps
                .iter_mut()
                .find(|d| d.target() == Some(target))
            {
                *existing = dep;
                return;
            }
        }

        if let (Some(xdir), Dependency::Test { pattern, .. }) = (target_exec_dir, &dep) {
            self.add_dep_directory(pattern.clone(), xdir);
        }
        self.deps.push(dep);
    }

    pub fn set_has_dependent(&mut self) {
        self.has_dependent = true;
    }

    pub fn has_dependent(&self) -> bool {
        self.has_dependent
    }

    pub fn add_dep_directory(&mut self, pattern: Option<String>, exec_dir: String) {
        if exec_dir.is_empty() {
            return;
        }
        match self.dep_dirs.iter_mut().find(|(_, d)| *d == exec_dir) {
            Some(entry) => entry.0 = pattern,
            None => self.dep_dirs.push((pattern, exec_dir)),
        }
    }

    /// `(match pattern, execute directory)` of each prerequisite.
    pub fn dep_directories(&self) -> &[(Option<String>, String)] {
        &self.dep_dirs
    }
}

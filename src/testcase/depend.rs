//! Dependency edges and prerequisite resolution by glob pattern.
//!
//! # Pattern Tiers
//!
//! A `depends on` pattern written in a test file is matched against the
//! display strings of all known tests. Several candidate patterns are tried
//! and the first one matching anything wins:
//!
//! | Tier | Pattern | Meaning |
//! |------|---------|---------|
//! | 1 | `normpath(srcdir/pat)` | sibling of the dependent test |
//! | 2 | `srcdir/*/pat` | inside an immediate subdirectory |
//! | 3 | `pat` | anywhere, matched exactly |
//! | 4 | `*pat` | anywhere, matched as a suffix |
//!
//! Globs follow fnmatch rules, so `*` also matches `/`.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::id::normalize_path;
use super::status::ResultStatus;
use super::{ModelError, TestCase, TestKey};

/// Reason attached to a dependency whose match criteria were not met.
pub const FAILED_MATCH_REASON: &str = "failed 'depends on' matching criteria";

/// Set of prerequisite result words a dependency accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultExpr {
    /// Any result, including not run.
    Any,
    /// One of the listed words.
    OneOf(BTreeSet<ResultStatus>),
}

impl ResultExpr {
    pub fn accepts(&self, status: ResultStatus) -> bool {
        match self {
            ResultExpr::Any => true,
            ResultExpr::OneOf(words) => words.contains(&status),
        }
    }
}

impl Default for ResultExpr {
    fn default() -> Self {
        ResultExpr::OneOf([ResultStatus::Pass, ResultStatus::Diff].into_iter().collect())
    }
}

impl FromStr for ResultExpr {
    type Err = ModelError;

    /// Parses a disjunction such as `pass or diff`, `fail|timeout` or `*`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed == "*" {
            return Ok(ResultExpr::Any);
        }

        let mut words = BTreeSet::new();
        for token in trimmed
            .split(|c: char| c == '|' || c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty() && *t != "or")
        {
            words.insert(token.parse::<ResultStatus>()?);
        }

        if words.is_empty() {
            return Err(ModelError::InvalidResultWord(s.to_string()));
        }
        Ok(ResultExpr::OneOf(words))
    }
}

/// How many tests a pattern is expected to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Multiplicity {
    /// `*`
    Any,
    /// `?`
    AtMostOne,
    /// `+`
    #[default]
    AtLeastOne,
    /// An explicit count.
    Exactly(usize),
}

impl Multiplicity {
    pub fn is_satisfied_by(&self, count: usize) -> bool {
        match self {
            Multiplicity::Any => true,
            Multiplicity::AtMostOne => count <= 1,
            Multiplicity::AtLeastOne => count > 0,
            Multiplicity::Exactly(n) => count == *n,
        }
    }
}

impl FromStr for Multiplicity {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "*" => Ok(Multiplicity::Any),
            "?" => Ok(Multiplicity::AtMostOne),
            "+" => Ok(Multiplicity::AtLeastOne),
            other => other
                .parse::<usize>()
                .map(Multiplicity::Exactly)
                .map_err(|_| ModelError::InvalidMultiplicity(other.to_string())),
        }
    }
}

/// A `depends on` declaration as written for a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub pattern: String,

    /// Accepted prerequisite results, e.g. `"pass or diff"`.
    #[serde(default)]
    pub result: Option<String>,

    /// Expected match count: `*`, `?`, `+` or an integer.
    #[serde(default)]
    pub expect: Option<String>,
}

impl DependencySpec {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            result: None,
            expect: None,
        }
    }

    pub fn result_expr(&self) -> Result<Option<ResultExpr>, ModelError> {
        self.result.as_deref().map(str::parse).transpose()
    }

    pub fn multiplicity(&self) -> Result<Multiplicity, ModelError> {
        match self.expect.as_deref() {
            Some(e) => e.parse(),
            None => Ok(Multiplicity::default()),
        }
    }
}

/// A wired dependency edge from a dependent test to a prerequisite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// Edge to a known test.
    Test {
        target: TestKey,
        pattern: Option<String>,
        accept: Option<ResultExpr>,
    },

    /// Sentinel for a dependency that can never be satisfied.
    Failed { reason: String },
}

impl Dependency {
    pub fn on(target: TestKey) -> Self {
        Dependency::Test {
            target,
            pattern: None,
            accept: None,
        }
    }

    pub fn failed() -> Self {
        Dependency::Failed {
            reason: FAILED_MATCH_REASON.to_string(),
        }
    }

    pub fn with_pattern(mut self, pat: impl Into<String>) -> Self {
        if let Dependency::Test { pattern, .. } = &mut self {
            *pattern = Some(pat.into());
        }
        self
    }

    pub fn with_accept(mut self, expr: Option<ResultExpr>) -> Self {
        if let Dependency::Test { accept, .. } = &mut self {
            *accept = expr;
        }
        self
    }

    pub fn target(&self) -> Option<&TestKey> {
        match self {
            Dependency::Test { target, .. } => Some(target),
            Dependency::Failed { .. } => None,
        }
    }

    /// Whether a prerequisite result word satisfies this edge.
    pub fn accepts(&self, status: ResultStatus) -> bool {
        match self {
            Dependency::Test { accept: None, .. } => ResultExpr::default().accepts(status),
            Dependency::Test {
                accept: Some(expr), ..
            } => expr.accepts(status),
            Dependency::Failed { .. } => false,
        }
    }
}

/// Finds the tests a `depends on` pattern refers to.
///
/// `srcdir` is the directory of the dependent test's source file relative to
/// the scan root. Returned keys follow the iteration order of `tests`.
pub fn find_tests_by_pattern<'a, I>(srcdir: &str, pattern: &str, tests: I) -> Vec<TestKey>
where
    I: IntoIterator<Item = &'a TestCase> + Clone,
{
    let prefix = match srcdir {
        "." | "" => String::new(),
        dir => format!("{}/", dir),
    };

    let tiers = [
        normalize_path(&format!("{}{}", prefix, pattern)),
        format!("{}*/{}", prefix, pattern),
        pattern.to_string(),
        format!("*{}", pattern),
    ];

    for tier in &tiers {
        let Some(matcher) = compile_glob(tier) else {
            continue;
        };

        let matched: Vec<&TestCase> = tests
            .clone()
            .into_iter()
            .filter(|tc| matcher.is_match(tc.display_string()))
            .collect();

        if !matched.is_empty() {
            return collect_matching_tests(&matched);
        }
    }

    Vec::new()
}

fn compile_glob(pattern: &str) -> Option<GlobMatcher> {
    match GlobBuilder::new(pattern).literal_separator(false).build() {
        Ok(glob) => Some(glob.compile_matcher()),
        Err(e) => {
            warn!("Ignoring invalid dependency pattern '{}': {}", pattern, e);
            None
        }
    }
}

/// Drops earlier stages when a match spans a staged family.
fn collect_matching_tests(matched: &[&TestCase]) -> Vec<TestKey> {
    let mut families: HashMap<TestKey, Vec<&TestCase>> = HashMap::new();
    for tc in matched.iter().filter(|tc| tc.spec().id.staged.is_some()) {
        families
            .entry(tc.spec().id.compressed_stage_key())
            .or_default()
            .push(tc);
    }

    matched
        .iter()
        .filter(|tc| {
            let family = families.get(&tc.spec().id.compressed_stage_key());
            match family {
                Some(members) if members.len() >= 2 => {
                    tc.spec().is_last_stage() || !members.iter().any(|m| m.spec().is_last_stage())
                }
                _ => true,
            }
        })
        .map(|tc| tc.key())
        .collect()
}

//! Insertion-ordered collection of test cases and dependency graph queries.

use std::collections::HashSet;

use indexmap::IndexMap;
use tracing::debug;

use super::depend::{Dependency, find_tests_by_pattern};
use super::status::SkipReason;
use super::{ModelError, ModelResult, TestCase, TestKey};

/// Owns every test of a run, keyed by identity.
#[derive(Debug, Clone, Default)]
pub struct TestList {
    tests: IndexMap<TestKey, TestCase>,
}

impl TestList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tc: TestCase) -> ModelResult<()> {
        let key = tc.key();
        if self.tests.contains_key(&key) {
            return Err(ModelError::DuplicateTest(tc.display_string()));
        }
        self.tests.insert(key, tc);
        Ok(())
    }

    /// Inserts or replaces a test.
    pub fn upsert(&mut self, tc: TestCase) {
        self.tests.insert(tc.key(), tc);
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn contains(&self, key: &TestKey) -> bool {
        self.tests.contains_key(key)
    }

    pub fn get(&self, key: &TestKey) -> Option<&TestCase> {
        self.tests.get(key)
    }

    pub fn get_mut(&mut self, key: &TestKey) -> Option<&mut TestCase> {
        self.tests.get_mut(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestCase> {
        self.tests.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TestCase> {
        self.tests.values_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &TestKey> {
        self.tests.keys()
    }

    /// Tests that are not skipped.
    pub fn active(&self) -> impl Iterator<Item = &TestCase> {
        self.tests.values().filter(|tc| !tc.status.is_skipped())
    }

    pub fn num_active(&self) -> usize {
        self.active().count()
    }

    /// Largest `(np, nd)` over the active tests, at least `(1, 0)`.
    pub fn max_size(&self) -> (usize, usize) {
        self.active().fold((1, 0), |(np, nd), tc| {
            let (tnp, tnd) = tc.size();
            (np.max(tnp), nd.max(tnd))
        })
    }

    /// Resolves every declared `depends on` pattern and wires analyze
    /// tests to the other members of their family.
    ///
    /// With `strict` unset, match-count expectations are not enforced, which
    /// is how a batch job re-reads a partial list.
    pub fn connect_dependencies(&mut self, strict: bool) -> ModelResult<()> {
        let mut edges: Vec<(TestKey, Dependency)> = Vec::new();

        for tc in self.tests.values() {
            let from = tc.key();
            let srcdir = source_directory(&tc.spec().id.filepath);

            for decl in &tc.spec().depends_on {
                let accept = decl.result_expr()?;
                let expect = decl.multiplicity()?;

                let found: Vec<TestKey> =
                    find_tests_by_pattern(srcdir, &decl.pattern, self.tests.values())
                        .into_iter()
                        .filter(|k| *k != from)
                        .collect();

                if strict && !expect.is_satisfied_by(found.len()) {
                    debug!(
                        "Dependency '{}' of {} matched {} tests",
                        decl.pattern,
                        tc.display_string(),
                        found.len()
                    );
                    edges.push((from.clone(), Dependency::failed()));
                    continue;
                }

                for target in found {
                    let dep = Dependency::on(target)
                        .with_pattern(decl.pattern.clone())
                        .with_accept(accept.clone());
                    edges.push((from.clone(), dep));
                }
            }
        }

        edges.extend(self.analyze_edges());

        for (from, dep) in edges {
            let target_dir = match dep.target().and_then(|t| self.tests.get_mut(t)) {
                Some(target) => {
                    target.set_has_dependent();
                    Some(target.spec().id.execute_directory())
                }
                None => None,
            };
            if let Some(tc) = self.tests.get_mut(&from) {
                tc.add_dependency(dep, target_dir);
            }
        }

        Ok(())
    }

    fn analyze_edges(&self) -> Vec<(TestKey, Dependency)> {
        let mut edges = Vec::new();

        for analyze in self.tests.values().filter(|tc| tc.spec().analyze) {
            let id = &analyze.spec().id;
            for member in self.tests.values() {
                let mid = &member.spec().id;
                if member.spec().analyze || mid.filepath != id.filepath || mid.name != id.name {
                    continue;
                }
                if member
                    .status
                    .skip
                    .is_some_and(|s| !s.causes_analyze_skip())
                {
                    continue;
                }
                edges.push((analyze.key(), Dependency::on(member.key())));
            }
        }

        edges
    }

    /// Skips analyze tests whose family has a member skipped for a reason
    /// that invalidates the aggregate.
    pub fn propagate_analyze_skips(&mut self) {
        let doomed: Vec<TestKey> = self
            .tests
            .values()
            .filter(|tc| tc.spec().analyze && !tc.status.is_skipped())
            .filter(|analyze| {
                let id = &analyze.spec().id;
                self.tests.values().any(|m| {
                    let mid = &m.spec().id;
                    !m.spec().analyze
                        && mid.filepath == id.filepath
                        && mid.name == id.name
                        && m.status.skip.is_some_and(|s| s.causes_analyze_skip())
                })
            })
            .map(|tc| tc.key())
            .collect();

        for key in doomed {
            if let Some(tc) = self.tests.get_mut(&key) {
                tc.status.mark_skipped(SkipReason::DepSkip);
            }
        }
    }

    pub fn is_blocked(&self, key: &TestKey) -> bool {
        self.first_blocking(key).is_some()
    }

    /// Reason the test is blocked, or an empty string.
    pub fn blocked_reason(&self, key: &TestKey) -> String {
        match self.first_blocking(key) {
            Some(Dependency::Failed { reason }) => reason.clone(),
            Some(Dependency::Test { target, .. }) => self
                .tests
                .get(target)
                .map(|t| t.display_string())
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Whether some prerequisite has settled, or will settle, on a result
    /// the test does not accept.
    pub fn will_never_run(&self, key: &TestKey) -> bool {
        let mut visiting = HashSet::new();
        self.never_runs(key, &mut visiting)
    }

    fn first_blocking(&self, key: &TestKey) -> Option<&Dependency> {
        let tc = self.tests.get(key)?;
        tc.dependencies().iter().find(|d| self.dependency_blocks(d))
    }

    fn dependency_blocks(&self, dep: &Dependency) -> bool {
        let target = match dep {
            Dependency::Failed { .. } => return true,
            Dependency::Test { target, .. } => target,
        };
        let Some(pre) = self.tests.get(target) else {
            return false;
        };

        let st = &pre.status;
        if st.is_done() || st.is_skipped() {
            !dep.accepts(st.result_status())
        } else if st.is_running() {
            true
        } else if self.will_never_run(target) {
            !dep.accepts(st.result_status())
        } else {
            true
        }
    }

    fn never_runs(&self, key: &TestKey, visiting: &mut HashSet<TestKey>) -> bool {
        if !visiting.insert(key.clone()) {
            return false;
        }

        let result = match self.tests.get(key) {
            Some(tc) => tc
                .dependencies()
                .iter()
                .any(|d| self.dependency_never_runs(d, visiting)),
            None => false,
        };

        visiting.remove(key);
        result
    }

    fn dependency_never_runs(&self, dep: &Dependency, visiting: &mut HashSet<TestKey>) -> bool {
        let target = match dep {
            Dependency::Failed { .. } => return true,
            Dependency::Test { target, .. } => target,
        };
        let Some(pre) = self.tests.get(target) else {
            return false;
        };

        let st = &pre.status;
        if st.is_done() || st.is_skipped() {
            !dep.accepts(st.result_status())
        } else if st.is_notrun() && self.never_runs(target, visiting) {
            !dep.accepts(st.result_status())
        } else {
            false
        }
    }
}

fn source_directory(filepath: &str) -> &str {
    match filepath.rfind('/') {
        Some(idx) => &filepath[..idx],
        None => ".",
    }
}

impl<'a> IntoIterator for &'a TestList {
    type Item = &'a TestCase;
    type IntoIter = indexmap::map::Values<'a, TestKey, TestCase>;

    fn into_iter(self) -> Self::IntoIter {
        self.tests.values()
    }
}

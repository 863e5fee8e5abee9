//! Packing tests into batch jobs.
//!
//! The grouper drains the scheduler backlog in `(np, timeout)` descending
//! order and packs tests first-fit into groups of equal size whose summed
//! timeout stays within the batch length:
//!
//! ```text
//!  backlog:  c(4,900) a(4,600) b(4,600) d(1,1200) e(1,300) f(1,0)
//!
//!  group 0: np=4  tsum=1500  [c, a]
//!  group 1: np=4  tsum=600   [b]          c+a+b would exceed 1800
//!  group 2: np=1  tsum=1500  [d, e]       size changed
//!  group 3: np=1  tsum=75600 [f]          no timeout: runs alone for 21 h
//! ```
//!
//! Tests with dependencies always get a group of their own so that a job
//! never waits on another job's results.

use tracing::debug;

use crate::orchestrator::scheduler::DirectScheduler;
use crate::testcase::{Size, TestKey};

/// Queue time given to a job whose tests have no timeout.
pub const NO_LIMIT_QUEUE_TIME: u64 = 21 * 60 * 60;

/// Default target for the summed timeout of one job.
pub const DEFAULT_BATCH_LENGTH: u64 = 30 * 60;

/// Tests packed for one batch job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchGroup {
    pub group_id: usize,
    pub size: Size,
    pub tsum: u64,
    pub tests: Vec<TestKey>,
}

/// First-fit packer.
#[derive(Debug, Clone)]
pub struct BatchGrouper {
    batch_length: u64,
    max_timeout: Option<u64>,
    next_group_id: usize,
}

impl BatchGrouper {
    pub fn new(batch_length: Option<u64>, max_timeout: Option<u64>) -> Self {
        Self {
            batch_length: batch_length.unwrap_or(DEFAULT_BATCH_LENGTH),
            max_timeout: max_timeout.filter(|t| *t > 0),
            next_group_id: 0,
        }
    }

    /// Drains the scheduler backlog into groups, ordered by
    /// `(tsum, size, group id)` descending.
    pub fn construct(&mut self, sched: &mut DirectScheduler) -> Vec<BatchGroup> {
        sched.sort_by_size_and_timeout();

        let mut groups: Vec<BatchGroup> = Vec::new();
        let mut current: Option<BatchGroup> = None;

        while let Some(key) = sched.get_next_test() {
            let Some(tc) = sched.tests().get(&key) else {
                continue;
            };
            let size = tc.size();
            let timeout = tc.status.timeout_secs();

            if tc.num_dependencies() > 0 {
                let g = self.new_group(size, timeout, vec![key]);
                groups.push(g);
            } else if timeout < 1 {
                let g = self.new_group(size, NO_LIMIT_QUEUE_TIME, vec![key]);
                groups.push(g);
            } else {
                let full = current.as_ref().is_some_and(|g| {
                    !g.tests.is_empty()
                        && (g.size != size || g.tsum + timeout > self.batch_length)
                });
                if full {
                    groups.extend(current.take());
                }
                let g = current.get_or_insert_with(|| self.new_group(size, 0, Vec::new()));
                g.tests.push(key);
                g.tsum += timeout;
            }
        }
        groups.extend(current.filter(|g| !g.tests.is_empty()));

        groups.sort_by(|a, b| {
            (b.tsum, b.size, b.group_id).cmp(&(a.tsum, a.size, a.group_id))
        });
        debug!("Grouped tests into {} batches", groups.len());
        groups
    }

    fn new_group(&mut self, size: Size, tsum: u64, tests: Vec<TestKey>) -> BatchGroup {
        let group_id = self.next_group_id;
        self.next_group_id += 1;
        BatchGroup {
            group_id,
            size,
            tsum,
            tests,
        }
    }

    /// Queue time for a job running tests with the given timeouts.
    pub fn compute_queue_time(&self, timeouts: impl IntoIterator<Item = u64>) -> u64 {
        let sum: u64 = timeouts.into_iter().sum();
        let qtime = if sum == 0 {
            NO_LIMIT_QUEUE_TIME
        } else {
            apply_queue_timeout_bump(sum)
        };
        match self.max_timeout {
            Some(max) => qtime.min(max),
            None => qtime,
        }
    }
}

/// Adds queue overhead: generous for short jobs, at most 15 minutes.
pub fn apply_queue_timeout_bump(qtime: u64) -> u64 {
    if qtime < 60 {
        qtime + 60
    } else if qtime < 10 * 60 {
        qtime * 2
    } else if qtime < 30 * 60 {
        qtime + (15 * 60).min(10 * 60 + ((qtime - 10 * 60) as f64 * 0.3) as u64)
    } else {
        qtime + 15 * 60
    }
}

/// Timeout passed to the only test of a job, leaving room for job startup
/// and teardown inside the queue time.
pub fn single_test_timeout(qtime: u64) -> u64 {
    if qtime < 600 {
        (qtime as f64 * 0.9) as u64
    } else {
        qtime - 120
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;
    use crate::testcase::{DependencySpec, TestCase, TestId, TestList, TestSpec};

    fn spec(name: &str, np: usize, timeout: u64) -> TestSpec {
        let mut p = BTreeMap::new();
        p.insert("np".to_string(), np.to_string());
        TestSpec::new(TestId::new(format!("{}.vvt", name), name).with_params(p), "true")
            .with_timeout(Some(timeout))
    }

    fn sched(specs: Vec<TestSpec>) -> DirectScheduler {
        let mut l = TestList::new();
        for s in specs {
            l.insert(TestCase::new(s)).unwrap();
        }
        DirectScheduler::new(l, false).unwrap()
    }

    fn names(s: &DirectScheduler, g: &BatchGroup) -> Vec<String> {
        g.tests
            .iter()
            .map(|k| s.tests().get(k).unwrap().spec().id.name.clone())
            .collect()
    }

    #[test]
    fn test_example_layout() {
        let mut s = sched(vec![
            spec("a", 4, 600),
            spec("b", 4, 600),
            spec("c", 4, 900),
            spec("d", 1, 1200),
            spec("e", 1, 300),
            spec("f", 1, 0),
        ]);
        let groups = BatchGrouper::new(None, None).construct(&mut s);

        let summary: Vec<(u64, Size, Vec<String>)> = groups
            .iter()
            .map(|g| (g.tsum, g.size, names(&s, g)))
            .collect();
        assert_eq!(
            summary,
            vec![
                (NO_LIMIT_QUEUE_TIME, (1, 0), vec!["f".to_string()]),
                (1500, (4, 0), vec!["c".to_string(), "a".to_string()]),
                (1500, (1, 0), vec!["d".to_string(), "e".to_string()]),
                (600, (4, 0), vec!["b".to_string()]),
            ]
        );
        assert!(s.backlog().is_empty());
    }

    #[test]
    fn test_dependent_tests_are_singletons() {
        let mut s = sched(vec![
            spec("pre", 1, 10),
            spec("post", 1, 10).with_dependency(DependencySpec::new("pre*")),
            spec("other", 1, 10),
        ]);
        let groups = BatchGrouper::new(None, None).construct(&mut s);
        assert_eq!(groups.len(), 2);

        let post = groups
            .iter()
            .find(|g| names(&s, g) == vec!["post"])
            .unwrap();
        assert_eq!(post.tests.len(), 1);
        let rest = groups.iter().find(|g| g.group_id != post.group_id).unwrap();
        assert_eq!(names(&s, rest), vec!["pre", "other"]);
    }

    #[test]
    fn test_zero_batch_length_gives_one_test_per_group() {
        let mut s = sched(vec![spec("a", 1, 10), spec("b", 1, 10), spec("c", 1, 10)]);
        let groups = BatchGrouper::new(Some(0), None).construct(&mut s);
        assert_eq!(groups.len(), 3);
        assert!(groups.iter().all(|g| g.tests.len() == 1));
    }

    #[test]
    fn test_equal_timeouts_fill_groups() {
        let specs = (0..10).map(|i| spec(&format!("t{}", i), 1, 200)).collect();
        let mut s = sched(specs);
        let groups = BatchGrouper::new(Some(1000), None).construct(&mut s);

        assert_eq!(groups.len(), 2);
        for g in &groups {
            assert_eq!(g.tests.len(), 5);
            assert_eq!(g.tsum, 1000);
        }
    }

    #[test]
    fn test_queue_time() {
        let g = BatchGrouper::new(None, None);
        assert_eq!(g.compute_queue_time([0, 0]), NO_LIMIT_QUEUE_TIME);
        assert_eq!(g.compute_queue_time([30]), 90);
        assert_eq!(g.compute_queue_time([100, 200]), 600);
        assert_eq!(g.compute_queue_time([1200]), 1200 + 780);
        assert_eq!(g.compute_queue_time([3600]), 4500);

        let capped = BatchGrouper::new(None, Some(1000));
        assert_eq!(capped.compute_queue_time([3600]), 1000);
        assert_eq!(capped.compute_queue_time([0]), 1000);
    }

    #[test]
    fn test_single_test_timeout() {
        assert_eq!(single_test_timeout(100), 90);
        assert_eq!(single_test_timeout(600), 480);
        assert_eq!(single_test_timeout(4500), 4380);
    }

    proptest! {
        #[test]
        fn test_groups_respect_size_and_length(
            tests in proptest::collection::vec((1usize..4, 0u64..900), 1..30),
            qlen in 0u64..2400,
        ) {
            let specs: Vec<TestSpec> = tests
                .iter()
                .enumerate()
                .map(|(i, (np, t))| spec(&format!("t{}", i), *np, *t))
                .collect();
            let total = specs.len();
            let mut s = sched(specs);
            let groups = BatchGrouper::new(Some(qlen), None).construct(&mut s);

            let mut seen = 0;
            for g in &groups {
                prop_assert!(!g.tests.is_empty());
                seen += g.tests.len();
                for k in &g.tests {
                    prop_assert_eq!(s.tests().get(k).unwrap().size(), g.size);
                }
                if g.tests.len() > 1 {
                    prop_assert!(g.tsum <= qlen);
                }
            }
            prop_assert_eq!(seen, total);

            for pair in groups.windows(2) {
                prop_assert!(
                    (pair[0].tsum, pair[0].size, pair[0].group_id)
                        > (pair[1].tsum, pair[1].size, pair[1].group_id)
                );
            }
        }
    }
}

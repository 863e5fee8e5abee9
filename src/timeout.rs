//! Per-test timeout computation.
//!
//! Each active test gets an effective timeout, in this order of preference:
//!
//! | Source | Timeout |
//! |--------|---------|
//! | Declared by the test | as declared |
//! | Timed out in the previous run | 1 h; `long` tests 4 h, 4×runtime, at most 5 days |
//! | Previous runtime `r` | `r < 120`: max(120, 2r); `r < 300`: max(300, 1.5r); `r < 4 h`: 1.5r; else 1.3r |
//! | Nothing known | 1 h; `long` tests 5 h |
//!
//! Then the command-line override replaces it, the multiplier scales it
//! (never below one second) and the max timeout caps it. Zero means no
//! limit and is neither scaled nor capped.

use tracing::debug;

use crate::config::TimeoutConfig;
use crate::resultlog::ResultLog;
use crate::testcase::{ResultStatus, TestList, TestSpec};

const HOUR: u64 = 60 * 60;
const DAY: u64 = 24 * HOUR;

/// Computes and assigns test timeouts.
#[derive(Debug, Clone, Default)]
pub struct TimeHandler {
    cmdline_timeout: Option<u64>,
    multiplier: Option<f64>,
    max_timeout: Option<u64>,
}

impl TimeHandler {
    pub fn new(cmdline_timeout: Option<u64>, multiplier: Option<f64>, max_timeout: Option<u64>) -> Self {
        Self {
            cmdline_timeout,
            multiplier: multiplier.filter(|m| *m > 0.0),
            max_timeout: max_timeout.filter(|m| *m > 0),
        }
    }

    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self::new(config.timeout, config.multiplier, config.max_timeout)
    }

    /// Copies runtimes from a previous run as ordering hints, for tests that
    /// have none of their own.
    pub fn load_prior_runtimes(&self, tests: &mut TestList, previous: &ResultLog) {
        let mut loaded = 0usize;
        for tc in tests.iter_mut() {
            if tc.status.prior_runtime.is_some() {
                continue;
            }
            let Some(prev) = previous.tests.get(&tc.key()) else {
                continue;
            };
            if let Some(rt) = prev.status.runtime() {
                tc.status.prior_runtime = Some(rt);
                loaded += 1;
            }
        }
        debug!("Loaded {} prior runtimes", loaded);
    }

    /// Sets the timeout of every test in the list.
    pub fn set_timeouts(&self, tests: &mut TestList, previous: Option<&ResultLog>) {
        for tc in tests.iter_mut() {
            let prior = previous
                .and_then(|log| log.tests.get(&tc.key()))
                .and_then(|prev| {
                    let rt = prev.status.runtime()?;
                    Some((rt, prev.status.result_status()))
                });
            let timeout = self.compute(tc.spec(), prior);
            tc.status.timeout = Some(timeout);
        }
    }

    /// Timeout for one test given its previous `(runtime, result)`, if any.
    pub fn compute(&self, spec: &TestSpec, prior: Option<(u64, ResultStatus)>) -> u64 {
        let long = spec.has_keyword("long");
        let base = match (spec.timeout, prior) {
            (Some(t), _) => t,
            (None, Some((rt, ResultStatus::Timeout))) => timeout_if_timed_out(rt, long),
            (None, Some((rt, _))) => timeout_from_runtime(rt),
            (None, None) => default_timeout(long),
        };
        self.apply_options(base)
    }

    fn apply_options(&self, timeout: u64) -> u64 {
        let mut t = self.cmdline_timeout.unwrap_or(timeout);

        if let Some(m) = self.multiplier {
            if t > 0 {
                t = ((t as f64 * m + 0.5) as u64).max(1);
            }
        }
        if let Some(max) = self.max_timeout {
            if t > 0 {
                t = t.min(max);
            }
        }
        t
    }
}

fn timeout_if_timed_out(runtime: u64, long: bool) -> u64 {
    if !long {
        HOUR
    } else if runtime < HOUR {
        4 * HOUR
    } else if runtime < 5 * DAY {
        4 * runtime
    } else {
        5 * DAY
    }
}

fn timeout_from_runtime(runtime: u64) -> u64 {
    if runtime < 120 {
        (2 * runtime).max(120)
    } else if runtime < 300 {
        ((runtime as f64 * 1.5) as u64).max(300)
    } else if runtime < 4 * HOUR {
        (runtime as f64 * 1.5) as u64
    } else {
        (runtime as f64 * 1.3) as u64
    }
}

fn default_timeout(long: bool) -> u64 {
    if long { 5 * HOUR } else { HOUR }
}

/// Parses a duration: plain seconds (`90`, `2.5`), a suffixed value
/// (`30s`, `10m`, `2h`, `1d`) or clock form (`1:30`, `2:00:00`).
///
/// Negative values are clamped to zero; positive values round to at least
/// one second.
pub fn parse_seconds(value: &str) -> Result<u64, String> {
    let v = value.trim();
    if v.is_empty() {
        return Err("empty duration".to_string());
    }
    let bad = || format!("invalid duration: {:?}", value);

    let secs = if v.contains(':') {
        let parts: Vec<&str> = v.split(':').collect();
        if parts.len() > 3 {
            return Err(bad());
        }
        let mut total = 0.0;
        for p in parts {
            let n: f64 = p.trim().parse().map_err(|_| bad())?;
            total = total * 60.0 + n;
        }
        total
    } else {
        let (num, scale) = match v.char_indices().last() {
            Some((i, 's')) => (&v[..i], 1.0),
            Some((i, 'm')) => (&v[..i], 60.0),
            Some((i, 'h')) => (&v[..i], 3600.0),
            Some((i, 'd')) => (&v[..i], 86400.0),
            _ => (v, 1.0),
        };
        let n: f64 = num.trim().parse().map_err(|_| bad())?;
        n * scale
    };

    if !secs.is_finite() {
        return Err(bad());
    }
    if secs <= 0.0 {
        Ok(0)
    } else {
        Ok((secs.max(1.0) + 0.5) as u64)
    }
}

//! Configuration schema definitions for vvrun.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig              - Manifest, results directory, machine size, timeouts
//! ├── BatchConfig            - Grouping and queue polling settings
//! │   └── AdapterConfig      - Tagged enum selecting the batch system
//! │       ├── Slurm          - sbatch / squeue / scancel
//! │       ├── Local          - Background shell processes
//! │       └── Shell          - User-defined command templates
//! └── ReportConfig           - Console output settings
//! ```
//!
//! Every section is optional; an empty file is a valid configuration that
//! runs `tests.toml` directly on all cores of this machine.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
///
/// ```toml
/// [vvrun]
/// manifest = "tests.toml"
/// results_dir = "TestResults"
/// num_procs = 8
///
/// [batch]
/// batch_length = 1800
/// max_jobs = 5
///
/// [batch.adapter]
/// type = "slurm"
/// partition = "pbatch"
/// procs_per_node = 36
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub vvrun: RunConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

/// Core run settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `manifest` | `tests.toml` |
/// | `results_dir` | `TestResults` |
/// | `num_procs` | number of CPUs |
/// | `max_procs` | `num_procs` |
/// | `num_devices` | 0 |
/// | `shell` | `/bin/sh` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// TOML file listing the tests to run.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Directory holding execute directories and result logs.
    ///
    /// Relative paths are resolved against the directory of the config file.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Processor slots available to a direct run.
    pub num_procs: Option<usize>,

    /// Distinct processor ids. Defaults to `num_procs`.
    pub max_procs: Option<usize>,

    /// Device slots available to a direct run.
    #[serde(default)]
    pub num_devices: usize,

    /// Distinct device ids. Defaults to `num_devices`.
    pub max_devices: Option<usize>,

    /// Shell used to run test commands.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Extra environment for every test and batch job.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            manifest: default_manifest(),
            results_dir: default_results_dir(),
            num_procs: None,
            max_procs: None,
            num_devices: 0,
            max_devices: None,
            shell: default_shell(),
            env: HashMap::new(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

fn default_manifest() -> PathBuf {
    PathBuf::from("tests.toml")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("TestResults")
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

/// Per-test and whole-run time limits, in seconds.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TimeoutConfig {
    /// Replaces every computed test timeout. Zero means no limit.
    pub timeout: Option<u64>,

    /// Scales every computed test timeout.
    pub multiplier: Option<f64>,

    /// Upper bound on any test timeout and on a batch job's queue time.
    pub max_timeout: Option<u64>,

    /// Wall-clock budget for the whole run.
    pub total_timeout: Option<u64>,
}

/// Batch mode settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `batch_length` | 1800 |
/// | `max_jobs` | 5 |
/// | `check_interval` | 30 |
/// | `check_timeout` | 300 |
/// | `sleep_secs` | 15 |
/// | `adapter` | `local` |
///
/// The three polling settings can also be overridden with the
/// `VVRUN_BATCH_READ_INTERVAL`, `VVRUN_BATCH_READ_TIMEOUT` and
/// `VVRUN_BATCH_SLEEP_LENGTH` environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    /// Run in batch mode without `--batch` on the command line.
    #[serde(default)]
    pub enabled: bool,

    /// Target summed timeout of one job, in seconds. Zero puts every test
    /// in its own job.
    #[serde(default = "default_batch_length")]
    pub batch_length: u64,

    /// Jobs allowed in the queue, or awaiting their results, at once.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// Seconds between result checks of a job that left the queue.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Seconds after leaving the queue before a job is given up on.
    #[serde(default = "default_check_timeout")]
    pub check_timeout: u64,

    /// Seconds the control loop sleeps when it has nothing to submit.
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,

    /// Shell text inserted into every job script before the `cd`.
    pub shim: Option<String>,

    #[serde(default)]
    pub adapter: AdapterConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch_length: default_batch_length(),
            max_jobs: default_max_jobs(),
            check_interval: default_check_interval(),
            check_timeout: default_check_timeout(),
            sleep_secs: default_sleep_secs(),
            shim: None,
            adapter: AdapterConfig::default(),
        }
    }
}

fn default_batch_length() -> u64 {
    1800
}

fn default_max_jobs() -> usize {
    5
}

fn default_check_interval() -> u64 {
    30
}

fn default_check_timeout() -> u64 {
    300
}

fn default_sleep_secs() -> u64 {
    15
}

/// Batch system selection.
///
/// | Type | Description |
/// |------|-------------|
/// | `slurm` | Submit with `sbatch` |
/// | `local` | Background processes on this machine |
/// | `shell` | Custom submit/query/cancel command templates |
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AdapterConfig {
    Slurm(SlurmAdapterConfig),
    Local(LocalAdapterConfig),
    Shell(ShellAdapterConfig),
}

impl Default for AdapterConfig {
    fn default() -> Self {
        AdapterConfig::Local(LocalAdapterConfig::default())
    }
}

/// Slurm settings.
///
/// ```toml
/// [batch.adapter]
/// type = "slurm"
/// partition = "pbatch"
/// account = "physics"
/// procs_per_node = 36
/// extra_flags = ["--exclusive"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlurmAdapterConfig {
    pub partition: Option<String>,
    pub account: Option<String>,
    pub qos: Option<String>,

    #[serde(default = "default_procs_per_node")]
    pub procs_per_node: usize,

    /// Zero when nodes carry no devices.
    #[serde(default)]
    pub devices_per_node: usize,

    /// Passed to `sbatch` before the script path.
    #[serde(default)]
    pub extra_flags: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for SlurmAdapterConfig {
    fn default() -> Self {
        Self {
            partition: None,
            account: None,
            qos: None,
            procs_per_node: default_procs_per_node(),
            devices_per_node: 0,
            extra_flags: Vec::new(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_procs_per_node() -> usize {
    1
}

fn default_command_timeout() -> u64 {
    60
}

/// Local background process settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalAdapterConfig {
    #[serde(default = "default_shell")]
    pub shell: String,
}

impl Default for LocalAdapterConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
        }
    }
}

/// Command templates for a batch system without a built-in adapter.
///
/// Placeholders: `{script}`, `{output}` and `{workdir}` in `submit`,
/// `{job_ids}` (space separated) in `query`, `{job_id}` in `cancel`.
/// Each line of the query output is read as `<job id> <state word>`.
///
/// ```toml
/// [batch.adapter]
/// type = "shell"
/// submit = "qsub -o {output} {script}"
/// query = "qstat-ids {job_ids}"
/// cancel = "qdel {job_id}"
/// job_id_pattern = "^(\\d+)"
/// header = "#PBS -l walltime={walltime}\n#PBS -l nodes=1:ppn={np}"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ShellAdapterConfig {
    pub submit: String,
    pub query: String,
    pub cancel: Option<String>,

    /// Job script header. Supports `{walltime}`, `{np}`, `{ndevice}` and
    /// `{output}`.
    pub header: Option<String>,

    /// Regex applied to the submit output; capture group 1 is the job id.
    #[serde(default = "default_job_id_pattern")]
    pub job_id_pattern: String,

    #[serde(default = "default_running_states")]
    pub running_states: Vec<String>,

    #[serde(default = "default_pending_states")]
    pub pending_states: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_job_id_pattern() -> String {
    r"(\d+)".to_string()
}

fn default_running_states() -> Vec<String> {
    vec!["R".into(), "RUNNING".into(), "r".into()]
}

fn default_pending_states() -> Vec<String> {
    vec!["PD".into(), "PENDING".into(), "Q".into(), "qw".into()]
}

/// Console output settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Show a progress bar while tests run.
    #[serde(default = "default_true")]
    pub show_progress: bool,

    /// Print one line per test in the final summary.
    #[serde(default)]
    pub list_tests: bool,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            show_progress: true,
            list_tests: false,
        }
    }
}

fn default_true() -> bool {
    true
}

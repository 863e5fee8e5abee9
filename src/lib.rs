//! vvrun: a test orchestrator for HPC machines.
//!
//! vvrun runs a list of test cases either directly, as processes on the
//! local machine within a processor and device budget, or by packing them
//! into jobs for a batch queue such as Slurm.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Test model** ([`testcase`]): test identity, status and the dependency
//!   graph
//! - **Manifest** ([`manifest`]): the TOML file listing the tests to run
//! - **Result log** ([`resultlog`]): the append-only record of a run
//! - **Orchestrators** ([`orchestrator`]): the direct and batch control loops
//! - **Batch** ([`batch`]): grouping tests into jobs and monitoring them
//! - **Adapters** ([`adapter`]): the interface to the batch queue
//! - **Report** ([`report`]): progress output and the final summary
//!
//! # Example
//!
//! ```text
//! let config = vvrun::load_config(Path::new("vvrun.toml"))?;
//! let tests = vvrun::manifest::load_manifest(&config.vvrun.manifest)?;
//! let sched = DirectScheduler::new(tests, true)?;
//! let result = DirectOrchestrator::new(MachinePool::new(8, 8, 0, 0), "TestResults", NullReporter)
//!     .run(sched)
//!     .await?;
//! std::process::exit(result.exit_code());
//! ```

pub mod adapter;
pub mod batch;
pub mod config;
pub mod connector;
pub mod manifest;
pub mod orchestrator;
pub mod report;
pub mod resultlog;
pub mod testcase;
pub mod timeout;

// Re-export commonly used types
pub use adapter::BatchSystemAdapter;
pub use config::{Config, load_config};
pub use orchestrator::{BatchOrchestrator, DirectOrchestrator, DirectScheduler, RunResult};
pub use report::Reporter;
pub use testcase::{TestCase, TestList};

//! Running tests through a batch queue.
//!
//! ```text
//!   DirectScheduler ──BatchGrouper──► BatchJob ×N ──BatchJobMonitor──► BatchSystemAdapter
//!                                         │                                 │
//!                                         ▼                                 ▼
//!                           batchsetK/testlist.N, qbat.N          sbatch / sh / template
//!                                         │
//!                      job runs `vvrun run --job-id=N`, writes testlist.N.<rundate>
//!                                         │
//!                      monitor reads it back into the parent scheduler
//! ```

pub mod grouper;
pub mod job;
pub mod monitor;
pub mod namer;
pub mod script;

pub use grouper::{BatchGroup, BatchGrouper};
pub use job::{BatchJob, JobOutcome, JobState};
pub use monitor::{BatchJobMonitor, MonitorSettings};
pub use namer::BatchFileNamer;

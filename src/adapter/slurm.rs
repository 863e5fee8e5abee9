//! Slurm adapter.
//!
//! # Commands
//!
//! | Operation | Command |
//! |-----------|---------|
//! | submit | `sbatch [extra_flags] <script>` |
//! | query | `squeue --noheader -o '%i %t'` |
//! | cancel | `scancel <id>` |
//!
//! # Example Configuration
//!
//! ```toml
//! [batch.adapter]
//! type = "slurm"
//! partition = "pbatch"
//! account = "physics"
//! qos = "normal"
//! procs_per_node = 36
//! devices_per_node = 4
//! ```

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{
    AdapterError, AdapterResult, BatchSystemAdapter, QueryOutcome, QueueState, SubmitOutcome,
    compute_num_nodes, hms_format,
};
use crate::config::SlurmAdapterConfig;
use crate::connector::{Connector, ShellConnector};
use crate::testcase::Size;

/// Submits job scripts with `sbatch`.
pub struct SlurmAdapter<C: Connector = ShellConnector> {
    config: SlurmAdapterConfig,
    connector: C,
}

impl SlurmAdapter<ShellConnector> {
    pub fn new(config: SlurmAdapterConfig) -> Self {
        let connector = ShellConnector::new().with_timeout(config.command_timeout_secs);
        Self { config, connector }
    }
}

impl<C: Connector> SlurmAdapter<C> {
    pub fn with_connector(config: SlurmAdapterConfig, connector: C) -> Self {
        Self { config, connector }
    }
}

#[async_trait]
impl<C: Connector> BatchSystemAdapter for SlurmAdapter<C> {
    fn name(&self) -> &str {
        "slurm"
    }

    fn header(&self, size: Size, walltime: u64, output: &Path) -> String {
        let nnodes =
            compute_num_nodes(size, self.config.procs_per_node, self.config.devices_per_node)
                .max(1);

        let mut lines = vec![
            format!("#SBATCH --time={}", hms_format(walltime)),
            format!("#SBATCH --nodes={}", nnodes),
            format!("#SBATCH --output={}", output.display()),
            format!("#SBATCH --error={}", output.display()),
        ];
        if let Some(p) = &self.config.partition {
            lines.push(format!("#SBATCH --partition={}", p));
        }
        if let Some(a) = &self.config.account {
            lines.push(format!("#SBATCH --account={}", a));
        }
        if let Some(q) = &self.config.qos {
            lines.push(format!("#SBATCH --qos={}", q));
        }
        lines.join("\n")
    }

    async fn submit(&self, script: &Path, workdir: &Path, _output: &Path) -> SubmitOutcome {
        let mut argv = vec!["sbatch".to_string()];
        argv.extend(self.config.extra_flags.iter().cloned());
        argv.push(script.display().to_string());

        let mut outcome = SubmitOutcome {
            command: shell_words::join(&argv),
            ..Default::default()
        };

        match self.connector.run(&argv, Some(workdir)).await {
            Ok(out) => {
                outcome.job_id = parse_submit_output(&out.output);
                if outcome.job_id.is_none() {
                    outcome.error = format!(
                        "could not find job id in sbatch output (exit {})",
                        out.exit_code
                    );
                }
                outcome.output = out.output;
            }
            Err(e) => outcome.error = e.to_string(),
        }
        outcome
    }

    async fn query(&self, job_ids: &[String]) -> QueryOutcome {
        let argv: Vec<String> = ["squeue", "--noheader", "-o", "%i %t"]
            .into_iter()
            .map(String::from)
            .collect();

        let mut outcome = QueryOutcome {
            command: shell_words::join(&argv),
            ..Default::default()
        };

        let out = match self.connector.run(&argv, None).await {
            Ok(out) => out,
            Err(e) => {
                outcome.error = e.to_string();
                outcome.failed = true;
                return outcome;
            }
        };
        if !out.success() {
            outcome.error = format!("squeue exited with {}", out.exit_code);
            outcome.failed = true;
        }

        let (states, unexpected) = parse_squeue_output(&out.output);
        if !unexpected.is_empty() {
            debug!("Unexpected squeue lines: {:?}", unexpected);
            if !outcome.error.is_empty() {
                outcome.error.push('\n');
            }
            outcome.error.push_str(&unexpected.join("\n"));
        }
        outcome.states = job_ids
            .iter()
            .filter_map(|id| states.get(id).map(|s| (id.clone(), *s)))
            .collect();
        outcome.output = out.output;
        outcome
    }

    async fn cancel(&self, job_id: &str) -> AdapterResult<()> {
        let argv = vec!["scancel".to_string(), job_id.to_string()];
        let out = self.connector.run(&argv, None).await?;
        if !out.success() {
            warn!("scancel {} failed: {}", job_id, out.output);
            return Err(AdapterError::Exec(out.output));
        }
        Ok(())
    }
}

/// Job id from `Submitted batch job <id>`.
fn parse_submit_output(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("Submitted batch job")?;
        rest.split_whitespace().next().map(String::from)
    })
}

/// Parses `%i %t` lines. Returns the known states and any lines that did
/// not look like a job listing.
fn parse_squeue_output(output: &str) -> (HashMap<String, QueueState>, Vec<String>) {
    let mut states = HashMap::new();
    let mut unexpected = Vec::new();

    for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(st), None) => {
                let state = match st {
                    "R" => QueueState::Running,
                    "PD" => QueueState::Pending,
                    _ => QueueState::Absent,
                };
                if state != QueueState::Absent {
                    states.insert(id.to_string(), state);
                }
            }
            _ => unexpected.push(line.to_string()),
        }
    }
    (states, unexpected)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::connector::CommandOutput;

    /// Replays canned output and records the commands it was given.
    struct ScriptedConnector {
        exit_code: i32,
        output: String,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl ScriptedConnector {
        fn new(exit_code: i32, output: &str) -> Self {
            Self {
                exit_code,
                output: output.to_string(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn run(&self, argv: &[String], _cwd: Option<&Path>) -> AdapterResult<CommandOutput> {
            self.calls.lock().unwrap().push(argv.to_vec());
            Ok(CommandOutput {
                command: argv.join(" "),
                exit_code: self.exit_code,
                output: self.output.clone(),
            })
        }
    }

    fn adapter(exit_code: i32, output: &str) -> SlurmAdapter<ScriptedConnector> {
        let config = SlurmAdapterConfig {
            partition: Some("pdebug".into()),
            procs_per_node: 16,
            extra_flags: vec!["--exclusive".into()],
            ..Default::default()
        };
        SlurmAdapter::with_connector(config, ScriptedConnector::new(exit_code, output))
    }

    #[test]
    fn test_header() {
        let a = adapter(0, "");
        let h = a.header((20, 0), 3725, Path::new("/r/qbat-out.3"));
        assert!(h.contains("#SBATCH --time=1:02:05"));
        assert!(h.contains("#SBATCH --nodes=2"));
        assert!(h.contains("#SBATCH --output=/r/qbat-out.3"));
        assert!(h.contains("#SBATCH --error=/r/qbat-out.3"));
        assert!(h.contains("#SBATCH --partition=pdebug"));
        assert!(!h.contains("--account"));
    }

    #[tokio::test]
    async fn test_submit_parses_job_id() {
        let a = adapter(0, "Submitted batch job 4711");
        let out = a
            .submit(Path::new("/r/qbat.0"), Path::new("/r"), Path::new("/r/out"))
            .await;
        assert_eq!(out.job_id.as_deref(), Some("4711"));
        assert!(out.error.is_empty());
        assert_eq!(
            a.connector.calls.lock().unwrap()[0],
            vec!["sbatch", "--exclusive", "/r/qbat.0"]
        );
    }

    #[tokio::test]
    async fn test_submit_failure_keeps_output() {
        let a = adapter(1, "sbatch: error: invalid partition");
        let out = a
            .submit(Path::new("/r/qbat.0"), Path::new("/r"), Path::new("/r/out"))
            .await;
        assert!(out.job_id.is_none());
        assert!(!out.error.is_empty());
        assert!(out.output.contains("invalid partition"));
    }

    #[tokio::test]
    async fn test_query_states() {
        let a = adapter(0, "11 R\n12 PD\n13 CG\nsqueue: warning\n");
        let ids: Vec<String> = ["11", "12", "13", "14"].iter().map(|s| s.to_string()).collect();
        let q = a.query(&ids).await;
        assert_eq!(q.state("11"), QueueState::Running);
        assert_eq!(q.state("12"), QueueState::Pending);
        assert_eq!(q.state("13"), QueueState::Absent);
        assert_eq!(q.state("14"), QueueState::Absent);
        assert!(q.error.contains("squeue: warning"));
        assert!(!q.failed);
    }

    #[tokio::test]
    async fn test_cancel() {
        let a = adapter(0, "");
        a.cancel("11").await.unwrap();
        assert_eq!(a.connector.calls.lock().unwrap()[0], vec!["scancel", "11"]);

        let bad = adapter(1, "scancel: error");
        assert!(bad.cancel("11").await.is_err());
    }

    #[test]
    fn test_parse_submit_output() {
        assert_eq!(
            parse_submit_output("note: x\nSubmitted batch job 99 on cluster y\n"),
            Some("99".to_string())
        );
        assert_eq!(parse_submit_output("Submitted batch job"), None);
        assert_eq!(parse_submit_output(""), None);
    }
}

//! Command-template adapter.
//!
//! For batch systems without a built-in adapter. Submission, query and
//! cancellation are shell command lines with placeholders:
//!
//! | Template | Placeholders |
//! |----------|--------------|
//! | `submit` | `{script}`, `{output}`, `{workdir}` |
//! | `query` | `{job_ids}` |
//! | `cancel` | `{job_id}` |
//! | `header` | `{walltime}`, `{np}`, `{ndevice}`, `{output}` |
//!
//! Substituted values are shell-quoted. The job id is the first capture
//! group of `job_id_pattern` matched against the submit output, and each
//! query output line is read as `<job id> <state word>`.
//!
//! # Example Configuration
//!
//! ```toml
//! [batch.adapter]
//! type = "shell"
//! submit = "qsub -o {output} {script}"
//! query = "qstat-brief {job_ids}"
//! cancel = "qdel {job_id}"
//! job_id_pattern = "^(\\d+)\\."
//! running_states = ["R"]
//! pending_states = ["Q", "H"]
//! ```

use std::path::Path;

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use super::{
    AdapterError, AdapterResult, BatchSystemAdapter, QueryOutcome, QueueState, SubmitOutcome,
    hms_format,
};
use crate::config::ShellAdapterConfig;
use crate::connector::{Connector, ShellConnector};
use crate::testcase::Size;

/// Drives a batch system through configured command templates.
pub struct ShellAdapter<C: Connector = ShellConnector> {
    config: ShellAdapterConfig,
    job_id_pattern: Regex,
    connector: C,
}

impl ShellAdapter<ShellConnector> {
    pub fn new(config: ShellAdapterConfig) -> AdapterResult<Self> {
        let connector = ShellConnector::new().with_timeout(config.command_timeout_secs);
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> ShellAdapter<C> {
    /// Fails if `job_id_pattern` is not a valid regex.
    pub fn with_connector(config: ShellAdapterConfig, connector: C) -> AdapterResult<Self> {
        let job_id_pattern = Regex::new(&config.job_id_pattern).map_err(|e| {
            AdapterError::Config(format!("job_id_pattern '{}': {}", config.job_id_pattern, e))
        })?;
        Ok(Self {
            config,
            job_id_pattern,
            connector,
        })
    }

    fn parse_job_id(&self, output: &str) -> Option<String> {
        self.job_id_pattern
            .captures(output)
            .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| m.as_str().to_string())
    }

    fn state_of(&self, word: &str) -> QueueState {
        if self.config.running_states.iter().any(|s| s == word) {
            QueueState::Running
        } else if self.config.pending_states.iter().any(|s| s == word) {
            QueueState::Pending
        } else {
            QueueState::Absent
        }
    }
}

/// Replaces each `{name}` with its shell-quoted value.
fn render(template: &str, vars: &[(&str, String)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), &shell_words::quote(value))
    })
}

#[async_trait]
impl<C: Connector> BatchSystemAdapter for ShellAdapter<C> {
    fn name(&self) -> &str {
        "shell"
    }

    fn header(&self, size: Size, walltime: u64, output: &Path) -> String {
        let Some(template) = &self.config.header else {
            return String::new();
        };
        let vars = [
            ("walltime", hms_format(walltime)),
            ("np", size.0.to_string()),
            ("ndevice", size.1.to_string()),
            ("output", output.display().to_string()),
        ];
        render(template, &vars)
    }

    async fn submit(&self, script: &Path, workdir: &Path, output: &Path) -> SubmitOutcome {
        let vars = [
            ("script", script.display().to_string()),
            ("output", output.display().to_string()),
            ("workdir", workdir.display().to_string()),
        ];
        let line = render(&self.config.submit, &vars);

        let mut outcome = SubmitOutcome {
            command: line.clone(),
            ..Default::default()
        };
        match self.connector.run_line(&line, Some(workdir)).await {
            Ok(out) => {
                if out.success() {
                    outcome.job_id = self.parse_job_id(&out.output);
                }
                if outcome.job_id.is_none() {
                    outcome.error = format!(
                        "no job id matching '{}' (exit {})",
                        self.config.job_id_pattern, out.exit_code
                    );
                }
                outcome.output = out.output;
            }
            Err(e) => outcome.error = e.to_string(),
        }
        outcome
    }

    async fn query(&self, job_ids: &[String]) -> QueryOutcome {
        let ids: Vec<String> = job_ids
            .iter()
            .map(|id| shell_words::quote(id).into_owned())
            .collect();
        let line = self.config.query.replace("{job_ids}", &ids.join(" "));

        let mut outcome = QueryOutcome {
            command: line.clone(),
            ..Default::default()
        };
        let out = match self.connector.run_line(&line, None).await {
            Ok(out) => out,
            Err(e) => {
                outcome.error = e.to_string();
                outcome.failed = true;
                return outcome;
            }
        };
        if !out.success() {
            outcome.error = format!("query exited with {}", out.exit_code);
            outcome.failed = true;
        }

        for text in out.output.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let mut parts = text.split_whitespace();
            let (Some(id), Some(word)) = (parts.next(), parts.next()) else {
                continue;
            };
            if !job_ids.iter().any(|j| j == id) {
                continue;
            }
            let state = self.state_of(word);
            if state != QueueState::Absent {
                outcome.states.insert(id.to_string(), state);
            }
        }
        outcome.output = out.output;
        outcome
    }

    async fn cancel(&self, job_id: &str) -> AdapterResult<()> {
        let Some(template) = &self.config.cancel else {
            return Err(AdapterError::Unsupported(self.name().to_string()));
        };
        let line = render(template, &[("job_id", job_id.to_string())]);
        let out = self.connector.run_line(&line, None).await?;
        if !out.success() {
            warn!("'{}' failed: {}", line, out.output);
            return Err(AdapterError::Exec(out.output));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::connector::CommandOutput;

    struct ScriptedConnector {
        output: String,
        lines: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn run(&self, argv: &[String], _cwd: Option<&Path>) -> AdapterResult<CommandOutput> {
            self.lines.lock().unwrap().push(shell_words::join(argv));
            Ok(CommandOutput {
                command: shell_words::join(argv),
                exit_code: 0,
                output: self.output.clone(),
            })
        }
    }

    fn config() -> ShellAdapterConfig {
        ShellAdapterConfig {
            submit: "qsub -o {output} {script}".into(),
            query: "qstat {job_ids}".into(),
            cancel: None,
            header: Some("#PBS -l walltime={walltime},ncpus={np}".into()),
            job_id_pattern: r"^(\d+)\.".into(),
            running_states: vec!["R".into()],
            pending_states: vec!["Q".into()],
            command_timeout_secs: 5,
        }
    }

    fn adapter(output: &str) -> ShellAdapter<ScriptedConnector> {
        let conn = ScriptedConnector {
            output: output.into(),
            lines: Mutex::new(Vec::new()),
        };
        ShellAdapter::with_connector(config(), conn).unwrap()
    }

    #[test]
    fn test_render_quotes_values() {
        let s = render("run {script} {x}", &[("script", "/a b/c".into()), ("x", "y".into())]);
        assert_eq!(s, "run '/a b/c' y");
    }

    #[test]
    fn test_header() {
        let a = adapter("");
        assert_eq!(
            a.header((8, 0), 600, Path::new("/o")),
            "#PBS -l walltime=10:00,ncpus=8"
        );
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let mut c = config();
        c.job_id_pattern = "(".into();
        let conn = ScriptedConnector {
            output: String::new(),
            lines: Mutex::new(Vec::new()),
        };
        assert!(matches!(
            ShellAdapter::with_connector(c, conn),
            Err(AdapterError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_submit() {
        let a = adapter("123.server\n");
        let out = a
            .submit(Path::new("/w/qbat.0"), Path::new("/w"), Path::new("/w/out 0"))
            .await;
        assert_eq!(out.job_id.as_deref(), Some("123"));
        assert_eq!(
            a.connector.lines.lock().unwrap()[0],
            "qsub -o '/w/out 0' /w/qbat.0"
        );

        let none = adapter("error: queue full");
        let out = none
            .submit(Path::new("/w/qbat.0"), Path::new("/w"), Path::new("/w/o"))
            .await;
        assert!(out.job_id.is_none());
        assert!(out.error.contains("no job id"));
    }

    #[tokio::test]
    async fn test_query() {
        let a = adapter("Job id  State\n7 R\n8 Q\n9 C\n");
        let ids: Vec<String> = ["7", "8", "9"].iter().map(|s| s.to_string()).collect();
        let q = a.query(&ids).await;
        assert_eq!(q.state("7"), QueueState::Running);
        assert_eq!(q.state("8"), QueueState::Pending);
        assert_eq!(q.state("9"), QueueState::Absent);
        assert_eq!(a.connector.lines.lock().unwrap()[0], "qstat 7 8 9");
    }

    #[tokio::test]
    async fn test_cancel_unsupported_without_template() {
        let a = adapter("");
        assert!(matches!(
            a.cancel("7").await,
            Err(AdapterError::Unsupported(_))
        ));
    }
}

//! Batch job script rendering.
//!
//! ```text
//! #!/bin/sh
//! #SBATCH --time=10:00                      adapter header
//! touch /r/batchset0/qbat-out.3 || exit 1
//! module load mpi                           optional shim
//! cd /r || exit 1
//! echo "job start time = `date`"
//! echo "job time limit = 600"
//! export OMP_NUM_THREADS="1"
//! /usr/bin/vvrun --config vvrun.toml run --job-id=3 || exit 1
//! echo "queue job finished cleanly"
//! ```
//!
//! The last line is how a stopped job is recognised as having run to its
//! end; see [`CLEAN_EXIT_MARKER`].

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Printed by the script as its final line.
pub const CLEAN_EXIT_MARKER: &str = "queue job finished cleanly";

/// Inputs for one job script.
#[derive(Debug, Clone, Default)]
pub struct JobScript {
    pub header: String,
    pub output_file: PathBuf,
    pub workdir: PathBuf,
    pub shim: Option<String>,
    pub queue_time: u64,
    pub env: Vec<(String, String)>,

    /// argv of the command the job runs.
    pub command: Vec<String>,
}

impl JobScript {
    pub fn render(&self) -> String {
        let mut s = String::from("#!/bin/sh\n");
        let header = self.header.trim_end();
        if !header.is_empty() {
            s.push_str(header);
            s.push('\n');
        }
        s.push('\n');
        s.push_str(&format!(
            "touch {} || exit 1\n",
            shell_words::quote(&self.output_file.display().to_string())
        ));
        if let Some(shim) = self.shim.as_deref().map(str::trim).filter(|sh| !sh.is_empty()) {
            s.push_str(shim);
            s.push('\n');
        }
        s.push_str(&format!(
            "cd {} || exit 1\n",
            shell_words::quote(&self.workdir.display().to_string())
        ));
        s.push_str("echo \"job start time = `date`\"\n");
        s.push_str(&format!("echo \"job time limit = {}\"\n", self.queue_time));
        for (k, v) in &self.env {
            s.push_str(&format!("export {}={}\n", k, double_quote(v)));
        }
        s.push('\n');
        s.push_str(&format!("{} || exit 1\n", shell_words::join(&self.command)));
        s.push('\n');
        s.push_str(&format!("echo \"{}\"\n", CLEAN_EXIT_MARKER));
        s
    }

    /// Writes the script and makes it executable.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.render())?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
    }
}

fn double_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Command a job runs to execute its test list.
pub fn job_command(
    base: &[String],
    batch_id: usize,
    single_test_timeout: Option<u64>,
) -> Vec<String> {
    let mut cmd = base.to_vec();
    cmd.push("run".to_string());
    cmd.push(format!("--job-id={}", batch_id));
    if let Some(t) = single_test_timeout {
        cmd.push("--timeout".to_string());
        cmd.push(t.to_string());
    }
    cmd
}

/// Whether the tail of a job output file carries the clean exit marker.
pub fn output_has_clean_exit(path: &Path) -> bool {
    const TAIL: usize = 512;
    let Ok(bytes) = fs::read(path) else {
        return false;
    };
    let tail = &bytes[bytes.len().saturating_sub(TAIL)..];
    String::from_utf8_lossy(tail).contains(CLEAN_EXIT_MARKER)
}

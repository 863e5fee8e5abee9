//! Configuration loading for vvrun.
//!
//! Configuration lives in a TOML file, `vvrun.toml` by default. See
//! [`schema`] for the available sections and their defaults.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;

/// Loads configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, or does
/// not match the schema.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads configuration from a TOML string.
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

impl Config {
    /// Expands `~` in the manifest and results paths, then resolves
    /// relative ones against `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &PathBuf| {
            let p = PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned());
            if p.is_absolute() {
                p
            } else {
                base.join(p)
            }
        };
        self.vvrun.manifest = resolve(&self.vvrun.manifest);
        self.vvrun.results_dir = resolve(&self.vvrun.results_dir);
    }
}

impl BatchConfig {
    /// Applies the `VVRUN_BATCH_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |name: &str, slot: &mut u64| {
            let Some(raw) = lookup(name) else {
                return;
            };
            match raw.trim().parse::<u64>() {
                Ok(v) => *slot = v,
                Err(_) => warn!("Ignoring {}={:?}: not a number of seconds", name, raw),
            }
        };
        read("VVRUN_BATCH_SLEEP_LENGTH", &mut self.sleep_secs);
        read("VVRUN_BATCH_READ_INTERVAL", &mut self.check_interval);
        read("VVRUN_BATCH_READ_TIMEOUT", &mut self.check_timeout);
    }
}

/// Configuration written by `vvrun init`.
pub const INIT_TEMPLATE: &str = r#"[vvrun]
manifest = "tests.toml"
results_dir = "TestResults"
# num_procs = 8
# num_devices = 0

[vvrun.timeouts]
# timeout = 600
# multiplier = 1.0
# max_timeout = 7200
# total_timeout = 36000

[batch]
enabled = false
batch_length = 1800
max_jobs = 5

[batch.adapter]
type = "local"

# [batch.adapter]
# type = "slurm"
# partition = "pbatch"
# procs_per_node = 36

[report]
show_progress = true
"#;

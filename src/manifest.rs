//! Test manifest loading.
//!
//! A manifest is a TOML file listing concrete test instances. Test file
//! parsing and parameter expansion happen elsewhere; by the time tests reach
//! vvrun each parameter combination is its own `[[test]]` entry:
//!
//! ```toml
//! [[test]]
//! path = "heat/heat.vvt"
//! name = "heat"
//! params = { np = 4, mesh = "fine" }
//! keywords = ["fast"]
//! command = "./heat -i input.$VVRUN_NP"
//! timeout = 300
//!
//! [[test]]
//! path = "heat/heat.vvt"
//! name = "heat"
//! analyze = true
//! command = "./compare.sh"
//! depends_on = [{ pattern = "heat.np=*", result = "pass or diff", expect = "+" }]
//! ```
//!
//! `path` is relative to the manifest's directory, which becomes the test
//! root.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::testcase::{
    DependencySpec, SkipReason, Staging, TestCase, TestId, TestList, TestSpec,
};

/// Top level of a manifest file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default, rename = "test")]
    pub tests: Vec<ManifestEntry>,
}

/// One `[[test]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub name: String,

    #[serde(default)]
    pub params: BTreeMap<String, toml::Value>,

    #[serde(default)]
    pub keywords: Vec<String>,

    pub command: String,

    pub timeout: Option<u64>,

    #[serde(default)]
    pub analyze: bool,

    /// For analyze tests: the parameter sets of the family, keyed by the
    /// space-joined parameter names.
    #[serde(default)]
    pub paramset: BTreeMap<String, Vec<Vec<String>>>,

    pub stage: Option<Staging>,

    #[serde(default)]
    pub depends_on: Vec<DependencySpec>,

    /// Excludes the test from the run.
    pub skip: Option<SkipReason>,

    /// Known runtime in seconds, used for ordering.
    pub runtime: Option<u64>,
}

impl ManifestEntry {
    fn into_case(self, root: &str) -> TestCase {
        let params = self
            .params
            .into_iter()
            .map(|(k, v)| (k, param_string(v)))
            .collect();
        let id = TestId::new(self.path, self.name)
            .with_params(params)
            .with_staging(self.stage);

        let mut spec = TestSpec::new(id, self.command)
            .with_root(root)
            .with_keywords(self.keywords)
            .with_timeout(self.timeout)
            .with_analyze(self.analyze);
        spec.paramset = self.paramset;
        spec.depends_on = self.depends_on;

        let mut tc = TestCase::new(spec);
        if let Some(reason) = self.skip {
            tc.status.mark_skipped(reason);
        }
        tc.status.prior_runtime = self.runtime;
        tc
    }
}

fn param_string(value: toml::Value) -> String {
    match value {
        toml::Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Parses manifest text. `root` is the directory test paths are relative to.
pub fn load_manifest_str(content: &str, root: &str) -> Result<TestList> {
    let manifest: Manifest = toml::from_str(content).context("Failed to parse manifest")?;

    let mut list = TestList::new();
    for entry in manifest.tests {
        let tc = entry.into_case(root);
        let display = tc.display_string();
        list.insert(tc)
            .with_context(|| format!("Manifest lists {} more than once", display))?;
    }
    list.propagate_analyze_skips();
    Ok(list)
}

/// Loads a manifest file into a test list.
pub fn load_manifest(path: &Path) -> Result<TestList> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;

    let root = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());

    load_manifest_str(&content, &root.display().to_string())
        .with_context(|| format!("Invalid manifest: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const SAMPLE: &str = r#"
        [[test]]
        path = "heat/heat.vvt"
        name = "heat"
        params = { np = 4, mesh = "fine" }
        keywords = ["fast"]
        command = "./heat"
        timeout = 300
        runtime = 120

        [[test]]
        path = "heat/heat.vvt"
        name = "heat"
        params = { np = 1, mesh = "coarse" }
        command = "./heat"
        skip = "keyword"

        [[test]]
        path = "heat/heat.vvt"
        name = "heat"
        analyze = true
        command = "./compare.sh"
        depends_on = [{ pattern = "heat.*", result = "pass or diff", expect = "+" }]
    "#;

    #[test]
    fn test_load_sample() {
        let list = load_manifest_str(SAMPLE, "/src").unwrap();
        assert_eq!(list.len(), 3);

        let tcs: Vec<&TestCase> = list.iter().collect();
        assert_eq!(tcs[0].size(), (4, 0));
        assert_eq!(tcs[0].spec().id.params["mesh"], "fine");
        assert_eq!(tcs[0].spec().root, "/src");
        assert_eq!(tcs[0].status.timeout, Some(300));
        assert_eq!(tcs[0].status.prior_runtime, Some(120));
        assert!(tcs[0].spec().has_keyword("fast"));

        assert_eq!(tcs[1].status.skip, Some(SkipReason::Keyword));

        // a keyword skip on a family member skips the analyze test
        assert!(tcs[2].spec().analyze);
        assert_eq!(tcs[2].status.skip, Some(SkipReason::DepSkip));
        assert_eq!(tcs[2].spec().depends_on[0].expect.as_deref(), Some("+"));
    }

    #[test]
    fn test_duplicate_entries_rejected() {
        let text = r#"
            [[test]]
            path = "a.vvt"
            name = "a"
            command = "true"

            [[test]]
            path = "a.vvt"
            name = "a"
            command = "false"
        "#;
        let err = load_manifest_str(text, ".").unwrap_err();
        assert!(format!("{:#}", err).contains("more than once"));
    }

    #[test]
    fn test_empty_manifest() {
        let list = load_manifest_str("", ".").unwrap();
        assert!(list.is_empty());
    }

    #[test]
    fn test_missing_command_rejected() {
        let text = "[[test]]\npath = \"a.vvt\"\nname = \"a\"\n";
        assert!(load_manifest_str(text, ".").is_err());
    }

    #[test]
    fn test_load_from_file_sets_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tests.toml");
        std::fs::write(&path, "[[test]]\npath = \"a.vvt\"\nname = \"a\"\ncommand = \"true\"\n")
            .unwrap();

        let list = load_manifest(&path).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(list.iter().next().unwrap().spec().root, root.display().to_string());
    }
}

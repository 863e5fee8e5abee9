//! Test identity, execute directories and display strings.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Execute directory base names longer than this are shortened by hashing.
pub const MAX_EXEC_NAME_LEN: usize = 100;

/// Number of hex digits of the SHA-256 digest kept in a shortened name.
const HASH_DIGITS: usize = 12;

/// Staging information for one member of a staged test family.
///
/// `param` names the stage parameter, `others` the remaining parameters that
/// vary together with the stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Staging {
    pub param: String,
    #[serde(default)]
    pub others: Vec<String>,
    #[serde(default)]
    pub last: bool,
}

/// Opaque, hashable key for a test, derived from its identity tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestKey(String);

impl TestKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a test: source file, test name and parameter assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestId {
    pub filepath: String,
    pub name: String,
    pub params: BTreeMap<String, String>,
    pub staged: Option<Staging>,
}

impl TestId {
    pub fn new(filepath: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            filepath: filepath.into(),
            name: name.into(),
            params: BTreeMap::new(),
            staged: None,
        }
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_staging(mut self, staged: Option<Staging>) -> Self {
        self.staged = staged;
        self
    }

    pub fn key(&self) -> TestKey {
        TestKey(self.compute_id(false).join("\u{1f}"))
    }

    /// Key shared by every stage of a staged family.
    pub fn compressed_stage_key(&self) -> TestKey {
        TestKey(self.compute_id(true).join("\u{1f}"))
    }

    /// Identity tuple as a list of strings.
    pub fn compute_id(&self, compress_stage: bool) -> Vec<String> {
        let mut id = vec![self.filepath.clone(), self.name.clone()];
        id.extend(self.parameter_list(compress_stage));
        id
    }

    /// Execute directory relative to the test root, shortened when long.
    pub fn execute_directory(&self) -> String {
        let base = self.exec_base_name();
        let base = if base.len() > MAX_EXEC_NAME_LEN {
            shorten_name(&self.name, &base)
        } else {
            base
        };
        normalize_path(&join_dir(parent_dir(&self.filepath), &base))
    }

    pub fn display_string(&self) -> String {
        let mut displ = normalize_path(&join_dir(parent_dir(&self.filepath), &self.exec_base_name()));

        if let Some(st) = &self.staged {
            let stage_val = self.params.get(&st.param).map(String::as_str).unwrap_or("");
            let mut others = st.others.clone();
            others.sort();
            let pairs: Vec<String> = others
                .iter()
                .map(|p| format!("{}={}", p, self.params.get(p).map(String::as_str).unwrap_or("")))
                .collect();
            displ.push_str(&format!(" {}={}({})", st.param, stage_val, pairs.join(",")));
        }

        displ
    }

    fn exec_base_name(&self) -> String {
        let params = self.parameter_list(true);
        if params.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, params.join("."))
        }
    }

    fn parameter_list(&self, compress_stage: bool) -> Vec<String> {
        let mut list: Vec<String> = self
            .params
            .iter()
            .filter_map(|(n, v)| match &self.staged {
                Some(st) if compress_stage && *n == st.param => None,
                Some(st) if compress_stage && st.others.contains(n) => Some(n.clone()),
                _ => Some(format!("{}={}", n, v)),
            })
            .collect();
        list.sort();
        list
    }
}

fn shorten_name(name: &str, base: &str) -> String {
    let digest = Sha256::digest(base.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}.{}", name, &hex[..HASH_DIGITS])
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn join_dir(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Lexical path normalization: collapses `.`, `..` and repeated separators.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if matches!(parts.last(), Some(last) if *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

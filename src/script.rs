//! Inline script metadata.
//!
//! A runnable script may open with a comment block delimited by
//! `# /// script` and `# ///`; the commented-out body is TOML declaring
//! `requires-python` and `dependencies`. The driver installs the listed
//! dependencies into the session environment before executing the script.

use std::path::Path;

use serde::Deserialize;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ScriptMetadata {
    pub requires_python: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

pub fn load_metadata(path: &Path) -> Result<ScriptMetadata> {
    let source = std::fs::read_to_string(path).map_err(|err| Error::ConfigLoad {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    let block = extract_block(&source).map_err(|message| Error::ConfigLoad {
        path: path.to_path_buf(),
        message,
    })?;
    toml::from_str(&block).map_err(|err| Error::ConfigLoad {
        path: path.to_path_buf(),
        message: format!("invalid script metadata: {err}"),
    })
}

/// Pull out the `script` block's TOML body. Exactly one block is allowed.
fn extract_block(source: &str) -> std::result::Result<String, String> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    for line in source.lines() {
        let trimmed = line.trim_end();
        match &mut current {
            None => {
                if trimmed == "# /// script" {
                    current = Some(Vec::new());
                }
            }
            Some(lines) => {
                if trimmed == "# ///" {
                    blocks.push(std::mem::take(lines));
                    current = None;
                } else if trimmed == "#" || trimmed.starts_with("# ") {
                    lines.push(trimmed);
                } else {
                    // A non-comment line aborts the candidate block.
                    current = None;
                }
            }
        }
    }
    match blocks.len() {
        0 => Err("no script metadata block found".to_string()),
        1 => Ok(blocks[0]
            .iter()
            .map(|line| line.strip_prefix("# ").unwrap_or("").to_string())
            .collect::<Vec<_>>()
            .join("\n")),
        _ => Err("multiple script metadata blocks found".to_string()),
    }
}

/// Check a session interpreter spec against a `requires-python` specifier
/// set (comma-separated comparison clauses).
pub fn python_satisfies(requirement: &str, version: &str) -> bool {
    version_satisfies(requirement, version)
}

/// Compare a dotted version against a specifier set. Also used for the
/// config's `needs-version` assertion against the driver version.
pub fn version_satisfies(requirement: &str, version: &str) -> bool {
    let version = parse_version(version);
    if version.is_empty() {
        return true;
    }
    requirement.split(',').all(|clause| {
        let clause = clause.trim();
        if clause.is_empty() {
            return true;
        }
        let (op, rest) = ["<=", ">=", "==", "!=", "~=", "<", ">"]
            .iter()
            .find_map(|op| clause.strip_prefix(op).map(|rest| (*op, rest)))
            .unwrap_or(("==", clause));
        let required = parse_version(rest.trim());
        if required.is_empty() {
            return true;
        }
        let ordering = compare(&version, &required);
        match op {
            ">=" | "~=" => ordering != std::cmp::Ordering::Less,
            "<=" => ordering != std::cmp::Ordering::Greater,
            ">" => ordering == std::cmp::Ordering::Greater,
            "<" => ordering == std::cmp::Ordering::Less,
            "==" => prefix_equal(&version, &required),
            "!=" => !prefix_equal(&version, &required),
            _ => true,
        }
    })
}

fn parse_version(text: &str) -> Vec<u64> {
    text.split('.')
        .map_while(|part| part.parse::<u64>().ok())
        .collect()
}

fn compare(a: &[u64], b: &[u64]) -> std::cmp::Ordering {
    let len = a.len().max(b.len());
    for idx in 0..len {
        let left = a.get(idx).copied().unwrap_or(0);
        let right = b.get(idx).copied().unwrap_or(0);
        match left.cmp(&right) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

/// Equality over the specified components only, so `==3.12` accepts
/// `3.12.4`.
fn prefix_equal(version: &[u64], required: &[u64]) -> bool {
    required
        .iter()
        .enumerate()
        .all(|(idx, part)| version.get(idx).copied().unwrap_or(0) == *part)
}

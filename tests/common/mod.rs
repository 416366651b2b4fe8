//! Shared helpers for driving the built binary against generated
//! configuration files.

// Not every integration-test crate uses every helper.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result};

pub fn write_config(dir: &Path, content: &str) {
    std::fs::write(dir.join("tasklab.toml"), content).expect("write tasklab.toml");
}

pub fn run_tasklab(dir: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_tasklab"));
    command.args(args).current_dir(dir);
    command.env_remove("CI").env_remove("NO_COLOR");
    for (key, _) in std::env::vars() {
        if key.starts_with("TASKLAB_") {
            command.env_remove(&key);
        }
    }
    command.output().expect("run tasklab")
}

pub fn exit_code(output: &Output) -> i32 {
    output.status.code().expect("exit code")
}

pub fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

pub fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

pub fn report_json(path: &Path) -> serde_json::Value {
    try_report_json(path).expect("read report")
}

fn try_report_json(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read report {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse report {}", path.display()))
}

/// Guard for tests that need a host interpreter with the venv module.
pub fn find_python_with_venv() -> Option<PathBuf> {
    let python = find_in_path("python3").or_else(|| find_in_path("python"))?;
    let probe = Command::new(&python)
        .args(["-c", "import venv"])
        .output()
        .ok()?;
    probe.status.success().then_some(python)
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

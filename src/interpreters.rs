//! Interpreter spec resolution.
//!
//! Accepted spec shapes: bare versions (`3`, `3.12`, `3.12.4`), Windows
//! launcher forms (`3.12-32`), implementation-prefixed versions
//! (`pypy-3.10`), explicit executable names (`python3.12t`, `pypy3`), and
//! filesystem paths. Resolution probes the PATH first; on Windows the `py`
//! launcher is consulted for version forms.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{Error, Result};

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<xy>\d+(\.\d+)?)(\.\d+)?(?P<arch>-\d+)?$").unwrap())
}

fn pypy_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^pypy-?(?P<ver>\d+(\.\d+)?)?$").unwrap())
}

/// Turn an interpreter spec into candidate executable names, most specific
/// first.
fn candidates(spec: &str) -> Vec<String> {
    if let Some(caps) = version_re().captures(spec) {
        let xy = &caps["xy"];
        return vec![format!("python{xy}")];
    }
    if let Some(caps) = pypy_re().captures(spec) {
        return match caps.name("ver") {
            Some(ver) => vec![format!("pypy{}", ver.as_str()), "pypy".to_string()],
            None => vec!["pypy".to_string()],
        };
    }
    vec![spec.to_string()]
}

/// Resolve a spec to a concrete executable path.
pub fn resolve(spec: &str) -> Result<PathBuf> {
    let as_path = Path::new(spec);
    if as_path.is_absolute() || spec.contains(std::path::MAIN_SEPARATOR) {
        if as_path.is_file() {
            return Ok(as_path.to_path_buf());
        }
        return Err(Error::InterpreterMissing(spec.to_string()));
    }

    for name in candidates(spec) {
        if let Ok(found) = which::which(&name) {
            return Ok(found);
        }
    }

    #[cfg(windows)]
    if let Some(found) = locate_via_py_launcher(spec) {
        return Ok(found);
    }

    Err(Error::InterpreterMissing(spec.to_string()))
}

/// The interpreter used when a session declares none: the first plain
/// `python3`/`python` on the PATH, standing in for the outer interpreter.
pub fn resolve_current() -> Result<PathBuf> {
    for name in ["python3", "python"] {
        if let Ok(found) = which::which(name) {
            return Ok(found);
        }
    }
    Err(Error::InterpreterMissing("python".to_string()))
}

/// Windows-only: ask the `py` launcher where the requested version lives.
/// The `-32` arch suffix is passed through, as the launcher expects it.
#[cfg(windows)]
fn locate_via_py_launcher(spec: &str) -> Option<PathBuf> {
    let caps = version_re().captures(spec)?;
    let mut request = caps["xy"].to_string();
    if let Some(arch) = caps.name("arch") {
        request.push_str(arch.as_str());
    }
    let py = which::which("py").ok()?;
    let output = std::process::Command::new(py)
        .arg(format!("-{request}"))
        .args(["-c", "import sys; print(sys.executable)"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if path.is_empty() {
        None
    } else {
        Some(PathBuf::from(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_specs_map_to_versioned_names() {
        assert_eq!(candidates("3.12"), vec!["python3.12"]);
        assert_eq!(candidates("3"), vec!["python3"]);
        assert_eq!(candidates("3.12.4"), vec!["python3.12"]);
        assert_eq!(candidates("3.12-32"), vec!["python3.12"]);
    }

    #[test]
    fn pypy_specs_map_to_pypy_names() {
        assert_eq!(candidates("pypy-3.10"), vec!["pypy3.10", "pypy"]);
        assert_eq!(candidates("pypy3"), vec!["pypy3", "pypy"]);
        assert_eq!(candidates("pypy"), vec!["pypy"]);
    }

    #[test]
    fn executable_names_pass_through() {
        assert_eq!(candidates("python3.12t"), vec!["python3.12t"]);
    }

    #[test]
    fn missing_interpreter_carries_the_spec() {
        let err = resolve("99.99").unwrap_err();
        assert!(matches!(err, Error::InterpreterMissing(spec) if spec == "99.99"));
    }
}

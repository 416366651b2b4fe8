//! The venv-family backends: the external `virtualenv` tool invoked through
//! the outer interpreter, and the interpreter's own `venv` module.

use std::path::{Path, PathBuf};

use crate::command::{self, EnvBuilder, ExternalPolicy, RunSpec};
use crate::errors::{Error, Result};
use crate::interpreters;

use super::{can_reuse, clear_location, Backend, BackendKind, EnvRequest, Environment};

pub struct VirtualenvBackend {
    kind: BackendKind,
}

impl VirtualenvBackend {
    pub fn isolated() -> VirtualenvBackend {
        VirtualenvBackend {
            kind: BackendKind::Virtualenv,
        }
    }

    pub fn native() -> VirtualenvBackend {
        VirtualenvBackend {
            kind: BackendKind::Venv,
        }
    }
}

impl Backend for VirtualenvBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        // Both variants ride on the outer interpreter; `virtualenv` is
        // treated as part of the driver's own install.
        true
    }

    fn bin_paths(&self, location: &Path) -> Vec<PathBuf> {
        vec![scripts_dir(location)]
    }

    fn create(&self, request: &EnvRequest<'_>) -> Result<Environment> {
        let resolved = match request.interpreter {
            Some(spec) => {
                if self.kind == BackendKind::Venv && is_python2(spec) {
                    return Err(Error::UnsupportedOperation(format!(
                        "the venv backend requires a python 3 interpreter, got {spec}"
                    )));
                }
                interpreters::resolve(spec)?
            }
            None => interpreters::resolve_current()?,
        };

        if can_reuse(self, request) {
            tracing::debug!(
                "re-using existing virtual environment at {}",
                request.location.display()
            );
            return Ok(self.environment(&request.location, true));
        }
        clear_location(&request.location)?;

        let argv = match self.kind {
            BackendKind::Virtualenv => {
                let outer = interpreters::resolve_current()?;
                isolated_create_argv(&outer, &resolved, request)
            }
            _ => native_create_argv(&resolved, request),
        };

        tracing::info!(
            "creating virtual environment ({}) using {} in {}",
            self.kind,
            resolved
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| resolved.display().to_string()),
            request.location.display()
        );
        let env = EnvBuilder::from_host().build();
        command::run(&RunSpec {
            silent: !request.verbose,
            external: ExternalPolicy::Allow,
            log: request.verbose,
            ..RunSpec::new(&argv, &env)
        })?;

        request.meta(self.kind).write(&request.location)?;
        Ok(self.environment(&request.location, false))
    }

    fn install_argv(&self, _env: &Environment, args: &[String]) -> Result<Vec<String>> {
        let mut argv = vec![
            "python".to_string(),
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
        ];
        argv.extend(args.iter().cloned());
        Ok(argv)
    }
}

impl VirtualenvBackend {
    fn environment(&self, location: &Path, reused: bool) -> Environment {
        Environment {
            kind: self.kind,
            location: location.to_path_buf(),
            interpreter_path: Some(venv_python(location)),
            bin_paths: self.bin_paths(location),
            reused,
            overlay: venv_overlay(location),
            allowed_globals: Vec::new(),
        }
    }
}

pub(super) fn scripts_dir(location: &Path) -> PathBuf {
    if cfg!(windows) {
        location.join("Scripts")
    } else {
        location.join("bin")
    }
}

pub(super) fn venv_python(location: &Path) -> PathBuf {
    if cfg!(windows) {
        scripts_dir(location).join("python.exe")
    } else {
        scripts_dir(location).join("python")
    }
}

pub(super) fn venv_overlay(location: &Path) -> Vec<(String, Option<String>)> {
    vec![
        (
            "VIRTUAL_ENV".to_string(),
            Some(location.display().to_string()),
        ),
        ("CONDA_PREFIX".to_string(), None),
    ]
}

fn is_python2(spec: &str) -> bool {
    let stripped = spec.strip_prefix("python").unwrap_or(spec);
    stripped == "2" || stripped.starts_with("2.")
}

/// The external tool is always driven through the outer interpreter; `-p`
/// is only passed when the session asked for a specific interpreter.
fn isolated_create_argv(outer: &Path, resolved: &Path, request: &EnvRequest<'_>) -> Vec<String> {
    let mut argv = vec![
        outer.display().to_string(),
        "-m".to_string(),
        "virtualenv".to_string(),
        request.location.display().to_string(),
    ];
    if request.interpreter.is_some() {
        argv.push("-p".to_string());
        argv.push(resolved.display().to_string());
    }
    argv.extend(request.venv_params.iter().cloned());
    argv
}

fn native_create_argv(resolved: &Path, request: &EnvRequest<'_>) -> Vec<String> {
    let mut argv = vec![
        resolved.display().to_string(),
        "-m".to_string(),
        "venv".to_string(),
        request.location.display().to_string(),
    ];
    argv.extend(request.venv_params.iter().cloned());
    argv
}

#[cfg(test)]
mod tests {
    use crate::options::{DownloadPython, ReuseMode};

    use super::*;

    fn request<'a>(params: &'a [String]) -> EnvRequest<'a> {
        EnvRequest {
            location: PathBuf::from("/envs/demo"),
            interpreter: Some("3.12"),
            venv_params: params,
            reuse: ReuseMode::No,
            download_python: DownloadPython::Never,
            verbose: false,
        }
    }

    #[test]
    fn python2_specs_are_rejected_by_the_native_backend() {
        assert!(is_python2("2.7"));
        assert!(is_python2("python2.7"));
        assert!(is_python2("2"));
        assert!(!is_python2("3.12"));
    }

    #[test]
    fn isolated_creation_goes_through_the_outer_interpreter() {
        let params: Vec<String> = Vec::new();
        let request = request(&params);
        let argv = isolated_create_argv(
            Path::new("/usr/bin/python3"),
            Path::new("/usr/bin/python3.12"),
            &request,
        );
        assert_eq!(
            argv,
            vec![
                "/usr/bin/python3",
                "-m",
                "virtualenv",
                "/envs/demo",
                "-p",
                "/usr/bin/python3.12",
            ]
        );
    }

    #[test]
    fn native_creation_uses_the_resolved_interpreter_and_params() {
        let params = vec!["--system-site-packages".to_string()];
        let request = request(&params);
        let argv = native_create_argv(Path::new("/usr/bin/python3.12"), &request);
        assert_eq!(
            argv,
            vec![
                "/usr/bin/python3.12",
                "-m",
                "venv",
                "/envs/demo",
                "--system-site-packages",
            ]
        );
    }

    #[test]
    fn overlay_sets_virtual_env_and_unsets_conda() {
        let overlay = venv_overlay(Path::new("/envs/demo"));
        assert!(overlay
            .iter()
            .any(|(k, v)| k == "VIRTUAL_ENV" && v.as_deref() == Some("/envs/demo")));
        assert!(overlay.iter().any(|(k, v)| k == "CONDA_PREFIX" && v.is_none()));
    }
}

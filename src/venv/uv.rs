//! The fast-resolver backend. Environments are plain venvs created by the
//! `uv` tool; the interpreter itself may be downloaded by uv when the
//! download policy allows it.

use std::path::{Path, PathBuf};

use crate::command::{self, EnvBuilder, ExternalPolicy, RunSpec};
use crate::errors::Result;
use crate::interpreters;
use crate::options::DownloadPython;

use super::virtualenv::{scripts_dir, venv_overlay, venv_python};
use super::{can_reuse, clear_location, Backend, BackendKind, EnvRequest, Environment};

pub struct UvBackend;

impl Backend for UvBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Uv
    }

    fn is_available(&self) -> bool {
        which::which("uv").is_ok()
    }

    fn bin_paths(&self, location: &Path) -> Vec<PathBuf> {
        vec![scripts_dir(location)]
    }

    fn create(&self, request: &EnvRequest<'_>) -> Result<Environment> {
        // With downloads disabled the interpreter must resolve locally; with
        // `always` the spec is handed straight to uv so a managed
        // interpreter is used even when a host one would match.
        let interpreter_arg = match (request.interpreter, request.download_python) {
            (None, _) => interpreters::resolve_current()?.display().to_string(),
            (Some(spec), DownloadPython::Never) => {
                interpreters::resolve(spec)?.display().to_string()
            }
            (Some(spec), DownloadPython::Auto) => match interpreters::resolve(spec) {
                Ok(found) => found.display().to_string(),
                Err(_) => spec.to_string(),
            },
            (Some(spec), DownloadPython::Always) => spec.to_string(),
        };

        if can_reuse(self, request) {
            tracing::debug!(
                "re-using existing virtual environment at {}",
                request.location.display()
            );
            return Ok(self.environment(&request.location, true));
        }
        clear_location(&request.location)?;

        let argv = create_argv(&interpreter_arg, request);

        tracing::info!(
            "creating virtual environment (uv) in {}",
            request.location.display()
        );
        let env = EnvBuilder::from_host().build();
        command::run(&RunSpec {
            silent: !request.verbose,
            external: ExternalPolicy::Allow,
            log: request.verbose,
            ..RunSpec::new(&argv, &env)
        })?;

        request.meta(self.kind()).write(&request.location)?;
        Ok(self.environment(&request.location, false))
    }

    /// uv environments carry no pip; the resolver's pip-compatible installer
    /// runs from outside the environment, which is why `uv` is an allowed
    /// global.
    fn install_argv(&self, _env: &Environment, args: &[String]) -> Result<Vec<String>> {
        let mut argv = vec!["uv".to_string(), "pip".to_string(), "install".to_string()];
        argv.extend(args.iter().cloned());
        Ok(argv)
    }
}

fn create_argv(interpreter_arg: &str, request: &EnvRequest<'_>) -> Vec<String> {
    let mut argv = vec![
        "uv".to_string(),
        "venv".to_string(),
        "-p".to_string(),
        interpreter_arg.to_string(),
        request.location.display().to_string(),
    ];
    if request.download_python == DownloadPython::Never {
        argv.push("--no-python-downloads".to_string());
    }
    argv.extend(request.venv_params.iter().cloned());
    argv
}

impl UvBackend {
    fn environment(&self, location: &Path, reused: bool) -> Environment {
        Environment {
            kind: BackendKind::Uv,
            location: location.to_path_buf(),
            interpreter_path: Some(venv_python(location)),
            bin_paths: self.bin_paths(location),
            reused,
            overlay: venv_overlay(location),
            allowed_globals: vec!["uv".to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::options::ReuseMode;

    use super::*;

    fn request(download: DownloadPython) -> EnvRequest<'static> {
        EnvRequest {
            location: PathBuf::from("/envs/demo"),
            interpreter: Some("3.12"),
            venv_params: &[],
            reuse: ReuseMode::No,
            download_python: download,
            verbose: false,
        }
    }

    #[test]
    fn creation_passes_the_interpreter_argument() {
        let argv = create_argv("3.12", &request(DownloadPython::Auto));
        assert_eq!(argv, vec!["uv", "venv", "-p", "3.12", "/envs/demo"]);
    }

    #[test]
    fn downloads_disabled_is_made_explicit() {
        let argv = create_argv("/usr/bin/python3.12", &request(DownloadPython::Never));
        assert!(argv.contains(&"--no-python-downloads".to_string()));
    }
}

//! The conda-family backends (conda, mamba, micromamba). Environments are
//! conda prefixes created with `create -p`; rebuilds go through
//! `remove -p … --all` so package caches stay coherent.

use std::path::{Path, PathBuf};

use crate::command::{self, EnvBuilder, ExternalPolicy, RunSpec};
use crate::errors::Result;

use super::{can_reuse, clear_location, Backend, BackendKind, EnvMeta, EnvRequest, Environment};

pub struct CondaBackend {
    kind: BackendKind,
}

impl CondaBackend {
    pub fn new(kind: BackendKind) -> CondaBackend {
        debug_assert!(kind.is_conda_family());
        CondaBackend { kind }
    }

    fn tool(&self) -> &'static str {
        match self.kind {
            BackendKind::Mamba => "mamba",
            BackendKind::Micromamba => "micromamba",
            _ => "conda",
        }
    }
}

impl Backend for CondaBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        which::which(self.tool()).is_ok()
    }

    fn bin_paths(&self, location: &Path) -> Vec<PathBuf> {
        if cfg!(windows) {
            vec![
                location.to_path_buf(),
                location.join("Library").join("mingw-w64").join("bin"),
                location.join("Library").join("usr").join("bin"),
                location.join("Library").join("bin"),
                location.join("Scripts"),
                location.join("bin"),
            ]
        } else {
            vec![location.join("bin")]
        }
    }

    fn create(&self, request: &EnvRequest<'_>) -> Result<Environment> {
        if can_reuse(self, request) {
            tracing::debug!(
                "re-using existing conda environment at {}",
                request.location.display()
            );
            return Ok(self.environment(&request.location, true));
        }

        if request.location.exists() {
            let recorded_conda = EnvMeta::read(&request.location)
                .map(|meta| meta.kind.is_conda_family())
                .unwrap_or(false);
            if recorded_conda {
                let argv = vec![
                    self.tool().to_string(),
                    "remove".to_string(),
                    "--yes".to_string(),
                    "--prefix".to_string(),
                    request.location.display().to_string(),
                    "--all".to_string(),
                ];
                let env = EnvBuilder::from_host().build();
                command::run(&RunSpec {
                    silent: true,
                    external: ExternalPolicy::Allow,
                    log: false,
                    ..RunSpec::new(&argv, &env)
                })?;
            }
            clear_location(&request.location)?;
        }

        let argv = create_argv(self.tool(), self.kind, request);

        tracing::info!(
            "creating {} env in {} with {}",
            self.tool(),
            request.location.display(),
            argv.last().map(String::as_str).unwrap_or("python")
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

    fn install_argv(&self, env: &Environment, args: &[String]) -> Result<Vec<String>> {
        let mut argv = vec![
            self.tool().to_string(),
            "install".to_string(),
            "--yes".to_string(),
            "--prefix".to_string(),
            env.location.display().to_string(),
        ];
        argv.extend(args.iter().cloned());
        Ok(argv)
    }
}

impl CondaBackend {
    fn environment(&self, location: &Path, reused: bool) -> Environment {
        let bin_paths = self.bin_paths(location);
        let python = if cfg!(windows) {
            location.join("python.exe")
        } else {
            location.join("bin").join("python")
        };
        Environment {
            kind: self.kind,
            location: location.to_path_buf(),
            interpreter_path: Some(python),
            bin_paths,
            reused,
            overlay: vec![
                (
                    "CONDA_PREFIX".to_string(),
                    Some(location.display().to_string()),
                ),
                ("VIRTUAL_ENV".to_string(), None),
            ],
            allowed_globals: vec![
                "conda".to_string(),
                "mamba".to_string(),
                "micromamba".to_string(),
            ],
        }
    }
}

/// `create --yes --prefix <loc> [channels…] [params…] pip python[=<v>]`.
/// The interpreter version rides in as a package pin; pip always comes
/// along so the pip interop path works.
fn create_argv(tool: &str, kind: BackendKind, request: &EnvRequest<'_>) -> Vec<String> {
    let mut argv = vec![
        tool.to_string(),
        "create".to_string(),
        "--yes".to_string(),
        "--prefix".to_string(),
        request.location.display().to_string(),
    ];
    // Micromamba ships with no default channels.
    if kind == BackendKind::Micromamba
        && !request
            .venv_params
            .iter()
            .any(|p| p.starts_with("--channel=") || p.starts_with("-c") || p == "--channel")
    {
        argv.push("--channel=conda-forge".to_string());
    }
    argv.extend(request.venv_params.iter().cloned());
    argv.push("pip".to_string());
    argv.push(match request.interpreter {
        Some(version) => format!("python={version}"),
        None => "python".to_string(),
    });
    argv
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::options::{DownloadPython, ReuseMode};

    use super::*;

    fn request<'a>(interpreter: Option<&'a str>, params: &'a [String]) -> EnvRequest<'a> {
        EnvRequest {
            location: PathBuf::from("/envs/demo"),
            interpreter,
            venv_params: params,
            reuse: ReuseMode::No,
            download_python: DownloadPython::Never,
            verbose: false,
        }
    }

    #[test]
    fn creation_pins_the_interpreter_as_a_package() {
        let params: Vec<String> = Vec::new();
        let argv = create_argv("conda", BackendKind::Conda, &request(Some("3.9"), &params));
        assert_eq!(
            argv,
            vec!["conda", "create", "--yes", "--prefix", "/envs/demo", "pip", "python=3.9"]
        );
        let argv = create_argv("mamba", BackendKind::Mamba, &request(None, &params));
        assert_eq!(argv.last().map(String::as_str), Some("python"));
    }

    #[test]
    fn micromamba_gets_a_default_channel_unless_one_is_given() {
        let params: Vec<String> = Vec::new();
        let argv = create_argv(
            "micromamba",
            BackendKind::Micromamba,
            &request(Some("3.12"), &params),
        );
        assert!(argv.contains(&"--channel=conda-forge".to_string()));

        let params = vec!["--channel=bioconda".to_string()];
        let argv = create_argv(
            "micromamba",
            BackendKind::Micromamba,
            &request(Some("3.12"), &params),
        );
        assert!(!argv.contains(&"--channel=conda-forge".to_string()));
        assert!(argv.contains(&"--channel=bioconda".to_string()));
    }

    #[test]
    fn install_argv_targets_the_prefix() {
        let backend = CondaBackend::new(BackendKind::Conda);
        let env = backend.environment(Path::new("/envs/demo"), false);
        let argv = backend
            .install_argv(&env, &["numpy".to_string()])
            .unwrap();
        assert_eq!(
            argv,
            vec!["conda", "install", "--yes", "--prefix", "/envs/demo", "numpy"]
        );
    }
}

//! Virtual-environment backends.
//!
//! Every backend provides the same capability set: create (with reuse
//! semantics), staleness inspection, bin directories, a process-env overlay,
//! an install argv, and an availability probe. A small hidden metadata file
//! inside each environment records what it was built from, so a later run
//! can decide between reuse and rebuild.

mod conda;
mod passthrough;
mod uv;
mod virtualenv;

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::options::{DownloadPython, Options, ReuseMode};
use crate::util::sha256_hex;

pub use conda::CondaBackend;
pub use passthrough::PassthroughBackend;
pub use uv::UvBackend;
pub use virtualenv::VirtualenvBackend;

/// Name of the metadata file recorded inside every created environment.
pub const ENV_META_FILE: &str = ".tasklab-env.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Virtualenv,
    Venv,
    Conda,
    Mamba,
    Micromamba,
    Uv,
    None,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackendKind::Virtualenv => "virtualenv",
            BackendKind::Venv => "venv",
            BackendKind::Conda => "conda",
            BackendKind::Mamba => "mamba",
            BackendKind::Micromamba => "micromamba",
            BackendKind::Uv => "uv",
            BackendKind::None => "none",
        };
        write!(f, "{label}")
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<BackendKind> {
        match s {
            "virtualenv" => Ok(BackendKind::Virtualenv),
            "venv" => Ok(BackendKind::Venv),
            "conda" => Ok(BackendKind::Conda),
            "mamba" => Ok(BackendKind::Mamba),
            "micromamba" => Ok(BackendKind::Micromamba),
            "uv" => Ok(BackendKind::Uv),
            "none" => Ok(BackendKind::None),
            other => Err(Error::InvalidOption(format!(
                "unknown venv backend: {other}"
            ))),
        }
    }
}

impl BackendKind {
    /// Backends that need no tool beyond the outer interpreter. These may
    /// only appear last in a preference chain.
    pub fn always_available(self) -> bool {
        matches!(
            self,
            BackendKind::Virtualenv | BackendKind::Venv | BackendKind::None
        )
    }

    pub fn is_conda_family(self) -> bool {
        matches!(
            self,
            BackendKind::Conda | BackendKind::Mamba | BackendKind::Micromamba
        )
    }

    pub fn is_venv_family(self) -> bool {
        matches!(
            self,
            BackendKind::Virtualenv | BackendKind::Venv | BackendKind::Uv
        )
    }

    /// Whether an environment previously built by `recorded` can satisfy a
    /// request for `self` without a rebuild. The venv family is mutually
    /// compatible except that moving off uv loses pip.
    pub fn reusable_from(self, recorded: BackendKind) -> bool {
        if self == recorded {
            return true;
        }
        match (recorded, self) {
            (BackendKind::Virtualenv | BackendKind::Venv, BackendKind::Virtualenv | BackendKind::Venv) => true,
            (BackendKind::Virtualenv | BackendKind::Venv, BackendKind::Uv) => true,
            (a, b) if a.is_conda_family() && b.is_conda_family() => true,
            _ => false,
        }
    }
}

/// The persisted fingerprint used for staleness detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvMeta {
    pub kind: BackendKind,
    pub interpreter: Option<String>,
    pub params_digest: String,
}

impl EnvMeta {
    pub fn read(location: &Path) -> Option<EnvMeta> {
        let raw = fs::read_to_string(location.join(ENV_META_FILE)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn write(&self, location: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(location.join(ENV_META_FILE), raw)?;
        Ok(())
    }
}

/// Everything a backend needs to build (or reuse) one environment.
#[derive(Debug, Clone)]
pub struct EnvRequest<'a> {
    pub location: PathBuf,
    /// Requested interpreter spec; `None` means the current interpreter.
    pub interpreter: Option<&'a str>,
    pub venv_params: &'a [String],
    pub reuse: ReuseMode,
    pub download_python: DownloadPython,
    /// Stream backend tool output instead of buffering it.
    pub verbose: bool,
}

impl EnvRequest<'_> {
    pub fn digest(&self, kind: BackendKind) -> String {
        let mut payload = format!("{kind}\n{}\n", self.interpreter.unwrap_or(""));
        for param in self.venv_params {
            payload.push_str(param);
            payload.push('\0');
        }
        sha256_hex(payload.as_bytes())[..16].to_string()
    }

    fn meta(&self, kind: BackendKind) -> EnvMeta {
        EnvMeta {
            kind,
            interpreter: self.interpreter.map(ToString::to_string),
            params_digest: self.digest(kind),
        }
    }
}

/// A created (or reused) per-session environment.
#[derive(Debug, Clone)]
pub struct Environment {
    pub kind: BackendKind,
    pub location: PathBuf,
    /// The environment's own interpreter; absent for passthrough sessions
    /// on hosts without a discoverable python.
    pub interpreter_path: Option<PathBuf>,
    pub bin_paths: Vec<PathBuf>,
    pub reused: bool,
    /// Process-env keys the backend wants injected; `None` unsets.
    pub overlay: Vec<(String, Option<String>)>,
    /// Tools expected to live outside the environment.
    pub allowed_globals: Vec<String>,
}

impl Environment {
    /// The platform scripts directory commands are resolved against first.
    pub fn bin_dir(&self) -> Option<&Path> {
        self.bin_paths.first().map(PathBuf::as_path)
    }

    pub fn is_sandboxed(&self) -> bool {
        self.kind != BackendKind::None
    }
}

/// The backend capability set.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    fn is_available(&self) -> bool;

    /// Create the environment, honoring the request's reuse policy.
    fn create(&self, request: &EnvRequest<'_>) -> Result<Environment>;

    fn bin_paths(&self, location: &Path) -> Vec<PathBuf>;

    /// Whether the stored fingerprint matches the request.
    fn exists_and_is_fresh(&self, request: &EnvRequest<'_>) -> bool {
        EnvMeta::read(&request.location)
            .map(|meta| meta == request.meta(self.kind()))
            .unwrap_or(false)
    }

    /// Argv for the backend's package-install primitive.
    fn install_argv(&self, env: &Environment, args: &[String]) -> Result<Vec<String>>;
}

pub fn backend_for(kind: BackendKind) -> Box<dyn Backend> {
    match kind {
        BackendKind::Virtualenv => Box::new(VirtualenvBackend::isolated()),
        BackendKind::Venv => Box::new(VirtualenvBackend::native()),
        BackendKind::Conda | BackendKind::Mamba | BackendKind::Micromamba => {
            Box::new(CondaBackend::new(kind))
        }
        BackendKind::Uv => Box::new(UvBackend),
        BackendKind::None => Box::new(PassthroughBackend),
    }
}

/// Pick the backend for one session: the forced backend wins unconditionally,
/// otherwise the first available entry of the preference chain (falling back
/// to the configured default). Always-available backends may only terminate
/// a chain.
pub fn select_backend(decl_chain: &[String], options: &Options) -> Result<BackendKind> {
    if let Some(forced) = &options.force_backend {
        return BackendKind::from_str(forced);
    }

    let chain: Vec<BackendKind> = if decl_chain.is_empty() {
        match &options.default_backend {
            Some(default) => vec![BackendKind::from_str(default)?],
            None => vec![BackendKind::Virtualenv],
        }
    } else {
        decl_chain
            .iter()
            .map(|name| BackendKind::from_str(name))
            .collect::<Result<_>>()?
    };

    for (idx, kind) in chain.iter().enumerate() {
        if kind.always_available() && idx + 1 != chain.len() {
            return Err(Error::BackendChainOrder(join_kinds(&chain)));
        }
    }

    for kind in &chain {
        if backend_for(*kind).is_available() {
            return Ok(*kind);
        }
    }
    Err(Error::BackendUnavailable(join_kinds(&chain)))
}

fn join_kinds(chain: &[BackendKind]) -> String {
    chain
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Shared reuse decision: `true` means the existing location can be kept.
/// `never`/`no` always rebuild; `yes` requires a fresh fingerprint; `always`
/// only requires a compatible recorded backend.
pub(crate) fn can_reuse(backend: &dyn Backend, request: &EnvRequest<'_>) -> bool {
    if !request.location.exists() {
        return false;
    }
    match request.reuse {
        ReuseMode::Never | ReuseMode::No => false,
        ReuseMode::Yes => {
            backend.exists_and_is_fresh(request)
                && EnvMeta::read(&request.location)
                    .map(|meta| backend.kind().reusable_from(meta.kind))
                    .unwrap_or(false)
        }
        ReuseMode::Always => EnvMeta::read(&request.location)
            .map(|meta| backend.kind().reusable_from(meta.kind))
            .unwrap_or(false),
    }
}

/// Remove a stale environment directory before recreation.
pub(crate) fn clear_location(location: &Path) -> Result<()> {
    if location.exists() {
        fs::remove_dir_all(location)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;
    use crate::options::FileOptions;

    fn options(default: Option<&str>, force: Option<&str>) -> Options {
        let mut options = Options::merge(&Args::default(), &FileOptions::default()).unwrap();
        options.default_backend = default.map(ToString::to_string);
        options.force_backend = force.map(ToString::to_string);
        options
    }

    fn request(location: PathBuf, reuse: ReuseMode) -> EnvRequest<'static> {
        EnvRequest {
            location,
            interpreter: Some("3.12"),
            venv_params: &[],
            reuse,
            download_python: DownloadPython::Never,
            verbose: false,
        }
    }

    #[test]
    fn forced_backend_overrides_chains() {
        let options = options(None, Some("none"));
        let kind = select_backend(&["uv".to_string()], &options).unwrap();
        assert_eq!(kind, BackendKind::None);
    }

    #[test]
    fn always_available_backend_must_terminate_chain() {
        let options = options(None, None);
        let err = select_backend(
            &["virtualenv".to_string(), "uv".to_string()],
            &options,
        )
        .unwrap_err();
        assert!(matches!(err, Error::BackendChainOrder(_)));
    }

    #[test]
    fn empty_chain_falls_back_to_default() {
        let options_venv = options(Some("venv"), None);
        assert_eq!(select_backend(&[], &options_venv).unwrap(), BackendKind::Venv);
        let options = options(None, None);
        assert_eq!(
            select_backend(&[], &options).unwrap(),
            BackendKind::Virtualenv
        );
    }

    #[test]
    fn unknown_backend_is_invalid_option() {
        let options = options(None, None);
        let err = select_backend(&["shoebox".to_string()], &options).unwrap_err();
        assert!(matches!(err, Error::InvalidOption(_)));
    }

    #[test]
    fn digest_varies_with_interpreter_and_params() {
        let base = request(PathBuf::from("/tmp/x"), ReuseMode::Yes);
        let digest = base.digest(BackendKind::Venv);
        let other = EnvRequest {
            interpreter: Some("3.13"),
            ..base.clone()
        };
        assert_ne!(digest, other.digest(BackendKind::Venv));
        assert_ne!(digest, base.digest(BackendKind::Uv));
    }

    #[test]
    fn reuse_decision_follows_the_policy_table() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("env");
        std::fs::create_dir_all(&location).unwrap();
        let backend = backend_for(BackendKind::Venv);

        let fresh = request(location.clone(), ReuseMode::Yes);
        fresh.meta(BackendKind::Venv).write(&location).unwrap();
        assert!(can_reuse(backend.as_ref(), &fresh));

        // Same location, different interpreter: stale under yes, kept under
        // always.
        let stale = EnvRequest {
            interpreter: Some("3.13"),
            ..fresh.clone()
        };
        assert!(!can_reuse(backend.as_ref(), &stale));
        let always = EnvRequest {
            reuse: ReuseMode::Always,
            ..stale.clone()
        };
        assert!(can_reuse(backend.as_ref(), &always));

        let never = EnvRequest {
            reuse: ReuseMode::Never,
            ..fresh.clone()
        };
        assert!(!can_reuse(backend.as_ref(), &never));
    }

    #[test]
    fn conda_environments_never_satisfy_venv_requests() {
        assert!(!BackendKind::Venv.reusable_from(BackendKind::Conda));
        assert!(BackendKind::Mamba.reusable_from(BackendKind::Conda));
        assert!(BackendKind::Uv.reusable_from(BackendKind::Venv));
        assert!(!BackendKind::Venv.reusable_from(BackendKind::Uv));
    }
}

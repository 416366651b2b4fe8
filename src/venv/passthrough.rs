//! The passthrough backend: no environment at all. Commands run against the
//! host with the outer interpreter, and the install primitive is disallowed
//! since it would modify the global interpreter.

use std::path::{Path, PathBuf};

use crate::errors::{Error, Result};
use crate::interpreters;

use super::{Backend, BackendKind, EnvRequest, Environment};

pub struct PassthroughBackend;

impl Backend for PassthroughBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::None
    }

    fn is_available(&self) -> bool {
        true
    }

    fn bin_paths(&self, _location: &Path) -> Vec<PathBuf> {
        Vec::new()
    }

    fn exists_and_is_fresh(&self, _request: &EnvRequest<'_>) -> bool {
        false
    }

    fn create(&self, request: &EnvRequest<'_>) -> Result<Environment> {
        Ok(Environment {
            kind: BackendKind::None,
            location: request.location.clone(),
            interpreter_path: interpreters::resolve_current().ok(),
            bin_paths: Vec::new(),
            reused: false,
            overlay: Vec::new(),
            allowed_globals: Vec::new(),
        })
    }

    fn install_argv(&self, _env: &Environment, _args: &[String]) -> Result<Vec<String>> {
        Err(Error::UnsupportedOperation(
            "this session has no virtual environment, so installing packages would modify \
             the global interpreter; run the installer explicitly with external set if that \
             is really intended"
                .to_string(),
        ))
    }
}

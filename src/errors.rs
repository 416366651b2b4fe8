//! Error taxonomy for the driver core.
//!
//! Setup-phase errors (config, options, version, graph problems) abort the
//! whole run before any session executes; errors raised while a session is
//! running are converted into that session's failed result by the runner.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to load config {path}: {message}")]
    ConfigLoad { path: PathBuf, message: String },

    #[error("sessions not found: {0}")]
    InvalidSession(String),

    #[error("no sessions selected")]
    EmptySelection,

    #[error("dependency cycle involving session {0}")]
    RequiresCycle(String),

    #[error("session {session} requires non-existent session {requirement}")]
    RequiresMissing { session: String, requirement: String },

    #[error("no virtual environment backend available from chain [{0}]")]
    BackendUnavailable(String),

    #[error("backend chain [{0}]: an always-available backend may only appear last")]
    BackendChainOrder(String),

    #[error("interpreter {0} not found")]
    InterpreterMissing(String),

    #[error("command {command} failed{}", fmt_reason(.reason))]
    CommandFailed {
        command: String,
        reason: Option<String>,
    },

    #[error("{program} is external to the environment and external running is disallowed")]
    ExternalUse { program: String },

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("config requires driver version {required}, but this is {running}")]
    VersionMismatch { required: String, running: String },

    #[error("invalid keyword expression: {0}")]
    KeywordSyntax(String),

    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that abort before any session executes map to exit code 3;
    /// everything else surfaces as a failed run (exit code 1).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConfigLoad { .. }
            | Error::InvalidSession(_)
            | Error::EmptySelection
            | Error::InvalidOption(_)
            | Error::VersionMismatch { .. }
            | Error::KeywordSyntax(_) => 3,
            _ => 1,
        }
    }
}

fn fmt_reason(reason: &Option<String>) -> String {
    match reason {
        Some(reason) => format!(": {reason}"),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, Error>;


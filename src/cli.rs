use std::path::PathBuf;

use clap::Parser;

use crate::options::{DownloadPython, ReuseMode, ScriptMode};

/// CLI arguments for the session driver.
#[derive(Parser, Debug, Default)]
#[command(
    name = "tasklab",
    version,
    about = "Run task sessions in isolated per-task environments",
    after_help = "Examples:\n  tasklab                      Run all default sessions\n  tasklab -s lint tests        Run the lint and tests sessions\n  tasklab -s \"tests-3.12(django='4.2')\"  Run one parametric instance\n  tasklab -l --json            List sessions as machine-readable JSON\n  tasklab -s tests -- -k fast  Forward positional args to the session"
)]
pub struct Args {
    /// Select sessions by name; patterns may include parametric tails
    #[arg(short = 's', long = "sessions", short_alias = 'e', num_args = 1.., value_name = "NAME")]
    pub sessions: Option<Vec<String>>,

    /// Select sessions by interpreter version
    #[arg(short = 'p', long = "python", alias = "pythons", num_args = 1.., value_name = "VERSION")]
    pub pythons: Option<Vec<String>>,

    /// Boolean expression over name substrings and tags, e.g. "tests and not slow"
    #[arg(short = 'k', long = "keywords", value_name = "EXPR")]
    pub keywords: Option<String>,

    /// Select sessions carrying any of the given tags
    #[arg(short = 't', long = "tags", num_args = 1.., value_name = "TAG")]
    pub tags: Option<Vec<String>>,

    /// List sessions instead of running them
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    /// With --list, emit machine-readable JSON
    #[arg(long)]
    pub json: bool,

    /// Path to the configuration file
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    pub file: Option<PathBuf>,

    /// Root directory for ephemeral environments
    #[arg(long, value_name = "DIR")]
    pub envdir: Option<PathBuf>,

    /// Environment reuse policy
    #[arg(long = "reuse-venv", value_name = "MODE")]
    pub reuse_venv: Option<ReuseMode>,

    /// Re-use existing environments when they match (same as --reuse-venv yes)
    #[arg(short = 'r', long = "reuse-existing-virtualenvs", conflicts_with = "reuse_venv")]
    pub reuse_existing: bool,

    /// Re-use existing environments and skip install steps (-r plus --no-install)
    #[arg(short = 'R')]
    pub reuse_and_skip_install: bool,

    /// Skip install primitives when the environment is reused
    #[arg(long = "no-install")]
    pub no_install: bool,

    /// Backend used when a session declares no preference
    #[arg(long = "default-venv-backend", alias = "db", value_name = "BACKEND")]
    pub default_venv_backend: Option<String>,

    /// Backend used regardless of session preferences
    #[arg(long = "force-venv-backend", alias = "fb", value_name = "BACKEND")]
    pub force_venv_backend: Option<String>,

    /// Run all sessions on the host, without creating environments
    #[arg(long = "no-venv")]
    pub no_venv: bool,

    /// Fail instead of skipping when an interpreter is missing
    #[arg(long = "error-on-missing-interpreters")]
    pub error_on_missing_interpreters: bool,

    /// Disable --error-on-missing-interpreters if the config enables it
    #[arg(
        long = "no-error-on-missing-interpreters",
        conflicts_with = "error_on_missing_interpreters"
    )]
    pub no_error_on_missing_interpreters: bool,

    /// Fail when a command resolves outside the session environment
    #[arg(long = "error-on-external-run")]
    pub error_on_external_run: bool,

    /// Disable --error-on-external-run if the config enables it
    #[arg(
        long = "no-error-on-external-run",
        conflicts_with = "error_on_external_run"
    )]
    pub no_error_on_external_run: bool,

    /// Policy for auto-downloading interpreters
    #[arg(long = "download-python", value_name = "POLICY")]
    pub download_python: Option<DownloadPython>,

    /// Write a machine-readable JSON report to the given path
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Skip run steps; still perform install and run-install steps
    #[arg(long = "install-only")]
    pub install_only: bool,

    /// Treat the session as non-interactive even on a tty
    #[arg(long = "non-interactive")]
    pub non_interactive: bool,

    /// Force color output
    #[arg(long = "forcecolor", conflicts_with = "nocolor")]
    pub forcecolor: bool,

    /// Disable color output
    #[arg(long = "nocolor")]
    pub nocolor: bool,

    /// Show all command output, not just failures
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Prefix log lines with a timestamp
    #[arg(long = "add-timestamp")]
    pub add_timestamp: bool,

    /// Abort remaining sessions after the first failure
    #[arg(long = "stop-on-first-error", short = 'x')]
    pub stop_on_first_error: bool,

    /// Disable --stop-on-first-error if the config enables it
    #[arg(long = "no-stop-on-first-error", conflicts_with = "stop_on_first_error")]
    pub no_stop_on_first_error: bool,

    /// Additional interpreters to append to every session's interpreter axis
    #[arg(long = "extra-pythons", num_args = 1.., value_name = "VERSION")]
    pub extra_pythons: Option<Vec<String>>,

    /// Replace every session's interpreter axis with a single interpreter
    #[arg(long = "force-python", value_name = "VERSION")]
    pub force_python: Option<String>,

    /// Policy for the config evaluator's own dependency installation
    #[arg(long = "script-mode", value_name = "MODE")]
    pub script_mode: Option<ScriptMode>,

    /// Backend used for the config evaluator's own environment
    #[arg(long = "script-venv-backend", value_name = "BACKEND")]
    pub script_venv_backend: Option<String>,

    /// Arguments after "--" are forwarded to the sessions
    #[arg(last = true, value_name = "POSARGS")]
    pub posargs: Vec<String>,
}

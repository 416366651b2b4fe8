//! The invocation option set.
//!
//! Each recognized option can arrive from three layers: a command-line flag,
//! a `TASKLAB_*` environment variable, and an `[options]` assignment in the
//! configuration file. Layers merge with CLI > environment > config; boolean
//! flag pairs follow the rule that a config-enabled toggle is defeated only
//! by the explicit `--no-...` flag.

use std::env;
use std::path::PathBuf;

use clap::ValueEnum;
use serde::Deserialize;

use crate::cli::Args;
use crate::errors::{Error, Result};
use crate::logging::ColorMode;

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ReuseMode {
    Always,
    Yes,
    No,
    Never,
}

impl std::fmt::Display for ReuseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ReuseMode::Always => "always",
            ReuseMode::Yes => "yes",
            ReuseMode::No => "no",
            ReuseMode::Never => "never",
        };
        write!(f, "{label}")
    }
}

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadPython {
    Auto,
    Always,
    Never,
}

#[derive(ValueEnum, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptMode {
    Reuse,
    Fresh,
    None,
}

/// The `[options]` table of the configuration file.
///
/// Unknown keys are rejected so that a typo surfaces as `invalid-option`
/// instead of silently doing nothing.
#[derive(Deserialize, Debug, Default, Clone)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct FileOptions {
    pub env_dir: Option<PathBuf>,
    pub sessions: Option<Vec<String>>,
    pub pythons: Option<Vec<String>>,
    pub keywords: Option<String>,
    pub tags: Option<Vec<String>>,
    pub default_backend: Option<String>,
    pub force_backend: Option<String>,
    pub reuse_mode: Option<ReuseMode>,
    pub stop_on_first_error: Option<bool>,
    pub error_on_missing_interpreter: Option<bool>,
    pub error_on_external_run: Option<bool>,
    pub download_python: Option<DownloadPython>,
    pub report_path: Option<PathBuf>,
    pub verbose: Option<bool>,
    pub non_interactive: Option<bool>,
    pub no_color: Option<bool>,
    pub force_color: Option<bool>,
    pub install_only: Option<bool>,
    pub script_mode: Option<ScriptMode>,
}

/// The immutable, fully merged invocation options.
#[derive(Debug, Clone)]
pub struct Options {
    /// Absolute path of the loaded configuration file.
    pub config_file: PathBuf,
    /// Directory the driver was invoked from, before chdir to the config dir.
    pub invoked_from: PathBuf,
    pub envdir: PathBuf,
    pub sessions: Option<Vec<String>>,
    pub pythons: Option<Vec<String>>,
    pub keywords: Option<String>,
    pub tags: Option<Vec<String>>,
    pub posargs: Vec<String>,
    pub list: bool,
    pub list_json: bool,
    pub default_backend: Option<String>,
    pub force_backend: Option<String>,
    pub reuse_mode: ReuseMode,
    pub no_install: bool,
    pub stop_on_first_error: bool,
    pub error_on_missing_interpreters: bool,
    pub error_on_external_run: bool,
    pub download_python: DownloadPython,
    pub report: Option<PathBuf>,
    pub install_only: bool,
    pub non_interactive: bool,
    pub verbose: bool,
    pub color: ColorMode,
    pub extra_pythons: Vec<String>,
    pub force_python: Option<String>,
    pub script_mode: ScriptMode,
    pub script_venv_backend: Option<String>,
}

pub const DEFAULT_ENVDIR: &str = ".tasklab";

impl Options {
    /// Merge the three option layers into the final record.
    pub fn merge(args: &Args, file: &FileOptions) -> Result<Options> {
        let reuse_mode = if args.reuse_existing || args.reuse_and_skip_install {
            ReuseMode::Yes
        } else {
            args.reuse_venv
                .or(env_enum::<ReuseMode>("TASKLAB_REUSE_VENV")?)
                .or(file.reuse_mode)
                .unwrap_or(ReuseMode::No)
        };

        let force_backend = if args.no_venv {
            Some("none".to_string())
        } else {
            args.force_venv_backend
                .clone()
                .or(env_string("TASKLAB_FORCE_VENV_BACKEND"))
        };

        let color = if args.forcecolor || file.force_color.unwrap_or(false) {
            ColorMode::Always
        } else if args.nocolor
            || file.no_color.unwrap_or(false)
            || env_string("NO_COLOR").is_some()
        {
            ColorMode::Never
        } else {
            ColorMode::Auto
        };

        Ok(Options {
            config_file: PathBuf::new(),
            invoked_from: env::current_dir()?,
            envdir: args
                .envdir
                .clone()
                .or(env_string("TASKLAB_ENVDIR").map(PathBuf::from))
                .or(file.env_dir.clone())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ENVDIR)),
            sessions: args
                .sessions
                .clone()
                .or(env_list("TASKLAB_SESSIONS"))
                .or(file.sessions.clone()),
            pythons: args
                .pythons
                .clone()
                .or(env_list("TASKLAB_PYTHONS"))
                .or(file.pythons.clone()),
            keywords: args
                .keywords
                .clone()
                .or(env_string("TASKLAB_KEYWORDS"))
                .or(file.keywords.clone()),
            tags: args
                .tags
                .clone()
                .or(env_list("TASKLAB_TAGS"))
                .or(file.tags.clone()),
            posargs: args.posargs.clone(),
            list: args.list,
            list_json: args.json,
            default_backend: args
                .default_venv_backend
                .clone()
                .or(env_string("TASKLAB_DEFAULT_VENV_BACKEND"))
                .or(file.default_backend.clone()),
            force_backend,
            reuse_mode,
            no_install: args.no_install || args.reuse_and_skip_install,
            stop_on_first_error: flag_pair(
                args.stop_on_first_error,
                args.no_stop_on_first_error,
                env_bool("TASKLAB_STOP_ON_FIRST_ERROR")?,
                file.stop_on_first_error,
                false,
            ),
            error_on_missing_interpreters: flag_pair(
                args.error_on_missing_interpreters,
                args.no_error_on_missing_interpreters,
                env_bool("TASKLAB_ERROR_ON_MISSING_INTERPRETERS")?,
                file.error_on_missing_interpreter,
                running_on_ci(),
            ),
            error_on_external_run: flag_pair(
                args.error_on_external_run,
                args.no_error_on_external_run,
                env_bool("TASKLAB_ERROR_ON_EXTERNAL_RUN")?,
                file.error_on_external_run,
                false,
            ),
            download_python: args
                .download_python
                .or(env_enum::<DownloadPython>("TASKLAB_DOWNLOAD_PYTHON")?)
                .or(file.download_python)
                .unwrap_or(DownloadPython::Auto),
            report: args
                .report
                .clone()
                .or(env_string("TASKLAB_REPORT").map(PathBuf::from))
                .or(file.report_path.clone()),
            install_only: args.install_only || file.install_only.unwrap_or(false),
            non_interactive: args.non_interactive
                || env_bool("TASKLAB_NON_INTERACTIVE")?.unwrap_or(false)
                || file.non_interactive.unwrap_or(false),
            verbose: args.verbose || file.verbose.unwrap_or(false),
            color,
            extra_pythons: args.extra_pythons.clone().unwrap_or_default(),
            force_python: args.force_python.clone(),
            script_mode: args
                .script_mode
                .or(env_enum::<ScriptMode>("TASKLAB_SCRIPT_MODE")?)
                .or(file.script_mode)
                .unwrap_or(ScriptMode::Reuse),
            script_venv_backend: args.script_venv_backend.clone(),
        })
    }
}

/// The CI heuristic: a non-empty `CI` variable flips the missing-interpreter
/// default from skip to error.
pub fn running_on_ci() -> bool {
    env::var("CI").map(|v| !v.is_empty()).unwrap_or(false)
}

fn flag_pair(
    cli_enable: bool,
    cli_disable: bool,
    env_value: Option<bool>,
    file_value: Option<bool>,
    default: bool,
) -> bool {
    if cli_disable {
        return false;
    }
    cli_enable
        || env_value.unwrap_or(false)
        || file_value.unwrap_or(false)
        || default
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env_string(name).map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(String::from)
            .collect()
    })
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    match env_string(name) {
        None => Ok(None),
        Some(value) => match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(Error::InvalidOption(format!(
                "{name}={value} is not a boolean"
            ))),
        },
    }
}

fn env_enum<T: ValueEnum>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        None => Ok(None),
        Some(value) => T::from_str(&value, true)
            .map(Some)
            .map_err(|_| Error::InvalidOption(format!("{name}={value} is not recognized"))),
    }
}

//! The declarative configuration host.
//!
//! `tasklab.toml` is located by an explicit `--file` or by scanning upward
//! from the invocation directory. Each `[[session]]` table compiles into a
//! registration through the same builder API a programmatic plugin would
//! use; the session body interprets the declared step list, substituting
//! `{posargs}`, `{python}`, `{session}`, `{envdir}`, `{tmp}`, and call-spec
//! placeholders at run time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::options::{FileOptions, ReuseMode};
use crate::parametrize::{CallSpec, ParamBundle, ParamLayer, ParamValue};
use crate::registry::{Interpreters, Registry};
use crate::script;
use crate::sessions::{BodyResult, RunOpts, Session, SessionBody, SessionExit, WorkingDirGuard};

pub const CONFIG_FILE_NAME: &str = "tasklab.toml";

/// Everything evaluation produces: script-level option assignments and the
/// registered session declarations.
#[derive(Debug)]
pub struct LoadedConfig {
    pub options: FileOptions,
    pub registry: Registry,
}

/// Find the configuration file: the explicit path wins, otherwise walk from
/// the invocation directory toward the filesystem root.
pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::ConfigLoad {
            path: path.to_path_buf(),
            message: "file not found".to_string(),
        });
    }
    let start = std::env::current_dir()?;
    let mut dir = Some(start.as_path());
    while let Some(current) = dir {
        let candidate = current.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Ok(candidate);
        }
        dir = current.parent();
    }
    Err(Error::ConfigLoad {
        path: start.join(CONFIG_FILE_NAME),
        message: format!("no {CONFIG_FILE_NAME} found here or in any parent directory"),
    })
}

pub fn load(path: &Path) -> Result<LoadedConfig> {
    let source = std::fs::read_to_string(path).map_err(|err| Error::ConfigLoad {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    parse(path, &source)
}

fn parse(path: &Path, source: &str) -> Result<LoadedConfig> {
    let raw: RawConfig = toml::from_str(source).map_err(|err| Error::ConfigLoad {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;

    if let Some(required) = &raw.needs_version {
        let running = env!("CARGO_PKG_VERSION");
        if !script::version_satisfies(required, running) {
            return Err(Error::VersionMismatch {
                required: required.clone(),
                running: running.to_string(),
            });
        }
    }

    // The [options] table re-parses on its own so a bad key or value reads
    // as an option problem, not a config-file syntax problem.
    let options: FileOptions = match raw.options {
        Some(value) => value
            .try_into()
            .map_err(|err: toml::de::Error| Error::InvalidOption(err.to_string()))?,
        None => FileOptions::default(),
    };

    let mut registry = Registry::new();
    for session in raw.sessions {
        register_session(&mut registry, session)?;
    }
    Ok(LoadedConfig { options, registry })
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct RawConfig {
    needs_version: Option<String>,
    options: Option<toml::Value>,
    #[serde(default, rename = "session")]
    sessions: Vec<SessionTable>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct SessionTable {
    name: String,
    description: Option<String>,
    python: Option<PythonField>,
    reuse: Option<ReuseMode>,
    backend: Option<BackendField>,
    #[serde(default)]
    venv_params: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_true")]
    default: bool,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    parametrize: Vec<ParametrizeTable>,
    #[serde(default)]
    steps: Vec<StepTable>,
}

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PythonField {
    Flag(bool),
    One(String),
    Many(Vec<String>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BackendField {
    One(String),
    Chain(Vec<String>),
}

impl BackendField {
    /// `"uv|virtualenv"` and `["uv", "virtualenv"]` both denote a chain.
    fn into_chain(self) -> Vec<String> {
        match self {
            BackendField::One(spec) => spec.split('|').map(str::trim).map(String::from).collect(),
            BackendField::Chain(chain) => chain,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArgNames {
    One(String),
    Many(Vec<String>),
}

impl ArgNames {
    /// `"arg"`, `"arg,arg2"`, and `["arg", "arg2"]` are all accepted.
    fn names(&self) -> Vec<String> {
        match self {
            ArgNames::One(spec) => spec
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(String::from)
                .collect(),
            ArgNames::Many(names) => names.clone(),
        }
    }
}

#[derive(Deserialize, Clone)]
#[serde(untagged)]
enum RawValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl From<&RawValue> for ParamValue {
    fn from(raw: &RawValue) -> ParamValue {
        match raw {
            RawValue::Bool(b) => ParamValue::Bool(*b),
            RawValue::Int(i) => ParamValue::Int(*i),
            RawValue::Str(s) => ParamValue::Str(s.clone()),
        }
    }
}

#[derive(Deserialize, Clone)]
#[serde(untagged)]
enum ValueCell {
    Scalar(RawValue),
    Row(Vec<RawValue>),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ValueEntry {
    Plain(ValueCell),
    /// The `param(value, id=.., tags=..)` wrapper.
    Wrapped {
        value: ValueCell,
        id: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
    },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct ParametrizeTable {
    args: ArgNames,
    values: Vec<ValueEntry>,
    ids: Option<Vec<String>>,
    tags: Option<Vec<Vec<String>>>,
}

impl ParametrizeTable {
    fn into_layer(self, session: &str) -> Result<ParamLayer> {
        let names = self.args.names();
        if names.is_empty() {
            return Err(config_error(session, "parametrize needs argument names"));
        }
        if let Some(ids) = &self.ids {
            if ids.len() != self.values.len() {
                return Err(config_error(session, "ids length must match values length"));
            }
        }
        if let Some(tags) = &self.tags {
            if tags.len() != self.values.len() {
                return Err(config_error(session, "tags length must match values length"));
            }
        }
        let mut bundles = Vec::with_capacity(self.values.len());
        for (idx, entry) in self.values.iter().enumerate() {
            let (cell, entry_id, entry_tags) = match entry {
                ValueEntry::Plain(cell) => (cell, None, Vec::new()),
                ValueEntry::Wrapped { value, id, tags } => (value, id.clone(), tags.clone()),
            };
            let row: Vec<ParamValue> = match cell {
                ValueCell::Scalar(value) => vec![value.into()],
                ValueCell::Row(row) => row.iter().map(ParamValue::from).collect(),
            };
            if row.len() != names.len() {
                return Err(config_error(
                    session,
                    &format!(
                        "value #{} supplies {} items for {} argument names",
                        idx + 1,
                        row.len(),
                        names.len()
                    ),
                ));
            }
            let mut spec = CallSpec::new();
            for (name, value) in names.iter().zip(row) {
                spec.insert(name.clone(), value);
            }
            let id = entry_id.or_else(|| self.ids.as_ref().map(|ids| ids[idx].clone()));
            let mut tags = entry_tags;
            if let Some(layer_tags) = &self.tags {
                tags.extend(layer_tags[idx].iter().cloned());
            }
            bundles.push(ParamBundle { spec, id, tags });
        }
        Ok(ParamLayer { bundles })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NotifyField {
    Target(String),
    Full {
        target: String,
        posargs: Option<Vec<String>>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ReasonField {
    Flag(bool),
    Reason(String),
}

impl ReasonField {
    fn reason(&self) -> Option<String> {
        match self {
            ReasonField::Flag(_) => None,
            ReasonField::Reason(reason) => Some(reason.clone()),
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct StepTable {
    run: Option<Vec<String>>,
    run_install: Option<Vec<String>>,
    install: Option<Vec<String>>,
    conda_install: Option<Vec<String>>,
    channels: Option<Vec<String>>,
    run_script: Option<String>,
    chdir: Option<String>,
    notify: Option<NotifyField>,
    log: Option<String>,
    warn: Option<String>,
    debug: Option<String>,
    skip: Option<ReasonField>,
    error: Option<ReasonField>,
    create_tmp: Option<bool>,
    env: Option<BTreeMap<String, String>>,
    unset_env: Option<Vec<String>>,
    silent: Option<bool>,
    success_codes: Option<Vec<i32>>,
    external: Option<bool>,
    include_outer_env: Option<bool>,
    timeout_seconds: Option<f64>,
    /// Skip this command when stdin is not a tty (or --non-interactive).
    only_interactive: Option<bool>,
}

/// A compiled step, ready for interpretation inside the session body.
enum Step {
    Run(Vec<String>, StepOpts),
    RunInstall(Vec<String>, StepOpts),
    Install(Vec<String>, StepOpts),
    CondaInstall(Vec<String>, Vec<String>, StepOpts),
    RunScript(String),
    Chdir(String),
    Notify(String, Option<Vec<String>>),
    Log(String),
    Warn(String),
    Debug(String),
    Skip(Option<String>),
    Error(Option<String>),
    CreateTmp,
}

#[derive(Default, Clone)]
struct StepOpts {
    env: Vec<(String, Option<String>)>,
    silent: Option<bool>,
    success_codes: Option<Vec<i32>>,
    external: Option<bool>,
    include_outer_env: Option<bool>,
    timeout: Option<Duration>,
    only_interactive: bool,
}

impl StepOpts {
    fn run_opts(&self) -> RunOpts {
        RunOpts {
            env: self.env.clone(),
            silent: self.silent,
            success_codes: self.success_codes.clone().unwrap_or_else(|| vec![0]),
            external: self.external,
            include_outer_env: self.include_outer_env.unwrap_or(true),
            timeout: self.timeout,
        }
    }
}

impl StepTable {
    fn compile(self, session: &str) -> Result<Step> {
        let opts = StepOpts {
            env: self
                .env
                .iter()
                .flatten()
                .map(|(key, value)| (key.clone(), Some(value.clone())))
                .chain(
                    self.unset_env
                        .iter()
                        .flatten()
                        .map(|key| (key.clone(), None)),
                )
                .collect(),
            silent: self.silent,
            success_codes: self.success_codes.clone(),
            external: self.external,
            include_outer_env: self.include_outer_env,
            timeout: self.timeout_seconds.map(Duration::from_secs_f64),
            only_interactive: self.only_interactive.unwrap_or(false),
        };

        let mut actions: Vec<Step> = Vec::new();
        if let Some(argv) = self.run {
            actions.push(Step::Run(argv, opts.clone()));
        }
        if let Some(argv) = self.run_install {
            actions.push(Step::RunInstall(argv, opts.clone()));
        }
        if let Some(args) = self.install {
            actions.push(Step::Install(args, opts.clone()));
        }
        if let Some(args) = self.conda_install {
            actions.push(Step::CondaInstall(
                args,
                self.channels.clone().unwrap_or_default(),
                opts.clone(),
            ));
        }
        if let Some(path) = self.run_script {
            actions.push(Step::RunScript(path));
        }
        if let Some(dir) = self.chdir {
            actions.push(Step::Chdir(dir));
        }
        if let Some(notify) = self.notify {
            let (target, posargs) = match notify {
                NotifyField::Target(target) => (target, None),
                NotifyField::Full { target, posargs } => (target, posargs),
            };
            actions.push(Step::Notify(target, posargs));
        }
        if let Some(message) = self.log {
            actions.push(Step::Log(message));
        }
        if let Some(message) = self.warn {
            actions.push(Step::Warn(message));
        }
        if let Some(message) = self.debug {
            actions.push(Step::Debug(message));
        }
        if let Some(skip) = self.skip {
            actions.push(Step::Skip(skip.reason()));
        }
        if let Some(error) = self.error {
            actions.push(Step::Error(error.reason()));
        }
        if self.create_tmp == Some(true) {
            actions.push(Step::CreateTmp);
        }

        if actions.len() != 1 {
            return Err(config_error(
                session,
                "each step must declare exactly one action",
            ));
        }
        let action = actions.remove(0);
        if self.channels.is_some() && !matches!(action, Step::CondaInstall(..)) {
            return Err(config_error(session, "channels requires conda-install"));
        }
        Ok(action)
    }
}

fn config_error(session: &str, message: &str) -> Error {
    Error::ConfigLoad {
        path: PathBuf::from(CONFIG_FILE_NAME),
        message: format!("session {session}: {message}"),
    }
}

fn register_session(registry: &mut Registry, table: SessionTable) -> Result<()> {
    let python = match table.python {
        None => Interpreters::Current,
        Some(PythonField::Flag(false)) => Interpreters::Disabled,
        Some(PythonField::Flag(true)) => Interpreters::Current,
        Some(PythonField::One(spec)) if spec == "none" => Interpreters::Disabled,
        Some(PythonField::One(spec)) => Interpreters::Single(spec),
        Some(PythonField::Many(list)) => Interpreters::List(list),
    };

    let mut layers = Vec::with_capacity(table.parametrize.len());
    for parametrize in table.parametrize {
        layers.push(parametrize.into_layer(&table.name)?);
    }

    let mut steps = Vec::with_capacity(table.steps.len());
    for step in table.steps {
        steps.push(step.compile(&table.name)?);
    }

    let mut builder = registry
        .session(&table.name)
        .python(python)
        .backend(table.backend.map(BackendField::into_chain).unwrap_or_default())
        .venv_params(table.venv_params)
        .tags(table.tags)
        .default_selected(table.default)
        .requires(table.requires);
    if let Some(reuse) = table.reuse {
        builder = builder.reuse(reuse);
    }
    if let Some(description) = &table.description {
        builder = builder.description(description);
    }
    for layer in layers {
        builder = builder.parametrize(layer);
    }
    builder.body(Arc::new(StepsBody { steps }))
}

/// The session body compiled from a declarative step list.
struct StepsBody {
    steps: Vec<Step>,
}

impl SessionBody for StepsBody {
    fn call(&self, session: &mut Session<'_>) -> BodyResult {
        // Directory changes live until the body finishes, then unwind in
        // reverse order.
        let mut dir_guards: Vec<WorkingDirGuard> = Vec::new();
        for step in &self.steps {
            match step {
                Step::Run(argv, opts) => {
                    if opts.only_interactive && !session.interactive() {
                        session.log("skipping interactive-only command");
                        continue;
                    }
                    let argv = expand_argv(argv, session)?;
                    session.run(&argv, &opts.run_opts())?;
                }
                Step::RunInstall(argv, opts) => {
                    if opts.only_interactive && !session.interactive() {
                        session.log("skipping interactive-only command");
                        continue;
                    }
                    let argv = expand_argv(argv, session)?;
                    session.run_install(&argv, &opts.run_opts())?;
                }
                Step::Install(args, opts) => {
                    let args = expand_argv(args, session)?;
                    session.install(&args, &opts.run_opts())?;
                }
                Step::CondaInstall(args, channels, opts) => {
                    let args = expand_argv(args, session)?;
                    session.conda_install(&args, channels, &opts.run_opts())?;
                }
                Step::RunScript(path) => {
                    let path = expand_str(path, session)?;
                    session.run_script(Path::new(&path))?;
                }
                Step::Chdir(dir) => {
                    let dir = expand_str(dir, session)?;
                    dir_guards.push(session.chdir(Path::new(&dir))?);
                }
                Step::Notify(target, posargs) => {
                    let target = expand_str(target, session)?;
                    let posargs = match posargs {
                        Some(posargs) => Some(expand_argv(posargs, session)?),
                        None => None,
                    };
                    session.notify(&target, posargs);
                }
                Step::Log(message) => session.log(&expand_str(message, session)?),
                Step::Warn(message) => session.warn(&expand_str(message, session)?),
                Step::Debug(message) => session.debug(&expand_str(message, session)?),
                Step::Skip(reason) => {
                    return Err(SessionExit::Skip(reason.clone()));
                }
                Step::Error(reason) => {
                    return Err(SessionExit::Stop(reason.clone()));
                }
                Step::CreateTmp => {
                    session.create_tmp()?;
                }
            }
        }
        Ok(())
    }
}

/// Expand placeholders in an argv. A standalone `{posargs}` element splices
/// the positional arguments; embedded placeholders substitute textually.
fn expand_argv(
    argv: &[String],
    session: &Session<'_>,
) -> std::result::Result<Vec<String>, SessionExit> {
    let mut expanded = Vec::with_capacity(argv.len());
    for element in argv {
        if element == "{posargs}" {
            expanded.extend(session.posargs().iter().cloned());
        } else {
            expanded.push(expand_str(element, session)?);
        }
    }
    Ok(expanded)
}

fn expand_str(
    template: &str,
    session: &Session<'_>,
) -> std::result::Result<String, SessionExit> {
    let mut output = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                output.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                output.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(c) => key.push(c),
                        None => {
                            return Err(SessionExit::Fail(Error::InvalidOption(format!(
                                "unterminated placeholder in {template:?}"
                            ))))
                        }
                    }
                }
                output.push_str(&placeholder_value(&key, session)?);
            }
            c => output.push(c),
        }
    }
    Ok(output)
}

fn placeholder_value(
    key: &str,
    session: &Session<'_>,
) -> std::result::Result<String, SessionExit> {
    match key {
        "session" => Ok(session.name().to_string()),
        "python" => Ok(session.python().unwrap_or_default().to_string()),
        "envdir" => Ok(session.env_dir().display().to_string()),
        "posargs" => Ok(session.posargs().join(" ")),
        "invoked-from" => Ok(session.invoked_from().display().to_string()),
        "cache" => session
            .cache_dir()
            .map(|cache| cache.display().to_string())
            .map_err(SessionExit::Fail),
        "tmp" => session
            .tmp_dir()
            .map(|tmp| tmp.display().to_string())
            .ok_or_else(|| {
                SessionExit::Fail(Error::InvalidOption(
                    "{tmp} used before a create-tmp step".to_string(),
                ))
            }),
        name => match session.call_spec().get(name) {
            Some(ParamValue::Str(s)) => Ok(s.clone()),
            Some(ParamValue::Int(i)) => Ok(i.to_string()),
            Some(ParamValue::Bool(b)) => Ok(b.to_string()),
            None => Err(SessionExit::Fail(Error::InvalidOption(format!(
                "unknown placeholder {{{name}}}"
            )))),
        },
    }
}

//! The per-session façade handed to session bodies, and the runner that
//! drives one instance from environment creation through result
//! classification.
//!
//! Control flow out of a body is a typed sum, not an unwind: `SessionExit`
//! carries skip/stop requests and command failures, and the runner folds it
//! into the session's result.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use serde::Serialize;

use crate::command::{self, EnvBuilder, ExternalPolicy, RunSpec};
use crate::errors::{Error, Result};
use crate::manifest::{QueueEntry, SessionInstance};
use crate::options::Options;
use crate::parametrize::CallSpec;
use crate::script;
use crate::util::{normalize_env_dir, truncate_string};
use crate::venv::{self, backend_for, BackendKind, EnvRequest, Environment};

const FAILURE_EXCERPT_BYTES: usize = 2000;

/// Typed control-flow exit from a session body.
#[derive(Debug)]
pub enum SessionExit {
    /// `session.skip(..)` — the session is reported as skipped.
    Skip(Option<String>),
    /// `session.error(..)` — the session stops and is reported as failed.
    Stop(Option<String>),
    /// A driver error escaped the body, most commonly `command-failed`.
    Fail(Error),
}

impl From<Error> for SessionExit {
    fn from(err: Error) -> SessionExit {
        SessionExit::Fail(err)
    }
}

pub type BodyResult = std::result::Result<(), SessionExit>;

/// A session function: the configuration host implements this for
/// declarative step lists, and programmatic plugins implement it directly.
pub trait SessionBody: Send + Sync {
    fn call(&self, session: &mut Session<'_>) -> BodyResult;
}

/// A body that does nothing; used by tests.
pub fn noop_body() -> Arc<dyn SessionBody> {
    struct Noop;
    impl SessionBody for Noop {
        fn call(&self, _session: &mut Session<'_>) -> BodyResult {
            Ok(())
        }
    }
    Arc::new(Noop)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Failed,
    Skipped,
    Aborted,
}

/// Outcome of one session instance.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub name: String,
    pub base: String,
    pub status: Status,
    pub reason: Option<String>,
    pub duration: Duration,
    pub call_spec: CallSpec,
    /// Truncated failure context, captured from the escaping error.
    pub log_excerpt: Option<String>,
}

impl SessionResult {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, Status::Failed | Status::Aborted)
    }

    /// Past-tense phrasing for log lines: "was successful", "failed: …".
    pub fn imperfect(&self) -> String {
        match (&self.status, &self.reason) {
            (Status::Success, _) => "was successful".to_string(),
            (status, Some(reason)) => format!("{}: {reason}", status_label(*status)),
            (status, None) => status_label(*status).to_string(),
        }
    }
}

fn status_label(status: Status) -> &'static str {
    match status {
        Status::Success => "success",
        Status::Failed => "failed",
        Status::Skipped => "skipped",
        Status::Aborted => "aborted",
    }
}

/// A notify request recorded during a body run; applied to the manifest
/// after the notifier finishes.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub target: String,
    pub posargs: Option<Vec<String>>,
}

/// Per-call options for `run` and friends.
#[derive(Debug, Clone)]
pub struct RunOpts {
    pub env: Vec<(String, Option<String>)>,
    pub silent: Option<bool>,
    pub success_codes: Vec<i32>,
    /// `Some(true)` suppresses the external-use check for this call.
    pub external: Option<bool>,
    pub include_outer_env: bool,
    pub timeout: Option<Duration>,
}

impl Default for RunOpts {
    fn default() -> RunOpts {
        RunOpts {
            env: Vec::new(),
            silent: None,
            success_codes: vec![0],
            external: None,
            include_outer_env: true,
            timeout: None,
        }
    }
}

/// Restores the previous working directory when dropped.
pub struct WorkingDirGuard {
    previous: PathBuf,
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.previous);
    }
}

/// The handle passed to session bodies.
pub struct Session<'a> {
    instance: &'a SessionInstance,
    options: &'a Options,
    env: &'a Environment,
    posargs: Vec<String>,
    env_overlay: Vec<(String, Option<String>)>,
    notifications: Vec<Notification>,
    tmp: Option<PathBuf>,
}

impl<'a> Session<'a> {
    pub fn name(&self) -> &str {
        &self.instance.name
    }

    pub fn python(&self) -> Option<&str> {
        self.instance.python.as_deref()
    }

    pub fn venv_backend(&self) -> String {
        self.env.kind.to_string()
    }

    pub fn env_dir(&self) -> &Path {
        &self.env.location
    }

    pub fn posargs(&self) -> &[String] {
        &self.posargs
    }

    pub fn call_spec(&self) -> &CallSpec {
        &self.instance.call_spec
    }

    /// The temp directory, if `create_tmp` has run.
    pub fn tmp_dir(&self) -> Option<&Path> {
        self.tmp.as_deref()
    }

    /// True when stdin is a tty and `--non-interactive` was not given.
    pub fn interactive(&self) -> bool {
        !self.options.non_interactive && std::io::stdin().is_terminal()
    }

    /// The directory the driver was invoked from, before it moved to the
    /// configuration file's directory.
    pub fn invoked_from(&self) -> &Path {
        &self.options.invoked_from
    }

    /// Set or unset an environment variable for subsequent commands in this
    /// session only.
    pub fn set_env(&mut self, key: &str, value: Option<&str>) {
        self.env_overlay
            .push((key.to_string(), value.map(ToString::to_string)));
    }

    pub fn log(&self, message: &str) {
        tracing::info!("{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!("{message}");
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!("{message}");
    }

    /// Change the working directory; the guard restores it on drop.
    pub fn chdir(&self, dir: &Path) -> Result<WorkingDirGuard> {
        self.log(&format!("cd {}", dir.display()));
        let previous = std::env::current_dir()?;
        std::env::set_current_dir(dir)?;
        Ok(WorkingDirGuard { previous })
    }

    /// Enqueue another session after this one finishes. Idempotent per
    /// target.
    pub fn notify(&mut self, target: &str, posargs: Option<Vec<String>>) {
        let notification = Notification {
            target: target.to_string(),
            posargs,
        };
        if !self.notifications.contains(&notification) {
            self.notifications.push(notification);
        }
    }

    /// Create (and export as TMPDIR) a temp directory inside the env dir.
    pub fn create_tmp(&mut self) -> Result<PathBuf> {
        let tmp = self.env.location.join("tmp");
        std::fs::create_dir_all(&tmp)?;
        let absolute = tmp.canonicalize()?;
        self.set_env("TMPDIR", Some(&absolute.display().to_string()));
        self.tmp = Some(absolute.clone());
        Ok(absolute)
    }

    /// The cross-session cache directory under the env root. Creation takes
    /// an advisory lock so concurrent writers do not race.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache = self.options.envdir.join(".cache");
        if !cache.is_dir() {
            std::fs::create_dir_all(&self.options.envdir)?;
            let lock_path = self.options.envdir.join(".cache.lock");
            let lock = std::fs::File::create(&lock_path)?;
            lock.lock_exclusive()?;
            std::fs::create_dir_all(&cache)?;
            fs2::FileExt::unlock(&lock)?;
        }
        Ok(cache)
    }

    /// Run a command inside the environment. Skipped under `--install-only`.
    pub fn run(&mut self, argv: &[String], opts: &RunOpts) -> Result<String> {
        if self.options.install_only {
            tracing::info!(
                "skipping {} run, as --install-only is set",
                argv.first().map(String::as_str).unwrap_or("")
            );
            return Ok(String::new());
        }
        self.run_internal(argv, opts)
    }

    /// Run a command even under `--install-only`; skipped instead when the
    /// environment was reused and `--no-install` is in effect. The escape
    /// hatch for shelling out to build tools during installation.
    pub fn run_install(&mut self, argv: &[String], opts: &RunOpts) -> Result<String> {
        if self.skip_installs() {
            return Ok(String::new());
        }
        self.run_internal(argv, opts)
    }

    /// Delegate to the backend's install primitive.
    pub fn install(&mut self, args: &[String], opts: &RunOpts) -> Result<()> {
        if args.is_empty() {
            return Err(Error::InvalidOption(
                "at least one argument is required to install".to_string(),
            ));
        }
        if self.env.kind == BackendKind::None {
            if opts.external != Some(true) {
                return backend_for(BackendKind::None)
                    .install_argv(self.env, args)
                    .map(|_| ());
            }
            // Deprecated escape hatch: installing into the outer
            // interpreter.
            tracing::warn!(
                "session {} installs into the global interpreter; \
                 passthrough installs are deprecated",
                self.name()
            );
            let mut argv = vec![
                "python".to_string(),
                "-m".to_string(),
                "pip".to_string(),
                "install".to_string(),
            ];
            argv.extend(args.iter().cloned());
            let mut opts = opts.clone();
            opts.silent.get_or_insert(true);
            return self.run_internal(&argv, &opts).map(|_| ());
        }
        if self.skip_installs() {
            return Ok(());
        }
        let argv = backend_for(self.env.kind).install_argv(self.env, args)?;
        let mut opts = opts.clone();
        opts.silent.get_or_insert(true);
        opts.external = Some(true);
        self.run_internal(&argv, &opts).map(|_| ())
    }

    /// Conda-family-only install; channels are passed through, with a
    /// warning when omitted.
    pub fn conda_install(
        &mut self,
        args: &[String],
        channels: &[String],
        opts: &RunOpts,
    ) -> Result<()> {
        if !self.env.kind.is_conda_family() {
            return Err(Error::UnsupportedOperation(format!(
                "conda-install is not supported by the {} backend",
                self.venv_backend()
            )));
        }
        if args.is_empty() {
            return Err(Error::InvalidOption(
                "at least one argument is required to conda-install".to_string(),
            ));
        }
        if channels.is_empty() {
            tracing::warn!(
                "no channels given for conda-install; the tool's configured defaults apply"
            );
        }
        if self.skip_installs() {
            return Ok(());
        }
        let mut full: Vec<String> = channels
            .iter()
            .map(|channel| format!("--channel={channel}"))
            .collect();
        for arg in args {
            full.push(quote_conda_spec(arg)?);
        }
        let argv = backend_for(self.env.kind).install_argv(self.env, &full)?;
        let mut opts = opts.clone();
        opts.silent.get_or_insert(true);
        opts.external = Some(true);
        self.run_internal(&argv, &opts).map(|_| ())
    }

    /// Parse the inline metadata block of a script, install its declared
    /// dependencies, and execute it with the session interpreter.
    pub fn run_script(&mut self, path: &Path) -> BodyResult {
        let metadata = script::load_metadata(path).map_err(SessionExit::Fail)?;
        if let Some(requirement) = &metadata.requires_python {
            if let Some(python) = self.python() {
                if !script::python_satisfies(requirement, python) {
                    return Err(SessionExit::Skip(Some(format!(
                        "{} requires python {requirement}, session uses {python}",
                        path.display()
                    ))));
                }
            }
        }
        if !metadata.dependencies.is_empty() {
            self.install(&metadata.dependencies, &RunOpts::default())?;
        }
        let argv = vec!["python".to_string(), path.display().to_string()];
        self.run(&argv, &RunOpts::default())?;
        Ok(())
    }

    fn skip_installs(&self) -> bool {
        self.env.reused && self.options.no_install
    }

    fn composed_env(&self, opts: &RunOpts) -> BTreeMap<String, String> {
        let mut builder = if opts.include_outer_env {
            EnvBuilder::from_host()
        } else {
            EnvBuilder::empty()
        };
        for (key, value) in &self.env.overlay {
            builder.apply(key, value.as_deref());
        }
        for (key, value) in &self.env_overlay {
            builder.apply(key, value.as_deref());
        }
        for (key, value) in &opts.env {
            builder.apply(key, value.as_deref());
        }
        builder.set("TASKLAB_CURRENT_SESSION", &self.instance.name);
        for bin in self.env.bin_paths.iter().rev() {
            builder.prepend_path(bin);
        }
        builder.build()
    }

    fn run_internal(&mut self, argv: &[String], opts: &RunOpts) -> Result<String> {
        if argv.is_empty() {
            return Err(Error::InvalidOption(
                "at least one argument is required to run".to_string(),
            ));
        }
        let env = self.composed_env(opts);
        let external = if opts.external == Some(true) || !self.env.is_sandboxed() {
            ExternalPolicy::Allow
        } else if self.options.error_on_external_run {
            ExternalPolicy::Strict
        } else {
            ExternalPolicy::Warn
        };
        command::run(&RunSpec {
            argv,
            env: &env,
            bin_paths: &self.env.bin_paths,
            silent: opts.silent.unwrap_or(false) && !self.options.verbose,
            success_codes: &opts.success_codes,
            external,
            allowed_globals: &self.env.allowed_globals,
            timeout: opts.timeout,
            log: true,
        })
    }
}

/// Conda package specs containing `<`/`>` must be double-quoted.
fn quote_conda_spec(arg: &str) -> Result<String> {
    if arg.matches('"').count() % 2 != 0 {
        return Err(Error::InvalidOption(format!(
            "ill-formatted package spec with odd number of quotes: {arg}"
        )));
    }
    if !arg.contains('<') && !arg.contains('>') {
        return Ok(arg.to_string());
    }
    if arg.starts_with('"') && arg.ends_with('"') {
        return Ok(arg.to_string());
    }
    if arg.contains('"') {
        return Err(Error::InvalidOption(format!(
            "cannot escape package spec: {arg}"
        )));
    }
    Ok(format!("\"{arg}\""))
}

/// Drives one queue entry to completion.
pub struct SessionRunner<'a> {
    pub entry: &'a QueueEntry,
    pub options: &'a Options,
}

/// A finished run: the result plus any notify requests from the body.
pub struct ExecutedSession {
    pub result: SessionResult,
    pub notifications: Vec<Notification>,
}

impl SessionRunner<'_> {
    pub fn execute(&self) -> ExecutedSession {
        let instance = &self.entry.instance;
        tracing::info!("running session {}", instance.name);
        let started = Instant::now();

        if let Some(reason) = &instance.placeholder_skip {
            return self.finish(started, Status::Skipped, Some(reason.clone()), None);
        }
        if !instance.ignored_pythons.is_empty() {
            tracing::warn!(
                "session {} runs without a backend; its interpreter list [{}] is ignored",
                instance.name,
                instance.ignored_pythons.join(", ")
            );
        }

        let environment = match self.create_environment() {
            Ok(environment) => {
                if let Some(bin) = environment.bin_dir() {
                    tracing::debug!("environment scripts directory: {}", bin.display());
                }
                environment
            }
            Err(Error::InterpreterMissing(spec)) => {
                let reason = format!("interpreter {spec} not found");
                if self.options.error_on_missing_interpreters {
                    return self.finish(started, Status::Failed, Some(reason), None);
                }
                tracing::warn!("missing interpreters error by default on CI systems");
                return self.finish(started, Status::Skipped, Some(reason), None);
            }
            Err(err) => {
                let excerpt = truncate_string(&err.to_string(), FAILURE_EXCERPT_BYTES);
                return self.finish(started, Status::Failed, Some(err.to_string()), Some(excerpt));
            }
        };

        let mut session = Session {
            instance,
            options: self.options,
            env: &environment,
            posargs: self
                .entry
                .posargs
                .clone()
                .unwrap_or_else(|| self.options.posargs.clone()),
            env_overlay: Vec::new(),
            notifications: Vec::new(),
            tmp: None,
        };

        let body = Arc::clone(&instance.decl.body);
        let outcome = catch_unwind(AssertUnwindSafe(|| body.call(&mut session)));
        let notifications = std::mem::take(&mut session.notifications);
        drop(session);

        let (status, reason, excerpt) = match outcome {
            Ok(Ok(())) => (Status::Success, None, None),
            Ok(Err(SessionExit::Skip(reason))) => (Status::Skipped, reason, None),
            Ok(Err(SessionExit::Stop(reason))) => (Status::Failed, reason, None),
            Ok(Err(SessionExit::Fail(Error::Interrupted))) => {
                (Status::Failed, Some("interrupted".to_string()), None)
            }
            Ok(Err(SessionExit::Fail(err))) => {
                let excerpt = truncate_string(&err.to_string(), FAILURE_EXCERPT_BYTES);
                (Status::Failed, Some(err.to_string()), Some(excerpt))
            }
            Err(panic) => {
                let message = panic_message(panic);
                tracing::error!("session {} raised: {message}", instance.name);
                (Status::Failed, Some(message), None)
            }
        };
        ExecutedSession {
            result: SessionResult {
                name: instance.name.clone(),
                base: instance.base.clone(),
                status,
                reason,
                duration: started.elapsed(),
                call_spec: instance.call_spec.clone(),
                log_excerpt: excerpt,
            },
            notifications,
        }
    }

    fn create_environment(&self) -> Result<Environment> {
        let instance = &self.entry.instance;
        let kind = if instance.no_backend {
            BackendKind::None
        } else {
            venv::select_backend(&instance.decl.backend, self.options)?
        };
        let backend = backend_for(kind);
        let location = normalize_env_dir(&self.options.envdir, &instance.name);
        let request = EnvRequest {
            location,
            interpreter: instance.python.as_deref(),
            venv_params: &instance.decl.venv_params,
            reuse: instance.decl.reuse.unwrap_or(self.options.reuse_mode),
            download_python: self.options.download_python,
            verbose: self.options.verbose,
        };
        backend.create(&request)
    }

    fn finish(
        &self,
        started: Instant,
        status: Status,
        reason: Option<String>,
        excerpt: Option<String>,
    ) -> ExecutedSession {
        let instance = &self.entry.instance;
        ExecutedSession {
            result: SessionResult {
                name: instance.name.clone(),
                base: instance.base.clone(),
                status,
                reason,
                duration: started.elapsed(),
                call_spec: instance.call_spec.clone(),
                log_excerpt: excerpt,
            },
            notifications: Vec::new(),
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "session body panicked".to_string()
    }
}

/// Mark a never-run entry aborted.
pub fn aborted_result(entry: &QueueEntry) -> SessionResult {
    SessionResult {
        name: entry.instance.name.clone(),
        base: entry.instance.base.clone(),
        status: Status::Aborted,
        reason: None,
        duration: Duration::ZERO,
        call_spec: entry.instance.call_spec.clone(),
        log_excerpt: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::Args;
    use crate::manifest::expand;
    use crate::options::FileOptions;
    use crate::registry::Registry;

    fn test_options() -> Options {
        Options::merge(&Args::default(), &FileOptions::default()).unwrap()
    }

    fn test_instance(options: &Options) -> Arc<SessionInstance> {
        let mut registry = Registry::new();
        registry.session("t").body(noop_body()).unwrap();
        expand(registry.snapshot(), options).remove(0)
    }

    fn venv_environment(location: &Path) -> Environment {
        Environment {
            kind: BackendKind::Venv,
            location: location.to_path_buf(),
            interpreter_path: None,
            bin_paths: vec![location.join("bin")],
            reused: false,
            overlay: vec![
                (
                    "VIRTUAL_ENV".to_string(),
                    Some(location.display().to_string()),
                ),
                ("CONDA_PREFIX".to_string(), None),
            ],
            allowed_globals: Vec::new(),
        }
    }

    #[test]
    fn composed_env_honors_the_full_overlay_contract() {
        std::env::set_var("PYTHONHOME", "/host/forced");
        std::env::set_var("CONDA_PREFIX", "/host/conda");
        let options = test_options();
        let instance = test_instance(&options);
        let environment = venv_environment(Path::new("/envs/demo"));
        let mut session = Session {
            instance: &instance,
            options: &options,
            env: &environment,
            posargs: Vec::new(),
            env_overlay: Vec::new(),
            notifications: Vec::new(),
            tmp: None,
        };
        session.set_env("FROM_SESSION", Some("1"));

        let composed = session.composed_env(&RunOpts {
            env: vec![
                ("FROM_CALL".to_string(), Some("2".to_string())),
                ("FROM_SESSION".to_string(), None),
            ],
            ..RunOpts::default()
        });
        std::env::remove_var("PYTHONHOME");
        std::env::remove_var("CONDA_PREFIX");

        // Deny-listed host variables never reach commands.
        assert!(!composed.contains_key("PYTHONHOME"));
        // Backend overlay: sets VIRTUAL_ENV, unsets the competing prefix.
        assert_eq!(
            composed.get("VIRTUAL_ENV").map(String::as_str),
            Some("/envs/demo")
        );
        assert!(!composed.contains_key("CONDA_PREFIX"));
        // The per-call layer wins over session-level mutations.
        assert_eq!(composed.get("FROM_CALL").map(String::as_str), Some("2"));
        assert!(!composed.contains_key("FROM_SESSION"));
        // Every command can see which session owns it.
        assert_eq!(
            composed.get("TASKLAB_CURRENT_SESSION").map(String::as_str),
            Some("t")
        );
        // The env's scripts directory leads the PATH.
        let path: Vec<PathBuf> = std::env::split_paths(&composed["PATH"]).collect();
        assert_eq!(path.first(), Some(&PathBuf::from("/envs/demo/bin")));
    }

    #[test]
    fn per_instance_posargs_copies_do_not_leak() {
        let options = test_options();
        let instance = test_instance(&options);
        let environment = venv_environment(Path::new("/envs/demo"));
        let mut first = Session {
            instance: &instance,
            options: &options,
            env: &environment,
            posargs: vec!["shared".to_string()],
            env_overlay: Vec::new(),
            notifications: Vec::new(),
            tmp: None,
        };
        first.posargs.push("mutated".to_string());

        let second = Session {
            instance: &instance,
            options: &options,
            env: &environment,
            posargs: vec!["shared".to_string()],
            env_overlay: Vec::new(),
            notifications: Vec::new(),
            tmp: None,
        };
        assert_eq!(second.posargs(), &["shared".to_string()]);
        assert_eq!(first.posargs().len(), 2);
    }

    #[test]
    fn conda_spec_quoting_wraps_version_ranges() {
        assert_eq!(quote_conda_spec("numpy").unwrap(), "numpy");
        assert_eq!(quote_conda_spec("dask>=2.1").unwrap(), "\"dask>=2.1\"");
        assert_eq!(
            quote_conda_spec("\"dask>=2.1\"").unwrap(),
            "\"dask>=2.1\""
        );
        assert!(quote_conda_spec("bad\"spec>=1").is_err());
    }

    #[test]
    fn imperfect_phrasing_matches_status() {
        let result = SessionResult {
            name: "t".into(),
            base: "t".into(),
            status: Status::Success,
            reason: None,
            duration: Duration::ZERO,
            call_spec: CallSpec::new(),
            log_excerpt: None,
        };
        assert_eq!(result.imperfect(), "was successful");
        let failed = SessionResult {
            status: Status::Failed,
            reason: Some("returned code 2".into()),
            ..result.clone()
        };
        assert_eq!(failed.imperfect(), "failed: returned code 2");
    }
}

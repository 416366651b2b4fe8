//! The command runner: spawns one external process with a controlled
//! environment, captures or streams its output, and classifies the exit.
//!
//! Program resolution searches the session's bin directories before the
//! inherited PATH; a command that resolves outside the bin directories is
//! "external" and subject to the external-run policy. Interrupts and
//! timeouts both use the same escalation ladder: signal, grace wait,
//! terminate, grace wait, kill.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use wait_timeout::ChildExt;

use crate::errors::{Error, Result};

/// Host variables stripped from every subprocess launched inside an
/// ephemeral environment: the ones virtual-environment tools use to discover
/// a pre-existing environment, plus the ones that force system-wide
/// interpreter selection. Additions are a minor version bump.
pub const DENIED_HOST_VARS: &[&str] = &[
    "PIP_RESPECT_VIRTUALENV",
    "PIP_REQUIRE_VIRTUALENV",
    "__PYVENV_LAUNCHER__",
    "UV_SYSTEM_PYTHON",
    "PYTHONHOME",
];

const DEFAULT_INTERRUPT_GRACE: Duration = Duration::from_millis(300);
const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_millis(200);
const WAIT_TICK: Duration = Duration::from_millis(100);

static INTERRUPT_FLAG: std::sync::OnceLock<Arc<AtomicBool>> = std::sync::OnceLock::new();

/// Register the driver-level SIGINT observer. Safe to call more than once;
/// the default handler is replaced so the driver can finish child cleanup
/// and exit on its own terms.
pub fn install_interrupt_handler() {
    let flag = INTERRUPT_FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)));
    #[cfg(unix)]
    {
        let _ = signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(flag));
    }
    #[cfg(not(unix))]
    let _ = flag;
}

pub fn interrupted() -> bool {
    INTERRUPT_FLAG
        .get()
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Environment-builder value type: (host − deny-list) + ordered overlays.
/// An overlay value of `None` unsets the key; a `PATH` overlay entry is
/// prepended rather than replacing the inherited value.
#[derive(Debug, Clone, Default)]
pub struct EnvBuilder {
    include_host: bool,
    entries: Vec<(String, Option<String>)>,
    path_prepend: Vec<PathBuf>,
}

impl EnvBuilder {
    pub fn from_host() -> EnvBuilder {
        EnvBuilder {
            include_host: true,
            entries: Vec::new(),
            path_prepend: Vec::new(),
        }
    }

    pub fn empty() -> EnvBuilder {
        EnvBuilder::default()
    }

    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        self.entries.push((key.to_string(), Some(value.to_string())));
        self
    }

    pub fn unset(&mut self, key: &str) -> &mut Self {
        self.entries.push((key.to_string(), None));
        self
    }

    pub fn apply(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        self.entries
            .push((key.to_string(), value.map(ToString::to_string)));
        self
    }

    pub fn prepend_path(&mut self, dir: &Path) -> &mut Self {
        self.path_prepend.push(dir.to_path_buf());
        self
    }

    pub fn build(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if self.include_host {
            for (key, value) in std::env::vars() {
                env.insert(key, value);
            }
            for key in DENIED_HOST_VARS {
                env.remove(*key);
            }
        }
        for (key, value) in &self.entries {
            match (key.as_str(), value) {
                ("PATH", Some(value)) => {
                    let mut parts = vec![PathBuf::from(value)];
                    if let Some(existing) = env.get("PATH") {
                        parts.extend(std::env::split_paths(existing));
                    }
                    if let Ok(joined) = std::env::join_paths(parts) {
                        env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
                    }
                }
                (_, Some(value)) => {
                    env.insert(key.clone(), value.clone());
                }
                (_, None) => {
                    env.remove(key);
                }
            }
        }
        if !self.path_prepend.is_empty() {
            let mut parts = self.path_prepend.clone();
            if let Some(existing) = env.get("PATH") {
                parts.extend(std::env::split_paths(existing));
            }
            if let Ok(joined) = std::env::join_paths(parts) {
                env.insert("PATH".to_string(), joined.to_string_lossy().into_owned());
            }
        }
        env
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalPolicy {
    Allow,
    Warn,
    Strict,
}

/// One command invocation against a composed environment.
pub struct RunSpec<'a> {
    pub argv: &'a [String],
    pub env: &'a BTreeMap<String, String>,
    /// Session bin directories, searched before PATH. Empty for passthrough
    /// sessions, which are never subject to the external check.
    pub bin_paths: &'a [PathBuf],
    pub silent: bool,
    pub success_codes: &'a [i32],
    pub external: ExternalPolicy,
    /// Program names that are expected to live outside the environment
    /// (the backend's own tools).
    pub allowed_globals: &'a [String],
    pub timeout: Option<Duration>,
    pub log: bool,
}

impl<'a> RunSpec<'a> {
    pub fn new(argv: &'a [String], env: &'a BTreeMap<String, String>) -> RunSpec<'a> {
        RunSpec {
            argv,
            env,
            bin_paths: &[],
            silent: false,
            success_codes: &[0],
            external: ExternalPolicy::Warn,
            allowed_globals: &[],
            timeout: None,
            log: true,
        }
    }
}

/// Execute the command. Returns the captured output for silent runs, an
/// empty string otherwise.
pub fn run(spec: &RunSpec<'_>) -> Result<String> {
    assert!(!spec.argv.is_empty(), "argv must be non-empty");
    let program = &spec.argv[0];
    let display_str = shell_words::join(spec.argv.iter().map(String::as_str));

    let (resolved, external) = resolve_program(program, spec.bin_paths, spec.env)?;
    if external && !spec.bin_paths.is_empty() && !spec.allowed_globals.contains(program) {
        match spec.external {
            ExternalPolicy::Strict => {
                tracing::error!(
                    "{program} is not installed in the session environment (found {}); \
                     pass external to allow running it",
                    resolved.display()
                );
                return Err(Error::ExternalUse {
                    program: program.clone(),
                });
            }
            ExternalPolicy::Warn => {
                tracing::warn!(
                    "{program} is not installed in the session environment (found {})",
                    resolved.display()
                );
            }
            ExternalPolicy::Allow => {}
        }
    }

    if spec.log {
        tracing::info!("{display_str}");
    }

    let mut command = Command::new(&resolved);
    command.args(&spec.argv[1..]);
    command.env_clear();
    command.envs(spec.env);
    if spec.silent {
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
    }

    let mut child = command.spawn().map_err(|err| Error::CommandFailed {
        command: display_str.clone(),
        reason: Some(format!("failed to spawn {}: {err}", resolved.display())),
    })?;

    let stdout_reader = spawn_pipe_reader(child.stdout.take());
    let stderr_reader = spawn_pipe_reader(child.stderr.take());

    let waited = wait_with_policies(&mut child, spec.timeout)?;

    let mut output = collect_pipe(stdout_reader);
    output.push_str(&collect_pipe(stderr_reader));

    match waited {
        Waited::Interrupted => {
            tracing::error!("command interrupted");
            Err(Error::Interrupted)
        }
        Waited::TimedOut => {
            if spec.silent && !output.is_empty() {
                tracing::warn!("{output}");
            }
            Err(Error::CommandFailed {
                command: display_str,
                reason: Some("timed out".to_string()),
            })
        }
        Waited::Exited(status) => {
            let code = status.code().unwrap_or(-1);
            if spec.success_codes.contains(&code) {
                if spec.silent && !output.is_empty() {
                    tracing::debug!("{output}");
                }
                Ok(output)
            } else {
                if spec.silent && !output.is_empty() {
                    tracing::warn!("{output}");
                }
                let reason = if status.code().is_none() {
                    "terminated by signal".to_string()
                } else {
                    format!("returned code {code}")
                };
                tracing::error!("command {display_str} failed: {reason}");
                Err(Error::CommandFailed {
                    command: display_str,
                    reason: Some(reason),
                })
            }
        }
    }
}

enum Waited {
    Exited(std::process::ExitStatus),
    Interrupted,
    TimedOut,
}

/// Wait for the child, honoring the driver-level interrupt flag and the
/// per-command timeout. Both escalate: signal, grace wait, terminate, grace
/// wait, kill.
fn wait_with_policies(child: &mut Child, timeout: Option<Duration>) -> Result<Waited> {
    let started = Instant::now();
    loop {
        if interrupted() {
            signal_child(child, ChildSignal::Interrupt);
            shutdown_child(child)?;
            return Ok(Waited::Interrupted);
        }
        if let Some(limit) = timeout {
            if started.elapsed() >= limit {
                signal_child(child, ChildSignal::Interrupt);
                shutdown_child(child)?;
                return Ok(Waited::TimedOut);
            }
        }
        match child.wait_timeout(WAIT_TICK)? {
            Some(status) => return Ok(Waited::Exited(status)),
            None => continue,
        }
    }
}

/// The terminate half of the ladder: SIGTERM, grace wait, SIGKILL.
fn shutdown_child(child: &mut Child) -> Result<()> {
    if child.wait_timeout(DEFAULT_INTERRUPT_GRACE)?.is_some() {
        return Ok(());
    }
    signal_child(child, ChildSignal::Terminate);
    if child.wait_timeout(DEFAULT_TERMINATE_GRACE)?.is_some() {
        return Ok(());
    }
    let _ = child.kill();
    child.wait()?;
    Ok(())
}

enum ChildSignal {
    Interrupt,
    Terminate,
}

#[cfg(unix)]
fn signal_child(child: &Child, signal: ChildSignal) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let signal = match signal {
        ChildSignal::Interrupt => Signal::SIGINT,
        ChildSignal::Terminate => Signal::SIGTERM,
    };
    let _ = kill(Pid::from_raw(child.id() as i32), signal);
}

#[cfg(not(unix))]
fn signal_child(child: &Child, _signal: ChildSignal) {
    // No graded signals on this platform; the kill in shutdown_child is the
    // only escalation step.
    let _ = child;
}

fn spawn_pipe_reader<R>(pipe: Option<R>) -> Option<thread::JoinHandle<String>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = pipe.read_to_end(&mut buffer);
            String::from_utf8_lossy(&buffer).into_owned()
        })
    })
}

fn collect_pipe(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Resolve argv[0]. Explicit paths pass through; bare names search the bin
/// directories first, then the environment's PATH. The second return value
/// says whether the resolution landed outside every bin directory.
fn resolve_program(
    program: &str,
    bin_paths: &[PathBuf],
    env: &BTreeMap<String, String>,
) -> Result<(PathBuf, bool)> {
    let explicit = Path::new(program).is_absolute()
        || program.starts_with("./")
        || program.starts_with(".\\")
        || program.contains(std::path::MAIN_SEPARATOR);
    let resolved = if explicit {
        PathBuf::from(program)
    } else {
        let mut search: Vec<PathBuf> = bin_paths.to_vec();
        if let Some(path) = env.get("PATH") {
            search.extend(std::env::split_paths(path));
        }
        let joined = std::env::join_paths(search).map_err(|err| Error::CommandFailed {
            command: program.to_string(),
            reason: Some(err.to_string()),
        })?;
        let cwd = std::env::current_dir()?;
        which::which_in(program, Some(joined), cwd).map_err(|_| {
            tracing::error!("program {program} not found");
            Error::CommandFailed {
                command: program.to_string(),
                reason: Some("program not found".to_string()),
            }
        })?
    };
    let external = !bin_paths.iter().any(|bin| resolved.starts_with(bin));
    Ok((resolved, external))
}

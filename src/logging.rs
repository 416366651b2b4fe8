//! Tracing subscriber setup for the driver's single serialized log stream.

use std::io::IsTerminal;

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    pub fn enabled(self) -> bool {
        match self {
            ColorMode::Always => true,
            ColorMode::Never => false,
            ColorMode::Auto => std::io::stderr().is_terminal(),
        }
    }
}

/// Install the global subscriber. Called once, before any session runs.
pub fn setup(verbose: bool, color: ColorMode, add_timestamp: bool) {
    let filter = if verbose { "tasklab=debug" } else { "tasklab=info" };
    let filter = EnvFilter::try_from_env("TASKLAB_LOG").unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .with_ansi(color.enabled())
        .with_writer(std::io::stderr);

    // Ignore the error when a subscriber is already installed, which happens
    // when tests drive the workflow more than once in a process.
    if add_timestamp {
        let _ = builder.try_init();
    } else {
        let _ = builder.without_time().try_init();
    }
}

//! Driver entry point: parse the CLI, run the workflow, map errors onto the
//! documented exit codes (0 success, 1 failures, 2 argument errors from
//! clap, 3 configuration/selection errors).

use std::process::ExitCode;

use clap::Parser;

mod cli;
mod command;
mod config;
mod errors;
mod interpreters;
mod keywords;
mod logging;
mod manifest;
mod options;
mod parametrize;
mod registry;
mod report;
mod script;
mod sessions;
mod util;
mod venv;
mod workflow;

fn main() -> ExitCode {
    let args = cli::Args::parse();
    match workflow::execute(args) {
        Ok(code) => ExitCode::from(code.clamp(0, u8::MAX as i32) as u8),
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::from(err.exit_code().clamp(0, u8::MAX as i32) as u8)
        }
    }
}

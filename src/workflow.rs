//! The top-level task chain: load the configuration, merge options, expand
//! and filter the manifest, honor a list request, run the queue, and report.
//!
//! Every step either hands its product to the next step or short-circuits
//! with an exit code, mirroring the sequential control flow of the CLI.

use crate::cli::Args;
use crate::command;
use crate::config;
use crate::errors::{Error, Result};
use crate::logging::{self, ColorMode};
use crate::manifest::{expand, Manifest};
use crate::options::Options;
use crate::report;
use crate::sessions::{aborted_result, SessionResult, SessionRunner, Status};

/// Exit code used after a SIGINT once children are cleaned up.
const INTERRUPT_EXIT: i32 = 130;

pub fn execute(args: Args) -> Result<i32> {
    let color = if args.forcecolor {
        ColorMode::Always
    } else if args.nocolor || std::env::var_os("NO_COLOR").is_some() {
        ColorMode::Never
    } else {
        ColorMode::Auto
    };
    logging::setup(args.verbose, color, args.add_timestamp);

    let config_file = config::locate(args.file.as_deref())?;
    let config_file = config_file.canonicalize().map_err(|err| Error::ConfigLoad {
        path: config_file.clone(),
        message: err.to_string(),
    })?;
    let mut loaded = config::load(&config_file)?;

    let mut options = Options::merge(&args, &loaded.options)?;
    options.config_file = config_file.clone();
    match options.color {
        ColorMode::Always => colored::control::set_override(true),
        ColorMode::Never => colored::control::set_override(false),
        ColorMode::Auto => {}
    }
    tracing::debug!(
        "evaluator self-dependency policy: {:?} (backend {})",
        options.script_mode,
        options.script_venv_backend.as_deref().unwrap_or("default")
    );

    // Sessions run relative to the configuration file, wherever the driver
    // was invoked from.
    if let Some(parent) = config_file.parent() {
        std::env::set_current_dir(parent)?;
    }

    let decls = loaded.registry.snapshot();
    let instances = expand(decls, &options);
    let mut manifest = Manifest::new(instances);

    let filtered_explicitly = apply_filters(&mut manifest, &options)?;

    if options.list {
        report::print_list(&manifest, &options.config_file, options.list_json)?;
        return Ok(0);
    }

    if manifest.is_empty() {
        if filtered_explicitly {
            return Err(Error::EmptySelection);
        }
        // Nothing selected and nothing asked for: show what exists and
        // succeed.
        report::print_list(&manifest, &options.config_file, false)?;
        return Ok(0);
    }

    manifest.schedule()?;

    command::install_interrupt_handler();
    let results = run_manifest(&mut manifest, &options)?;

    report::print_summary(&results);
    if let Some(path) = &options.report {
        report::write_report(path, &results)?;
    }

    if command::interrupted() {
        return Ok(INTERRUPT_EXIT);
    }
    if results.iter().any(SessionResult::is_failure) {
        return Ok(1);
    }
    Ok(0)
}

/// Apply the selection filters in order. Returns whether the user asked for
/// an explicit selection (which turns an empty result into an error).
fn apply_filters(manifest: &mut Manifest, options: &Options) -> Result<bool> {
    let mut explicit = false;
    match &options.sessions {
        Some(names) if names.is_empty() => {
            // An explicitly empty selection runs nothing, successfully.
            manifest.drain_remaining();
            return Ok(false);
        }
        Some(names) => {
            explicit = true;
            manifest.filter_by_names(names)?;
        }
        None => manifest.keep_defaults(),
    }
    if let Some(pythons) = &options.pythons {
        explicit = true;
        manifest.filter_by_pythons(pythons);
    }
    if let Some(keywords) = &options.keywords {
        explicit = true;
        manifest.filter_by_keywords(keywords)?;
    }
    if let Some(tags) = &options.tags {
        explicit = true;
        manifest.filter_by_tags(tags);
    }
    Ok(explicit)
}

/// Drive the queue to completion, honoring stop-on-first-error and the
/// driver-level interrupt.
fn run_manifest(manifest: &mut Manifest, options: &Options) -> Result<Vec<SessionResult>> {
    let mut results = Vec::new();
    while let Some(entry) = manifest.next_entry() {
        let runner = SessionRunner {
            entry: &entry,
            options,
        };
        let executed = runner.execute();
        let mut result = executed.result;

        // Notifications apply after the notifier finishes; a bad target is
        // the notifier's failure.
        if result.status == Status::Success {
            for notification in executed.notifications {
                if let Err(err) = manifest.notify(&notification.target, notification.posargs) {
                    result.status = Status::Failed;
                    result.reason = Some(err.to_string());
                    break;
                }
            }
        }

        report::log_result(&result);
        let failed = result.is_failure();
        results.push(result);

        if command::interrupted() {
            tracing::error!("interrupted; aborting remaining sessions");
            for remaining in manifest.drain_remaining() {
                results.push(aborted_result(&remaining));
            }
            break;
        }
        if failed && options.stop_on_first_error {
            for remaining in manifest.drain_remaining() {
                results.push(aborted_result(&remaining));
            }
            break;
        }
    }
    Ok(results)
}

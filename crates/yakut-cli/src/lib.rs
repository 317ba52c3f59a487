//! # yakut-cli
//!
//! The `yakut` command-line tool and its short alias `y`.
//!
//! Both binaries call [`main`], which parses the command line (every long
//! option may also come from a `YAKUT_*` environment variable), sets up
//! logging to stderr, and dispatches to one module per subcommand under
//! [`commands`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod app_descriptor;
pub mod commands;
pub mod context;
pub mod controller;
pub mod expr;
pub mod output;
pub mod ui;
pub mod yaml;

use std::process::ExitCode;

use tracing_subscriber::EnvFilter;
use yakut_common::constants::{ENV_LOG, ENV_LOG_FORMAT, EXIT_CODE_INTERRUPTED, EXIT_CODE_UNSUCCESSFUL};

use crate::ui::{ExitStatus, Interrupted};

/// Log filter for the number of `-v` flags.
#[must_use]
pub const fn verbosity_filter(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

fn init_logging(verbosity: u8) {
    let filter = std::env::var(ENV_LOG)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| EnvFilter::new(verbosity_filter(verbosity)));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);
    let json = std::env::var(ENV_LOG_FORMAT).is_ok_and(|f| f.trim().eq_ignore_ascii_case("json"));
    let _ = if json { builder.json().try_init() } else { builder.try_init() };
}

/// Process exit code of a command failure.
#[must_use]
pub fn exit_code_of(error: &anyhow::Error) -> i32 {
    if let Some(ExitStatus(code)) = error.downcast_ref::<ExitStatus>() {
        return *code;
    }
    if error.downcast_ref::<Interrupted>().is_some() {
        return EXIT_CODE_INTERRUPTED;
    }
    EXIT_CODE_UNSUCCESSFUL
}

fn to_exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code.rem_euclid(256)).unwrap_or(u8::MAX))
}

/// Entry point shared by the `yakut` and `y` binaries.
pub fn main() -> ExitCode {
    let cli = match commands::parse(std::env::args_os()) {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return to_exit_code(e.exit_code());
        }
    };
    init_logging(cli.verbose);
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "starting");
    match commands::execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code_of(&e);
            if e.downcast_ref::<ExitStatus>().is_none() {
                if e.downcast_ref::<Interrupted>().is_some() {
                    tracing::info!("interrupted");
                } else {
                    ui::show_error(&format!("{e:#}"));
                }
            }
            to_exit_code(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(verbosity_filter(0), "warn");
        assert_eq!(verbosity_filter(1), "info");
        assert_eq!(verbosity_filter(5), "debug");
    }

    #[test]
    fn failures_map_to_exit_codes() {
        assert_eq!(exit_code_of(&anyhow::anyhow!("boom")), EXIT_CODE_UNSUCCESSFUL);
        assert_eq!(exit_code_of(&ExitStatus(42).into()), 42);
        assert_eq!(exit_code_of(&Interrupted.into()), EXIT_CODE_INTERRUPTED);
    }
}

//! `yakut orchestrate` — Run a composition of processes from an orc-file.

use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::Context as _;
use clap::Args;
use tokio::signal::unix::{SignalKind, signal};
use yakut_orchestrate::{Env, Stack, exec_file};

use crate::context::Context;
use crate::ui::ExitStatus;

/// Arguments for the `orchestrate` command.
#[derive(Args, Debug)]
#[command(after_help = "\
An orc-file is a YAML composition: keys with a dot are registers (exported as UAVCAN__ variables),
other plain keys are environment variables, and keys ending with = are directives: ?= predicate,
$= main script, .= finalizer and external= other orc-files to run first. Script statements are
shell commands, nested compositions, or null, which waits for the statements launched before it.

The exit code is that of the composition. If it succeeded but the orchestrator was stopped by
SIGINT, SIGTERM or SIGHUP, the exit code is the negated signal number.

Example:
    yakut orc launch.orc.yaml")]
pub struct OrchestrateArgs {
    /// The orc-file; relative paths are also searched in the lookup paths.
    #[arg(value_name = "FILE")]
    pub file: String,
}

/// The composition's code, or the negated signal number if it succeeded
/// but a stop was requested.
const fn final_code(composition: i32, signal: i32) -> i32 {
    if composition != 0 { composition } else { -signal }
}

async fn watch_signals(received: Arc<AtomicI32>) -> anyhow::Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("SIGTERM")?;
    let mut sighup = signal(SignalKind::hangup()).context("SIGHUP")?;
    loop {
        let (num, name) = tokio::select! {
            _ = sigint.recv() => (SignalKind::interrupt().as_raw_value(), "SIGINT"),
            _ = sigterm.recv() => (SignalKind::terminate().as_raw_value(), "SIGTERM"),
            _ = sighup.recv() => (SignalKind::hangup().as_raw_value(), "SIGHUP"),
        };
        tracing::info!(signal = num, "orchestrator received {name}, stopping");
        received.store(num, Ordering::SeqCst);
    }
}

/// Executes the `orchestrate` command.
///
/// # Errors
///
/// Returns [`ExitStatus`] with the composition's code when it is nonzero.
pub fn execute(args: OrchestrateArgs, ctx: &Context) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("cannot start the async runtime")?;
    let received = Arc::new(AtomicI32::new(0));
    let lookup = ctx.lookup_dirs();
    let code = runtime.block_on(async {
        let watcher = tokio::spawn(watch_signals(Arc::clone(&received)));
        let flag = Arc::clone(&received);
        let file = args.file.clone();
        let executed = tokio::task::spawn_blocking(move || {
            let octx = yakut_orchestrate::Context::new(lookup);
            let gate = move || flag.load(Ordering::SeqCst) == 0;
            exec_file(&octx, &file, &mut Env::new(), &gate, &Stack::default())
        })
        .await;
        watcher.abort();
        executed.context("the orchestrator thread failed")
    })?;
    let code = final_code(code, received.load(Ordering::SeqCst));
    tracing::debug!(file = %args.file, code, "orchestration finished");
    if code == 0 { Ok(()) } else { Err(ExitStatus(code).into()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_is_reported_only_on_success() {
        assert_eq!(final_code(0, 0), 0);
        assert_eq!(final_code(0, 15), -15);
        assert_eq!(final_code(3, 15), 3);
        assert_eq!(final_code(124, 0), 124);
    }
}

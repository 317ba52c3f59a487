//! Shell child processes with non-blocking control.
//!
//! Every child runs `sh -c CMD` as the leader of its own process group, so
//! that signals reach the whole tree the shell spawns. Output goes straight
//! to the orchestrator's stdout and stderr.

use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child as Process, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

use crate::schema::Env;

/// Signal that starts a graceful stop.
pub const SIGNAL_INTERRUPT: Signal = Signal::SIGINT;
/// Signal sent once the interrupt was ignored.
pub const SIGNAL_TERMINATE: Signal = Signal::SIGTERM;
/// Signal sent as the last resort.
pub const SIGNAL_KILL: Signal = Signal::SIGKILL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Escalation {
    Terminate,
    Kill,
}

/// A running shell command.
#[derive(Debug)]
pub struct Child {
    process: Process,
    result: Option<i32>,
    schedule: Vec<(Instant, Escalation)>,
}

/// Exit code of a status; death by signal is the negated signal number.
fn exit_code(status: ExitStatus) -> i32 {
    status.code().or_else(|| status.signal().map(|s| -s)).unwrap_or(-1)
}

impl Child {
    /// Starts `cmd` with the orchestrator's environment extended by `env`.
    ///
    /// # Errors
    ///
    /// Returns an error if the shell cannot be started.
    pub fn spawn(cmd: &str, env: &Env) -> io::Result<Self> {
        let process = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0)
            .spawn()?;
        Ok(Self {
            process,
            result: None,
            schedule: Vec::new(),
        })
    }

    /// Process-ID of the shell; stays valid after it exits.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.process.id()
    }

    fn signal(&self, signal: Signal) {
        let Ok(raw) = i32::try_from(self.pid()) else {
            return;
        };
        match killpg(Pid::from_raw(raw), signal) {
            Ok(()) => tracing::debug!(pid = raw, ?signal, "signal sent to process group"),
            Err(e) => tracing::debug!(pid = raw, ?signal, error = %e, "process group not signaled"),
        }
    }

    fn try_wait(&mut self) -> Option<i32> {
        match self.process.try_wait() {
            Ok(status) => status.map(exit_code),
            Err(e) => {
                tracing::error!(pid = self.pid(), error = %e, "cannot query child status");
                Some(-1)
            }
        }
    }

    /// Returns the exit code once the child has finished, blocking for at
    /// most `timeout`. Pending signal escalations are carried out here.
    pub fn poll(&mut self, timeout: Duration) -> Option<i32> {
        if self.result.is_none() {
            if let Some(&(deadline, step)) = self.schedule.first() {
                if Instant::now() >= deadline {
                    let _ = self.schedule.remove(0);
                    match step {
                        Escalation::Terminate => {
                            tracing::warn!(pid = self.pid(), "child is still alive, escalating to SIGTERM");
                            self.signal(SIGNAL_TERMINATE);
                        }
                        Escalation::Kill => {
                            tracing::error!(
                                pid = self.pid(),
                                "child is still alive, escalating to SIGKILL and detaching; no further attempts will be made"
                            );
                            self.kill();
                        }
                    }
                }
            }
            let mut status = self.try_wait();
            if status.is_none() {
                std::thread::sleep(timeout);
                status = self.try_wait();
            }
            if status.is_some() {
                self.result = status;
            }
        }
        self.result
    }

    /// Sends SIGINT and schedules SIGTERM after `escalate_after` and SIGKILL
    /// after `give_up_after`. Does nothing if the child has finished.
    pub fn stop(&mut self, escalate_after: Duration, give_up_after: Duration) {
        if self.result.is_some() || self.try_wait().is_some() {
            return;
        }
        let give_up_after = give_up_after.max(escalate_after);
        tracing::debug!(pid = self.pid(), ?escalate_after, ?give_up_after, "stopping child");
        self.signal(SIGNAL_INTERRUPT);
        let now = Instant::now();
        self.schedule = vec![
            (now + escalate_after, Escalation::Terminate),
            (now + give_up_after, Escalation::Kill),
        ];
    }

    /// Kills the whole process group at once.
    pub fn kill(&mut self) {
        if self.result.is_none() {
            self.result = Some(-(SIGNAL_KILL as i32));
        }
        self.signal(SIGNAL_KILL);
        // SIGKILL cannot be caught, so reaping the shell does not block for long.
        if let Err(e) = self.process.wait() {
            tracing::warn!(pid = self.pid(), error = %e, "cannot reap the killed child");
        }
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if self.try_wait().is_none() {
            self.kill();
        }
    }
}

//! Execution of compositions.
//!
//! Failures never surface as Rust errors: like the processes it runs, the
//! executor reports everything through exit codes. Statements of a script run
//! concurrently on scoped threads; the first nonzero code wins and closes the
//! gate of its siblings, which are then stopped.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::child::Child;
use crate::schema::{Composition, Env, Statement, load_ast, load_composition};

/// The orc-file is malformed.
pub const EXIT_SCHEMA_ERROR: i32 = 125;
/// The orc-file cannot be found or read.
pub const EXIT_FILE_ERROR: i32 = 124;
/// The shell cannot be started.
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

/// Returns `false` once execution shall wind down.
pub type Gate<'a> = &'a (dyn Fn() -> bool + Sync);

/// Settings shared by the whole run.
#[derive(Debug, Clone)]
pub struct Context {
    /// Directories searched for relative orc-file paths, in order.
    pub lookup_paths: Vec<PathBuf>,
    /// How long a child is waited for between gate checks.
    pub poll_interval: Duration,
}

impl Context {
    /// A context searching `lookup_paths`.
    #[must_use]
    pub const fn new(lookup_paths: Vec<PathBuf>) -> Self {
        Self {
            lookup_paths,
            poll_interval: Duration::from_millis(50),
        }
    }

    /// Absolute paths are taken as is if they exist; relative ones are
    /// searched in the lookup paths.
    #[must_use]
    pub fn locate(&self, file: &str) -> Option<PathBuf> {
        let p = Path::new(file);
        if p.is_absolute() {
            return p.exists().then(|| p.to_path_buf());
        }
        self.lookup_paths.iter().map(|d| d.join(p)).find(|c| c.exists())
    }
}

/// Position in the composition tree, shown on every log line.
#[derive(Debug, Clone, Default)]
pub struct Stack(Vec<String>);

impl Stack {
    /// The stack extended by `node`.
    #[must_use]
    pub fn push(&self, node: impl fmt::Display) -> Self {
        let mut path = self.0.clone();
        path.push(node.to_string());
        Self(path)
    }

    fn lines(lines: &[&str]) -> String {
        lines.join("\n")
    }

    /// Logs at debug level.
    pub fn debug(&self, lines: &[&str]) {
        tracing::debug!("Call stack: {self}\n{}", Self::lines(lines));
    }

    /// Logs at info level.
    pub fn info(&self, lines: &[&str]) {
        tracing::info!("Call stack: {self}\n{}", Self::lines(lines));
    }

    /// Logs at warning level.
    pub fn warn(&self, lines: &[&str]) {
        tracing::warn!("Call stack: {self}\n{}", Self::lines(lines));
    }
}

impl fmt::Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

/// Runs an orc-file. `env` is inherited by the composition and afterwards
/// updated with the variables it defines.
pub fn exec_file(ctx: &Context, file: &str, env: &mut Env, gate: Gate<'_>, stack: &Stack) -> i32 {
    let searched: Vec<String> = ctx.lookup_paths.iter().map(|p| p.display().to_string()).collect();
    let Some(path) = ctx.locate(file) else {
        let head = format!("Cannot locate file {file:?} in:");
        let mut lines = vec![head.as_str()];
        lines.extend(searched.iter().map(String::as_str));
        stack.warn(&lines);
        return EXIT_FILE_ERROR;
    };
    stack.debug(&[&format!("Executing file {file:?} found at: {}", path.display())]);
    let text = match std::fs::read_to_string(&path) {
        Ok(t) => t,
        Err(e) => {
            stack.warn(&[&format!("Cannot read file {}: {e}", path.display())]);
            return EXIT_FILE_ERROR;
        }
    };
    let comp = match load_ast(&text).and_then(|ast| load_composition(&ast, env)) {
        Ok(c) => c,
        Err(e) => {
            stack.warn(&[&format!("Cannot load file {}: {e}", path.display())]);
            return EXIT_SCHEMA_ERROR;
        }
    };
    env.extend(comp.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    let stack = stack.push(format!("{file:?}"));
    stack.debug(&["Loaded composition", &format!("{comp:?}")]);
    exec_composition(ctx, &comp, gate, &stack)
}

/// Runs externals, predicate, main and finalizer. The result is the main
/// script's code if nonzero, else the finalizer's; a failed predicate
/// yields zero.
pub fn exec_composition(ctx: &Context, comp: &Composition, gate: Gate<'_>, stack: &Stack) -> i32 {
    let mut env = comp.env.clone();
    for file in &comp.external {
        let res = exec_file(ctx, file, &mut env, gate, &stack.push("external"));
        if res != 0 {
            return res;
        }
    }
    let kill_timeout = comp.kill_timeout();
    let run = |node: &str, script: &[Statement], gate: Gate<'_>| {
        let inner = stack.push(node);
        let started = Instant::now();
        let res = exec_script(ctx, script, &env, kill_timeout, gate, &inner);
        inner.debug(&[&format!("Script exit status {res} in {:.1} sec", started.elapsed().as_secs_f64())]);
        res
    };
    if run("?", &comp.predicate, gate) != 0 {
        return 0;
    }
    let res = run("$", &comp.main, gate);
    let res_fin = run(".", &comp.finalizer, &|| true);
    if res != 0 { res } else { res_fin }
}

/// Runs the statements concurrently. Returns the code of the first statement
/// to fail, or zero.
pub fn exec_script(
    ctx: &Context,
    script: &[Statement],
    env: &Env,
    kill_timeout: f64,
    gate: Gate<'_>,
    stack: &Stack,
) -> i32 {
    if script.is_empty() {
        return 0;
    }
    // Zero means nothing has failed yet.
    let first_failure = AtomicI32::new(0);
    let inner_gate = || first_failure.load(Ordering::SeqCst) == 0 && gate();
    let accept = |res: i32| {
        if res != 0 {
            let _ = first_failure.compare_exchange(0, res, Ordering::SeqCst, Ordering::SeqCst);
        }
    };
    thread::scope(|scope| {
        let mut pending: Vec<thread::ScopedJoinHandle<'_, ()>> = Vec::new();
        for (index, stmt) in script.iter().enumerate() {
            let stmt_stack = stack.push(index);
            if !inner_gate() {
                break;
            }
            match stmt {
                Statement::Shell(cmd) => {
                    let (inner_gate, accept) = (&inner_gate, &accept);
                    pending.push(scope.spawn(move || {
                        accept(exec_shell(ctx, cmd, env, kill_timeout, inner_gate, &stmt_stack));
                    }));
                }
                Statement::Composition(comp) => {
                    let (inner_gate, accept) = (&inner_gate, &accept);
                    pending.push(scope.spawn(move || {
                        accept(exec_composition(ctx, comp, inner_gate, &stmt_stack));
                    }));
                }
                Statement::Join => {
                    let running = pending.iter().filter(|h| !h.is_finished()).count();
                    stmt_stack.debug(&[&format!("Waiting for {running} pending statements to join")]);
                    for handle in pending.drain(..) {
                        if handle.join().is_err() {
                            accept(1);
                        }
                    }
                }
            }
        }
        for handle in pending {
            if handle.join().is_err() {
                accept(1);
            }
        }
    });
    first_failure.load(Ordering::SeqCst)
}

fn exec_shell(ctx: &Context, cmd: &str, env: &Env, kill_timeout: f64, gate: Gate<'_>, stack: &Stack) -> i32 {
    let started = Instant::now();
    let mut child = match Child::spawn(cmd, env) {
        Ok(c) => c,
        Err(e) => {
            stack.warn(&[&format!("Cannot start shell: {e}"), cmd]);
            return EXIT_CANNOT_EXECUTE;
        }
    };
    let prefix = format!("PID={:08} ", child.pid());
    let width = env.keys().map(String::len).max().unwrap_or(0);
    let mut lines = vec![format!("{prefix}EXECUTING WITH ENVIRONMENT VARIABLES:")];
    if env.is_empty() {
        lines.push("<no variables>".to_owned());
    }
    lines.extend(env.iter().map(|(k, v)| format!("{k:width$} = {v:?}")));
    lines.extend(cmd.lines().map(str::to_owned));
    stack.info(&lines.iter().map(String::as_str).collect::<Vec<_>>());

    let mut ret = None;
    while ret.is_none() && gate() {
        ret = child.poll(ctx.poll_interval);
    }
    if ret.is_none() {
        stack.warn(&[&format!(
            "{prefix}Stopping (was started {:.1} sec ago)",
            started.elapsed().as_secs_f64()
        )]);
        let kill_timeout = Duration::from_secs_f64(kill_timeout);
        child.stop(kill_timeout / 2, kill_timeout);
    }
    let code = loop {
        if let Some(code) = ret {
            break code;
        }
        ret = child.poll(ctx.poll_interval);
    };
    stack.info(&[&format!(
        "{prefix}Exit status {code} in {:.1} sec",
        started.elapsed().as_secs_f64()
    )]);
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script(text: &str) -> Composition {
        load_composition(&load_ast(text).expect("ast"), &Env::new()).expect("composition")
    }

    fn run(text: &str) -> i32 {
        exec_composition(&Context::new(Vec::new()), &script(text), &|| true, &Stack::default())
    }

    #[test]
    fn stack_renders_path() {
        let s = Stack::default().push("\"a.orc.yaml\"").push("$").push(0);
        assert_eq!(s.to_string(), "\"a.orc.yaml\" $ 0");
    }

    #[test]
    fn first_failure_wins_and_stops_siblings() {
        let started = Instant::now();
        assert_eq!(run("$=: [sleep 10, exit 3]"), 3);
        assert!(started.elapsed() < Duration::from_secs(8));
    }

    #[test]
    fn failed_predicate_skips_composition() {
        assert_eq!(run("?=: exit 1\n$=: exit 5"), 0);
    }

    #[test]
    fn finalizer_code_is_used_when_main_succeeds() {
        assert_eq!(run("$=: 'true'\n.=: exit 4"), 4);
        assert_eq!(run("$=: exit 2\n.=: exit 4"), 2);
    }

    #[test]
    fn join_waits_before_later_statements() {
        let dir = tempfile::tempdir().expect("tempdir");
        let marker = dir.path().join("m");
        let text = format!(
            "$=:\n- sleep 0.3; touch {p}\n-\n- test -f {p}",
            p = marker.display()
        );
        assert_eq!(run(&text), 0);
    }

    #[test]
    fn closed_gate_stops_everything() {
        let comp = script("$=: sleep 10\n.=: exit 0");
        let started = Instant::now();
        let res = exec_composition(&Context::new(Vec::new()), &comp, &|| false, &Stack::default());
        assert_eq!(res, 0);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn missing_and_malformed_files_have_codes() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("bad.orc.yaml"), "- not a dict").expect("write");
        let ctx = Context::new(vec![dir.path().to_path_buf()]);
        let mut env = Env::new();
        assert_eq!(exec_file(&ctx, "nope.orc.yaml", &mut env, &|| true, &Stack::default()), EXIT_FILE_ERROR);
        assert_eq!(exec_file(&ctx, "bad.orc.yaml", &mut env, &|| true, &Stack::default()), EXIT_SCHEMA_ERROR);
    }
}

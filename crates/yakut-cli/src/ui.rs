//! Terminal helpers: colored diagnostics, progress lines and document output.
//!
//! Documents go to stdout; everything meant for the human goes to stderr so
//! that piping the output into `jq` or a file stays clean.

use std::io::{self, IsTerminal, Write};

use thiserror::Error;

/// ANSI bold.
pub const BOLD: &str = "\x1b[1m";
/// ANSI dim.
pub const DIM: &str = "\x1b[2m";
/// ANSI red.
pub const RED: &str = "\x1b[31m";
/// ANSI green.
pub const GREEN: &str = "\x1b[32m";
/// ANSI yellow.
pub const YELLOW: &str = "\x1b[33m";
/// ANSI cyan.
pub const CYAN: &str = "\x1b[36m";
/// ANSI reset.
pub const RESET: &str = "\x1b[0m";

/// The command ran but its outcome is reported through the exit code only;
/// the diagnostics have been printed already.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("exit status {0}")]
pub struct ExitStatus(pub i32);

/// The user interrupted the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("interrupted")]
pub struct Interrupted;

fn styled(style: &str, text: &str, color: bool) -> String {
    if color {
        format!("{style}{text}{RESET}")
    } else {
        text.to_owned()
    }
}

fn to_stderr(text: &str) {
    let mut err = io::stderr().lock();
    let _ = writeln!(err, "{text}");
    let _ = err.flush();
}

/// Prints an error to stderr in bold red.
pub fn show_error(text: &str) {
    let color = io::stderr().is_terminal();
    to_stderr(&styled(&format!("{BOLD}{RED}"), &format!("Error: {text}"), color));
}

/// Prints a warning to stderr in yellow.
pub fn show_warning(text: &str) {
    let color = io::stderr().is_terminal();
    to_stderr(&styled(YELLOW, &format!("Warning: {text}"), color));
}

/// Writes a complete document to stdout.
///
/// # Errors
///
/// Fails if stdout is closed.
pub fn emit(text: &str) -> io::Result<()> {
    let mut out = io::stdout().lock();
    out.write_all(text.as_bytes())?;
    out.flush()
}

/// Clears the terminal and moves the cursor home, for `--redraw`-style output.
///
/// # Errors
///
/// Fails if stdout is closed.
pub fn clear_screen() -> io::Result<()> {
    emit("\x1b[2J\x1b[H")
}

/// A single self-overwriting status line on stderr, shown only on a terminal.
#[derive(Debug)]
pub struct ProgressReporter {
    enabled: bool,
    width: usize,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    /// A reporter that stays silent unless stderr is a terminal.
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: io::stderr().is_terminal(),
            width: 0,
        }
    }

    /// Replaces the status line.
    pub fn report(&mut self, text: &str) {
        if !self.enabled {
            return;
        }
        let pad = self.width.saturating_sub(text.chars().count());
        self.width = text.chars().count();
        let mut err = io::stderr().lock();
        let _ = write!(err, "\r{DIM}{text}{RESET}{}", " ".repeat(pad));
        let _ = err.flush();
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        if self.enabled && self.width > 0 {
            let mut err = io::stderr().lock();
            let _ = write!(err, "\r{}\r", " ".repeat(self.width));
            let _ = err.flush();
        }
    }
}

/// Reports the errors and warnings of a finished operation. Returns `true`
/// if there were no errors.
pub fn report(errors: &[String], warnings: &[String]) -> bool {
    for w in warnings {
        show_warning(w);
    }
    for e in errors {
        show_error(e);
    }
    errors.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn styling_is_skipped_without_color() {
        assert_eq!(styled(RED, "x", false), "x");
        assert_eq!(styled(RED, "x", true), "\x1b[31mx\x1b[0m");
    }

    #[test]
    fn report_is_successful_only_without_errors() {
        assert!(report(&[], &["careful".into()]));
        assert!(!report(&["broken".into()], &[]));
    }
}

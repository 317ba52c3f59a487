//! Terminal event handling.
//!
//! Keyboard and resize events are read on a dedicated thread and forwarded
//! to the async main loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio::sync::mpsc::UnboundedSender;

/// Terminal input events.
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    /// A key was pressed.
    Key(KeyEvent),
    /// The terminal was resized.
    Resize(u16, u16),
}

impl TerminalEvent {
    /// Whether the event asks the monitor to exit.
    #[must_use]
    pub fn is_quit(&self) -> bool {
        match self {
            Self::Key(k) => {
                k.kind == KeyEventKind::Press
                    && (matches!(k.code, KeyCode::Char('q') | KeyCode::Esc)
                        || (k.code == KeyCode::Char('c') && k.modifiers.contains(KeyModifiers::CONTROL)))
            }
            Self::Resize(..) => false,
        }
    }
}

/// Starts the reader thread; it exits once `stop` is set or the receiver is gone.
pub fn spawn_reader(tx: UnboundedSender<TerminalEvent>, stop: Arc<AtomicBool>) -> JoinHandle<()> {
    std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            match event::poll(Duration::from_millis(100)) {
                Ok(false) => {}
                Ok(true) => {
                    let forwarded = match event::read() {
                        Ok(Event::Key(k)) => tx.send(TerminalEvent::Key(k)),
                        Ok(Event::Resize(w, h)) => tx.send(TerminalEvent::Resize(w, h)),
                        Ok(_) => Ok(()),
                        Err(e) => {
                            tracing::warn!(error = %e, "cannot read terminal event");
                            break;
                        }
                    };
                    if forwarded.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "cannot poll terminal events");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quit_keys() {
        let key = |code, modifiers| TerminalEvent::Key(KeyEvent::new(code, modifiers));
        assert!(key(KeyCode::Char('q'), KeyModifiers::NONE).is_quit());
        assert!(key(KeyCode::Esc, KeyModifiers::NONE).is_quit());
        assert!(key(KeyCode::Char('c'), KeyModifiers::CONTROL).is_quit());
        assert!(!key(KeyCode::Char('c'), KeyModifiers::NONE).is_quit());
        assert!(!TerminalEvent::Resize(80, 24).is_quit());
    }
}

//! `yakut joystick` — Show the state of the connected controllers, htop-style.

use std::io::IsTerminal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use clap::Args;

use crate::context::Context;
use crate::controller::{Controller, Sample, list_controllers};
use crate::ui::{self, BOLD, CYAN, GREEN, Interrupted, RED, RESET, YELLOW};

const REFRESH: Duration = Duration::from_millis(50);
const IDLE_REDRAW: Duration = Duration::from_secs(1);

/// Arguments for the `joystick` command.
#[derive(Args, Debug)]
#[command(after_help = "\
Each controller has an index that `yakut publish` expressions refer to together with a channel,
e.g. A(1,2) is axis 2 of controller 1. Index 0 is the virtual controller named null, whose
channels always read zero. Press Ctrl+C to quit.")]
pub struct JoystickArgs {}

struct Palette {
    color: bool,
}

impl Palette {
    fn paint(&self, style: &str, text: &str) -> String {
        if self.color { format!("{style}{text}{RESET}") } else { text.to_owned() }
    }

    fn channels<T>(
        &self,
        style: &str,
        prefix: char,
        idx: usize,
        values: &[(u8, T)],
        fmt: impl Fn(&T) -> String,
    ) -> String {
        values
            .iter()
            .map(|(ch, v)| {
                let label = self.paint(style, &format!("{prefix}({idx},{ch})="));
                format!("{label}{}", self.paint(BOLD, &fmt(v)))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn render_controller(p: &Palette, idx: usize, name: &str, sample: &Sample) -> Vec<String> {
    let mut lines = vec![String::new(), format!("{} {}", p.paint(CYAN, &idx.to_string()), p.paint(BOLD, name))];
    let axes: Vec<_> = sample.axis.iter().map(|(k, v)| (*k, *v)).collect();
    lines.push(if axes.is_empty() {
        p.paint(RED, "No analog axes detected (try moving the controls)")
    } else {
        p.channels(GREEN, 'A', idx, &axes, |v| format!("{v:+.2}"))
    });
    let buttons: Vec<_> = sample.button.iter().map(|(k, v)| (*k, *v)).collect();
    lines.push(if buttons.is_empty() {
        p.paint(RED, "No buttons detected (try pushing them)")
    } else {
        p.channels(CYAN, 'B', idx, &buttons, |v| u8::from(*v).to_string())
    });
    let toggles: Vec<_> = sample.toggle.iter().map(|(k, v)| (*k, *v)).collect();
    lines.push(if toggles.is_empty() {
        p.paint(RED, "No toggles detected (try switching them)")
    } else {
        p.channels(YELLOW, 'T', idx, &toggles, |v| u8::from(*v).to_string())
    });
    lines
}

fn render_all(p: &Palette, controllers: &[Box<dyn Controller>]) -> String {
    let mut lines = vec!["Legend: A -- analog axis, B -- push button, T -- toggle switch".to_owned()];
    for (idx, ctl) in controllers.iter().enumerate() {
        lines.extend(render_controller(p, idx, ctl.name(), &ctl.sample()));
    }
    lines.join("\n") + "\n"
}

/// Executes the `joystick` command. Runs until interrupted.
///
/// # Errors
///
/// Returns [`Interrupted`] on Ctrl+C, or an error if stdout is closed.
pub fn execute(_args: JoystickArgs, _ctx: &Context) -> anyhow::Result<()> {
    let controllers = list_controllers();
    tracing::info!(
        count = controllers.len(),
        names = ?controllers.iter().map(|c| c.name().to_owned()).collect::<Vec<_>>(),
        "controllers"
    );
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).context("cannot install the Ctrl+C handler")?;
    let palette = Palette { color: std::io::stdout().is_terminal() };
    let updates = |cs: &[Box<dyn Controller>]| cs.iter().map(|c| c.updates()).sum::<u64>();
    let mut seen = None;
    let mut drawn_at = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        let count = updates(&controllers);
        if seen != Some(count) || drawn_at.elapsed() >= IDLE_REDRAW {
            seen = Some(count);
            drawn_at = Instant::now();
            ui::clear_screen()?;
            ui::emit(&render_all(&palette, &controllers))?;
        }
        std::thread::sleep(REFRESH);
    }
    Err(Interrupted.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::NullController;

    #[test]
    fn null_controller_is_rendered_with_hints() {
        let p = Palette { color: false };
        let controllers: Vec<Box<dyn Controller>> = vec![Box::new(NullController)];
        let text = render_all(&p, &controllers);
        assert!(text.starts_with("Legend: A -- analog axis, B -- push button, T -- toggle switch\n"));
        assert!(text.contains("\n0 null\n"));
        assert!(text.contains("No analog axes detected (try moving the controls)"));
        assert!(text.contains("No buttons detected (try pushing them)"));
        assert!(text.contains("No toggles detected (try switching them)"));
    }

    #[test]
    fn channels_are_listed_in_order() {
        let p = Palette { color: false };
        let mut sample = Sample::default();
        let _ = sample.axis.insert(1, -0.5);
        let _ = sample.axis.insert(0, 1.0);
        let _ = sample.button.insert(3, true);
        let _ = sample.toggle.insert(3, false);
        let lines = render_controller(&p, 2, "pad", &sample);
        assert_eq!(lines[1], "2 pad");
        assert_eq!(lines[2], "A(2,0)=+1.00 A(2,1)=-0.50");
        assert_eq!(lines[3], "B(2,3)=1");
        assert_eq!(lines[4], "T(2,3)=0");
    }
}

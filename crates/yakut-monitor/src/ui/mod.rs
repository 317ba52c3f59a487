//! Rendering of the monitor screen.
//!
//! The screen holds the node table on top, the connectivity matrix below it
//! and a status line at the bottom.

mod nodes;
mod traffic;

use ratatui::Frame;
use ratatui::layout::{Constraint, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::Paragraph;

use crate::app::App;
use crate::stats::AVERAGING_WINDOW;

pub use nodes::{render_full_software_version, render_health, render_mode, render_uptime};
pub use traffic::{render_byte_rate, render_xfer_rate};

const S_DEFAULT: Style = Style::new().fg(Color::White);
const S_FAILURE: Style = Style::new().fg(Color::White).bg(Color::Red);
const S_MUTED: Style = Style::new().fg(Color::DarkGray);
const S_ADVISORY: Style = Style::new().fg(Color::Magenta);
const S_CAUTION: Style = Style::new().fg(Color::Yellow);
const S_WARNING: Style = Style::new().fg(Color::Red);
const S_NOTICE: Style = Style::new().fg(Color::Cyan);
const S_NICE: Style = Style::new().fg(Color::Green);
const S_POOR: Style = Style::new().fg(Color::Yellow);

/// Style of a matrix cell. `tx` marks publishers and clients, `rx`
/// subscribers and servers; `None` when the node does not report its ports.
const fn matrix_cell_style(tx: Option<bool>, rx: Option<bool>, recent: bool) -> Style {
    let base = if recent {
        Style::new().fg(Color::Red).add_modifier(Modifier::BOLD)
    } else {
        Style::new().fg(Color::White).add_modifier(Modifier::DIM)
    };
    match (tx, rx) {
        (Some(true), Some(true)) => base.bg(Color::Cyan),
        (Some(true), _) => base.bg(Color::Blue),
        (_, Some(true)) => base.bg(Color::Green),
        _ => base,
    }
}

/// Renders the whole screen.
pub fn render(frame: &mut Frame, app: &App) {
    let node_rows = u16::try_from(app.snapshot().len()).unwrap_or(u16::MAX);
    let [nodes_area, legend_area, matrix_area, status_area] = Layout::vertical([
        Constraint::Length(node_rows.saturating_add(3)),
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(1),
    ])
    .areas(frame.area());
    frame.render_widget(nodes::table(app.snapshot()), nodes_area);
    frame.render_widget(Paragraph::new(legend()), legend_area);
    frame.render_widget(traffic::matrix(app.snapshot(), app.traffic()), matrix_area);
    frame.render_widget(Paragraph::new(status(app.transport_errors)), status_area);
}

fn legend() -> Line<'static> {
    let bar = || Span::raw("│");
    Line::from(vec![
        Span::raw("Legend: "),
        Span::styled("pub/cln", matrix_cell_style(Some(true), Some(false), false)),
        bar(),
        Span::styled("sub/srv", matrix_cell_style(Some(false), Some(true), false)),
        bar(),
        Span::styled("(pub+sub)/(cln+srv)", matrix_cell_style(Some(true), Some(true), false)),
        bar(),
        Span::styled("activity", matrix_cell_style(None, None, true)),
        Span::raw("│uavcan.node.port.List is "),
        Span::styled("published", S_NICE),
        Span::raw("/"),
        Span::styled("not", S_POOR),
        bar(),
    ])
}

fn status(transport_errors: u64) -> Line<'static> {
    Line::from(vec![
        Span::raw("Transport errors:"),
        Span::styled(
            format!("{transport_errors:9}"),
            if transport_errors > 0 { S_POOR } else { S_NICE },
        ),
        Span::raw(format!(
            "   Average over {:.1} sec   q: quit",
            AVERAGING_WINDOW.as_secs_f64()
        )),
    ])
}

#[cfg(test)]
mod tests {
    use ratatui::Terminal;
    use ratatui::backend::TestBackend;
    use serde_json::json;
    use yakut_common::types::{NodeId, Priority, SubjectId};
    use yakut_node::info::NodeInfo;
    use yakut_node::types;
    use yakut_transport::{DataSpecifier, Timestamp, Transfer};

    use super::*;
    use crate::model::Schemas;

    fn screen(app: &App) -> String {
        let mut terminal = Terminal::new(TestBackend::new(200, 40)).unwrap();
        let _ = terminal.draw(|f| render(f, app)).unwrap();
        let buffer = terminal.backend().buffer();
        let width = usize::from(buffer.area.width);
        buffer
            .content()
            .chunks(width)
            .map(|row| row.iter().map(ratatui::buffer::Cell::symbol).collect::<String>())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn transfer(source: Option<u16>, subject: u16, payload: Vec<u8>) -> Transfer {
        Transfer {
            timestamp: Timestamp { system: 0.0, monotonic: 1.0 },
            priority: Priority::Nominal,
            transfer_id: 0,
            source: source.map(NodeId::new),
            specifier: DataSpecifier::Message(SubjectId::new(subject).unwrap()),
            payload,
        }
    }

    #[test]
    fn screen_shows_nodes_and_traffic() {
        let hb = yakut_dsdl::serialize(
            &types::HEARTBEAT.message().unwrap(),
            &json!({"uptime": 3661, "health": {"value": 2}, "mode": {"value": 3}, "vendor_specific_status_code": 9}),
        )
        .unwrap();
        let info = NodeInfo::for_command("monitor").unwrap();
        let mut app = App::new(Schemas::load().unwrap(), Some(NodeId::new(10)), info);
        app.on_transfer(&transfer(Some(10), 7509, hb.clone()));
        app.on_transfer(&transfer(Some(42), 7509, hb));
        app.on_transfer(&transfer(None, 1000, vec![1, 2, 3]));
        app.transport_errors = 3;
        app.tick(1.0);

        let text = screen(&app);
        for expected in [
            "NodID", "Unique-ID", "org.opencyphal.yakut.monitor", "swup", "cautio", "0d01:01:01", "anon", "MESSG",
            "7509", "1000", "TOTAL", "Transport errors:", "Legend:",
        ] {
            assert!(text.contains(expected), "{expected:?} missing in:\n{text}");
        }
    }
}

//! The connectivity matrix: transfer rates per port and node.
//!
//! Rows are ports, columns are online nodes. Cells are colored by the role
//! the node reports for the port in its port list; a value in an uncolored
//! cell of a node that does publish its port list means the node uses a port
//! it does not report. Services show requests and responses combined.

use std::collections::{BTreeMap, BTreeSet};

use ratatui::layout::Constraint;
use ratatui::widgets::{Block, Cell, Row, Table};

use super::{S_DEFAULT, S_MUTED, S_NICE, S_POOR, matrix_cell_style};
use crate::model::{N_SUBJECTS, NodeKey, NodeState};
use crate::stats::{Load, PortKey, Traffic};

const CELL_WIDTH: u16 = 5;

/// Transfers per second in five columns.
#[must_use]
pub fn render_xfer_rate(x: f64) -> String {
    // Accumulated rounding may push the value slightly below zero.
    let x = x.max(0.0);
    if x < 1e3 {
        format!("{x:4.0} ")
    } else if x < 1e6 {
        format!("{:4.0}k", x / 1e3)
    } else {
        format!("{:4.0}M", x / 1e6)
    }
}

/// Bytes per second in five columns.
#[must_use]
pub fn render_byte_rate(x: f64) -> String {
    let x = x.max(0.0);
    if x < 1024.0 {
        format!("{x:4.0} ")
    } else if x < 1024.0 * 1024.0 {
        format!("{:4.0}K", x / 1024.0)
    } else {
        format!("{:4.0}M", x / (1024.0 * 1024.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Messages,
    Services,
}

impl Section {
    const fn label(self) -> &'static str {
        match self {
            Self::Messages => "MESSG",
            Self::Services => "RQ+RS",
        }
    }

    fn ports(self, id: u16) -> Vec<PortKey> {
        match self {
            Self::Messages => vec![PortKey::Subject(id)],
            Self::Services => vec![PortKey::Request(id), PortKey::Response(id)],
        }
    }
}

struct Matrix<'a> {
    online: Vec<(NodeKey, &'a NodeState)>,
    traffic: &'a Traffic,
    rows: Vec<Row<'static>>,
}

impl Matrix<'_> {
    fn load(&self, node: Option<NodeKey>, ports: &[PortKey]) -> (Load, bool) {
        let pred = |(n, p): &(NodeKey, PortKey)| node.is_none_or(|node| *n == node) && ports.contains(p);
        (self.traffic.total(pred), self.traffic.any_recent(pred))
    }

    fn header(&mut self, label: &'static str) {
        let mut cells = vec![Cell::from(label).style(S_MUTED)];
        cells.extend(self.online.iter().map(|(k, s)| {
            let text = match k {
                NodeKey::Node(id) => format!("{:>5}", id.get()),
                NodeKey::Anonymous => " anon".to_owned(),
            };
            Cell::from(text).style(if s.ports.is_some() { S_NICE } else { S_POOR })
        }));
        cells.extend([Cell::from(" ∑t/s"), Cell::from(" ∑B/s")]);
        self.rows.push(Row::new(cells));
    }

    fn port_row(&mut self, section: Section, id: u16) {
        let ports = section.ports(id);
        let mut cells = vec![Cell::from(format!("{id:>5}")).style(S_DEFAULT)];
        for (node, state) in &self.online {
            let (load, recent) = self.load(Some(*node), &ports);
            let rate = load.transfers;
            let (style, show) = match &state.ports {
                Some(p) => {
                    let (tx, rx) = match section {
                        Section::Messages => (p.publishers.contains(&id), p.subscribers.contains(&id)),
                        Section::Services => (p.clients.contains(&id), p.servers.contains(&id)),
                    };
                    (matrix_cell_style(Some(tx), Some(rx), recent), tx || rx || rate > f64::EPSILON)
                }
                None => (matrix_cell_style(None, None, recent), rate > f64::EPSILON),
            };
            let text = if show { render_xfer_rate(rate) } else { String::new() };
            cells.push(Cell::from(text).style(style));
        }
        let (total, recent) = self.load(None, &ports);
        let style = matrix_cell_style(None, None, recent);
        cells.extend([
            Cell::from(render_xfer_rate(total.transfers)).style(style),
            Cell::from(render_byte_rate(total.bytes)).style(style),
            Cell::from(format!("{id:>5}")).style(S_DEFAULT),
        ]);
        self.rows.push(Row::new(cells));
    }

    /// Per-node sums over `ports`, one row for t/s and one for B/s.
    fn totals(&mut self, ports: &[PortKey]) {
        let mut xfer = vec![Cell::from("∑t/s")];
        let mut byte = vec![Cell::from("∑B/s")];
        let mut grand = Load::default();
        let mut grand_recent = false;
        for (node, _) in &self.online {
            let (load, recent) = self.load(Some(*node), ports);
            let style = matrix_cell_style(None, None, recent);
            xfer.push(Cell::from(render_xfer_rate(load.transfers)).style(style));
            byte.push(Cell::from(render_byte_rate(load.bytes)).style(style));
            grand += load;
            grand_recent |= recent;
        }
        let style = matrix_cell_style(None, None, grand_recent);
        xfer.push(Cell::from(render_xfer_rate(grand.transfers)).style(style));
        byte.extend([Cell::from(""), Cell::from(render_byte_rate(grand.bytes)).style(style)]);
        xfer.extend([Cell::from(""), Cell::from("↖ t/s").style(S_MUTED)]);
        self.rows.push(Row::new(xfer));
        self.rows.push(Row::new(byte));
    }

    fn section(&mut self, section: Section, ids: &BTreeSet<u16>) {
        self.header(section.label());
        for id in ids {
            self.port_row(section, *id);
        }
        let ports: Vec<PortKey> = ids.iter().flat_map(|id| section.ports(*id)).collect();
        self.totals(&ports);
        self.rows.push(Row::new(Vec::<Cell>::new()));
    }
}

/// Ports to show: those with recent traffic and those reported in port lists.
fn active_ports(states: &BTreeMap<NodeKey, NodeState>, traffic: &Traffic) -> (BTreeSet<u16>, BTreeSet<u16>) {
    let mut subjects = BTreeSet::new();
    let mut services = BTreeSet::new();
    for ((_, port), load) in &traffic.rates {
        if load.transfers > 0.0 {
            match port.service() {
                Some(s) => {
                    let _ = services.insert(s);
                }
                None => {
                    if let PortKey::Subject(s) = port {
                        let _ = subjects.insert(*s);
                    }
                }
            }
        }
    }
    for ports in states.values().filter_map(|s| s.ports.as_ref()) {
        subjects.extend(&ports.publishers);
        // Subjects only a supersubscriber listens to are not worth a row.
        if ports.subscribers.len() < usize::from(N_SUBJECTS) {
            subjects.extend(&ports.subscribers);
        }
        services.extend(&ports.clients);
        services.extend(&ports.servers);
    }
    (subjects, services)
}

/// The matrix of the online nodes.
pub(super) fn matrix(states: &BTreeMap<NodeKey, NodeState>, traffic: &Traffic) -> Table<'static> {
    let (subjects, services) = active_ports(states, traffic);
    let online: Vec<(NodeKey, &NodeState)> = states.iter().filter(|(_, s)| s.online).map(|(k, s)| (*k, s)).collect();
    let columns = online.len() + 4;
    let mut m = Matrix {
        online,
        traffic,
        rows: Vec::new(),
    };
    m.section(Section::Messages, &subjects);
    m.section(Section::Services, &services);
    m.header("TOTAL");
    let every_port: Vec<PortKey> = traffic.rates.keys().map(|(_, p)| *p).collect();
    m.totals(&every_port);
    Table::new(m.rows, vec![Constraint::Length(CELL_WIDTH); columns])
        .column_spacing(0)
        .block(Block::bordered().title(" Traffic "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rates_fit_five_columns() {
        assert_eq!(render_xfer_rate(-0.1), "   0 ");
        assert_eq!(render_xfer_rate(12.4), "  12 ");
        assert_eq!(render_xfer_rate(25_000.0), "  25k");
        assert_eq!(render_xfer_rate(3.0e6), "   3M");
        assert_eq!(render_byte_rate(1023.0), "1023 ");
        assert_eq!(render_byte_rate(2048.0), "   2K");
        assert_eq!(render_byte_rate(5.0 * 1024.0 * 1024.0), "   5M");
    }
}

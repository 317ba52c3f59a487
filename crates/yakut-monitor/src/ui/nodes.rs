//! The node table.

use std::collections::BTreeMap;

use ratatui::layout::Constraint;
use ratatui::style::Style;
use ratatui::widgets::{Block, Cell, Row, Table};
use yakut_node::info::{PROTOCOL_VERSION, Version};
use yakut_node::tracker::Heartbeat;

use super::{S_ADVISORY, S_CAUTION, S_DEFAULT, S_FAILURE, S_MUTED, S_NOTICE, S_WARNING};
use crate::model::{NodeKey, NodeState};

const HEADER: [(&str, u16); 10] = [
    ("NodID", 5),
    ("Mode", 4),
    ("Health", 6),
    ("VSSC", 4),
    ("Uptime", 14),
    ("VProtcl", 7),
    ("VHardwr", 7),
    ("VSoftware(major.minor.vcs.crc)", 41),
    ("Unique-ID", 32),
    ("Name", 40),
];

/// Short name and style of a heartbeat mode.
#[must_use]
pub fn render_mode(mode: u8) -> (String, Option<Style>) {
    match mode {
        0 => ("oper".into(), None),
        1 => ("init".into(), Some(S_NOTICE)),
        2 => ("mntn".into(), Some(S_ADVISORY)),
        3 => ("swup".into(), Some(S_CAUTION)),
        other => (other.to_string(), Some(S_FAILURE)),
    }
}

/// Short name and style of a heartbeat health.
#[must_use]
pub fn render_health(health: u8) -> (String, Option<Style>) {
    match health {
        0 => ("nomina".into(), None),
        1 => ("adviso".into(), Some(S_ADVISORY)),
        2 => ("cautio".into(), Some(S_CAUTION)),
        3 => ("warnin".into(), Some(S_WARNING)),
        other => (other.to_string(), Some(S_FAILURE)),
    }
}

/// Uptime as `DDDDDdHH:MM:SS`.
#[must_use]
pub fn render_uptime(seconds: u32) -> String {
    format!(
        "{:5}d{:02}:{:02}:{:02}",
        seconds / (3600 * 24),
        (seconds / 3600) % 24,
        (seconds / 60) % 60,
        seconds % 60
    )
}

fn render_version(v: Version) -> String {
    format!("{:3}.{:<3}", v.major, v.minor)
}

/// Software version with the VCS revision and the image CRC when known.
#[must_use]
pub fn render_full_software_version(version: Version, vcs_revision_id: u64, crc: Option<u64>) -> String {
    let mut out = format!("{:3}.{}", version.major, version.minor);
    if vcs_revision_id != 0 || crc.is_some() {
        out += &format!(".{vcs_revision_id:016x}");
    }
    if let Some(crc) = crc {
        out += &format!(".{crc:016x}");
    }
    out
}

fn heartbeat_cells(key: NodeKey, state: &NodeState, hb: &Heartbeat) -> [Cell<'static>; 3] {
    let forced = match (key, state.online) {
        // Anonymous nodes shall not publish heartbeats.
        (NodeKey::Anonymous, true) => Some(S_FAILURE),
        (_, false) => Some(S_MUTED),
        _ => None,
    };
    let (mode, mode_style) = render_mode(hb.mode);
    let (health, health_style) = render_health(hb.health);
    [
        Cell::from(mode).style(forced.or(mode_style).unwrap_or(S_DEFAULT)),
        Cell::from(health).style(forced.or(health_style).unwrap_or(S_DEFAULT)),
        Cell::from(hb.vssc.to_string()).style(forced.unwrap_or(S_DEFAULT)),
    ]
}

fn row(key: NodeKey, state: &NodeState) -> Row<'static> {
    let unknown = || Cell::from("?").style(S_MUTED);
    let mut cells = Vec::with_capacity(HEADER.len());
    cells.push(Cell::from(key.to_string()).style(if state.online { S_DEFAULT } else { S_MUTED }));

    match &state.heartbeat {
        Some(hb) => cells.extend(heartbeat_cells(key, state, hb)),
        None => cells.extend([unknown(), unknown(), unknown()]),
    }

    cells.push(match (state.online, &state.heartbeat, key) {
        (false, ..) => Cell::from("offline").style(S_MUTED),
        (true, Some(hb), _) => Cell::from(render_uptime(hb.uptime)).style(S_DEFAULT),
        (true, None, NodeKey::Node(_)) => Cell::from("zombie").style(S_FAILURE),
        (true, None, NodeKey::Anonymous) => Cell::from("online").style(S_DEFAULT),
    });

    match &state.info {
        Some(info) => {
            let sty = if state.online && state.heartbeat.is_some() { S_DEFAULT } else { S_MUTED };
            let proto_sty = if info.protocol_version.major == PROTOCOL_VERSION.major { sty } else { S_FAILURE };
            // Whitespace would break the layout.
            let name: String = info.name.split_whitespace().collect();
            cells.extend([
                Cell::from(render_version(info.protocol_version)).style(proto_sty),
                Cell::from(render_version(info.hardware_version)).style(sty),
                Cell::from(render_full_software_version(
                    info.software_version,
                    info.software_vcs_revision_id,
                    info.software_image_crc,
                ))
                .style(sty),
                Cell::from(info.unique_id_hex()).style(sty),
                Cell::from(name).style(sty),
            ]);
        }
        None => cells.extend((0..5).map(|_| unknown())),
    }
    Row::new(cells)
}

/// Table of all nodes seen so far.
pub(super) fn table(states: &BTreeMap<NodeKey, NodeState>) -> Table<'static> {
    let header = Row::new(HEADER.iter().map(|(h, _)| Cell::from(*h))).style(S_MUTED);
    let widths = HEADER.iter().map(|(_, w)| Constraint::Length(*w));
    Table::new(states.iter().map(|(k, s)| row(*k, s)), widths)
        .header(header)
        .block(Block::bordered().title(" Nodes "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_rendering() {
        assert_eq!(render_uptime(0), "    0d00:00:00");
        assert_eq!(render_uptime(90061), "    1d01:01:01");
        assert_eq!(render_mode(3).0, "swup");
        assert_eq!(render_health(0), ("nomina".to_owned(), None));
        assert_eq!(render_health(9).0, "9");
        let v = Version { major: 1, minor: 2 };
        assert_eq!(render_full_software_version(v, 0, None), "  1.2");
        assert_eq!(
            render_full_software_version(v, 0xabc, Some(1)),
            "  1.2.0000000000000abc.0000000000000001"
        );
        assert_eq!(render_version(v), "  1.2  ");
    }
}

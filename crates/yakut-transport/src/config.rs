//! Transport construction from expressions or registers.

use std::collections::BTreeMap;
use std::sync::Arc;

use yakut_common::types::NodeId;

use crate::Transport;
use crate::error::{Result, TransportError};
use crate::expr::{Constructor, Literal, TransportExpr, parse_expression};
use crate::loopback::{DEFAULT_BUS, LoopbackTransport};

/// Register holding the local node-ID; 65535 means anonymous.
pub const REG_NODE_ID: &str = "uavcan.node.id";
/// Register enabling the loopback transport.
pub const REG_LOOPBACK: &str = "uavcan.loopback";
/// Transport interface registers recognized but not available in this build.
pub const UNSUPPORTED_IFACE_REGISTERS: [(&str, &str); 3] = [
    ("uavcan.udp.iface", "UDP"),
    ("uavcan.serial.iface", "Serial"),
    ("uavcan.can.iface", "CAN"),
];

/// Node-ID value that stands for "anonymous" in the node-ID register.
pub const ANONYMOUS_NODE_ID: u16 = u16::MAX;

fn parse_truthy(text: &str) -> bool {
    matches!(text.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Parses the node-ID register text; empty or 65535 means anonymous.
///
/// # Errors
///
/// Returns [`TransportError::InvalidRegister`] for non-numeric text.
pub fn parse_node_id(text: &str) -> Result<Option<NodeId>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let id: u16 = text.parse().map_err(|_| TransportError::InvalidRegister {
        name: REG_NODE_ID.to_owned(),
        value: text.to_owned(),
    })?;
    Ok((id != ANONYMOUS_NODE_ID).then(|| NodeId::new(id)))
}

fn build_constructor(c: &Constructor, expression: &str) -> Result<Arc<dyn Transport>> {
    let invalid = |message: &str| TransportError::InvalidExpression {
        expression: expression.to_owned(),
        message: message.to_owned(),
    };
    match c.kind() {
        "Loopback" => {
            let node_id = match c.arg("local_node_id", 0) {
                None | Some(Literal::None) => None,
                Some(Literal::Int(n)) => Some(
                    u16::try_from(*n)
                        .ok()
                        .filter(|n| *n != ANONYMOUS_NODE_ID)
                        .map(NodeId::new)
                        .ok_or_else(|| invalid("node-ID out of range"))?,
                ),
                Some(_) => return Err(invalid("node-ID must be an integer or None")),
            };
            let bus = match c.arg("bus", 1) {
                None => DEFAULT_BUS.to_owned(),
                Some(Literal::Str(s)) => s.clone(),
                Some(_) => return Err(invalid("bus name must be a string")),
            };
            Ok(Arc::new(LoopbackTransport::new(node_id, &bus)))
        }
        "UDP" | "Serial" | "CAN" | "UDPIP" => Err(TransportError::Unsupported {
            name: c.kind().to_owned(),
        }),
        other => Err(invalid(&format!("unknown transport {other:?}"))),
    }
}

/// Builds a transport from an expression.
///
/// # Errors
///
/// Fails on syntax errors, unknown kinds, unsupported kinds, and redundant groups.
pub fn from_expression(expression: &str) -> Result<Arc<dyn Transport>> {
    match parse_expression(expression)? {
        TransportExpr::Single(c) => build_constructor(&c, expression),
        TransportExpr::Redundant(mut list) if list.len() == 1 => {
            let c = list.remove(0);
            build_constructor(&c, expression)
        }
        TransportExpr::Redundant(_) => Err(TransportError::Unsupported {
            name: "redundant transport".to_owned(),
        }),
    }
}

/// Builds a transport from register values (name to text).
///
/// # Errors
///
/// [`TransportError::Unsupported`] when a network interface register is set,
/// [`TransportError::NotConfigured`] when nothing selects a transport.
pub fn from_registers(registers: &BTreeMap<String, String>) -> Result<Arc<dyn Transport>> {
    for (reg, kind) in UNSUPPORTED_IFACE_REGISTERS {
        if registers.get(reg).is_some_and(|v| !v.trim().is_empty()) {
            return Err(TransportError::Unsupported { name: kind.to_owned() });
        }
    }
    if registers.get(REG_LOOPBACK).is_some_and(|v| parse_truthy(v)) {
        let node_id = match registers.get(REG_NODE_ID) {
            Some(text) => parse_node_id(text)?,
            None => None,
        };
        return Ok(Arc::new(LoopbackTransport::new(node_id, DEFAULT_BUS)));
    }
    Err(TransportError::NotConfigured)
}

/// Builds a transport from the expression if one is given, else from registers.
///
/// # Errors
///
/// See [`from_expression`] and [`from_registers`].
pub fn construct(expression: Option<&str>, registers: &BTreeMap<String, String>) -> Result<Arc<dyn Transport>> {
    match expression.map(str::trim).filter(|e| !e.is_empty()) {
        Some(e) => {
            tracing::info!(expression = e, "constructing transport from expression");
            from_expression(e)
        }
        None => {
            tracing::info!("constructing transport from registers");
            from_registers(registers)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[test]
    fn loopback_expression_sets_node_id() {
        let t = from_expression("Loopback(42)").expect("transport");
        assert_eq!(t.local_node_id(), Some(NodeId::new(42)));
        let t = from_expression("Loopback(None)").expect("transport");
        assert_eq!(t.local_node_id(), None);
    }

    #[test]
    fn network_transports_are_unsupported() {
        assert!(matches!(
            from_expression(r#"UDP("127.0.0.1", 5)"#),
            Err(TransportError::Unsupported { ref name }) if name == "UDP"
        ));
        assert!(matches!(
            from_expression("Bogus(1)"),
            Err(TransportError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn registers_select_loopback() {
        let t = from_registers(&regs(&[("uavcan.loopback", "1"), ("uavcan.node.id", "7")])).expect("transport");
        assert_eq!(t.local_node_id(), Some(NodeId::new(7)));
        let t = from_registers(&regs(&[("uavcan.loopback", "true"), ("uavcan.node.id", "65535")])).expect("transport");
        assert_eq!(t.local_node_id(), None);
    }

    #[test]
    fn iface_registers_are_reported_unsupported() {
        assert!(matches!(
            from_registers(&regs(&[("uavcan.can.iface", "socketcan:vcan0")])),
            Err(TransportError::Unsupported { ref name }) if name == "CAN"
        ));
    }

    #[test]
    fn nothing_configured_is_an_error() {
        assert!(matches!(construct(None, &regs(&[])), Err(TransportError::NotConfigured)));
        assert!(matches!(construct(Some("  "), &regs(&[])), Err(TransportError::NotConfigured)));
    }

    #[test]
    fn bad_node_id_register_is_reported() {
        assert!(parse_node_id("abc").is_err());
        assert_eq!(parse_node_id("").expect("empty"), None);
    }
}

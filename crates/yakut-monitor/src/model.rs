//! What the monitor knows about each node.
//!
//! An [`Avatar`] learns about its node only by snooping on the transfers the
//! node emits: heartbeats, port lists and responses to `GetInfo`, whoever asked.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use yakut_common::types::NodeId;
use yakut_dsdl::Composite;
use yakut_node::info::NodeInfo;
use yakut_node::tracker::{Heartbeat, OFFLINE_TIMEOUT};
use yakut_node::types;
use yakut_transport::DataSpecifier;

use crate::error::Result;

/// Number of distinct subject-IDs.
pub const N_SUBJECTS: u16 = 8192;
/// Number of distinct service-IDs.
pub const N_SERVICES: u16 = 512;

/// Port introspection older than this many seconds is disregarded.
const PORT_LIST_VALIDITY: f64 = 10.0 * 2.0;

/// Sources of node activity. Anonymous transfers share one entry, listed last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NodeKey {
    /// A node with a node-ID.
    Node(NodeId),
    /// All anonymous nodes.
    Anonymous,
}

impl From<Option<NodeId>> for NodeKey {
    fn from(id: Option<NodeId>) -> Self {
        id.map_or(Self::Anonymous, Self::Node)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => write!(f, "{id}"),
            Self::Anonymous => f.write_str("anon"),
        }
    }
}

/// Ports a node reports via `uavcan.node.port.List`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSet {
    /// Published subjects.
    pub publishers: BTreeSet<u16>,
    /// Subscribed subjects.
    pub subscribers: BTreeSet<u16>,
    /// Services invoked.
    pub clients: BTreeSet<u16>,
    /// Services served.
    pub servers: BTreeSet<u16>,
}

impl PortSet {
    /// Reads the builtin form of `uavcan.node.port.List.0.1`.
    #[must_use]
    pub fn from_builtin(value: &Value) -> Self {
        Self {
            publishers: expand_subjects(value.get("publishers")),
            subscribers: expand_subjects(value.get("subscribers")),
            clients: expand_mask(value.pointer("/clients/mask")),
            servers: expand_mask(value.pointer("/servers/mask")),
        }
    }
}

fn expand_subjects(list: Option<&Value>) -> BTreeSet<u16> {
    let Some(list) = list else {
        return BTreeSet::new();
    };
    if let Some(Value::Array(sparse)) = list.get("sparse_list") {
        return sparse
            .iter()
            .filter_map(|x| x.get("value").and_then(Value::as_u64))
            .filter_map(|x| u16::try_from(x).ok())
            .collect();
    }
    if list.get("total").is_some() {
        return (0..N_SUBJECTS).collect();
    }
    expand_mask(list.get("mask"))
}

fn expand_mask(mask: Option<&Value>) -> BTreeSet<u16> {
    let Some(Value::Array(bits)) = mask else {
        return BTreeSet::new();
    };
    bits.iter()
        .enumerate()
        .filter(|(_, b)| b.as_bool().unwrap_or(false))
        .filter_map(|(i, _)| u16::try_from(i).ok())
        .collect()
}

/// Snapshot of a node, taken once per refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    /// The node emitted something recently.
    pub online: bool,
    /// Latest heartbeat; `None` for a node that is online without heartbeats (a zombie).
    pub heartbeat: Option<Heartbeat>,
    /// Info, once seen.
    pub info: Option<NodeInfo>,
    /// Ports, if the node keeps its port list publications up to date.
    pub ports: Option<PortSet>,
}

/// Schemas needed to understand snooped transfers.
#[derive(Debug, Clone)]
pub struct Schemas {
    heartbeat: Arc<Composite>,
    heartbeat_subject: u16,
    port_list: Arc<Composite>,
    port_list_subject: u16,
    get_info_response: Arc<Composite>,
    get_info_service: u16,
}

impl Schemas {
    /// Loads the standard types.
    ///
    /// # Errors
    ///
    /// Fails only if the standard catalog is incomplete.
    pub fn load() -> Result<Self> {
        let heartbeat = types::HEARTBEAT.load()?;
        let port_list = types::PORT_LIST.load()?;
        let get_info = types::GET_INFO.load()?;
        let (_, get_info_response) = types::service_schemas(&get_info)?;
        Ok(Self {
            heartbeat: types::message_schema(&heartbeat)?,
            heartbeat_subject: heartbeat.fixed_port_id().unwrap_or(7509),
            port_list: types::message_schema(&port_list)?,
            port_list_subject: port_list.fixed_port_id().unwrap_or(7510),
            get_info_response,
            get_info_service: get_info.fixed_port_id().unwrap_or(430),
        })
    }
}

/// Accumulated knowledge about one node.
#[derive(Debug, Clone)]
pub struct Avatar {
    key: NodeKey,
    heartbeat: Option<Heartbeat>,
    info: Option<NodeInfo>,
    info_requests: u32,
    ports: PortSet,
    ts_activity: f64,
    ts_heartbeat: f64,
    ts_port_list: f64,
    ts_info_request: f64,
}

impl Avatar {
    /// A node never seen before; `info` is known only for the local node.
    #[must_use]
    pub const fn new(key: NodeKey, info: Option<NodeInfo>) -> Self {
        Self {
            key,
            heartbeat: None,
            info,
            info_requests: 0,
            ports: PortSet {
                publishers: BTreeSet::new(),
                subscribers: BTreeSet::new(),
                clients: BTreeSet::new(),
                servers: BTreeSet::new(),
            },
            ts_activity: f64::NEG_INFINITY,
            ts_heartbeat: f64::NEG_INFINITY,
            ts_port_list: f64::NEG_INFINITY,
            ts_info_request: f64::NEG_INFINITY,
        }
    }

    /// Which node this is.
    #[must_use]
    pub const fn key(&self) -> NodeKey {
        self.key
    }

    /// Feeds a transfer emitted by this node at monotonic time `ts`. Returns
    /// `true` if the node should be asked for its info now.
    pub fn on_transfer(&mut self, ts: f64, specifier: &DataSpecifier, payload: &[u8], schemas: &Schemas) -> bool {
        self.ts_activity = ts;
        match specifier {
            DataSpecifier::Message(s) if s.get() == schemas.heartbeat_subject => {
                match yakut_dsdl::deserialize(&schemas.heartbeat, payload) {
                    Ok(v) => return self.on_heartbeat(ts, Heartbeat::from_builtin(&v)),
                    Err(e) => tracing::debug!(node = %self.key, error = %e, "undecodable heartbeat"),
                }
            }
            DataSpecifier::Message(s) if s.get() == schemas.port_list_subject => {
                match yakut_dsdl::deserialize(&schemas.port_list, payload) {
                    Ok(v) => {
                        self.ports = PortSet::from_builtin(&v);
                        self.ts_port_list = ts;
                    }
                    Err(e) => tracing::debug!(node = %self.key, error = %e, "undecodable port list"),
                }
            }
            DataSpecifier::Response { service, .. } if service.get() == schemas.get_info_service => {
                match yakut_dsdl::deserialize(&schemas.get_info_response, payload)
                    .ok()
                    .and_then(|v| NodeInfo::from_builtin(&v).ok())
                {
                    Some(info) => {
                        tracing::info!(node = %self.key, name = %info.name, "received node info");
                        self.info = Some(info);
                    }
                    None => tracing::debug!(node = %self.key, "undecodable node info"),
                }
            }
            _ => {}
        }
        false
    }

    fn on_heartbeat(&mut self, ts: f64, hb: Heartbeat) -> bool {
        let restarted = self.heartbeat.is_some_and(|prev| {
            prev.uptime > hb.uptime || ts - self.ts_heartbeat > OFFLINE_TIMEOUT.as_secs_f64()
        });
        if restarted {
            tracing::info!(node = %self.key, uptime = hb.uptime, "restart detected");
            self.info = None;
            self.info_requests = 0;
            self.ts_port_list = f64::NEG_INFINITY;
        }
        let mut request = false;
        if self.info.is_none() && matches!(self.key, NodeKey::Node(_)) {
            let backoff = f64::from(2_u32.saturating_pow(self.info_requests.saturating_add(2)));
            if ts - self.ts_info_request >= backoff {
                tracing::debug!(node = %self.key, backoff, "requesting node info");
                self.info_requests += 1;
                self.ts_info_request = ts;
                request = true;
            }
        }
        self.heartbeat = Some(hb);
        self.ts_heartbeat = ts;
        request
    }

    /// Computes the state as of monotonic time `ts`.
    pub fn update(&mut self, ts: f64) -> NodeState {
        let offline_timeout = OFFLINE_TIMEOUT.as_secs_f64();
        if self.heartbeat.is_some() && self.ts_activity - self.ts_heartbeat > offline_timeout {
            tracing::info!(node = %self.key, "activity without heartbeats, the node is a zombie");
            self.heartbeat = None;
        }
        NodeState {
            online: ts - self.ts_heartbeat.max(self.ts_activity) <= offline_timeout,
            heartbeat: self.heartbeat,
            info: self.info.clone(),
            ports: (ts - self.ts_port_list <= PORT_LIST_VALIDITY).then(|| self.ports.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use yakut_common::types::{ServiceId, SubjectId};

    use super::*;

    fn heartbeat(uptime: u32) -> Vec<u8> {
        let schema = types::HEARTBEAT.message().unwrap();
        yakut_dsdl::serialize(
            &schema,
            &json!({"uptime": uptime, "health": {"value": 0}, "mode": {"value": 0}, "vendor_specific_status_code": 0}),
        )
        .unwrap()
    }

    fn hb_spec() -> DataSpecifier {
        DataSpecifier::Message(SubjectId::new(7509).unwrap())
    }

    #[test]
    fn info_is_requested_with_exponential_backoff() {
        let schemas = Schemas::load().unwrap();
        let mut a = Avatar::new(NodeKey::Node(NodeId::new(5)), None);
        assert!(a.on_transfer(0.0, &hb_spec(), &heartbeat(1), &schemas));
        assert!(!a.on_transfer(1.0, &hb_spec(), &heartbeat(2), &schemas));
        assert!(!a.on_transfer(3.0, &hb_spec(), &heartbeat(4), &schemas));
        assert!(!a.on_transfer(5.0, &hb_spec(), &heartbeat(6), &schemas));
        assert!(a.on_transfer(8.0, &hb_spec(), &heartbeat(9), &schemas));
        assert!(!a.on_transfer(10.0, &hb_spec(), &heartbeat(11), &schemas));
        assert!(a.on_transfer(24.0, &hb_spec(), &heartbeat(25), &schemas));
    }

    #[test]
    fn anonymous_nodes_are_never_asked() {
        let schemas = Schemas::load().unwrap();
        let mut a = Avatar::new(NodeKey::Anonymous, None);
        assert!(!a.on_transfer(0.0, &hb_spec(), &heartbeat(1), &schemas));
    }

    #[test]
    fn restart_clears_info() {
        let schemas = Schemas::load().unwrap();
        let info = NodeInfo::for_command("monitor").unwrap();
        let mut a = Avatar::new(NodeKey::Node(NodeId::new(5)), Some(info));
        assert!(!a.on_transfer(0.0, &hb_spec(), &heartbeat(100), &schemas));
        assert!(a.update(0.5).info.is_some());
        assert!(a.on_transfer(1.0, &hb_spec(), &heartbeat(3), &schemas));
        assert!(a.update(1.0).info.is_none());
    }

    #[test]
    fn online_offline_and_zombie() {
        let schemas = Schemas::load().unwrap();
        let mut a = Avatar::new(NodeKey::Node(NodeId::new(9)), None);
        let _ = a.on_transfer(0.0, &hb_spec(), &heartbeat(1), &schemas);
        let s = a.update(1.0);
        assert!(s.online);
        assert_eq!(s.heartbeat.map(|h| h.uptime), Some(1));
        assert!(!a.update(5.0).online);

        let other = DataSpecifier::Message(SubjectId::new(100).unwrap());
        let _ = a.on_transfer(5.0, &other, &[], &schemas);
        let s = a.update(5.5);
        assert!(s.online);
        assert!(s.heartbeat.is_none());
    }

    #[test]
    fn port_list_expires() {
        let schemas = Schemas::load().unwrap();
        let list = json!({
            "publishers": {"sparse_list": [{"value": 7509}, {"value": 100}]},
            "subscribers": {"total": {}},
            "clients": {"mask": (0..512).map(|i| i == 430).collect::<Vec<_>>()},
            "servers": {"mask": vec![false; 512]},
        });
        let payload = yakut_dsdl::serialize(&types::PORT_LIST.message().unwrap(), &list).unwrap();
        let spec = DataSpecifier::Message(SubjectId::new(7510).unwrap());
        let mut a = Avatar::new(NodeKey::Node(NodeId::new(1)), None);
        let _ = a.on_transfer(0.0, &spec, &payload, &schemas);
        let ports = a.update(1.0).ports.unwrap();
        assert_eq!(ports.publishers, BTreeSet::from([100, 7509]));
        assert_eq!(ports.subscribers.len(), usize::from(N_SUBJECTS));
        assert_eq!(ports.clients, BTreeSet::from([430]));
        assert!(ports.servers.is_empty());
        assert!(a.update(25.0).ports.is_none());
    }

    #[test]
    fn snooped_info_response_is_kept() {
        let schemas = Schemas::load().unwrap();
        let info = NodeInfo::for_command("snooped").unwrap();
        let (_, response) = types::GET_INFO.service().unwrap();
        let payload = yakut_dsdl::serialize(&response, &info.to_builtin()).unwrap();
        let spec = DataSpecifier::Response {
            service: ServiceId::new(430).unwrap(),
            destination: NodeId::new(2),
        };
        let mut a = Avatar::new(NodeKey::Node(NodeId::new(3)), None);
        let _ = a.on_transfer(0.0, &spec, &payload, &schemas);
        assert_eq!(a.update(0.0).info.map(|i| i.name), Some(info.name));
    }

    #[test]
    fn anonymous_sorts_last() {
        let mut keys = vec![NodeKey::Anonymous, NodeKey::Node(NodeId::new(3)), NodeKey::Node(NodeId::new(1))];
        keys.sort();
        assert_eq!(keys[2], NodeKey::Anonymous);
        assert_eq!(NodeKey::from(None).to_string(), "anon");
    }
}

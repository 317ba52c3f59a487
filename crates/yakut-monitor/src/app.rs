//! Monitor application state.
//!
//! Collects transfers into per-node avatars and traffic counters, and once per
//! refresh period turns them into a snapshot for rendering.

use std::collections::BTreeMap;

use yakut_common::types::NodeId;
use yakut_node::info::NodeInfo;
use yakut_transport::Transfer;

use crate::model::{Avatar, NodeKey, NodeState, Schemas};
use crate::stats::{PERIOD, Traffic, TrafficStats};

/// Root application state.
#[derive(Debug)]
pub struct App {
    /// Whether the app should continue running.
    pub running: bool,
    /// Transport errors observed so far.
    pub transport_errors: u64,
    schemas: Schemas,
    local: Option<NodeId>,
    avatars: BTreeMap<NodeKey, Avatar>,
    stats: TrafficStats,
    pending_info_requests: Vec<NodeId>,
    ts_last_transfer: Option<f64>,
    ts_previous: Option<f64>,
    snapshot: BTreeMap<NodeKey, NodeState>,
    traffic: Traffic,
}

impl App {
    /// A monitor running on the node `local` whose info is `info`.
    #[must_use]
    pub fn new(schemas: Schemas, local: Option<NodeId>, info: NodeInfo) -> Self {
        let mut avatars = BTreeMap::new();
        // The local node cannot ask itself for info.
        if let Some(id) = local {
            let _ = avatars.insert(NodeKey::Node(id), Avatar::new(NodeKey::Node(id), Some(info)));
        }
        Self {
            running: true,
            transport_errors: 0,
            schemas,
            local,
            avatars,
            stats: TrafficStats::new(),
            pending_info_requests: Vec::new(),
            ts_last_transfer: None,
            ts_previous: None,
            snapshot: BTreeMap::new(),
            traffic: Traffic::default(),
        }
    }

    /// Accounts for a transfer seen on the network.
    pub fn on_transfer(&mut self, transfer: &Transfer) {
        let ts = transfer.timestamp.monotonic;
        self.ts_last_transfer = Some(ts);
        let key = NodeKey::from(transfer.source);
        let avatar = self.avatars.entry(key).or_insert_with(|| {
            tracing::info!(node = %key, "new node");
            Avatar::new(key, None)
        });
        if avatar.on_transfer(ts, &transfer.specifier, &transfer.payload, &self.schemas) {
            if let NodeKey::Node(id) = key {
                if Some(id) != self.local {
                    self.pending_info_requests.push(id);
                }
            }
        }
        self.stats.count(transfer);
    }

    /// Nodes that should be asked for their info, drained.
    pub fn take_info_requests(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.pending_info_requests)
    }

    /// Recomputes the snapshot. The time is taken from the latest transfer
    /// if any arrived since the previous tick, so that a backlog of transfers
    /// does not make the data look stale; `now` is used otherwise.
    pub fn tick(&mut self, now: f64) {
        let ts = self.ts_last_transfer.take().unwrap_or(now);
        let dt = self.ts_previous.map_or(PERIOD.as_secs_f64(), |prev| ts - prev);
        self.ts_previous = Some(ts);
        self.traffic = self.stats.sample(dt);
        self.snapshot = self.avatars.iter_mut().map(|(k, a)| (*k, a.update(ts))).collect();
    }

    /// Node states as of the last tick, anonymous last.
    #[must_use]
    pub const fn snapshot(&self) -> &BTreeMap<NodeKey, NodeState> {
        &self.snapshot
    }

    /// Traffic as of the last tick.
    #[must_use]
    pub const fn traffic(&self) -> &Traffic {
        &self.traffic
    }

    /// Signals the app to quit.
    pub fn quit(&mut self) {
        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use yakut_common::types::{Priority, SubjectId};
    use yakut_node::types;
    use yakut_transport::{DataSpecifier, Timestamp};

    use super::*;

    fn heartbeat_from(source: Option<u16>, monotonic: f64, uptime: u32) -> Transfer {
        let schema = types::HEARTBEAT.message().unwrap();
        let payload = yakut_dsdl::serialize(
            &schema,
            &json!({"uptime": uptime, "health": {"value": 0}, "mode": {"value": 0}, "vendor_specific_status_code": 0}),
        )
        .unwrap();
        Transfer {
            timestamp: Timestamp { system: 0.0, monotonic },
            priority: Priority::Nominal,
            transfer_id: 0,
            source: source.map(NodeId::new),
            specifier: DataSpecifier::Message(SubjectId::new(7509).unwrap()),
            payload,
        }
    }

    #[test]
    fn nodes_appear_and_info_is_requested_once() {
        let info = NodeInfo::for_command("monitor").unwrap();
        let mut app = App::new(Schemas::load().unwrap(), Some(NodeId::new(1)), info);
        app.on_transfer(&heartbeat_from(Some(1), 0.0, 5));
        app.on_transfer(&heartbeat_from(Some(7), 0.0, 5));
        app.on_transfer(&heartbeat_from(Some(7), 1.0, 6));
        app.on_transfer(&heartbeat_from(None, 1.0, 6));
        assert_eq!(app.take_info_requests(), vec![NodeId::new(7)]);
        assert!(app.take_info_requests().is_empty());

        app.tick(100.0);
        let keys: Vec<NodeKey> = app.snapshot().keys().copied().collect();
        assert_eq!(
            keys,
            vec![NodeKey::Node(NodeId::new(1)), NodeKey::Node(NodeId::new(7)), NodeKey::Anonymous]
        );
        assert!(app.snapshot().values().all(|s| s.online));
        assert!(app.snapshot()[&NodeKey::Node(NodeId::new(1))].info.is_some());
    }

    #[test]
    fn quiet_network_uses_wall_time() {
        let mut app = App::new(Schemas::load().unwrap(), None, NodeInfo::default());
        app.on_transfer(&heartbeat_from(Some(3), 0.0, 1));
        app.tick(0.5);
        assert!(app.snapshot()[&NodeKey::Node(NodeId::new(3))].online);
        app.tick(10.0);
        assert!(!app.snapshot()[&NodeKey::Node(NodeId::new(3))].online);
        app.quit();
        assert!(!app.running);
    }
}

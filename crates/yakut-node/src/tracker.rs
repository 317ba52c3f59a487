//! Tracking of the nodes present on the network.
//!
//! The tracker listens to heartbeats, asks every new or restarted node for its
//! info, and tells registered handlers about each change as
//! `(node_id, previous, current)`, where `current` is `None` once the node has
//! gone offline.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use yakut_common::types::NodeId;

use crate::error::Result;
use crate::info::NodeInfo;
use crate::node::Node;
use crate::types;

/// A node is offline after this long without a heartbeat.
pub const OFFLINE_TIMEOUT: Duration = Duration::from_secs(3);

/// GetInfo attempts per node incarnation.
const GET_INFO_ATTEMPTS: u32 = 5;

/// Heartbeat health `WARNING`.
pub const HEALTH_WARNING: u8 = 3;
/// Heartbeat mode `SOFTWARE_UPDATE`.
pub const MODE_SOFTWARE_UPDATE: u8 = 3;

/// A decoded heartbeat.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Heartbeat {
    /// Seconds since the node started.
    pub uptime: u32,
    /// 0 nominal, 1 advisory, 2 caution, 3 warning.
    pub health: u8,
    /// 0 operational, 1 initialization, 2 maintenance, 3 software update.
    pub mode: u8,
    /// Vendor-specific status code.
    pub vssc: u8,
}

impl Heartbeat {
    /// Reads the builtin form of `uavcan.node.Heartbeat.1.0`.
    #[must_use]
    pub fn from_builtin(value: &Value) -> Self {
        let num = |ptr: &str| value.pointer(ptr).and_then(Value::as_u64).unwrap_or(0);
        Self {
            uptime: u32::try_from(num("/uptime")).unwrap_or(u32::MAX),
            health: u8::try_from(num("/health/value")).unwrap_or(u8::MAX),
            mode: u8::try_from(num("/mode/value")).unwrap_or(u8::MAX),
            vssc: u8::try_from(num("/vendor_specific_status_code")).unwrap_or(u8::MAX),
        }
    }
}

/// What is known about one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// The latest heartbeat.
    pub heartbeat: Heartbeat,
    /// Info, once the node has answered GetInfo.
    pub info: Option<NodeInfo>,
}

/// Called on every change of a node's entry.
pub type UpdateHandler = Arc<dyn Fn(NodeId, Option<&Entry>, Option<&Entry>) + Send + Sync>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct State {
    entries: Mutex<BTreeMap<NodeId, Entry>>,
    handlers: Mutex<Vec<UpdateHandler>>,
}

impl State {
    fn notify(&self, node_id: NodeId, old: Option<&Entry>, new: Option<&Entry>) {
        let handlers = lock(&self.handlers).clone();
        for h in handlers {
            h(node_id, old, new);
        }
    }

    fn set(&self, node_id: NodeId, new: Option<Entry>) {
        let old = {
            let mut entries = lock(&self.entries);
            match &new {
                Some(e) => entries.insert(node_id, e.clone()),
                None => entries.remove(&node_id),
            }
        };
        self.notify(node_id, old.as_ref(), new.as_ref());
    }
}

/// Keeps the set of online nodes up to date.
pub struct NodeTracker {
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl NodeTracker {
    /// Starts tracking. GetInfo requests are only sent by non-anonymous nodes.
    ///
    /// # Errors
    ///
    /// Fails if the heartbeat subscription cannot be created.
    pub fn new(node: Arc<Node>) -> Result<Self> {
        let sub = node.make_subscriber(&types::HEARTBEAT.load()?, None)?;
        let get_info = types::GET_INFO.load()?;
        let state = Arc::new(State {
            entries: Mutex::new(BTreeMap::new()),
            handlers: Mutex::new(Vec::new()),
        });
        let task = tokio::spawn(run(node, sub, get_info, Arc::clone(&state)));
        Ok(Self { state, task })
    }

    /// Registers a handler for subsequent changes.
    pub fn add_update_handler(&self, handler: UpdateHandler) {
        lock(&self.state.handlers).push(handler);
    }

    /// Snapshot of the online nodes.
    #[must_use]
    pub fn registry(&self) -> BTreeMap<NodeId, Entry> {
        lock(&self.state.entries).clone()
    }
}

impl Drop for NodeTracker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Incarnation {
    last_seen: Instant,
    generation: u64,
}

async fn run(node: Arc<Node>, mut sub: crate::node::Subscriber, get_info: Arc<yakut_dsdl::DataType>, state: Arc<State>) {
    let (info_tx, mut info_rx) = mpsc::channel::<(NodeId, u64, NodeInfo)>(64);
    let mut seen: BTreeMap<NodeId, Incarnation> = BTreeMap::new();
    let mut generation = 0_u64;
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            received = sub.receive() => {
                let Some((msg, meta)) = received else { break };
                let Some(nid) = meta.source_node_id else { continue };
                let hb = Heartbeat::from_builtin(&msg);
                let now = Instant::now();
                let previous = lock(&state.entries).get(&nid).cloned();
                let restarted = match (&previous, seen.get(&nid)) {
                    (Some(prev), Some(inc)) => {
                        hb.uptime < prev.heartbeat.uptime || now.duration_since(inc.last_seen) > OFFLINE_TIMEOUT
                    }
                    _ => true,
                };
                if restarted {
                    generation += 1;
                    tracing::info!(node_id = %nid, uptime = hb.uptime, "node appeared or restarted");
                    let _ = seen.insert(nid, Incarnation { last_seen: now, generation });
                    state.set(nid, Some(Entry { heartbeat: hb, info: None }));
                    if node.id().is_some() {
                        match node.make_client(&get_info, nid, None) {
                            Ok(client) => {
                                let tx = info_tx.clone();
                                let _info_task = tokio::spawn(request_info(client, nid, generation, tx));
                            }
                            Err(e) => tracing::warn!(node_id = %nid, error = %e, "cannot query node info"),
                        }
                    }
                } else {
                    if let Some(inc) = seen.get_mut(&nid) {
                        inc.last_seen = now;
                    }
                    let info = previous.and_then(|p| p.info);
                    state.set(nid, Some(Entry { heartbeat: hb, info }));
                }
            }
            Some((nid, gen_id, info)) = info_rx.recv() => {
                if seen.get(&nid).is_some_and(|inc| inc.generation == gen_id) {
                    let current = lock(&state.entries).get(&nid).cloned();
                    if let Some(entry) = current {
                        tracing::info!(node_id = %nid, name = %info.name, "node info received");
                        state.set(nid, Some(Entry { info: Some(info), ..entry }));
                    }
                }
            }
            _ = ticker.tick() => {
                let now = Instant::now();
                let expired: Vec<NodeId> = seen
                    .iter()
                    .filter(|(_, inc)| now.duration_since(inc.last_seen) > OFFLINE_TIMEOUT)
                    .map(|(id, _)| *id)
                    .collect();
                for nid in expired {
                    tracing::info!(node_id = %nid, "node went offline");
                    let _ = seen.remove(&nid);
                    state.set(nid, None);
                }
            }
        }
    }
}

async fn request_info(
    mut client: crate::node::Client,
    node_id: NodeId,
    generation: u64,
    tx: mpsc::Sender<(NodeId, u64, NodeInfo)>,
) {
    for attempt in 0..GET_INFO_ATTEMPTS {
        client.timeout = Duration::from_secs(1 << attempt.min(4));
        match client.call(&serde_json::json!({})).await {
            Ok(Some((response, _))) => match NodeInfo::from_builtin(&response) {
                Ok(info) => {
                    let _ = tx.send((node_id, generation, info)).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(node_id = %node_id, error = %e, "malformed node info");
                    return;
                }
            },
            Ok(None) => tracing::debug!(node_id = %node_id, attempt, "GetInfo timed out"),
            Err(e) => {
                tracing::warn!(node_id = %node_id, error = %e, "GetInfo failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn heartbeat_from_builtin() {
        let hb = Heartbeat::from_builtin(&json!({
            "uptime": 12,
            "health": {"value": 2},
            "mode": {"value": 3},
            "vendor_specific_status_code": 7,
        }));
        assert_eq!(hb, Heartbeat { uptime: 12, health: 2, mode: 3, vssc: 7 });
        assert_eq!(Heartbeat::from_builtin(&json!({})), Heartbeat::default());
    }
}

//! Resolution of user-supplied subject and service specifiers into port-IDs
//! and data types, using the network for what the user left out.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use yakut_common::types::{NodeId, Priority, SERVICE_ID_MAX, SUBJECT_ID_MAX};
use yakut_dsdl::{DataType, Loader};

use crate::error::{NodeError, Result};
use crate::node::Node;
use crate::register::RegisterValue;
use crate::register::remote;
use crate::types;

/// How long heartbeats are collected before the set of nodes is considered complete.
pub const DISCOVERY_DURATION: Duration = Duration::from_secs(3);

/// Response timeout for the introspection requests.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

#[allow(clippy::expect_used)] // literal patterns, compiled in tests
static RE_PORT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^uavcan\.(pub|sub)\.(.+)\.id$").expect("pattern is valid"));
#[allow(clippy::expect_used)]
static RE_PORT_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^uavcan\.(pub|sub)\.(.+)\.type$").expect("pattern is valid"));

/// Maps a subject-ID to the type names that nodes declare for it in their
/// `uavcan.(pub|sub).PORT.(id|type)` registers. Ports without a type register,
/// port-IDs that are not numbers and type registers that are not strings are ignored.
#[must_use]
pub fn register_dtypes_by_id(
    registers_per_node: &BTreeMap<NodeId, BTreeMap<String, RegisterValue>>,
    subject_id: u16,
) -> BTreeSet<String> {
    let mut result = BTreeSet::new();
    for (node_id, registers) in registers_per_node {
        let mut ports = BTreeSet::new();
        for (name, value) in registers {
            let Some(caps) = RE_PORT_ID.captures(name) else {
                continue;
            };
            match value.as_integer() {
                Some(id) if id == i64::from(subject_id) => {
                    let _ = ports.insert(caps[2].to_owned());
                }
                Some(_) => {}
                None => tracing::warn!(register = %name, node_id = %node_id, value = %value, "invalid port-ID value"),
            }
        }
        tracing::debug!(node_id = %node_id, subject_id, ports = ?ports, "ports using subject");
        for (name, value) in registers {
            let Some(caps) = RE_PORT_TYPE.captures(name) else {
                continue;
            };
            if !ports.contains(&caps[2]) {
                continue;
            }
            match value.as_text() {
                Some(t) => {
                    let _ = result.insert(t.to_owned());
                }
                None => tracing::warn!(register = %name, node_id = %node_id, value = %value, "invalid data type name"),
            }
        }
    }
    result
}

/// Discovers which data types the nodes on the network use with a subject.
///
/// Heartbeats are collected from construction on; the first query waits
/// until [`DISCOVERY_DURATION`] has passed, then reads the port registers of
/// every node seen. Later queries reuse the cached registers and only visit
/// newly seen nodes.
pub struct SubjectResolver<'a> {
    node: &'a Node,
    seen: Arc<Mutex<BTreeSet<NodeId>>>,
    cache: BTreeMap<NodeId, Option<BTreeMap<String, RegisterValue>>>,
    deadline: Instant,
    listener: JoinHandle<()>,
}

impl<'a> SubjectResolver<'a> {
    /// Starts listening for heartbeats.
    ///
    /// # Errors
    ///
    /// Fails if the local node is anonymous.
    pub fn new(node: &'a Node) -> Result<Self> {
        if node.id().is_none() {
            return Err(NodeError::resolution(
                "Cannot use automatic discovery because the local node is anonymous, \
                 so it cannot access the introspection services on remote nodes. \
                 You need to either fully specify the subjects explicitly or assign a local node-ID.",
            ));
        }
        let mut sub = node.make_subscriber(&types::HEARTBEAT.load()?, None)?;
        let seen = Arc::new(Mutex::new(BTreeSet::new()));
        let sink = Arc::clone(&seen);
        let listener = tokio::spawn(async move {
            while let Some((_, meta)) = sub.receive().await {
                if let Some(id) = meta.source_node_id {
                    let _ = sink.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
                }
            }
        });
        Ok(Self {
            node,
            seen,
            cache: BTreeMap::new(),
            deadline: Instant::now() + DISCOVERY_DURATION,
            listener,
        })
    }

    async fn update_cache(&mut self) -> Result<()> {
        loop {
            let next = {
                let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
                seen.iter().find(|id| !self.cache.contains_key(id)).copied()
            };
            match next {
                Some(nid) => {
                    tracing::debug!(node_id = %nid, "fetching port registers");
                    let regs = remote::fetch_registers(
                        self.node,
                        nid,
                        |name| RE_PORT_ID.is_match(name) || RE_PORT_TYPE.is_match(name),
                        RESPONSE_TIMEOUT,
                        Priority::High,
                    )
                    .await?;
                    let _ = self.cache.insert(nid, regs);
                }
                None if Instant::now() >= self.deadline => return Ok(()),
                None => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }

    /// Type names used with `subject_id` across the network. An empty set
    /// means nobody uses the subject or the users lack the register service.
    ///
    /// # Errors
    ///
    /// Fails only on local problems.
    pub async fn dtypes_by_id(&mut self, subject_id: u16) -> Result<BTreeSet<String>> {
        self.update_cache().await?;
        let known: BTreeMap<NodeId, BTreeMap<String, RegisterValue>> = self
            .cache
            .iter()
            .filter_map(|(k, v)| v.clone().map(|v| (*k, v)))
            .collect();
        Ok(register_dtypes_by_id(&known, subject_id))
    }
}

impl Drop for SubjectResolver<'_> {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

fn parse_subject_id(text: &str) -> Option<u16> {
    text.trim().parse::<u16>().ok().filter(|id| *id <= SUBJECT_ID_MAX)
}

/// Turns a subject specifier into a subject-ID and a message type.
///
/// `ID:TYPE` is taken literally; a lone type name uses its fixed subject-ID;
/// a lone subject-ID asks `resolver` which types the network uses with it.
///
/// # Errors
///
/// Fails on malformed specifiers, types without a fixed port-ID, a missing
/// resolver when one is needed and unsuccessful discovery.
pub async fn process_subject_specifier(
    specifier: &str,
    loader: &Loader,
    resolver: Option<&mut SubjectResolver<'_>>,
) -> Result<(u16, Arc<DataType>)> {
    if let Some((id_text, type_name)) = specifier.split_once(':').filter(|(_, t)| !t.contains(':')) {
        tracing::info!(specifier, "subject specifier interpreted as explicit");
        let id = parse_subject_id(id_text)
            .ok_or_else(|| NodeError::resolution(format!("{id_text} is not a valid subject-ID")))?;
        return Ok((id, loader.load(type_name, false)?));
    }
    let Some(subject_id) = parse_subject_id(specifier) else {
        let dtype = loader.load(specifier, false)?;
        let id = dtype.fixed_port_id().ok_or_else(|| {
            NodeError::resolution(format!(
                "Type specified as {specifier:?} is found but it has no fixed port-ID. \
                 Consider specifying the subject-ID manually? The syntax is like 1234:{specifier}"
            ))
        })?;
        tracing::debug!(dtype = %dtype, subject_id = id, "using fixed subject-ID");
        return Ok((id, dtype));
    };
    tracing::info!(subject_id, "subject specifier is a number, using network discovery");
    let resolver = resolver.ok_or_else(|| {
        NodeError::resolution(
            "Cannot use automatic discovery because the local node is anonymous, \
             so it cannot access the introspection services on remote nodes. \
             You need to either fully specify the subjects explicitly or assign a local node-ID.",
        )
    })?;
    let names = resolver.dtypes_by_id(subject_id).await?;
    tracing::debug!(subject_id, names = ?names, "types found by network discovery");
    names
        .iter()
        .rev()
        .filter_map(|name| match loader.load(name, true) {
            Ok(dt) => Some(dt),
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "discovered type cannot be loaded");
                None
            }
        })
        .find(|dt| !dt.is_service())
        .map(|dt| (subject_id, dt))
        .ok_or_else(|| {
            NodeError::resolution(format!(
                "Automatic network discovery did not return suitable dtypes for subject {subject_id}. \
                 Either the subject-ID is incorrect, or the nodes that utilize it are currently offline, \
                 or they do not support the introspection services required for automatic discovery. \
                 Consider specifying the data type manually? The syntax is like {subject_id}:namespace.DataType"
            ))
        })
}

/// Reads `uavcan.srv.NAME.id` and `.type` from the server. Returns `None` if
/// the server does not answer or the service is not configured.
async fn resolve_service_by_name(
    node: &Node,
    server: NodeId,
    port_name: &str,
    timeout: Duration,
) -> Result<Option<(u16, Option<String>)>> {
    let id_reg = format!("uavcan.srv.{port_name}.id");
    let Some(response) = remote::read(node, server, &id_reg, timeout, Priority::Nominal).await? else {
        tracing::info!(server = %server, register = %id_reg, "request timed out");
        return Ok(None);
    };
    let Some(port_id) = response
        .value
        .as_integer()
        .and_then(|v| u16::try_from(v).ok())
        .filter(|v| *v <= SERVICE_ID_MAX)
    else {
        tracing::debug!(server = %server, port_name, "service is not configured");
        return Ok(None);
    };
    let type_reg = format!("uavcan.srv.{port_name}.type");
    let Some(response) = remote::read(node, server, &type_reg, timeout, Priority::Nominal).await? else {
        tracing::info!(server = %server, register = %type_reg, "request timed out");
        return Ok(None);
    };
    Ok(Some((port_id, response.value.as_text().map(str::to_owned))))
}

fn unresolved(port_name: &str, server: NodeId) -> NodeError {
    NodeError::resolution(format!(
        "Could not resolve service {port_name:?} via node {server}. \
         The remote node might be offline or it may not support automatic discovery. \
         Consider specifying the service-ID and the data type explicitly?"
    ))
}

/// Turns a service specifier into a service-ID and a service type.
///
/// Accepted forms are `ID:TYPE`, `NAME:TYPE`, `TYPE` (fixed service-ID) and
/// `NAME`; names are resolved through the `uavcan.srv.NAME.*` registers of
/// `server`, which requires `node`.
///
/// # Errors
///
/// Fails on malformed specifiers, unknown types, types without a fixed
/// port-ID and unsuccessful resolution.
pub async fn process_service_specifier(
    specifier: &str,
    server: NodeId,
    loader: &Loader,
    node: Option<&Node>,
    timeout: Duration,
) -> Result<(u16, Arc<DataType>)> {
    let parts: Vec<&str> = specifier.split(':').collect();
    let need_node = || {
        node.ok_or_else(|| NodeError::Anonymous {
            purpose: "to resolve service names".to_owned(),
        })
    };
    match parts.as_slice() {
        [port, type_name] => {
            let dtype = loader.load(type_name, false)?;
            if let Ok(id) = port.trim().parse::<u16>() {
                if id > SERVICE_ID_MAX {
                    return Err(NodeError::resolution(format!("{id} is not a valid service-ID")));
                }
                return Ok((id, dtype));
            }
            tracing::info!(server = %server, dtype = %dtype, "querying server for the service-ID");
            let (id, remote_type) = resolve_service_by_name(need_node()?, server, port, timeout)
                .await?
                .ok_or_else(|| unresolved(port, server))?;
            tracing::debug!(local = %dtype, remote = ?remote_type, "using locally specified type");
            Ok((id, dtype))
        }
        [single] => {
            if single.contains('.') {
                if let Ok(dtype) = loader.load(single, false) {
                    let id = dtype.fixed_port_id().ok_or_else(|| {
                        NodeError::resolution(format!("Type {} does not have a fixed port-ID", dtype.full_name()))
                    })?;
                    return Ok((id, dtype));
                }
            }
            tracing::info!(specifier, "not a type name, assuming a port name");
            let (id, type_name) = resolve_service_by_name(need_node()?, server, single, timeout)
                .await?
                .ok_or_else(|| unresolved(single, server))?;
            let type_name = type_name.ok_or_else(|| {
                NodeError::resolution(format!(
                    "Remote node {server} does not provide data type information for service {single}, \
                     nor is the type specified locally."
                ))
            })?;
            Ok((id, loader.load(&type_name, true)?))
        }
        _ => Err(NodeError::resolution(format!("Service specifier invalid: {specifier:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regs(entries: &[(&str, RegisterValue)]) -> BTreeMap<String, RegisterValue> {
        entries.iter().map(|(k, v)| ((*k).to_owned(), v.clone())).collect()
    }

    #[test]
    fn dtypes_by_id_follows_port_registers() {
        let s = RegisterValue::string;
        let n = |v| RegisterValue::natural16(&[v]);
        let mut all = BTreeMap::new();
        let _ = all.insert(
            NodeId::new(0),
            regs(&[
                ("uavcan.pub.aa.id", n(1000)),
                ("uavcan.pub.aa.type", s("ns.A.1.1")),
                ("uavcan.sub.bb.id", n(2000)),
                ("uavcan.sub.bb.type", s("ns.B.1.1")),
                ("uavcan.sub.typeless.id", n(3000)),
                ("uavcan.pub.bad_id.id", s("not a number")),
                ("uavcan.pub.bad_type.id", n(2000)),
                ("uavcan.pub.bad_type.type", n(2000)),
            ]),
        );
        let _ = all.insert(
            NodeId::new(1),
            regs(&[
                ("uavcan.sub.cc.id", n(2000)),
                ("uavcan.sub.cc.type", s("ns.B.1.1")),
                ("uavcan.pub.aa.id", n(1000)),
                ("uavcan.pub.aa.type", s("ns.A.2.2")),
            ]),
        );
        let _ = all.insert(NodeId::new(3), BTreeMap::new());
        let set = |items: &[&str]| items.iter().map(|s| (*s).to_owned()).collect::<BTreeSet<_>>();
        assert_eq!(register_dtypes_by_id(&BTreeMap::new(), 123), set(&[]));
        assert_eq!(register_dtypes_by_id(&all, 1000), set(&["ns.A.1.1", "ns.A.2.2"]));
        assert_eq!(register_dtypes_by_id(&all, 2000), set(&["ns.B.1.1"]));
        assert_eq!(register_dtypes_by_id(&all, 3000), set(&[]));
        assert_eq!(register_dtypes_by_id(&all, 9000), set(&[]));
    }

    #[tokio::test]
    async fn explicit_and_fixed_subject_specifiers() {
        let loader = Loader::default();
        let (id, dt) = process_subject_specifier("1234:uavcan.si.unit.length.Scalar", &loader, None)
            .await
            .expect("explicit");
        assert_eq!((id, dt.full_name().as_str()), (1234, "uavcan.si.unit.length.Scalar.1.0"));
        let (id, _) = process_subject_specifier("uavcan.node.heartbeat", &loader, None)
            .await
            .expect("fixed");
        assert_eq!(id, 7509);
    }

    #[tokio::test]
    async fn subject_specifier_errors() {
        let loader = Loader::default();
        let err = process_subject_specifier("9000:uavcan.node.Heartbeat", &loader, None)
            .await
            .expect_err("bad id");
        assert_eq!(err.to_string(), "9000 is not a valid subject-ID");
        let err = process_subject_specifier("uavcan.si.unit.length.Scalar", &loader, None)
            .await
            .expect_err("no fixed id");
        assert!(err.to_string().contains("The syntax is like 1234:uavcan.si.unit.length.Scalar"), "{err}");
        let err = process_subject_specifier("100", &loader, None).await.expect_err("anonymous");
        assert!(err.to_string().starts_with("Cannot use automatic discovery"), "{err}");
    }

    #[tokio::test]
    async fn service_specifiers_without_network() {
        let loader = Loader::default();
        let server = NodeId::new(42);
        let timeout = Duration::from_millis(100);
        let (id, dt) = process_service_specifier("uavcan.node.GetInfo", server, &loader, None, timeout)
            .await
            .expect("fixed");
        assert_eq!((id, dt.full_name().as_str()), (430, "uavcan.node.GetInfo.1.0"));
        let (id, _) = process_service_specifier("123:uavcan.node.ExecuteCommand", server, &loader, None, timeout)
            .await
            .expect("explicit");
        assert_eq!(id, 123);
        assert!(process_service_specifier("least_squares", server, &loader, None, timeout).await.is_err());
        assert!(process_service_specifier("a:b:c", server, &loader, None, timeout).await.is_err());
    }

    #[test]
    fn patterns_compile() {
        let _ = LazyLock::force(&RE_PORT_ID);
        let _ = LazyLock::force(&RE_PORT_TYPE);
    }
}

//! Register access on remote nodes: listing, reading, writing and batch
//! processing through `uavcan.register.List` and `uavcan.register.Access`.
//!
//! Failures that concern one node are collected as human-readable errors and
//! warnings instead of aborting the whole operation, so that callers can
//! always produce best-effort output.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value, json};
use yakut_common::types::{NodeId, Priority};

use super::registry::request_name;
use super::value::RegisterValue;
use crate::error::{NodeError, Result};
use crate::node::{Client, Node};
use crate::types;

/// Per-node data together with the problems met while collecting it.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome<T> {
    /// Collected data keyed by node-ID.
    pub data_per_node: BTreeMap<NodeId, T>,
    /// Problems that make the outcome unsuccessful.
    pub errors: Vec<String>,
    /// Problems that were tolerated as requested.
    pub warnings: Vec<String>,
}

impl<T> Default for Outcome<T> {
    fn default() -> Self {
        Self {
            data_per_node: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl<T> Outcome<T> {
    /// Whether no errors were recorded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A decoded `uavcan.register.Access` response.
#[derive(Debug, Clone, PartialEq)]
pub struct AccessResponse {
    /// Value after the access; empty if the register does not exist.
    pub value: RegisterValue,
    /// Whether the register accepts writes.
    pub mutable: bool,
    /// Whether the register survives restarts.
    pub persistent: bool,
    /// Server timestamp in microseconds; zero if unknown.
    pub timestamp_us: u64,
}

impl AccessResponse {
    /// Parses the builtin form of the response.
    ///
    /// # Errors
    ///
    /// Fails if the value union is malformed.
    pub fn from_builtin(response: &Value) -> Result<Self> {
        let flag = |key: &str| response.get(key).and_then(Value::as_bool).unwrap_or(false);
        Ok(Self {
            value: response
                .get("value")
                .map_or(Ok(RegisterValue::Empty), RegisterValue::from_builtin)?,
            mutable: flag("mutable"),
            persistent: flag("persistent"),
            timestamp_us: response
                .pointer("/timestamp/microsecond")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
    }

    /// Mutability and persistence flags as a mapping.
    #[must_use]
    pub fn metadata(&self) -> Value {
        json!({"mutable": self.mutable, "persistent": self.persistent})
    }

    /// Output form of the value: simplified at `detail` 0, typed at 1, typed
    /// with flags under `_meta_` at 2 and above.
    #[must_use]
    pub fn represent(&self, detail: u8) -> Value {
        match detail {
            0 => self.value.to_simplified(),
            1 => self.value.to_builtin(),
            _ => {
                let mut out = match self.value.to_builtin() {
                    Value::Object(m) => m,
                    other => Map::from_iter([("value".to_owned(), other)]),
                };
                let _ = out.insert("_meta_".to_owned(), self.metadata());
                Value::Object(out)
            }
        }
    }
}

async fn request_access(client: &Client, name: &str, value: Option<&RegisterValue>) -> Result<Option<AccessResponse>> {
    let request = json!({
        "name": {"name": name},
        "value": value.map_or_else(|| RegisterValue::Empty.to_builtin(), RegisterValue::to_builtin),
    });
    match client.call(&request).await? {
        Some((response, _)) => Ok(Some(AccessResponse::from_builtin(&response)?)),
        None => Ok(None),
    }
}

async fn request_name_at(client: &Client, index: u16) -> Result<Option<String>> {
    Ok(client
        .call(&json!({"index": index}))
        .await?
        .map(|(response, _)| request_name(response.get("name"))))
}

fn make_client(node: &Node, dtype: types::StandardType, server: NodeId, timeout: Duration, priority: Priority) -> Result<Client> {
    let mut client = node.make_client(&dtype.load()?, server, None)?;
    client.timeout = timeout;
    client.priority = priority;
    Ok(client)
}

/// Reads one register of one node. Returns `None` on timeout.
///
/// # Errors
///
/// Fails only on local problems such as an anonymous node.
pub async fn read(
    node: &Node,
    node_id: NodeId,
    name: &str,
    timeout: Duration,
    priority: Priority,
) -> Result<Option<AccessResponse>> {
    let client = make_client(node, types::REGISTER_ACCESS, node_id, timeout, priority)?;
    request_access(&client, name, None).await
}

/// Lists the register names of every node in `node_ids`, sorted per node.
///
/// A node that does not answer the first request is taken to lack the
/// service; it maps to `None` and is reported as a warning when
/// `optional_service` is set, an error otherwise. A timeout after the first
/// answer leaves the list incomplete and is always an error.
///
/// # Errors
///
/// Fails only on local problems such as an anonymous node.
pub async fn list_names(
    node: &Node,
    node_ids: &[NodeId],
    timeout: Duration,
    optional_service: bool,
) -> Result<Outcome<Option<Vec<String>>>> {
    let mut out = Outcome::default();
    for &nid in node_ids {
        let client = make_client(node, types::REGISTER_LIST, nid, timeout, Priority::Nominal)?;
        let mut names = Vec::new();
        let mut service = true;
        for index in 0..=u16::MAX {
            tracing::debug!(node_id = %nid, index, "listing registers");
            match request_name_at(&client, index).await? {
                Some(name) if name.is_empty() => break,
                Some(name) => names.push(name),
                None if index == 0 => {
                    service = false;
                    if optional_service {
                        out.warnings.push(format!(
                            "Register list service is not accessible at node {nid}, ignoring as requested"
                        ));
                    } else {
                        out.errors
                            .push(format!("Register list service is not accessible at node {nid}"));
                    }
                    break;
                }
                None => {
                    out.errors
                        .push(format!("Request #{index} to node {nid} has timed out, data incomplete"));
                    break;
                }
            }
        }
        names.sort();
        let _ = out.data_per_node.insert(nid, service.then_some(names));
    }
    Ok(out)
}

/// How [`access`] treats nodes without the service or without the register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessOptions {
    /// Nodes that never answer are warnings rather than errors.
    pub optional_service: bool,
    /// Writing a nonexistent register is a warning rather than an error.
    pub optional_register: bool,
}

/// Reads the register `name` on every node in `node_ids`. When `value_text`
/// is given and the register exists, the text is converted to the register's
/// own type and written; the value reported after the write is kept.
///
/// # Errors
///
/// Fails only on local problems such as an anonymous node.
pub async fn access(
    node: &Node,
    node_ids: &[NodeId],
    name: &str,
    value_text: Option<&str>,
    options: AccessOptions,
    timeout: Duration,
) -> Result<Outcome<Option<AccessResponse>>> {
    let mut out = Outcome::default();
    for &nid in node_ids {
        tracing::info!(node_id = %nid, register = name, "accessing register");
        let client = make_client(node, types::REGISTER_ACCESS, nid, timeout, Priority::Nominal)?;
        let Some(read) = request_access(&client, name, None).await? else {
            let _ = out.data_per_node.insert(nid, None);
            if options.optional_service {
                out.warnings
                    .push(format!("Service not accessible at node {nid}, ignoring as requested"));
            } else {
                out.errors.push(format!("Service not accessible at node {nid}"));
            }
            continue;
        };
        let Some(text) = value_text else {
            let _ = out.data_per_node.insert(nid, Some(read));
            continue;
        };
        if read.value.is_empty() {
            if options.optional_register {
                out.warnings
                    .push(format!("Nonexistent register {name:?} at node {nid} ignored as requested"));
            } else {
                out.errors
                    .push(format!("Cannot assign nonexistent register {name:?} at node {nid}"));
            }
            let _ = out.data_per_node.insert(nid, Some(read));
            continue;
        }
        let coerced = match read.value.assign_from_str(text) {
            Ok(v) => v,
            Err(e) => {
                out.errors.push(format!("Assignment failed at node {nid}: {e}"));
                let _ = out.data_per_node.insert(nid, Some(read));
                continue;
            }
        };
        match request_access(&client, name, Some(&coerced)).await? {
            Some(written) => {
                let _ = out.data_per_node.insert(nid, Some(written));
            }
            None => {
                out.errors.push(format!("Request to node {nid} has timed out"));
                let _ = out.data_per_node.insert(nid, None);
            }
        }
    }
    Ok(out)
}

/// Reads every register of `node_id` whose name satisfies `predicate`.
/// Returns `None` if any request times out.
///
/// # Errors
///
/// Fails only on local problems such as an anonymous node.
pub async fn fetch_registers(
    node: &Node,
    node_id: NodeId,
    predicate: impl Fn(&str) -> bool,
    timeout: Duration,
    priority: Priority,
) -> Result<Option<BTreeMap<String, RegisterValue>>> {
    let list = make_client(node, types::REGISTER_LIST, node_id, timeout, priority)?;
    let mut names = Vec::new();
    for index in 0..=u16::MAX {
        match request_name_at(&list, index).await? {
            Some(name) if name.is_empty() => break,
            Some(name) => names.push(name),
            None => {
                tracing::warn!(node_id = %node_id, index, "register list request timed out");
                return Ok(None);
            }
        }
    }
    tracing::debug!(node_id = %node_id, names = ?names, "register names fetched");
    let access = make_client(node, types::REGISTER_ACCESS, node_id, timeout, priority)?;
    let mut out = BTreeMap::new();
    for name in names.into_iter().filter(|n| predicate(n)) {
        let Some(response) = request_access(&access, &name, None).await? else {
            tracing::warn!(node_id = %node_id, register = %name, "register access request timed out");
            return Ok(None);
        };
        let _ = out.insert(name, response.value);
    }
    Ok(Some(out))
}

/// What to do with the registers of each node, in processing order.
/// A `None` value reads the register; a value writes it after coercion to
/// the register's type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Directive {
    /// Register directives per node.
    pub registers_per_node: Vec<(NodeId, Vec<(String, Option<Value>)>)>,
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

fn invalid(message: String) -> NodeError {
    NodeError::resolution(message)
}

/// Folds nested mappings into dotted register names unless they are typed
/// register values.
fn flatten_node_spec(prefix: &str, map: &Map<String, Value>, out: &mut Vec<(String, Option<Value>)>) {
    for (key, value) in map {
        let name = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
        match value {
            Value::Object(inner) if RegisterValue::from_builtin(value).is_err() => {
                flatten_node_spec(&name, inner, out);
            }
            other => out.push((name, Some(other.clone()))),
        }
    }
}

fn load_node_spec(spec: &Value) -> Result<Vec<(String, Option<Value>)>> {
    match spec {
        Value::Array(items) if items.iter().all(Value::is_string) => Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(|n| (n.to_owned(), None))
            .collect()),
        Value::Object(map) => {
            let mut out = Vec::new();
            flatten_node_spec("", map, &mut out);
            Ok(out)
        }
        other => Err(invalid(format!(
            "Invalid node specifier: expected [register_name] or (register_name->register_value); found {}",
            type_label(other)
        ))),
    }
}

impl Directive {
    /// Parses a directive document. With `node_ids`, the document is a single
    /// node specifier applied to each of them; otherwise it maps node-IDs to
    /// node specifiers.
    ///
    /// # Errors
    ///
    /// Fails on malformed documents and invalid node-IDs.
    pub fn load(document: &Value, node_ids: Option<&[NodeId]>) -> Result<Self> {
        if let Some(ids) = node_ids {
            let spec = load_node_spec(document)?;
            return Ok(Self {
                registers_per_node: ids.iter().map(|&id| (id, spec.clone())).collect(),
            });
        }
        let Value::Object(map) = document else {
            return Err(invalid(format!(
                "Invalid directive: expected mapping (node_id->...), found {}",
                type_label(document)
            )));
        };
        let mut registers_per_node = Vec::with_capacity(map.len());
        for (key, spec) in map {
            let node_id = key
                .trim()
                .parse::<i64>()
                .ok()
                .and_then(|n| NodeId::try_from_i64(n).ok())
                .ok_or_else(|| invalid(format!("Not a valid node-ID: {key}")))?;
            let spec = load_node_spec(spec)?;
            tracing::debug!(node_id = %node_id, registers = spec.len(), "node directive loaded");
            registers_per_node.push((node_id, spec));
        }
        Ok(Self { registers_per_node })
    }
}

/// The fate of one register in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchItem {
    /// The node answered; the value is empty if the register does not exist.
    Response(AccessResponse),
    /// The given value could not be converted to the register's type.
    TypeCoercionFailure(AccessResponse),
    /// The node stopped answering at this register.
    Timeout,
    /// Not attempted because an earlier register of the node timed out.
    Skipped,
}

async fn process_one(client: &Client, name: &str, value: Option<&Value>) -> Result<BatchItem> {
    let Some(read) = request_access(client, name, None).await? else {
        return Ok(BatchItem::Timeout);
    };
    let Some(value) = value else {
        return Ok(BatchItem::Response(read));
    };
    if read.value.is_empty() {
        return Ok(BatchItem::Response(read));
    }
    let coerced = match read.value.coerce_builtin(value) {
        Ok(v) => v,
        Err(e) => {
            tracing::info!(register = name, error = %e, "type coercion failed");
            return Ok(BatchItem::TypeCoercionFailure(read));
        }
    };
    Ok(request_access(client, name, Some(&coerced))
        .await?
        .map_or(BatchItem::Timeout, BatchItem::Response))
}

/// Executes a directive strictly in order. After a timeout the remaining
/// registers of that node are skipped; other nodes are still processed.
///
/// # Errors
///
/// Fails only on local problems such as an anonymous node.
pub async fn do_calls(node: &Node, directive: &Directive, timeout: Duration) -> Result<Vec<(NodeId, Vec<(String, BatchItem)>)>> {
    let mut out = Vec::with_capacity(directive.registers_per_node.len());
    for (nid, registers) in &directive.registers_per_node {
        let client = make_client(node, types::REGISTER_ACCESS, *nid, timeout, Priority::Nominal)?;
        let mut items = Vec::with_capacity(registers.len());
        let mut timed_out = false;
        for (index, (name, value)) in registers.iter().enumerate() {
            if timed_out {
                items.push((name.clone(), BatchItem::Skipped));
                continue;
            }
            let item = process_one(&client, name, value.as_ref()).await?;
            if item == BatchItem::Timeout {
                tracing::info!(
                    node_id = %nid,
                    register = %name,
                    position = index + 1,
                    total = registers.len(),
                    "register timed out, rest of node skipped"
                );
                timed_out = true;
            }
            items.push((name.clone(), item));
        }
        out.push((*nid, items));
    }
    Ok(out)
}

/// Output filter over register flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    /// `m`
    Mutable,
    /// `i`
    Immutable,
    /// `p`
    Persistent,
    /// `v`
    Volatile,
    /// `mp`
    MutablePersistent,
    /// `mv`
    MutableVolatile,
    /// `ip`
    ImmutablePersistent,
    /// `iv`
    ImmutableVolatile,
}

impl Predicate {
    /// The short codes accepted by [`str::parse`].
    pub const CODES: [&'static str; 8] = ["m", "i", "p", "v", "mp", "mv", "ip", "iv"];

    /// Whether `response` passes the filter.
    #[must_use]
    pub const fn matches(self, response: &AccessResponse) -> bool {
        let (m, p) = (response.mutable, response.persistent);
        match self {
            Self::Mutable => m,
            Self::Immutable => !m,
            Self::Persistent => p,
            Self::Volatile => !p,
            Self::MutablePersistent => m && p,
            Self::MutableVolatile => m && !p,
            Self::ImmutablePersistent => !m && p,
            Self::ImmutableVolatile => !m && !p,
        }
    }
}

impl std::str::FromStr for Predicate {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "m" => Self::Mutable,
            "i" => Self::Immutable,
            "p" => Self::Persistent,
            "v" => Self::Volatile,
            "mp" => Self::MutablePersistent,
            "mv" => Self::MutableVolatile,
            "ip" => Self::ImmutablePersistent,
            "iv" => Self::ImmutableVolatile,
            other => return Err(invalid(format!("unknown register filter {other:?}"))),
        })
    }
}

/// Errors and warnings for a finished batch. With `options`, a node that
/// never answered and writes to nonexistent registers are only warnings.
#[must_use]
pub fn batch_report(
    results: &[(NodeId, Vec<(String, BatchItem)>)],
    options: AccessOptions,
) -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    for (nid, items) in results {
        if options.optional_service && matches!(items.first(), Some((_, BatchItem::Timeout))) {
            warnings.push(format!("Service not accessible at node {nid}, ignoring as requested"));
            continue;
        }
        let mut failed = 0_usize;
        for (name, item) in items {
            let prefix = format!("{nid}:{name:?}: ");
            match item {
                BatchItem::Response(r) if !r.value.is_empty() => continue,
                BatchItem::Response(_) if options.optional_register => {
                    warnings.push(format!("{prefix}No such register, ignored as requested"));
                }
                BatchItem::Response(_) => errors.push(format!("{prefix}No such register")),
                BatchItem::TypeCoercionFailure(_) => {
                    errors.push(format!("{prefix}Type coercion failed, original value left unchanged"));
                }
                BatchItem::Timeout => errors.push(format!("{prefix}Timed out")),
                BatchItem::Skipped => {}
            }
            failed += 1;
        }
        tracing::info!(node_id = %nid, total = items.len(), failed, "batch node processed");
        if failed > 0 {
            warnings.push(format!("{nid}: {failed} failed of {} total. Output incomplete.", items.len()));
        }
    }
    (errors, warnings)
}

/// The output document of a batch: per node, every answered register that
/// passes `predicate`, rendered at `detail`.
#[must_use]
pub fn batch_output(results: &[(NodeId, Vec<(String, BatchItem)>)], predicate: Option<Predicate>, detail: u8) -> Value {
    let mut out = Map::new();
    for (nid, items) in results {
        let per_node: Map<String, Value> = items
            .iter()
            .filter_map(|(name, item)| match item {
                BatchItem::Response(r) if predicate.is_none_or(|p| p.matches(r)) => {
                    Some((name.clone(), r.represent(detail)))
                }
                _ => None,
            })
            .collect();
        let _ = out.insert(nid.to_string(), Value::Object(per_node));
    }
    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(value: RegisterValue, mutable: bool, persistent: bool) -> AccessResponse {
        AccessResponse {
            value,
            mutable,
            persistent,
            timestamp_us: 0,
        }
    }

    #[test]
    fn access_response_parses_builtin() {
        let r = AccessResponse::from_builtin(&json!({
            "timestamp": {"microsecond": 5},
            "mutable": true,
            "persistent": false,
            "value": {"natural16": {"value": [42]}},
        }))
        .expect("parse");
        assert_eq!(r, AccessResponse { timestamp_us: 5, ..response(RegisterValue::natural16(&[42]), true, false) });
    }

    #[test]
    fn representation_levels() {
        let r = response(RegisterValue::natural16(&[42]), true, true);
        assert_eq!(r.represent(0), json!(42));
        assert_eq!(r.represent(1), json!({"natural16": {"value": [42]}}));
        assert_eq!(
            r.represent(2),
            json!({"natural16": {"value": [42]}, "_meta_": {"mutable": true, "persistent": true}})
        );
    }

    #[test]
    fn directive_maps_node_ids_to_specifiers() {
        let doc = json!({
            "10": ["uavcan.node.id", "uavcan.node.description"],
            "11": {"uavcan": {"node": {"description": "hello"}}, "m.x": {"real32": {"value": [1.5]}}},
        });
        let d = Directive::load(&doc, None).expect("load");
        assert_eq!(d.registers_per_node.len(), 2);
        assert_eq!(d.registers_per_node[0].0, NodeId::new(10));
        assert_eq!(d.registers_per_node[0].1[1], ("uavcan.node.description".to_owned(), None));
        let eleven = &d.registers_per_node[1].1;
        assert_eq!(eleven[0], ("uavcan.node.description".to_owned(), Some(json!("hello"))));
        assert_eq!(eleven[1].0, "m.x");
    }

    #[test]
    fn directive_applies_flat_document_to_given_nodes() {
        let ids = [NodeId::new(1), NodeId::new(2)];
        let d = Directive::load(&json!(["a", "b"]), Some(&ids)).expect("load");
        assert_eq!(d.registers_per_node.len(), 2);
        assert_eq!(d.registers_per_node[1].1.len(), 2);
    }

    #[test]
    fn directive_rejects_malformed_documents() {
        let err = Directive::load(&json!([1, 2]), None).expect_err("list");
        assert_eq!(err.to_string(), "Invalid directive: expected mapping (node_id->...), found list");
        let err = Directive::load(&json!({"abc": []}), None).expect_err("node id");
        assert_eq!(err.to_string(), "Not a valid node-ID: abc");
        let err = Directive::load(&json!({"1": 5}), None).expect_err("spec");
        assert!(err.to_string().ends_with("found int"), "{err}");
    }

    #[test]
    fn predicates_filter_on_flags() {
        let mp = response(RegisterValue::string("x"), true, true);
        let iv = response(RegisterValue::string("x"), false, false);
        assert!("mp".parse::<Predicate>().expect("mp").matches(&mp));
        assert!(!"mp".parse::<Predicate>().expect("mp").matches(&iv));
        assert!("IV".parse::<Predicate>().expect("iv").matches(&iv));
        assert!("x".parse::<Predicate>().is_err());
    }

    #[test]
    fn batch_report_and_output() {
        let results = vec![(
            NodeId::new(7),
            vec![
                ("ok".to_owned(), BatchItem::Response(response(RegisterValue::natural16(&[1]), true, true))),
                ("ro".to_owned(), BatchItem::Response(response(RegisterValue::natural16(&[2]), false, true))),
                ("missing".to_owned(), BatchItem::Response(response(RegisterValue::Empty, false, false))),
                (
                    "bad".to_owned(),
                    BatchItem::TypeCoercionFailure(response(RegisterValue::string("x"), true, true)),
                ),
                ("late".to_owned(), BatchItem::Timeout),
                ("after".to_owned(), BatchItem::Skipped),
            ],
        )];
        let (errors, warnings) = batch_report(&results, AccessOptions::default());
        assert_eq!(
            errors,
            vec![
                "7:\"missing\": No such register",
                "7:\"bad\": Type coercion failed, original value left unchanged",
                "7:\"late\": Timed out",
            ]
        );
        assert_eq!(warnings, vec!["7: 4 failed of 6 total. Output incomplete."]);
        let tolerant = AccessOptions {
            optional_service: true,
            optional_register: true,
        };
        let (errors, warnings) = batch_report(&results, tolerant);
        assert_eq!(errors.len(), 2);
        assert_eq!(warnings[0], "7:\"missing\": No such register, ignored as requested");
        let silent = vec![(NodeId::new(9), vec![("a".to_owned(), BatchItem::Timeout)])];
        assert_eq!(
            batch_report(&silent, tolerant),
            (Vec::new(), vec!["Service not accessible at node 9, ignoring as requested".to_owned()])
        );
        assert_eq!(
            batch_output(&results, None, 0),
            json!({"7": {"ok": 1, "ro": 2, "missing": null}})
        );
        assert_eq!(
            batch_output(&results, Some(Predicate::Mutable), 0),
            json!({"7": {"ok": 1}})
        );
    }
}

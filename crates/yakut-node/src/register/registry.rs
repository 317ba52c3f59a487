//! The local register store served by every non-anonymous node.

use std::collections::BTreeMap;

use serde_json::{Value, json};
use yakut_common::env::registers_from_env;
use yakut_common::types::NodeId;

use super::value::RegisterValue;

/// Register holding the node-ID.
pub const NODE_ID: &str = "uavcan.node.id";
/// Register holding the free-form node description.
pub const NODE_DESCRIPTION: &str = "uavcan.node.description";

/// A named value with its access flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Register {
    /// Current value.
    pub value: RegisterValue,
    /// Whether remote writes are accepted.
    pub mutable: bool,
    /// Whether the value survives restarts.
    pub persistent: bool,
}

impl Register {
    /// A mutable persistent register.
    #[must_use]
    pub const fn mutable(value: RegisterValue) -> Self {
        Self {
            value,
            mutable: true,
            persistent: true,
        }
    }

    /// An immutable volatile register.
    #[must_use]
    pub const fn immutable(value: RegisterValue) -> Self {
        Self {
            value,
            mutable: false,
            persistent: false,
        }
    }

    /// Builtin form of the `uavcan.register.Access` response describing this register.
    #[must_use]
    pub fn to_access_response(&self) -> Value {
        json!({
            "timestamp": {"microsecond": 0},
            "mutable": self.mutable,
            "persistent": self.persistent,
            "value": self.value.to_builtin(),
        })
    }
}

/// Guesses the type of a register known only from environment text.
fn infer_from_env(name: &str, text: &str) -> RegisterValue {
    if name == NODE_ID || name.ends_with(".id") {
        if let Ok(ids) = text.split_whitespace().map(str::parse::<u16>).collect::<Result<Vec<_>, _>>() {
            if !ids.is_empty() {
                return RegisterValue::natural16(&ids);
            }
        }
    }
    RegisterValue::string(text)
}

/// Registers ordered by name.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    entries: BTreeMap<String, Register>,
}

impl Registry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard node registers followed by every `UAVCAN__*` variable in `vars`.
    #[must_use]
    pub fn for_node<I>(node_id: Option<NodeId>, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut reg = Self::new();
        let id = node_id.map_or(u16::MAX, NodeId::get);
        reg.insert(NODE_ID, Register::mutable(RegisterValue::natural16(&[id])));
        reg.insert(NODE_DESCRIPTION, Register::mutable(RegisterValue::string("")));
        reg.apply_environment(vars);
        reg
    }

    /// Overrides or adds registers from `UAVCAN__*` variables. Existing
    /// registers keep their type when the text converts.
    pub fn apply_environment<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (name, text) in registers_from_env(vars) {
            let value = match self.entries.get(&name) {
                Some(existing) => existing.value.assign_from_str(&text).unwrap_or_else(|e| {
                    tracing::warn!(register = %name, error = %e, "environment value does not fit, stored as string");
                    RegisterValue::string(text.clone())
                }),
                None => infer_from_env(&name, &text),
            };
            tracing::debug!(register = %name, value = %value, "register from environment");
            let entry = self
                .entries
                .entry(name)
                .or_insert_with(|| Register::mutable(RegisterValue::Empty));
            entry.value = value;
        }
    }

    /// Adds or replaces a register.
    pub fn insert(&mut self, name: &str, register: Register) {
        let _ = self.entries.insert(name.to_owned(), register);
    }

    /// Looks up a register.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Register> {
        self.entries.get(name)
    }

    /// Number of registers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no registers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Name at `index` in the ordered listing.
    #[must_use]
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names().nth(index)
    }

    /// Reads a register, writing `value` first when the register is mutable.
    /// A value of another type is converted; failed conversions leave the
    /// register unchanged. Nonexistent registers read as empty.
    pub fn access(&mut self, name: &str, value: Option<&RegisterValue>) -> Register {
        let Some(entry) = self.entries.get_mut(name) else {
            return Register::immutable(RegisterValue::Empty);
        };
        if let Some(new) = value.filter(|v| !v.is_empty()) {
            if !entry.mutable {
                tracing::debug!(register = name, "write to immutable register ignored");
            } else if new.type_name() == entry.value.type_name() {
                entry.value = new.clone();
            } else {
                match entry.value.coerce_builtin(&new.to_simplified()) {
                    Ok(converted) => entry.value = converted,
                    Err(e) => tracing::warn!(register = name, error = %e, "register write ignored"),
                }
            }
        }
        entry.clone()
    }

    /// Register values as environment text, as consumed by transport configuration.
    #[must_use]
    pub fn to_env_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter(|(_, r)| !r.value.is_empty())
            .map(|(k, r)| (k.clone(), r.value.to_env_string()))
            .collect()
    }

    /// Serves a decoded `uavcan.register.Access` request.
    #[must_use]
    pub fn handle_access(&mut self, request: &Value) -> Value {
        let name = request_name(request.get("name"));
        let value = request
            .get("value")
            .map(RegisterValue::from_builtin)
            .transpose()
            .unwrap_or_else(|e| {
                tracing::warn!(register = %name, error = %e, "malformed register value in request");
                None
            });
        self.access(&name, value.as_ref()).to_access_response()
    }

    /// Serves a decoded `uavcan.register.List` request.
    #[must_use]
    pub fn handle_list(&self, request: &Value) -> Value {
        let index = request
            .get("index")
            .and_then(Value::as_u64)
            .and_then(|i| usize::try_from(i).ok())
            .unwrap_or(usize::MAX);
        json!({"name": {"name": self.name_at(index).unwrap_or("")}})
    }
}

/// Extracts the text of a `uavcan.register.Name` builtin value.
pub(crate) fn request_name(name: Option<&Value>) -> String {
    let inner = name.and_then(|n| n.get("name")).or(name);
    match inner {
        Some(Value::String(s)) => s.clone(),
        Some(other) => crate::info::bytes_from_builtin(other)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[test]
    fn node_registers_are_always_present() {
        let reg = Registry::for_node(Some(NodeId::new(42)), Vec::new());
        assert_eq!(reg.get(NODE_ID).expect("id").value, RegisterValue::natural16(&[42]));
        assert!(reg.get(NODE_DESCRIPTION).is_some());
        let anon = Registry::for_node(None, Vec::new());
        assert_eq!(anon.get(NODE_ID).expect("id").value.as_integer(), Some(65535));
    }

    #[test]
    fn environment_variables_become_registers() {
        let reg = Registry::for_node(
            None,
            env(&[
                ("UAVCAN__NODE__ID", "7"),
                ("UAVCAN__PUB__MEASUREMENT__ID", "1000"),
                ("UAVCAN__PUB__MEASUREMENT__TYPE", "uavcan.si.unit.angle.Scalar.1.0"),
                ("HOME", "/root"),
            ]),
        );
        assert_eq!(reg.get(NODE_ID).expect("id").value.as_integer(), Some(7));
        assert_eq!(reg.get("uavcan.pub.measurement.id").expect("id").value, RegisterValue::natural16(&[1000]));
        assert_eq!(
            reg.get("uavcan.pub.measurement.type").expect("type").value.as_text(),
            Some("uavcan.si.unit.angle.Scalar.1.0")
        );
        assert_eq!(reg.len(), 4);
    }

    #[test]
    fn access_writes_only_mutable_registers() {
        let mut reg = Registry::new();
        reg.insert("a", Register::mutable(RegisterValue::natural16(&[1])));
        reg.insert("b", Register::immutable(RegisterValue::natural16(&[1])));
        let new = RegisterValue::natural16(&[5]);
        assert_eq!(reg.access("a", Some(&new)).value, new);
        assert_eq!(reg.access("b", Some(&new)).value, RegisterValue::natural16(&[1]));
        assert!(reg.access("missing", Some(&new)).value.is_empty());
    }

    #[test]
    fn access_converts_between_types() {
        let mut reg = Registry::new();
        reg.insert("x", Register::mutable(RegisterValue::Real { bits: 32, values: vec![0.0] }));
        let out = reg.access("x", Some(&RegisterValue::natural16(&[3])));
        assert_eq!(out.value, RegisterValue::Real { bits: 32, values: vec![3.0] });
        let out = reg.access("x", Some(&RegisterValue::string("oops")));
        assert_eq!(out.value, RegisterValue::Real { bits: 32, values: vec![3.0] });
    }

    #[test]
    fn list_handler_walks_names_in_order() {
        let reg = Registry::for_node(Some(NodeId::new(1)), Vec::new());
        assert_eq!(reg.handle_list(&json!({"index": 0})), json!({"name": {"name": NODE_DESCRIPTION}}));
        assert_eq!(reg.handle_list(&json!({"index": 1})), json!({"name": {"name": NODE_ID}}));
        assert_eq!(reg.handle_list(&json!({"index": 2})), json!({"name": {"name": ""}}));
    }

    #[test]
    fn access_handler_reads_and_writes() {
        let mut reg = Registry::for_node(Some(NodeId::new(1)), Vec::new());
        let response = reg.handle_access(&json!({
            "name": {"name": NODE_DESCRIPTION},
            "value": {"string": {"value": "bench"}},
        }));
        assert_eq!(response["value"], json!({"string": {"value": "bench"}}));
        assert_eq!(response["mutable"], json!(true));
        let response = reg.handle_access(&json!({"name": {"name": "nope"}, "value": {"empty": {}}}));
        assert_eq!(response["value"], json!({"empty": {}}));
    }

    #[test]
    fn env_map_feeds_transport_configuration() {
        let reg = Registry::for_node(Some(NodeId::new(12)), env(&[("UAVCAN__LOOPBACK", "1")]));
        let map = reg.to_env_map();
        assert_eq!(map.get(NODE_ID).map(String::as_str), Some("12"));
        assert_eq!(map.get("uavcan.loopback").map(String::as_str), Some("1"));
    }
}

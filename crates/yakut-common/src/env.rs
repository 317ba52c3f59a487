//! Mapping between register names and environment variables.
//!
//! A register `m.motor.inductance_dq` is passed to processes as the variable
//! `M__MOTOR__INDUCTANCE_DQ`. Values are encoded as text: strings verbatim,
//! numbers in decimal, booleans as `1`/`0`, array elements space-separated.

use serde_json::{Map, Value};
use thiserror::Error;

/// Separator of register name components.
pub const NAME_SEP: char = '.';

/// Replacement of [`NAME_SEP`] in environment variable names.
pub const ENV_NAME_SEP: &str = "__";

/// Separator of array elements in encoded values.
pub const ITEM_SEP: &str = " ";

/// A value cannot be represented as an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot encode register value of type {kind}")]
pub struct EnvValueError {
    /// JSON type name of the rejected value.
    pub kind: &'static str,
}

/// Converts a register name into its environment variable name.
#[must_use]
pub fn register_name_to_env(name: &str) -> String {
    name.to_uppercase().replace(NAME_SEP, ENV_NAME_SEP)
}

/// Converts an environment variable name back into a register name.
///
/// Returns `None` for variables that do not follow the register convention.
#[must_use]
pub fn env_to_register_name(var: &str) -> Option<String> {
    if !var.contains(ENV_NAME_SEP) || var.starts_with(ENV_NAME_SEP) || var.ends_with(ENV_NAME_SEP) {
        return None;
    }
    Some(var.to_lowercase().replace(ENV_NAME_SEP, &NAME_SEP.to_string()))
}

/// Whether a configuration key names a register rather than a plain variable.
#[must_use]
pub fn is_register_name(key: &str) -> bool {
    key.contains(NAME_SEP)
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Renders a float the way register text values expect: the shortest
/// round-trip digits, integral values keep a `.0`, and magnitudes below
/// `1e-4` or from `1e16` up use an exponent of at least two digits.
#[must_use]
pub fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_owned();
    }
    if x.is_infinite() || x == 0.0 || (1e-4..1e16).contains(&x.abs()) {
        return if x.is_finite() && x.fract() == 0.0 { format!("{x:.1}") } else { format!("{x}") };
    }
    let text = format!("{x:e}");
    let (mantissa, exponent) = text.split_once('e').unwrap_or((text.as_str(), "0"));
    let (sign, digits) = exponent.strip_prefix('-').map_or(("+", exponent), |d| ("-", d));
    format!("{mantissa}e{sign}{digits:0>2}")
}

/// Encodes a register value as environment variable text.
///
/// # Errors
///
/// Returns [`EnvValueError`] for nulls and mappings.
pub fn encode_env_value(value: &Value) -> Result<String, EnvValueError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(if *b { "1" } else { "0" }.to_owned()),
        Value::Number(n) => Ok(if let Some(i) = n.as_i64() {
            i.to_string()
        } else if let Some(u) = n.as_u64() {
            u.to_string()
        } else {
            format_float(n.as_f64().unwrap_or(f64::NAN))
        }),
        Value::Array(items) => {
            let parts = items.iter().map(encode_env_value).collect::<Result<Vec<_>, _>>()?;
            Ok(parts.join(ITEM_SEP))
        }
        Value::Null | Value::Object(_) => Err(EnvValueError { kind: kind_of(value) }),
    }
}

/// Flattens nested mappings into dotted register names, keeping insertion order.
#[must_use]
pub fn flatten_registers(spec: &Map<String, Value>) -> Map<String, Value> {
    fn walk(spec: &Map<String, Value>, prefix: &str, out: &mut Map<String, Value>) {
        for (key, value) in spec {
            let name = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}{NAME_SEP}{key}")
            };
            match value {
                Value::Object(inner) => walk(inner, &name, out),
                other => {
                    let _ = out.insert(name, other.clone());
                }
            }
        }
    }
    let mut out = Map::new();
    walk(spec, "", &mut out);
    out
}

/// Collects all `UAVCAN__*`-style register variables from an environment snapshot.
pub fn registers_from_env<I>(vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut out: Vec<_> = vars
        .into_iter()
        .filter_map(|(k, v)| env_to_register_name(&k).map(|name| (name, v)))
        .collect();
    out.sort();
    out
}

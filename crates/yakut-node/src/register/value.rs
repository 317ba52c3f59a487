//! The typed register value, mirroring `uavcan.register.Value.1.0`.
//!
//! Numeric arrays are stored widened (`i64`, `u64`, `f64`) together with the
//! bit width of the wire type, which keeps the fifteen union variants to a
//! handful of Rust variants while preserving the exact type on the wire.

use std::fmt;

use serde_json::{Map, Value, json};
use yakut_common::env::{ITEM_SEP, encode_env_value};

use crate::error::{NodeError, Result};
use crate::info::bytes_from_builtin;

/// Bytes available to array payloads of the register value union.
const ARRAY_CAPACITY_BITS: usize = 2048;

/// Maximum length of string and unstructured values.
pub const BYTES_CAPACITY: usize = 256;

const INT_WIDTHS: [u8; 4] = [8, 16, 32, 64];
const REAL_WIDTHS: [u8; 3] = [16, 32, 64];

/// A register value.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RegisterValue {
    /// No value; returned for nonexistent registers.
    #[default]
    Empty,
    /// UTF-8 text.
    String(String),
    /// Opaque bytes.
    Unstructured(Vec<u8>),
    /// Boolean array.
    Bit(Vec<bool>),
    /// Signed integer array of the given bit width.
    Integer {
        /// 8, 16, 32 or 64.
        bits: u8,
        /// Elements.
        values: Vec<i64>,
    },
    /// Unsigned integer array of the given bit width.
    Natural {
        /// 8, 16, 32 or 64.
        bits: u8,
        /// Elements.
        values: Vec<u64>,
    },
    /// Floating point array of the given bit width.
    Real {
        /// 16, 32 or 64.
        bits: u8,
        /// Elements.
        values: Vec<f64>,
    },
}

fn conversion(message: impl Into<String>) -> NodeError {
    NodeError::conversion(message)
}

fn int_range(bits: u8) -> (i64, i64) {
    if bits >= 64 {
        (i64::MIN, i64::MAX)
    } else {
        let half = 1_i64 << (bits - 1);
        (-half, half - 1)
    }
}

fn nat_max(bits: u8) -> u64 {
    if bits >= 64 { u64::MAX } else { (1_u64 << bits) - 1 }
}

fn parse_bool(token: &str) -> Option<bool> {
    match token.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        other => other.parse::<f64>().ok().map(|x| x != 0.0),
    }
}

fn parse_integral(token: &str) -> Option<i128> {
    token.parse::<i128>().ok().or_else(|| {
        token
            .parse::<f64>()
            .ok()
            .filter(|x| x.is_finite())
            .map(|x| {
                #[allow(clippy::cast_possible_truncation)]
                let n = x.round() as i128;
                n
            })
    })
}

impl RegisterValue {
    /// A `natural16` value, the usual type of port-ID registers.
    #[must_use]
    pub fn natural16(values: &[u16]) -> Self {
        Self::Natural {
            bits: 16,
            values: values.iter().map(|&v| u64::from(v)).collect(),
        }
    }

    /// A string value.
    #[must_use]
    pub fn string(text: impl Into<String>) -> Self {
        Self::String(text.into())
    }

    /// Whether this is the empty value.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Name of the union variant: `empty`, `string`, `natural16` and so on.
    #[must_use]
    pub fn type_name(&self) -> String {
        match self {
            Self::Empty => "empty".to_owned(),
            Self::String(_) => "string".to_owned(),
            Self::Unstructured(_) => "unstructured".to_owned(),
            Self::Bit(_) => "bit".to_owned(),
            Self::Integer { bits, .. } => format!("integer{bits}"),
            Self::Natural { bits, .. } => format!("natural{bits}"),
            Self::Real { bits, .. } => format!("real{bits}"),
        }
    }

    /// Number of elements; strings and byte blobs count bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::String(s) => s.len(),
            Self::Unstructured(b) => b.len(),
            Self::Bit(v) => v.len(),
            Self::Integer { values, .. } => values.len(),
            Self::Natural { values, .. } => values.len(),
            Self::Real { values, .. } => values.len(),
        }
    }

    fn capacity(&self) -> usize {
        match self {
            Self::Empty => 0,
            Self::String(_) | Self::Unstructured(_) => BYTES_CAPACITY,
            Self::Bit(_) => ARRAY_CAPACITY_BITS,
            Self::Integer { bits, .. } | Self::Natural { bits, .. } | Self::Real { bits, .. } => {
                ARRAY_CAPACITY_BITS / usize::from(*bits)
            }
        }
    }

    fn check(self) -> Result<Self> {
        if self.len() > self.capacity() {
            return Err(conversion(format!(
                "{} elements exceed the capacity {} of {}",
                self.len(),
                self.capacity(),
                self.type_name()
            )));
        }
        match &self {
            Self::Integer { bits, values } => {
                let (lo, hi) = int_range(*bits);
                if let Some(bad) = values.iter().find(|v| **v < lo || **v > hi) {
                    return Err(conversion(format!("{bad} does not fit integer{bits}")));
                }
            }
            Self::Natural { bits, values } => {
                if let Some(bad) = values.iter().find(|v| **v > nat_max(*bits)) {
                    return Err(conversion(format!("{bad} does not fit natural{bits}")));
                }
            }
            _ => {}
        }
        Ok(self)
    }

    /// The builtin form, a single-key mapping such as `{"natural16": {"value": [1]}}`.
    #[must_use]
    pub fn to_builtin(&self) -> Value {
        let inner = match self {
            Self::Empty => json!({}),
            Self::String(s) => json!({ "value": s }),
            Self::Unstructured(b) => json!({ "value": b }),
            Self::Bit(v) => json!({ "value": v }),
            Self::Integer { values, .. } => json!({ "value": values }),
            Self::Natural { values, .. } => json!({ "value": values }),
            Self::Real { values, .. } => json!({ "value": values }),
        };
        let mut out = Map::new();
        let _ = out.insert(self.type_name(), inner);
        Value::Object(out)
    }

    /// Parses the builtin form produced by the codec or by [`Self::to_builtin`].
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Conversion`] for unknown variants or ill-typed elements.
    pub fn from_builtin(value: &Value) -> Result<Self> {
        let Value::Object(obj) = value else {
            return Err(conversion(format!("expected a single-key mapping, got {value}")));
        };
        let mut entries = obj.iter();
        let (key, inner) = match (entries.next(), entries.next()) {
            (None, _) => return Ok(Self::Empty),
            (Some(kv), None) => kv,
            _ => return Err(conversion("a register value mapping must have exactly one key")),
        };
        let payload = inner.get("value").unwrap_or(inner);
        let items = || -> Result<Vec<Value>> {
            match payload {
                Value::Array(items) => Ok(items.clone()),
                Value::Null => Ok(Vec::new()),
                Value::Object(_) => Err(conversion(format!("{key}: expected a list, got a mapping"))),
                scalar => Ok(vec![scalar.clone()]),
            }
        };
        let parsed = match key.as_str() {
            "empty" => Self::Empty,
            "string" => match payload {
                Value::String(s) => Self::String(s.clone()),
                other => {
                    let bytes = bytes_from_builtin(other).ok_or_else(|| conversion("string: expected text"))?;
                    Self::String(String::from_utf8_lossy(&bytes).into_owned())
                }
            },
            "unstructured" => Self::Unstructured(
                bytes_from_builtin(payload).ok_or_else(|| conversion("unstructured: expected bytes"))?,
            ),
            "bit" => Self::Bit(
                items()?
                    .iter()
                    .map(|v| v.as_bool().or_else(|| v.as_f64().map(|x| x != 0.0)))
                    .collect::<Option<_>>()
                    .ok_or_else(|| conversion("bit: expected booleans"))?,
            ),
            other => {
                let (prefix, bits) = other
                    .char_indices()
                    .find(|(_, c)| c.is_ascii_digit())
                    .map(|(i, _)| other.split_at(i))
                    .ok_or_else(|| conversion(format!("unknown register value type {other:?}")))?;
                let bits: u8 = bits
                    .parse()
                    .map_err(|_| conversion(format!("unknown register value type {other:?}")))?;
                match prefix {
                    "integer" if INT_WIDTHS.contains(&bits) => Self::Integer {
                        bits,
                        values: items()?
                            .iter()
                            .map(Value::as_i64)
                            .collect::<Option<_>>()
                            .ok_or_else(|| conversion(format!("{other}: expected integers")))?,
                    },
                    "natural" if INT_WIDTHS.contains(&bits) => Self::Natural {
                        bits,
                        values: if let Value::String(s) = payload {
                            s.bytes().map(u64::from).collect()
                        } else {
                            items()?
                                .iter()
                                .map(Value::as_u64)
                                .collect::<Option<_>>()
                                .ok_or_else(|| conversion(format!("{other}: expected natural numbers")))?
                        },
                    },
                    "real" if REAL_WIDTHS.contains(&bits) => Self::Real {
                        bits,
                        values: items()?
                            .iter()
                            .map(|v| if v.is_null() { Some(f64::NAN) } else { v.as_f64() })
                            .collect::<Option<_>>()
                            .ok_or_else(|| conversion(format!("{other}: expected numbers")))?,
                    },
                    _ => return Err(conversion(format!("unknown register value type {other:?}"))),
                }
            }
        };
        parsed.check()
    }

    /// The simplified builtin form: `null` for empty, plain text for strings,
    /// text or a byte list for unstructured values, a scalar for one-element
    /// arrays and a list otherwise.
    #[must_use]
    pub fn to_simplified(&self) -> Value {
        fn unwrap_single(mut items: Vec<Value>) -> Value {
            if items.len() == 1 {
                items.pop().unwrap_or(Value::Null)
            } else {
                Value::Array(items)
            }
        }
        match self {
            Self::Empty => Value::Null,
            Self::String(s) => Value::String(s.clone()),
            Self::Unstructured(b) => std::str::from_utf8(b)
                .map_or_else(|_| json!(b), |s| Value::String(s.to_owned())),
            Self::Bit(v) => unwrap_single(v.iter().map(|&b| Value::Bool(b)).collect()),
            Self::Integer { values, .. } => unwrap_single(values.iter().map(|&v| json!(v)).collect()),
            Self::Natural { values, .. } => unwrap_single(values.iter().map(|&v| json!(v)).collect()),
            Self::Real { values, .. } => unwrap_single(values.iter().map(|&v| json!(v)).collect()),
        }
    }

    /// Converts user or environment text into a value of the same type as `self`.
    /// Numbers are separated by whitespace or commas; booleans accept `true`,
    /// `false` and numbers; strings are taken verbatim.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Conversion`] if the text does not fit the type.
    pub fn assign_from_str(&self, text: &str) -> Result<Self> {
        let tokens: Vec<&str> = text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();
        let need_tokens = || {
            if tokens.is_empty() {
                Err(conversion(format!("no values given for {}", self.type_name())))
            } else {
                Ok(())
            }
        };
        let bad = |token: &str| conversion(format!("{token:?} is not a valid {} element", self.type_name()));
        let out = match self {
            Self::Empty => return Err(conversion("cannot assign a value to an empty register")),
            Self::String(_) => Self::String(text.to_owned()),
            Self::Unstructured(_) => Self::Unstructured(text.as_bytes().to_vec()),
            Self::Bit(_) => {
                need_tokens()?;
                Self::Bit(
                    tokens
                        .iter()
                        .map(|t| parse_bool(t).ok_or_else(|| bad(t)))
                        .collect::<Result<_>>()?,
                )
            }
            Self::Integer { bits, .. } => {
                need_tokens()?;
                let (lo, hi) = int_range(*bits);
                Self::Integer {
                    bits: *bits,
                    values: tokens
                        .iter()
                        .map(|t| {
                            parse_integral(t)
                                .filter(|n| *n >= i128::from(lo) && *n <= i128::from(hi))
                                .and_then(|n| i64::try_from(n).ok())
                                .ok_or_else(|| bad(t))
                        })
                        .collect::<Result<_>>()?,
                }
            }
            Self::Natural { bits, .. } => {
                need_tokens()?;
                let max = nat_max(*bits);
                Self::Natural {
                    bits: *bits,
                    values: tokens
                        .iter()
                        .map(|t| {
                            parse_integral(t)
                                .and_then(|n| u64::try_from(n).ok())
                                .filter(|n| *n <= max)
                                .ok_or_else(|| bad(t))
                        })
                        .collect::<Result<_>>()?,
                }
            }
            Self::Real { bits, .. } => {
                need_tokens()?;
                Self::Real {
                    bits: *bits,
                    values: tokens
                        .iter()
                        .map(|t| t.parse::<f64>().map_err(|_| bad(t)))
                        .collect::<Result<_>>()?,
                }
            }
        };
        out.check()
    }

    /// Converts a builtin value into the type of `self`. Typed single-key
    /// mappings are taken as is; anything else is coerced through its text form.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::Conversion`] when coercion fails.
    pub fn coerce_builtin(&self, value: &Value) -> Result<Self> {
        if let Value::Object(_) = value {
            return Self::from_builtin(value);
        }
        match (self, value) {
            (Self::String(_) | Self::Unstructured(_), Value::String(s)) => self.assign_from_str(s),
            (Self::Unstructured(_), other) => bytes_from_builtin(other)
                .map(Self::Unstructured)
                .ok_or_else(|| conversion(format!("cannot convert {other} to bytes"))),
            _ => {
                let text = encode_env_value(value).map_err(|e| conversion(e.to_string()))?;
                self.assign_from_str(&text)
            }
        }
    }

    /// The value as one integer, if it is a single numeric element.
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Bit(v) if v.len() == 1 => Some(i64::from(v[0])),
            Self::Integer { values, .. } if values.len() == 1 => Some(values[0]),
            Self::Natural { values, .. } if values.len() == 1 => i64::try_from(values[0]).ok(),
            #[allow(clippy::cast_possible_truncation)]
            Self::Real { values, .. } if values.len() == 1 && values[0].fract() == 0.0 => Some(values[0] as i64),
            _ => None,
        }
    }

    /// The text, if this is a string value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The value as environment variable text.
    #[must_use]
    pub fn to_env_string(&self) -> String {
        match self {
            Self::Empty => String::new(),
            Self::String(s) => s.clone(),
            Self::Unstructured(b) => String::from_utf8_lossy(b).into_owned(),
            other => encode_env_value(&other.to_simplified()).unwrap_or_default(),
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("<empty>"),
            Self::String(s) => write!(f, "{s:?}"),
            other => write!(f, "{}: {}", other.type_name(), other.to_env_string().replace(ITEM_SEP, ", ")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_form_is_a_single_key_union() {
        let v = RegisterValue::natural16(&[1, 2]);
        assert_eq!(v.to_builtin(), json!({"natural16": {"value": [1, 2]}}));
        assert_eq!(RegisterValue::from_builtin(&v.to_builtin()).expect("parse"), v);
        assert_eq!(RegisterValue::from_builtin(&json!({})).expect("empty"), RegisterValue::Empty);
    }

    #[test]
    fn natural8_accepts_codec_text_form() {
        let v = RegisterValue::from_builtin(&json!({"natural8": {"value": "AB"}})).expect("parse");
        assert_eq!(v, RegisterValue::Natural { bits: 8, values: vec![65, 66] });
    }

    #[test]
    fn register_value_survives_the_codec() {
        let value_type = yakut_dsdl::Catalog::standard()
            .require("uavcan.register.Value", 1, 0)
            .expect("type");
        let schema = value_type.message_schema().expect("message");
        for v in [
            RegisterValue::string("hello"),
            RegisterValue::Bit(vec![true, false]),
            RegisterValue::Integer { bits: 32, values: vec![-5, 7] },
            RegisterValue::Real { bits: 64, values: vec![1.5] },
            RegisterValue::Empty,
        ] {
            let bytes = yakut_dsdl::serialize(schema, &v.to_builtin()).expect("serialize");
            let back = yakut_dsdl::deserialize(schema, &bytes).expect("deserialize");
            assert_eq!(RegisterValue::from_builtin(&back).expect("parse"), v);
        }
    }

    #[test]
    fn simplified_form_unwraps_single_elements() {
        assert_eq!(RegisterValue::Empty.to_simplified(), Value::Null);
        assert_eq!(RegisterValue::natural16(&[42]).to_simplified(), json!(42));
        assert_eq!(RegisterValue::natural16(&[1, 2]).to_simplified(), json!([1, 2]));
        assert_eq!(RegisterValue::string("x").to_simplified(), json!("x"));
        assert_eq!(RegisterValue::Unstructured(vec![0xff]).to_simplified(), json!([255]));
    }

    #[test]
    fn assignment_keeps_the_type() {
        let v = RegisterValue::natural16(&[0]);
        assert_eq!(v.assign_from_str("1, 2 3").expect("assign"), RegisterValue::natural16(&[1, 2, 3]));
        assert!(v.assign_from_str("70000").is_err());
        assert!(v.assign_from_str("-1").is_err());
        assert!(v.assign_from_str("").is_err());
        let b = RegisterValue::Bit(vec![false]);
        assert_eq!(b.assign_from_str("true 0 2").expect("assign"), RegisterValue::Bit(vec![true, false, true]));
        let s = RegisterValue::string("");
        assert_eq!(s.assign_from_str("a b").expect("assign"), RegisterValue::string("a b"));
        assert!(RegisterValue::Empty.assign_from_str("1").is_err());
    }

    #[test]
    fn integers_accept_integral_floats() {
        let v = RegisterValue::Integer { bits: 8, values: vec![0] };
        assert_eq!(
            v.assign_from_str("-128 127.0").expect("assign"),
            RegisterValue::Integer { bits: 8, values: vec![-128, 127] }
        );
        assert!(v.assign_from_str("128").is_err());
    }

    #[test]
    fn capacity_is_enforced() {
        let v = RegisterValue::Natural { bits: 64, values: vec![0] };
        let text = vec!["1"; 33].join(" ");
        assert!(v.assign_from_str(&text).is_err());
    }

    #[test]
    fn coercion_goes_through_text() {
        let v = RegisterValue::Real { bits: 32, values: vec![0.0] };
        assert_eq!(
            v.coerce_builtin(&json!([1, 2.5])).expect("coerce"),
            RegisterValue::Real { bits: 32, values: vec![1.0, 2.5] }
        );
        assert_eq!(
            v.coerce_builtin(&json!({"natural8": {"value": [3]}})).expect("typed"),
            RegisterValue::Natural { bits: 8, values: vec![3] }
        );
        assert!(v.coerce_builtin(&Value::Null).is_err());
    }

    #[test]
    fn scalar_views() {
        assert_eq!(RegisterValue::natural16(&[125]).as_integer(), Some(125));
        assert_eq!(RegisterValue::natural16(&[1, 2]).as_integer(), None);
        assert_eq!(RegisterValue::string("ns.A.1.0").as_text(), Some("ns.A.1.0"));
        assert_eq!(RegisterValue::natural16(&[1]).as_text(), None);
        assert_eq!(RegisterValue::Real { bits: 64, values: vec![2.0] }.to_env_string(), "2.0");
    }
}

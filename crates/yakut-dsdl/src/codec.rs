//! Conversion between serialized payloads and builtin values.
//!
//! The builtin form is plain JSON: composites are objects keyed by field name,
//! unions are objects with exactly one key, arrays are lists and variable-length
//! `uint8` arrays become strings when they hold valid UTF-8. Encoding applies the
//! given object on top of the default (all-zero) value of the type.

use serde_json::{Map, Number, Value};

use crate::bits::{BitReader, BitWriter};
use crate::error::{DsdlError, Result};
use crate::schema::{Composite, FieldType, Primitive};

/// Serializes a builtin value of `schema` into a transfer payload.
///
/// # Errors
///
/// Returns [`DsdlError::Value`] when the value does not fit the schema.
pub fn serialize(schema: &Composite, value: &Value) -> Result<Vec<u8>> {
    let mut w = BitWriter::new();
    encode_composite(schema, value, &mut w, "")?;
    Ok(w.into_bytes())
}

/// Deserializes a transfer payload into the builtin form.
///
/// # Errors
///
/// Returns [`DsdlError::Deserialize`] for invalid union tags, array lengths
/// beyond capacity, or delimiter headers pointing past the payload.
pub fn deserialize(schema: &Composite, payload: &[u8]) -> Result<Value> {
    let mut r = BitReader::new(payload);
    decode_composite(schema, &mut r)
}

/// The default value of `schema` in the builtin form.
#[must_use]
pub fn default_value(schema: &Composite) -> Value {
    deserialize(schema, &[]).unwrap_or(Value::Null)
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_owned()
    } else {
        format!("{path}.{name}")
    }
}

fn encode_composite(schema: &Composite, value: &Value, w: &mut BitWriter, path: &str) -> Result<()> {
    let wrapped;
    let obj = match value {
        Value::Object(obj) => obj,
        Value::Null => {
            wrapped = Map::new();
            &wrapped
        }
        scalar => {
            let mut fields = schema.data_fields();
            match (fields.next(), fields.next(), schema.is_union()) {
                (Some(only), None, false) => {
                    let mut m = Map::new();
                    let _ = m.insert(only.name.clone(), scalar.clone());
                    wrapped = m;
                    &wrapped
                }
                _ => {
                    return Err(DsdlError::value(
                        path,
                        format!("expected a mapping for {schema}, got {scalar}"),
                    ));
                }
            }
        }
    };

    for key in obj.keys() {
        if !schema.data_fields().any(|f| &f.name == key) {
            return Err(DsdlError::value(
                &join(path, key),
                format!("{schema} has no field named {key:?}"),
            ));
        }
    }

    if schema.is_union() {
        if obj.len() > 1 {
            return Err(DsdlError::value(
                path,
                format!("union {schema} requires exactly one field, got {}", obj.len()),
            ));
        }
        let (tag, field) = match obj.keys().next() {
            Some(key) => schema
                .data_fields()
                .enumerate()
                .find(|(_, f)| &f.name == key)
                .ok_or_else(|| DsdlError::value(path, "unknown union variant"))?,
            None => schema
                .data_fields()
                .enumerate()
                .next()
                .ok_or_else(|| DsdlError::value(path, format!("union {schema} has no variants")))?,
        };
        w.write_uint(tag as u64, schema.tag_bits());
        encode_field(&field.ty, obj.get(&field.name), w, &join(path, &field.name))?;
    } else {
        for field in schema.fields() {
            if let FieldType::Primitive(Primitive::Void(bits)) = field.ty {
                w.skip(usize::from(bits));
                continue;
            }
            encode_field(&field.ty, obj.get(&field.name), w, &join(path, &field.name))?;
        }
    }
    w.align();
    Ok(())
}

fn as_unsigned(value: &Value) -> Option<u64> {
    match value {
        Value::Bool(b) => Some(u64::from(*b)),
        Value::Number(n) => n.as_u64().or_else(|| {
            let x = n.as_f64()?;
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            (x.fract() == 0.0 && x >= 0.0 && x <= u64::MAX as f64).then_some(x as u64)
        }),
        _ => None,
    }
}

fn as_signed(value: &Value) -> Option<i64> {
    match value {
        Value::Bool(b) => Some(i64::from(*b)),
        Value::Number(n) => n.as_i64().or_else(|| {
            let x = n.as_f64()?;
            #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
            (x.fract() == 0.0 && x >= i64::MIN as f64 && x <= i64::MAX as f64).then_some(x as i64)
        }),
        _ => None,
    }
}

fn encode_primitive(p: Primitive, value: Option<&Value>, w: &mut BitWriter, path: &str) -> Result<()> {
    let bad = |v: &Value, what: &str| DsdlError::value(path, format!("{v} is not a valid {what}"));
    match p {
        Primitive::Bool => {
            let b = match value {
                None => false,
                Some(Value::Bool(b)) => *b,
                Some(v @ Value::Number(n)) => n.as_f64().map(|x| x != 0.0).ok_or_else(|| bad(v, "bool"))?,
                Some(v) => return Err(bad(v, "bool")),
            };
            w.write_bool(b);
        }
        Primitive::Uint(bits) => {
            let x = match value {
                None => 0,
                Some(v) => as_unsigned(v).ok_or_else(|| bad(v, &format!("uint{bits}")))?,
            };
            if bits < 64 && x >> bits != 0 {
                return Err(DsdlError::value(path, format!("{x} does not fit into uint{bits}")));
            }
            w.write_uint(x, bits);
        }
        Primitive::Int(bits) => {
            let x = match value {
                None => 0,
                Some(v) => as_signed(v).ok_or_else(|| bad(v, &format!("int{bits}")))?,
            };
            if bits < 64 {
                let limit = 1_i64 << (bits - 1);
                if x < -limit || x >= limit {
                    return Err(DsdlError::value(path, format!("{x} does not fit into int{bits}")));
                }
            }
            w.write_int(x, bits);
        }
        Primitive::Float(bits) => {
            let x = match value {
                None => 0.0,
                Some(Value::Bool(b)) => f64::from(u8::from(*b)),
                Some(v @ Value::Number(n)) => n.as_f64().ok_or_else(|| bad(v, "float"))?,
                Some(v) => return Err(bad(v, &format!("float{bits}"))),
            };
            w.write_float(x, bits);
        }
        Primitive::Void(bits) => w.skip(usize::from(bits)),
    }
    Ok(())
}

fn encode_field(ty: &FieldType, value: Option<&Value>, w: &mut BitWriter, path: &str) -> Result<()> {
    match ty {
        FieldType::Primitive(p) => encode_primitive(*p, value, w, path),
        FieldType::FixedArray { element, length } => {
            let items = array_items(ty, value, path)?;
            let absent = matches!(value, None | Some(Value::Null));
            if !absent && items.len() != *length {
                return Err(DsdlError::value(
                    path,
                    format!("expected {length} elements, got {}", items.len()),
                ));
            }
            for i in 0..*length {
                encode_field(element, items.get(i), w, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        FieldType::VariableArray { element, capacity } => {
            let items = array_items(ty, value, path)?;
            if items.len() > *capacity {
                return Err(DsdlError::value(
                    path,
                    format!("{} elements exceed the capacity of {capacity}", items.len()),
                ));
            }
            w.write_uint(items.len() as u64, FieldType::length_prefix_bits(*capacity));
            for (i, item) in items.iter().enumerate() {
                encode_field(element, Some(item), w, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        FieldType::Composite(inner) => {
            w.align();
            let value = value.unwrap_or(&Value::Null);
            if inner.is_sealed() {
                encode_composite(inner, value, w, path)
            } else {
                let mut nested = BitWriter::new();
                encode_composite(inner, value, &mut nested, path)?;
                let bytes = nested.into_bytes();
                w.write_uint(bytes.len() as u64, 32);
                w.write_bytes(&bytes);
                Ok(())
            }
        }
    }
}

/// Normalizes an array value; strings are accepted for byte arrays.
fn array_items(ty: &FieldType, value: Option<&Value>, path: &str) -> Result<Vec<Value>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(Value::String(s)) if ty.is_byte_array() => {
            Ok(s.as_bytes().iter().map(|b| Value::from(*b)).collect())
        }
        Some(other) => Err(DsdlError::value(path, format!("expected a list, got {other}"))),
    }
}

fn decode_error(schema: &Composite, message: impl Into<String>) -> DsdlError {
    DsdlError::Deserialize {
        type_name: schema.to_string(),
        message: message.into(),
    }
}

fn decode_composite(schema: &Composite, r: &mut BitReader<'_>) -> Result<Value> {
    let mut out = Map::new();
    if schema.is_union() {
        let tag = r.read_uint(schema.tag_bits());
        let field = usize::try_from(tag)
            .ok()
            .and_then(|t| schema.data_fields().nth(t))
            .ok_or_else(|| decode_error(schema, format!("union tag {tag} is out of range")))?;
        let value = decode_field(schema, &field.ty, r)?;
        let _ = out.insert(field.name.clone(), value);
    } else {
        for field in schema.fields() {
            if let FieldType::Primitive(Primitive::Void(bits)) = field.ty {
                r.skip(usize::from(bits));
                continue;
            }
            let value = decode_field(schema, &field.ty, r)?;
            let _ = out.insert(field.name.clone(), value);
        }
    }
    r.align();
    Ok(Value::Object(out))
}

fn float_value(x: f64) -> Value {
    Number::from_f64(x).map_or(Value::Null, Value::Number)
}

fn decode_field(owner: &Composite, ty: &FieldType, r: &mut BitReader<'_>) -> Result<Value> {
    Ok(match ty {
        FieldType::Primitive(Primitive::Bool) => Value::Bool(r.read_bool()),
        FieldType::Primitive(Primitive::Uint(bits)) => Value::from(r.read_uint(*bits)),
        FieldType::Primitive(Primitive::Int(bits)) => Value::from(r.read_int(*bits)),
        FieldType::Primitive(Primitive::Float(bits)) => float_value(r.read_float(*bits)),
        FieldType::Primitive(Primitive::Void(bits)) => {
            r.skip(usize::from(*bits));
            Value::Null
        }
        FieldType::FixedArray { element, length } => {
            let items = (0..*length)
                .map(|_| decode_field(owner, element, r))
                .collect::<Result<Vec<_>>>()?;
            Value::Array(items)
        }
        FieldType::VariableArray { element, capacity } => {
            let len = r.read_uint(FieldType::length_prefix_bits(*capacity));
            let len = usize::try_from(len)
                .ok()
                .filter(|n| n <= capacity)
                .ok_or_else(|| decode_error(owner, format!("array length {len} exceeds capacity {capacity}")))?;
            let items = (0..len)
                .map(|_| decode_field(owner, element, r))
                .collect::<Result<Vec<_>>>()?;
            if ty.is_string_like() {
                let bytes: Vec<u8> = items
                    .iter()
                    .filter_map(Value::as_u64)
                    .filter_map(|b| u8::try_from(b).ok())
                    .collect();
                match String::from_utf8(bytes) {
                    Ok(s) => Value::String(s),
                    Err(_) => Value::Array(items),
                }
            } else {
                Value::Array(items)
            }
        }
        FieldType::Composite(inner) => {
            r.align();
            if inner.is_sealed() {
                decode_composite(inner, r)?
            } else {
                let size = r.read_uint(32);
                let size = usize::try_from(size).unwrap_or(usize::MAX);
                if size > r.remaining_bytes() {
                    return Err(decode_error(
                        owner,
                        format!("delimiter header {size} exceeds the remaining payload"),
                    ));
                }
                let bytes = r.take_bytes(size);
                let mut sub = BitReader::new(bytes);
                decode_composite(inner, &mut sub)?
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;

    fn heartbeat() -> Arc<Composite> {
        let health = Composite::new("uavcan.node.Health", 1, 0)
            .field("value", FieldType::uint(2))
            .sealed();
        let mode = Composite::new("uavcan.node.Mode", 1, 0)
            .field("value", FieldType::uint(3))
            .sealed();
        Composite::new("uavcan.node.Heartbeat", 1, 0)
            .field("uptime", FieldType::uint(32))
            .field("health", FieldType::composite(&health))
            .field("mode", FieldType::composite(&mode))
            .field("vendor_specific_status_code", FieldType::uint(8))
            .extent(12)
    }

    #[test]
    fn heartbeat_layout_matches_wire_format() {
        let value = json!({"uptime": 258, "health": {"value": 2}, "mode": {"value": 3}, "vendor_specific_status_code": 7});
        let bytes = serialize(&heartbeat(), &value).expect("serialize");
        assert_eq!(bytes, vec![2, 1, 0, 0, 2, 3, 7]);
        assert_eq!(deserialize(&heartbeat(), &bytes).expect("deserialize"), value);
    }

    #[test]
    fn unspecified_fields_take_defaults() {
        let bytes = serialize(&heartbeat(), &json!({"uptime": 1})).expect("serialize");
        assert_eq!(bytes, vec![1, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serialize(&heartbeat(), &json!({"uptime": 1, "bogus": 2})).expect_err("should fail");
        assert!(matches!(err, DsdlError::Value { ref path, .. } if path == "bogus"));
    }

    #[test]
    fn out_of_range_integers_are_rejected() {
        let err = serialize(&heartbeat(), &json!({"health": {"value": 4}})).expect_err("should fail");
        assert!(err.to_string().contains("uint2"));
    }

    #[test]
    fn scalar_is_accepted_for_single_field_composite() {
        let scalar = Composite::new("uavcan.si.unit.length.Scalar", 1, 0)
            .field("meter", FieldType::float(32))
            .sealed();
        let bytes = serialize(&scalar, &json!(2.5)).expect("serialize");
        assert_eq!(bytes, 2.5_f32.to_le_bytes().to_vec());
        assert_eq!(deserialize(&scalar, &bytes).expect("deserialize"), json!({"meter": 2.5}));
    }

    #[test]
    fn byte_arrays_accept_strings_and_decode_to_text() {
        let name = Composite::new("uavcan.register.Name", 1, 0)
            .field("name", FieldType::uint(8).up_to(255))
            .sealed();
        let bytes = serialize(&name, &json!({"name": "abc"})).expect("serialize");
        assert_eq!(bytes, vec![3, b'a', b'b', b'c']);
        assert_eq!(deserialize(&name, &bytes).expect("deserialize"), json!({"name": "abc"}));
        let raw = deserialize(&name, &[2, 0xFF, 0xFE]).expect("deserialize");
        assert_eq!(raw, json!({"name": [255, 254]}));
    }

    #[test]
    fn union_encodes_tag_and_single_variant() {
        let u = Composite::new("x.U", 1, 0)
            .field("a", FieldType::uint(8))
            .field("b", FieldType::int(16).up_to(4))
            .union()
            .sealed();
        let bytes = serialize(&u, &json!({"b": [-1, 2]})).expect("serialize");
        assert_eq!(bytes, vec![1, 2, 0xFF, 0xFF, 2, 0]);
        assert_eq!(deserialize(&u, &bytes).expect("deserialize"), json!({"b": [-1, 2]}));
        assert!(serialize(&u, &json!({"a": 1, "b": []})).is_err());
        assert_eq!(serialize(&u, &json!({})).expect("default"), vec![0, 0]);
    }

    #[test]
    fn invalid_union_tag_fails_to_decode() {
        let u = Composite::new("x.U", 1, 0)
            .field("a", FieldType::uint(8))
            .union()
            .sealed();
        assert!(matches!(deserialize(&u, &[5, 0]), Err(DsdlError::Deserialize { .. })));
    }

    #[test]
    fn delimited_nested_types_carry_header() {
        let inner = Composite::new("x.Inner", 1, 0).field("a", FieldType::uint(8)).extent(8);
        let outer = Composite::new("x.Outer", 1, 0)
            .field("inner", FieldType::composite(&inner))
            .field("b", FieldType::uint(8))
            .sealed();
        let bytes = serialize(&outer, &json!({"inner": {"a": 9}, "b": 7})).expect("serialize");
        assert_eq!(bytes, vec![1, 0, 0, 0, 9, 7]);
        // A newer sender may append fields; they are skipped through the header.
        let extended = vec![2, 0, 0, 0, 9, 42, 7];
        assert_eq!(
            deserialize(&outer, &extended).expect("deserialize"),
            json!({"inner": {"a": 9}, "b": 7})
        );
        assert!(deserialize(&outer, &[200, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn truncated_payload_is_zero_extended() {
        let value = deserialize(&heartbeat(), &[5]).expect("deserialize");
        assert_eq!(value["uptime"], json!(5));
        assert_eq!(value["mode"], json!({"value": 0}));
    }

    #[test]
    fn fixed_arrays_require_exact_length() {
        let c = Composite::new("x.Id", 1, 0)
            .field("uid", FieldType::uint(8).array(4))
            .sealed();
        assert!(serialize(&c, &json!({"uid": [1, 2]})).is_err());
        assert_eq!(serialize(&c, &json!({"uid": [1, 2, 3, 4]})).expect("ok"), vec![1, 2, 3, 4]);
        assert_eq!(default_value(&c), json!({"uid": [0, 0, 0, 0]}));
    }

    #[test]
    fn empty_list_is_not_a_missing_fixed_array() {
        let c = Composite::new("x.Id", 1, 0)
            .field("uid", FieldType::uint(8).array(4))
            .sealed();
        assert!(serialize(&c, &json!({"uid": []})).is_err());
        assert!(serialize(&c, &json!({"uid": ""})).is_err());
        assert_eq!(serialize(&c, &json!({})).expect("default"), vec![0, 0, 0, 0]);
        assert_eq!(serialize(&c, &json!({"uid": null})).expect("default"), vec![0, 0, 0, 0]);
    }
}

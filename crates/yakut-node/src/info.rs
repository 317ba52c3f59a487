//! Node identity reported through `uavcan.node.GetInfo`.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value, json};
use yakut_common::constants::NODE_NAME_PREFIX;

use crate::error::{NodeError, Result};

/// Protocol version implemented by this build.
pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

#[allow(clippy::expect_used)] // literal patterns, compiled in tests
static RE_NAME_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_]*[a-z0-9]$").expect("pattern is valid"));

/// A `major.minor` version pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    /// Major component.
    pub major: u8,
    /// Minor component.
    pub minor: u8,
}

impl Version {
    fn to_builtin(self) -> Value {
        json!({"major": self.major, "minor": self.minor})
    }

    fn from_builtin(value: Option<&Value>, field: &str) -> Result<Self> {
        let part = |key: &str| -> Result<u8> {
            match value.and_then(|v| v.get(key)) {
                None | Some(Value::Null) => Ok(0),
                Some(v) => v
                    .as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| invalid(format!("{field}.{key} must be an integer in [0, 255]"))),
            }
        };
        Ok(Self {
            major: part("major")?,
            minor: part("minor")?,
        })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

fn invalid(message: String) -> NodeError {
    NodeError::InvalidNodeInfo { message }
}

/// Bytes of a `uint8[]` field in builtin form: a string or a list of integers.
pub(crate) fn bytes_from_builtin(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => Some(s.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|x| x.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect(),
        Value::Null => Some(Vec::new()),
        _ => None,
    }
}

/// Contents of a `uavcan.node.GetInfo` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Cyphal protocol version.
    pub protocol_version: Version,
    /// Hardware version; zero when not applicable.
    pub hardware_version: Version,
    /// Software version.
    pub software_version: Version,
    /// VCS revision of the software; zero if unknown.
    pub software_vcs_revision_id: u64,
    /// Globally unique identifier of the node instance.
    pub unique_id: [u8; 16],
    /// Reverse-domain node name.
    pub name: String,
    /// CRC-64-WE of the software image, if known.
    pub software_image_crc: Option<u64>,
    /// Opaque certificate bytes.
    pub certificate_of_authenticity: Vec<u8>,
}

impl Default for NodeInfo {
    fn default() -> Self {
        let mut parts = env!("CARGO_PKG_VERSION").split('.').map(|p| p.parse::<u8>().unwrap_or(0));
        Self {
            protocol_version: PROTOCOL_VERSION,
            hardware_version: Version::default(),
            software_version: Version {
                major: parts.next().unwrap_or(0),
                minor: parts.next().unwrap_or(0),
            },
            software_vcs_revision_id: 0,
            unique_id: *uuid::Uuid::new_v4().as_bytes(),
            name: String::new(),
            software_image_crc: None,
            certificate_of_authenticity: Vec::new(),
        }
    }
}

impl NodeInfo {
    /// Default info of the node used by the command `suffix`; the name becomes
    /// `org.opencyphal.yakut.<suffix>`.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidNodeInfo`] for suffixes that do not look like
    /// a name component.
    pub fn for_command(suffix: &str) -> Result<Self> {
        if !RE_NAME_SUFFIX.is_match(suffix) {
            return Err(invalid(format!("poorly chosen node name suffix: {suffix:?}")));
        }
        Ok(Self {
            name: format!("{NODE_NAME_PREFIX}.{suffix}"),
            ..Self::default()
        })
    }

    /// Applies user overrides given as a builtin mapping. The protocol version
    /// cannot be overridden; an empty name keeps the current one.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidNodeInfo`] if a field does not fit.
    pub fn apply_overrides(&mut self, overrides: &Map<String, Value>) -> Result<()> {
        let mut merged = match self.to_builtin() {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        for (key, value) in overrides {
            if !merged.contains_key(key) {
                return Err(invalid(format!("unknown field {key:?}")));
            }
            let _ = merged.insert(key.clone(), value.clone());
        }
        let mut updated = Self::from_builtin(&Value::Object(merged))?;
        updated.protocol_version = PROTOCOL_VERSION;
        if updated.name.is_empty() {
            updated.name.clone_from(&self.name);
        }
        tracing::debug!(name = %updated.name, "node info overridden");
        *self = updated;
        Ok(())
    }

    /// The builtin form of the `GetInfo` response.
    #[must_use]
    pub fn to_builtin(&self) -> Value {
        json!({
            "protocol_version": self.protocol_version.to_builtin(),
            "hardware_version": self.hardware_version.to_builtin(),
            "software_version": self.software_version.to_builtin(),
            "software_vcs_revision_id": self.software_vcs_revision_id,
            "unique_id": self.unique_id.to_vec(),
            "name": self.name,
            "software_image_crc": self.software_image_crc.into_iter().collect::<Vec<_>>(),
            "certificate_of_authenticity": self.certificate_of_authenticity,
        })
    }

    /// Parses a decoded `GetInfo` response.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::InvalidNodeInfo`] when a field has the wrong shape.
    pub fn from_builtin(value: &Value) -> Result<Self> {
        let field = |name: &str| value.get(name);
        let bytes = |name: &str| -> Result<Vec<u8>> {
            field(name)
                .map_or(Some(Vec::new()), bytes_from_builtin)
                .ok_or_else(|| invalid(format!("{name} must be a byte string")))
        };
        let unique = bytes("unique_id")?;
        let mut unique_id = [0_u8; 16];
        if unique.len() > unique_id.len() {
            return Err(invalid("unique_id is longer than 16 bytes".to_owned()));
        }
        unique_id[..unique.len()].copy_from_slice(&unique);
        let name = String::from_utf8(bytes("name")?).map_err(|_| invalid("name is not UTF-8".to_owned()))?;
        if name.len() > 50 {
            return Err(invalid(format!("name {name:?} is longer than 50 bytes")));
        }
        let software_image_crc = match field("software_image_crc") {
            None | Some(Value::Null) => None,
            Some(Value::Array(items)) if items.is_empty() => None,
            Some(Value::Array(items)) if items.len() == 1 => items[0].as_u64(),
            Some(v) => v.as_u64(),
        };
        Ok(Self {
            protocol_version: Version::from_builtin(field("protocol_version"), "protocol_version")?,
            hardware_version: Version::from_builtin(field("hardware_version"), "hardware_version")?,
            software_version: Version::from_builtin(field("software_version"), "software_version")?,
            software_vcs_revision_id: field("software_vcs_revision_id").and_then(Value::as_u64).unwrap_or(0),
            unique_id,
            name,
            software_image_crc,
            certificate_of_authenticity: bytes("certificate_of_authenticity")?,
        })
    }

    /// Unique-ID as 32 lower-case hex digits.
    #[must_use]
    pub fn unique_id_hex(&self) -> String {
        self.unique_id.iter().map(|b| format!("{b:02x}")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_name_is_prefixed() {
        let info = NodeInfo::for_command("register_list").expect("info");
        assert_eq!(info.name, "org.opencyphal.yakut.register_list");
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert!(NodeInfo::for_command("Bad-Name").is_err());
        assert!(NodeInfo::for_command("trailing_").is_err());
    }

    #[test]
    fn unique_ids_differ_between_instances() {
        assert_ne!(NodeInfo::default().unique_id, NodeInfo::default().unique_id);
    }

    #[test]
    fn builtin_form_survives_the_codec() {
        let mut info = NodeInfo::for_command("monitor").expect("info");
        info.software_image_crc = Some(0xdead_beef);
        let (_, response) = crate::types::GET_INFO.service().expect("schema");
        let payload = yakut_dsdl::serialize(&response, &info.to_builtin()).expect("serialize");
        let decoded = yakut_dsdl::deserialize(&response, &payload).expect("deserialize");
        assert_eq!(NodeInfo::from_builtin(&decoded).expect("parse"), info);
    }

    #[test]
    fn overrides_keep_protocol_version_and_name() {
        let mut info = NodeInfo::for_command("call").expect("info");
        let overrides: Map<String, Value> = serde_json::from_value(json!({
            "protocol_version": {"major": 9, "minor": 9},
            "hardware_version": {"major": 2},
            "name": "",
        }))
        .expect("map");
        info.apply_overrides(&overrides).expect("apply");
        assert_eq!(info.protocol_version, PROTOCOL_VERSION);
        assert_eq!(info.hardware_version, Version { major: 2, minor: 0 });
        assert_eq!(info.name, "org.opencyphal.yakut.call");
    }

    #[test]
    fn unknown_override_is_rejected() {
        let mut info = NodeInfo::default();
        let overrides: Map<String, Value> = serde_json::from_value(json!({"colour": "red"})).expect("map");
        assert!(matches!(info.apply_overrides(&overrides), Err(NodeError::InvalidNodeInfo { .. })));
    }

    #[test]
    fn unique_id_hex_is_32_digits() {
        let mut info = NodeInfo::default();
        info.unique_id[15] = 0xab;
        let hex = info.unique_id_hex();
        assert_eq!(hex.len(), 32);
        assert!(hex.ends_with("ab"));
    }

    #[test]
    fn patterns_compile() {
        let _ = LazyLock::force(&RE_NAME_SUFFIX);
    }
}

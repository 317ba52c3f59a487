//! Built-in definitions of the standard `uavcan` data types.
//!
//! These are the types Yakut itself speaks (heartbeat, node info, registers,
//! file transfer, diagnostics) plus the primitive and SI types commonly used
//! on the command line.

use std::sync::{Arc, LazyLock};

use crate::error::{DsdlError, Result};
use crate::schema::{Composite, DataType, FieldType as F};

/// A searchable set of data types.
#[derive(Debug, Default)]
pub struct Catalog {
    types: Vec<Arc<DataType>>,
}

static STANDARD: LazyLock<Catalog> = LazyLock::new(build_standard);

impl Catalog {
    /// The catalog of standard types.
    #[must_use]
    pub fn standard() -> &'static Self {
        &STANDARD
    }

    fn add(&mut self, dt: DataType) {
        self.types.push(Arc::new(dt));
    }

    fn message(&mut self, schema: &Arc<Composite>, port: Option<u16>) {
        self.add(DataType::message(Arc::clone(schema), port));
    }

    fn service(&mut self, request: Arc<Composite>, response: Arc<Composite>, port: u16) {
        self.add(DataType::service(request, response, Some(port)));
    }

    /// All types.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<DataType>> {
        self.types.iter()
    }

    /// Number of types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Finds the newest type matching the criteria. The namespace is compared
    /// exactly, the short name ignoring case.
    #[must_use]
    pub fn find(
        &self,
        namespace: &str,
        short_name: &str,
        major: Option<u8>,
        minor: Option<u8>,
    ) -> Option<Arc<DataType>> {
        self.types
            .iter()
            .filter(|t| {
                t.namespace() == namespace
                    && t.short_name().eq_ignore_ascii_case(short_name)
                    && major.is_none_or(|m| t.version().major == m)
                    && minor.is_none_or(|m| t.version().minor == m)
            })
            .max_by_key(|t| t.version())
            .cloned()
    }

    /// Whether any type lives under `namespace` or one of its children.
    #[must_use]
    pub fn has_namespace(&self, namespace: &str) -> bool {
        self.types.iter().any(|t| {
            let ns = t.namespace();
            ns == namespace || ns.starts_with(&format!("{namespace}."))
        })
    }

    /// Exact lookup by full name and version.
    ///
    /// # Errors
    ///
    /// Returns [`DsdlError::UnknownType`] if the catalog lacks the type.
    pub fn require(&self, name: &str, major: u8, minor: u8) -> Result<Arc<DataType>> {
        self.types
            .iter()
            .find(|t| t.name() == name && t.version().major == major && t.version().minor == minor)
            .cloned()
            .ok_or_else(|| DsdlError::UnknownType {
                name: format!("{name}.{major}.{minor}"),
                suggestion: String::new(),
            })
    }

    /// The type bound to a fixed subject or service port-ID.
    #[must_use]
    pub fn by_fixed_port_id(&self, port_id: u16, service: bool) -> Option<Arc<DataType>> {
        self.types
            .iter()
            .filter(|t| t.fixed_port_id() == Some(port_id) && t.is_service() == service)
            .max_by_key(|t| t.version())
            .cloned()
    }
}

fn value_of(name: &str, major: u8, minor: u8, ty: F) -> Arc<Composite> {
    Composite::new(name, major, minor).field("value", ty).sealed()
}

#[allow(clippy::too_many_lines)]
fn build_standard() -> Catalog {
    let mut cat = Catalog::default();

    // uavcan.primitive
    let empty = Composite::new("uavcan.primitive.Empty", 1, 0).sealed();
    let string = value_of("uavcan.primitive.String", 1, 0, F::uint(8).up_to(256));
    let unstructured = value_of("uavcan.primitive.Unstructured", 1, 0, F::uint(8).up_to(256));
    for c in [&empty, &string, &unstructured] {
        cat.message(c, None);
    }
    let scalars = [
        ("Bit", F::bool()),
        ("Integer8", F::int(8)),
        ("Integer16", F::int(16)),
        ("Integer32", F::int(32)),
        ("Integer64", F::int(64)),
        ("Natural8", F::uint(8)),
        ("Natural16", F::uint(16)),
        ("Natural32", F::uint(32)),
        ("Natural64", F::uint(64)),
        ("Real16", F::float(16)),
        ("Real32", F::float(32)),
        ("Real64", F::float(64)),
    ];
    for (short, ty) in scalars {
        cat.message(&value_of(&format!("uavcan.primitive.scalar.{short}"), 1, 0, ty), None);
    }
    let arrays: Vec<(&str, Arc<Composite>)> = [
        ("bit", "Bit", F::bool(), 2048),
        ("integer64", "Integer64", F::int(64), 32),
        ("integer32", "Integer32", F::int(32), 64),
        ("integer16", "Integer16", F::int(16), 128),
        ("integer8", "Integer8", F::int(8), 256),
        ("natural64", "Natural64", F::uint(64), 32),
        ("natural32", "Natural32", F::uint(32), 64),
        ("natural16", "Natural16", F::uint(16), 128),
        ("natural8", "Natural8", F::uint(8), 256),
        ("real64", "Real64", F::float(64), 32),
        ("real32", "Real32", F::float(32), 64),
        ("real16", "Real16", F::float(16), 128),
    ]
    .into_iter()
    .map(|(field, short, ty, cap)| {
        let c = value_of(&format!("uavcan.primitive.array.{short}"), 1, 0, ty.up_to(cap));
        (field, c)
    })
    .collect();
    for (_, c) in &arrays {
        cat.message(c, None);
    }

    // uavcan.time
    let timestamp = Composite::new("uavcan.time.SynchronizedTimestamp", 1, 0)
        .constant("UNKNOWN", 0)
        .field("microsecond", F::uint(56))
        .sealed();
    cat.message(&timestamp, None);

    // uavcan.node
    let health = Composite::new("uavcan.node.Health", 1, 0)
        .constant("NOMINAL", 0)
        .constant("ADVISORY", 1)
        .constant("CAUTION", 2)
        .constant("WARNING", 3)
        .field("value", F::uint(2))
        .sealed();
    let mode = Composite::new("uavcan.node.Mode", 1, 0)
        .constant("OPERATIONAL", 0)
        .constant("INITIALIZATION", 1)
        .constant("MAINTENANCE", 2)
        .constant("SOFTWARE_UPDATE", 3)
        .field("value", F::uint(3))
        .sealed();
    let version = Composite::new("uavcan.node.Version", 1, 0)
        .field("major", F::uint(8))
        .field("minor", F::uint(8))
        .sealed();
    let node_id = value_of("uavcan.node.ID", 1, 0, F::uint(16));
    for c in [&health, &mode, &version, &node_id] {
        cat.message(c, None);
    }
    let heartbeat = Composite::new("uavcan.node.Heartbeat", 1, 0)
        .constant("MAX_PUBLICATION_PERIOD", 1)
        .constant("OFFLINE_TIMEOUT", 3)
        .field("uptime", F::uint(32))
        .field("health", F::composite(&health))
        .field("mode", F::composite(&mode))
        .field("vendor_specific_status_code", F::uint(8))
        .extent(12);
    cat.message(&heartbeat, Some(7509));

    let get_info_request = Composite::new("uavcan.node.GetInfo", 1, 0).sealed();
    let get_info_response = Composite::new("uavcan.node.GetInfo", 1, 0)
        .field("protocol_version", F::composite(&version))
        .field("hardware_version", F::composite(&version))
        .field("software_version", F::composite(&version))
        .field("software_vcs_revision_id", F::uint(64))
        .field("unique_id", F::uint(8).array(16))
        .field("name", F::uint(8).up_to(50))
        .field("software_image_crc", F::uint(64).up_to(1))
        .field("certificate_of_authenticity", F::uint(8).up_to(222))
        .extent(448);
    cat.service(get_info_request, get_info_response, 430);

    let execute_request = Composite::new("uavcan.node.ExecuteCommand", 1, 1)
        .constant("COMMAND_RESTART", 65535)
        .constant("COMMAND_POWER_OFF", 65534)
        .constant("COMMAND_BEGIN_SOFTWARE_UPDATE", 65533)
        .constant("COMMAND_FACTORY_RESET", 65532)
        .constant("COMMAND_EMERGENCY_STOP", 65531)
        .constant("COMMAND_STORE_PERSISTENT_STATES", 65530)
        .constant("COMMAND_IDENTIFY", 65529)
        .field("command", F::uint(16))
        .field("parameter", F::uint(8).up_to(255))
        .extent(300);
    let execute_response = Composite::new("uavcan.node.ExecuteCommand", 1, 1)
        .constant("STATUS_SUCCESS", 0)
        .constant("STATUS_FAILURE", 1)
        .constant("STATUS_NOT_AUTHORIZED", 2)
        .constant("STATUS_BAD_COMMAND", 3)
        .constant("STATUS_BAD_PARAMETER", 4)
        .constant("STATUS_BAD_STATE", 5)
        .constant("STATUS_INTERNAL_ERROR", 6)
        .field("status", F::uint(8))
        .extent(48);
    cat.service(execute_request, execute_response, 435);

    // uavcan.node.port
    let subject_id = Composite::new("uavcan.node.port.SubjectID", 1, 0)
        .constant("MAX", 8191)
        .field("value", F::uint(13))
        .sealed();
    let service_id = Composite::new("uavcan.node.port.ServiceID", 1, 0)
        .constant("MAX", 511)
        .field("value", F::uint(9))
        .sealed();
    let subject_id_list = Composite::new("uavcan.node.port.SubjectIDList", 0, 1)
        .constant("CAPACITY", 8192)
        .field("mask", F::bool().array(8192))
        .field("sparse_list", F::composite(&subject_id).up_to(255))
        .field("total", F::composite(&empty))
        .union()
        .extent(4097);
    let service_id_list = Composite::new("uavcan.node.port.ServiceIDList", 0, 1)
        .constant("CAPACITY", 512)
        .field("mask", F::bool().array(512))
        .extent(128);
    for c in [&subject_id, &service_id, &subject_id_list, &service_id_list] {
        cat.message(c, None);
    }
    let port_list = Composite::new("uavcan.node.port.List", 0, 1)
        .constant("MAX_PUBLICATION_PERIOD", 10)
        .field("publishers", F::composite(&subject_id_list))
        .field("subscribers", F::composite(&subject_id_list))
        .field("clients", F::composite(&service_id_list))
        .field("servers", F::composite(&service_id_list))
        .extent(8466);
    cat.message(&port_list, Some(7510));

    // uavcan.register
    let name = Composite::new("uavcan.register.Name", 1, 0)
        .field("name", F::uint(8).up_to(255))
        .sealed();
    let mut value = Composite::new("uavcan.register.Value", 1, 0)
        .field("empty", F::composite(&empty))
        .field("string", F::composite(&string))
        .field("unstructured", F::composite(&unstructured));
    for (field, c) in &arrays {
        value = value.field(field, F::composite(c));
    }
    let value = value.union().sealed();
    cat.message(&name, None);
    cat.message(&value, None);
    let access_request = Composite::new("uavcan.register.Access", 1, 0)
        .field("name", F::composite(&name))
        .field("value", F::composite(&value))
        .sealed();
    let access_response = Composite::new("uavcan.register.Access", 1, 0)
        .field("timestamp", F::composite(&timestamp))
        .field("mutable", F::bool())
        .field("persistent", F::bool())
        .pad(6)
        .field("value", F::composite(&value))
        .sealed();
    cat.service(access_request, access_response, 384);
    let list_request = Composite::new("uavcan.register.List", 1, 0)
        .field("index", F::uint(16))
        .sealed();
    let list_response = Composite::new("uavcan.register.List", 1, 0)
        .field("name", F::composite(&name))
        .sealed();
    cat.service(list_request, list_response, 385);

    // uavcan.file
    let path = Composite::new("uavcan.file.Path", 2, 0)
        .constant("SEPARATOR", i64::from(b'/'))
        .constant("MAX_LENGTH", 255)
        .field("path", F::uint(8).up_to(255))
        .sealed();
    let error = Composite::new("uavcan.file.Error", 1, 0)
        .constant("OK", 0)
        .constant("UNKNOWN_ERROR", 65535)
        .constant("NOT_FOUND", 2)
        .constant("IO_ERROR", 5)
        .constant("ACCESS_DENIED", 13)
        .constant("IS_DIRECTORY", 21)
        .constant("INVALID_VALUE", 22)
        .constant("FILE_TOO_LARGE", 27)
        .constant("OUT_OF_SPACE", 28)
        .constant("NOT_SUPPORTED", 38)
        .field("value", F::uint(16))
        .sealed();
    cat.message(&path, None);
    cat.message(&error, None);
    cat.service(
        Composite::new("uavcan.file.GetInfo", 0, 2)
            .field("path", F::composite(&path))
            .extent(300),
        Composite::new("uavcan.file.GetInfo", 0, 2)
            .field("error", F::composite(&error))
            .field("size", F::uint(40))
            .field("unix_timestamp_of_last_modification", F::uint(40))
            .field("is_file_not_directory", F::bool())
            .field("is_link", F::bool())
            .field("is_readable", F::bool())
            .field("is_writeable", F::bool())
            .pad(4)
            .extent(48),
        405,
    );
    cat.service(
        Composite::new("uavcan.file.List", 0, 2)
            .field("entry_index", F::uint(32))
            .pad(32)
            .field("directory_path", F::composite(&path))
            .extent(300),
        Composite::new("uavcan.file.List", 0, 2)
            .pad(32)
            .field("entry_base_name", F::composite(&path))
            .extent(300),
        406,
    );
    cat.service(
        Composite::new("uavcan.file.Modify", 1, 1)
            .field("preserve_source", F::bool())
            .field("overwrite_destination", F::bool())
            .pad(30)
            .field("source", F::composite(&path))
            .field("destination", F::composite(&path))
            .extent(600),
        Composite::new("uavcan.file.Modify", 1, 1)
            .field("error", F::composite(&error))
            .extent(48),
        407,
    );
    cat.service(
        Composite::new("uavcan.file.Read", 1, 1)
            .field("offset", F::uint(40))
            .field("path", F::composite(&path))
            .extent(300),
        Composite::new("uavcan.file.Read", 1, 1)
            .field("error", F::composite(&error))
            .field("data", F::composite(&unstructured))
            .extent(300),
        408,
    );
    cat.service(
        Composite::new("uavcan.file.Write", 1, 1)
            .field("offset", F::uint(40))
            .field("path", F::composite(&path))
            .field("data", F::composite(&unstructured))
            .extent(600),
        Composite::new("uavcan.file.Write", 1, 1)
            .field("error", F::composite(&error))
            .extent(48),
        409,
    );

    // uavcan.diagnostic
    let severity = Composite::new("uavcan.diagnostic.Severity", 1, 0)
        .constant("TRACE", 0)
        .constant("DEBUG", 1)
        .constant("INFO", 2)
        .constant("NOTICE", 3)
        .constant("WARNING", 4)
        .constant("ERROR", 5)
        .constant("CRITICAL", 6)
        .constant("ALERT", 7)
        .field("value", F::uint(3))
        .sealed();
    cat.message(&severity, None);
    let record = Composite::new("uavcan.diagnostic.Record", 1, 1)
        .field("timestamp", F::composite(&timestamp))
        .field("severity", F::composite(&severity))
        .field("text", F::uint(8).up_to(255))
        .extent(300);
    cat.message(&record, Some(8184));

    // uavcan.si
    let quantities = [
        ("acceleration", "meter_per_second_per_second", true),
        ("angle", "radian", false),
        ("angular_acceleration", "radian_per_second_per_second", true),
        ("angular_velocity", "radian_per_second", true),
        ("duration", "second", false),
        ("electric_charge", "coulomb", false),
        ("electric_current", "ampere", false),
        ("energy", "joule", false),
        ("force", "newton", true),
        ("frequency", "hertz", false),
        ("length", "meter", true),
        ("magnetic_field_strength", "tesla", true),
        ("mass", "kilogram", false),
        ("power", "watt", false),
        ("pressure", "pascal", false),
        ("temperature", "kelvin", false),
        ("torque", "newton_meter", true),
        ("velocity", "meter_per_second", true),
        ("voltage", "volt", false),
        ("volume", "cubic_meter", false),
        ("volumetric_flow_rate", "cubic_meter_per_second", false),
    ];
    for (quantity, unit, has_vector) in quantities {
        let mut shapes = vec![("Scalar", F::float(32))];
        if has_vector {
            shapes.push(("Vector3", F::float(32).array(3)));
        }
        for (shape, ty) in shapes {
            let unit_type = Composite::new(&format!("uavcan.si.unit.{quantity}.{shape}"), 1, 0)
                .field(unit, ty.clone())
                .sealed();
            let sample_type = Composite::new(&format!("uavcan.si.sample.{quantity}.{shape}"), 1, 0)
                .field("timestamp", F::composite(&timestamp))
                .field(unit, ty)
                .sealed();
            cat.message(&unit_type, None);
            cat.message(&sample_type, None);
        }
    }

    tracing::debug!(types = cat.len(), "standard data type catalog built");
    cat
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::codec::{deserialize, serialize};

    #[test]
    fn heartbeat_is_bound_to_its_fixed_subject() {
        let hb = Catalog::standard().find("uavcan.node", "heartbeat", None, None).expect("heartbeat");
        assert_eq!(hb.full_name(), "uavcan.node.Heartbeat.1.0");
        assert_eq!(hb.fixed_port_id(), Some(7509));
        let schema = hb.message_schema().expect("message");
        assert_eq!(schema.max_bit_length(), 56);
    }

    #[test]
    fn get_info_response_extent_is_448_bytes() {
        let dt = Catalog::standard().require("uavcan.node.GetInfo", 1, 0).expect("GetInfo");
        let (req, resp) = dt.service_schemas().expect("service");
        assert_eq!(req.max_bit_length(), 0);
        assert_eq!(resp.extent_bits(), 448 * 8);
        assert!(resp.max_bit_length() <= resp.extent_bits());
    }

    #[test]
    fn register_value_round_trips_natural16() {
        let dt = Catalog::standard().require("uavcan.register.Value", 1, 0).expect("Value");
        let schema = dt.message_schema().expect("message");
        let value = json!({"natural16": {"value": [60000, 50000]}});
        let bytes = serialize(schema, &value).expect("serialize");
        assert_eq!(bytes[0], 10);
        assert_eq!(deserialize(schema, &bytes).expect("deserialize"), value);
    }

    #[test]
    fn register_access_response_layout() {
        let dt = Catalog::standard().require("uavcan.register.Access", 1, 0).expect("Access");
        let (_, resp) = dt.service_schemas().expect("service");
        let bytes = serialize(resp, &json!({"mutable": true, "value": {"empty": {}}})).expect("serialize");
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 0b01, 0]);
    }

    #[test]
    fn by_fixed_port_id_distinguishes_services() {
        let cat = Catalog::standard();
        assert_eq!(cat.by_fixed_port_id(7509, false).expect("subject").short_name(), "Heartbeat");
        assert_eq!(cat.by_fixed_port_id(430, true).expect("service").short_name(), "GetInfo");
        assert!(cat.by_fixed_port_id(430, false).is_none());
    }

    #[test]
    fn si_vectors_exist_only_for_vector_quantities() {
        let cat = Catalog::standard();
        assert!(cat.find("uavcan.si.unit.velocity", "vector3", Some(1), Some(0)).is_some());
        assert!(cat.find("uavcan.si.unit.mass", "Vector3", None, None).is_none());
        assert!(cat.has_namespace("uavcan.si"));
        assert!(!cat.has_namespace("sirius"));
    }

    #[test]
    fn port_list_nests_delimited_lists() {
        let dt = Catalog::standard().require("uavcan.node.port.List", 0, 1).expect("List");
        let schema = dt.message_schema().expect("message");
        let bytes = serialize(schema, &json!({"publishers": {"sparse_list": [{"value": 7509}]}})).expect("serialize");
        let decoded = deserialize(schema, &bytes).expect("deserialize");
        assert_eq!(decoded["publishers"], json!({"sparse_list": [{"value": 7509}]}));
        assert_eq!(decoded["subscribers"], json!({"mask": vec![false; 8192]}));
    }
}

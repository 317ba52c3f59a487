//! Schema model of DSDL data types.
//!
//! Composites are built with a small fluent API so that the catalog reads close
//! to the definitions it mirrors:
//!
//! ```
//! use yakut_dsdl::schema::{Composite, FieldType};
//!
//! let version = Composite::new("uavcan.node.Version", 1, 0)
//!     .field("major", FieldType::uint(8))
//!     .field("minor", FieldType::uint(8))
//!     .sealed();
//! assert_eq!(version.max_bit_length(), 16);
//! ```

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bits::align_up;

/// Major and minor version of a data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl Version {
    /// Creates a version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Scalar wire types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Primitive {
    /// Single bit.
    Bool,
    /// Unsigned integer of 1..=64 bits.
    Uint(u8),
    /// Signed integer of 2..=64 bits.
    Int(u8),
    /// IEEE 754 float of 16, 32, or 64 bits.
    Float(u8),
    /// Padding of 1..=64 zero bits.
    Void(u8),
}

impl Primitive {
    /// Size on the wire.
    #[must_use]
    pub const fn bit_length(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::Uint(n) | Self::Int(n) | Self::Float(n) | Self::Void(n) => n as usize,
        }
    }
}

/// Type of a composite field.
#[derive(Debug, Clone)]
pub enum FieldType {
    /// A scalar.
    Primitive(Primitive),
    /// Array of exactly `length` elements.
    FixedArray {
        /// Element type.
        element: Box<FieldType>,
        /// Element count.
        length: usize,
    },
    /// Array of up to `capacity` elements preceded by an implicit length prefix.
    VariableArray {
        /// Element type.
        element: Box<FieldType>,
        /// Maximum element count.
        capacity: usize,
    },
    /// A nested composite.
    Composite(Arc<Composite>),
}

impl FieldType {
    /// `bool`.
    #[must_use]
    pub const fn bool() -> Self {
        Self::Primitive(Primitive::Bool)
    }

    /// `uintN`.
    #[must_use]
    pub const fn uint(bits: u8) -> Self {
        Self::Primitive(Primitive::Uint(bits))
    }

    /// `intN`.
    #[must_use]
    pub const fn int(bits: u8) -> Self {
        Self::Primitive(Primitive::Int(bits))
    }

    /// `floatN`.
    #[must_use]
    pub const fn float(bits: u8) -> Self {
        Self::Primitive(Primitive::Float(bits))
    }

    /// `voidN`.
    #[must_use]
    pub const fn void(bits: u8) -> Self {
        Self::Primitive(Primitive::Void(bits))
    }

    /// Nested composite.
    #[must_use]
    pub fn composite(c: &Arc<Composite>) -> Self {
        Self::Composite(Arc::clone(c))
    }

    /// `T[length]`.
    #[must_use]
    pub fn array(self, length: usize) -> Self {
        Self::FixedArray {
            element: Box::new(self),
            length,
        }
    }

    /// `T[<=capacity]`.
    #[must_use]
    pub fn up_to(self, capacity: usize) -> Self {
        Self::VariableArray {
            element: Box::new(self),
            capacity,
        }
    }

    /// Width of the implicit length prefix for a variable array of `capacity` elements.
    #[must_use]
    pub const fn length_prefix_bits(capacity: usize) -> u8 {
        let needed = usize::BITS - capacity.leading_zeros();
        if needed <= 8 {
            8
        } else if needed <= 16 {
            16
        } else if needed <= 32 {
            32
        } else {
            64
        }
    }

    /// Whether this is a variable-length `uint8` array, rendered as text when possible.
    #[must_use]
    pub fn is_string_like(&self) -> bool {
        matches!(self, Self::VariableArray { element, .. }
            if matches!(**element, Self::Primitive(Primitive::Uint(8))))
    }

    /// Whether this is an array of `uint8`, fixed or variable.
    #[must_use]
    pub fn is_byte_array(&self) -> bool {
        match self {
            Self::FixedArray { element, .. } | Self::VariableArray { element, .. } => {
                matches!(**element, Self::Primitive(Primitive::Uint(8)))
            }
            _ => false,
        }
    }

    /// Alignment requirement in bits.
    #[must_use]
    pub fn alignment(&self) -> usize {
        match self {
            Self::Primitive(_) => 1,
            Self::FixedArray { element, .. } | Self::VariableArray { element, .. } => element.alignment(),
            Self::Composite(_) => 8,
        }
    }

    /// Largest possible serialized size, excluding leading alignment padding.
    #[must_use]
    pub fn max_bit_length(&self) -> usize {
        match self {
            Self::Primitive(p) => p.bit_length(),
            Self::FixedArray { element, length } => {
                element_span(element) * length.saturating_sub(1) + element.max_bit_length()
            }
            Self::VariableArray { element, capacity } => {
                let prefix = usize::from(Self::length_prefix_bits(*capacity));
                align_up(prefix, element.alignment()) + element_span(element) * capacity
            }
            Self::Composite(c) => {
                if c.is_sealed() {
                    c.max_bit_length()
                } else {
                    32 + c.extent_bits()
                }
            }
        }
    }
}

fn element_span(element: &FieldType) -> usize {
    align_up(element.max_bit_length(), element.alignment())
}

/// A named field; padding fields have an empty name.
#[derive(Debug, Clone)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Field type.
    pub ty: FieldType,
}

impl Field {
    /// Whether this is a `voidN` padding field.
    #[must_use]
    pub const fn is_padding(&self) -> bool {
        matches!(self.ty, FieldType::Primitive(Primitive::Void(_)))
    }
}

/// Named integer constant declared in a composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constant {
    /// Constant name, upper case by convention.
    pub name: String,
    /// Constant value.
    pub value: i64,
}

/// How the receiver treats payloads of a newer, larger version of the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// The type can never grow; nested fields are serialized inline.
    Sealed,
    /// Explicit extent in bytes.
    Bytes(usize),
    /// One and a half times the maximum size.
    Implicit,
}

/// A structure or union type.
#[derive(Debug, Clone)]
pub struct Composite {
    name: String,
    version: Version,
    fields: Vec<Field>,
    constants: Vec<Constant>,
    union: bool,
    extent: Extent,
}

impl Composite {
    /// Starts an empty structure.
    #[must_use]
    pub fn new(name: &str, major: u8, minor: u8) -> Self {
        Self {
            name: name.to_owned(),
            version: Version::new(major, minor),
            fields: Vec::new(),
            constants: Vec::new(),
            union: false,
            extent: Extent::Implicit,
        }
    }

    /// Appends a field.
    #[must_use]
    pub fn field(mut self, name: &str, ty: FieldType) -> Self {
        self.fields.push(Field {
            name: name.to_owned(),
            ty,
        });
        self
    }

    /// Appends `voidN` padding.
    #[must_use]
    pub fn pad(self, bits: u8) -> Self {
        self.field("", FieldType::void(bits))
    }

    /// Declares a constant.
    #[must_use]
    pub fn constant(mut self, name: &str, value: i64) -> Self {
        self.constants.push(Constant {
            name: name.to_owned(),
            value,
        });
        self
    }

    /// Marks the type as a tagged union.
    #[must_use]
    pub const fn union(mut self) -> Self {
        self.union = true;
        self
    }

    /// Seals the type and wraps it for sharing.
    #[must_use]
    pub fn sealed(mut self) -> Arc<Self> {
        self.extent = Extent::Sealed;
        Arc::new(self)
    }

    /// Sets an explicit extent in bytes and wraps the type for sharing.
    #[must_use]
    pub fn extent(mut self, bytes: usize) -> Arc<Self> {
        self.extent = Extent::Bytes(bytes);
        Arc::new(self)
    }

    /// Wraps the type for sharing with the implicit extent.
    #[must_use]
    pub fn delimited(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Full name without version, such as `uavcan.node.Heartbeat`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Fields in declaration order, padding included.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Fields that carry data.
    pub fn data_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| !f.is_padding())
    }

    /// Declared constants.
    #[must_use]
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// Looks up a constant by name.
    #[must_use]
    pub fn constant_value(&self, name: &str) -> Option<i64> {
        self.constants.iter().find(|c| c.name == name).map(|c| c.value)
    }

    /// Whether this is a tagged union.
    #[must_use]
    pub const fn is_union(&self) -> bool {
        self.union
    }

    /// Whether nested occurrences are serialized without a delimiter header.
    #[must_use]
    pub const fn is_sealed(&self) -> bool {
        matches!(self.extent, Extent::Sealed)
    }

    /// Width of the union tag.
    #[must_use]
    pub fn tag_bits(&self) -> u8 {
        FieldType::length_prefix_bits(self.data_fields().count().saturating_sub(1))
    }

    /// Largest possible serialized size, padded to a whole byte.
    #[must_use]
    pub fn max_bit_length(&self) -> usize {
        let end = if self.union {
            let tag = usize::from(self.tag_bits());
            self.data_fields()
                .map(|f| align_up(tag, f.ty.alignment()) + f.ty.max_bit_length())
                .max()
                .unwrap_or(tag)
        } else {
            self.fields.iter().fold(0, |offset, f| {
                align_up(offset, f.ty.alignment()) + f.ty.max_bit_length()
            })
        };
        align_up(end, 8)
    }

    /// Size of the buffer a receiver reserves for this type.
    #[must_use]
    pub fn extent_bits(&self) -> usize {
        match self.extent {
            Extent::Sealed => self.max_bit_length(),
            Extent::Bytes(n) => n * 8,
            Extent::Implicit => align_up(self.max_bit_length() * 3 / 2, 8),
        }
    }
}

impl fmt::Display for Composite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.version)
    }
}

/// Message or service payload schema.
#[derive(Debug, Clone)]
pub enum Kind {
    /// A message type.
    Message(Arc<Composite>),
    /// A service type with request and response sections.
    Service {
        /// Request schema.
        request: Arc<Composite>,
        /// Response schema.
        response: Arc<Composite>,
    },
}

/// A top-level data type, optionally bound to a fixed port-ID.
#[derive(Debug, Clone)]
pub struct DataType {
    name: String,
    version: Version,
    kind: Kind,
    fixed_port_id: Option<u16>,
}

impl DataType {
    /// A message type.
    #[must_use]
    pub fn message(schema: Arc<Composite>, fixed_port_id: Option<u16>) -> Self {
        Self {
            name: schema.name().to_owned(),
            version: schema.version(),
            kind: Kind::Message(schema),
            fixed_port_id,
        }
    }

    /// A service type; both sections carry the service name.
    #[must_use]
    pub fn service(request: Arc<Composite>, response: Arc<Composite>, fixed_port_id: Option<u16>) -> Self {
        Self {
            name: request.name().to_owned(),
            version: request.version(),
            kind: Kind::Service { request, response },
            fixed_port_id,
        }
    }

    /// Full name without version.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last name component.
    #[must_use]
    pub fn short_name(&self) -> &str {
        self.name.rsplit('.').next().unwrap_or(&self.name)
    }

    /// Name components before the short name.
    #[must_use]
    pub fn namespace(&self) -> &str {
        self.name.rsplit_once('.').map_or("", |(ns, _)| ns)
    }

    /// Root namespace.
    #[must_use]
    pub fn root_namespace(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    /// Type version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Versioned full name, `uavcan.node.Heartbeat.1.0`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.name, self.version)
    }

    /// Schema of the type.
    #[must_use]
    pub const fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Whether this is a service type.
    #[must_use]
    pub const fn is_service(&self) -> bool {
        matches!(self.kind, Kind::Service { .. })
    }

    /// Message schema, if this is a message type.
    #[must_use]
    pub const fn message_schema(&self) -> Option<&Arc<Composite>> {
        match &self.kind {
            Kind::Message(c) => Some(c),
            Kind::Service { .. } => None,
        }
    }

    /// Request and response schemas, if this is a service type.
    #[must_use]
    pub const fn service_schemas(&self) -> Option<(&Arc<Composite>, &Arc<Composite>)> {
        match &self.kind {
            Kind::Service { request, response } => Some((request, response)),
            Kind::Message(_) => None,
        }
    }

    /// Fixed port-ID, if one is assigned.
    #[must_use]
    pub const fn fixed_port_id(&self) -> Option<u16> {
        self.fixed_port_id
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_prefix_width_fits_capacity() {
        assert_eq!(FieldType::length_prefix_bits(1), 8);
        assert_eq!(FieldType::length_prefix_bits(255), 8);
        assert_eq!(FieldType::length_prefix_bits(256), 16);
        assert_eq!(FieldType::length_prefix_bits(2048), 16);
        assert_eq!(FieldType::length_prefix_bits(70_000), 32);
    }

    #[test]
    fn max_bit_length_accounts_for_alignment() {
        let health = Composite::new("x.Health", 1, 0).field("value", FieldType::uint(2)).sealed();
        let hb = Composite::new("x.Heartbeat", 1, 0)
            .field("uptime", FieldType::uint(32))
            .field("health", FieldType::composite(&health))
            .field("flag", FieldType::bool())
            .extent(12);
        assert_eq!(health.max_bit_length(), 8);
        assert_eq!(hb.max_bit_length(), 48);
        assert_eq!(hb.extent_bits(), 96);
        assert!(!hb.is_sealed());
    }

    #[test]
    fn delimited_nested_types_reserve_header_and_extent() {
        let inner = Composite::new("x.Inner", 1, 0).field("a", FieldType::uint(8)).extent(4);
        let outer = Composite::new("x.Outer", 1, 0).field("inner", FieldType::composite(&inner)).sealed();
        assert_eq!(outer.max_bit_length(), 32 + 32);
    }

    #[test]
    fn union_size_is_tag_plus_largest_variant() {
        let u = Composite::new("x.U", 1, 0)
            .field("a", FieldType::uint(8))
            .field("b", FieldType::uint(8).up_to(3))
            .union()
            .sealed();
        assert_eq!(u.tag_bits(), 8);
        assert_eq!(u.max_bit_length(), 8 + 8 + 24);
    }

    #[test]
    fn implicit_extent_is_one_and_a_half_times_max_size() {
        let c = Composite::new("x.C", 1, 0).field("a", FieldType::uint(8).array(4)).delimited();
        assert_eq!(c.extent_bits(), 48);
    }

    #[test]
    fn data_type_name_accessors() {
        let c = Composite::new("uavcan.node.Heartbeat", 1, 0).extent(12);
        let dt = DataType::message(c, Some(7509));
        assert_eq!(dt.short_name(), "Heartbeat");
        assert_eq!(dt.namespace(), "uavcan.node");
        assert_eq!(dt.root_namespace(), "uavcan");
        assert_eq!(dt.full_name(), "uavcan.node.Heartbeat.1.0");
        assert_eq!(dt.fixed_port_id(), Some(7509));
        assert!(!dt.is_service());
    }
}

//! # yakut-dsdl
//!
//! Data type support for Yakut: a bit-level cursor following the Cyphal
//! serialization rules, a schema model of DSDL composite types, a generic codec
//! between wire bytes and the builtin JSON object model, a catalog of the
//! standard data types, type name lookup, and the namespace index produced by
//! the `compile` command.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod bits;
pub mod catalog;
pub mod codec;
pub mod error;
pub mod index;
pub mod name;
pub mod schema;

pub use catalog::Catalog;
pub use codec::{deserialize, serialize};
pub use error::{DsdlError, Result};
pub use name::{Loader, TypeName};
pub use schema::{Composite, DataType, FieldType, Kind, Primitive, Version};

//! Handles on the standard data types the node layer speaks.

use std::sync::Arc;

use yakut_dsdl::{Catalog, Composite, DataType};

use crate::error::{NodeError, Result};

/// A standard type referenced by exact name and version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandardType {
    /// Full name without version.
    pub name: &'static str,
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
}

impl StandardType {
    const fn new(name: &'static str, major: u8, minor: u8) -> Self {
        Self { name, major, minor }
    }

    /// Looks the type up in the standard catalog.
    ///
    /// # Errors
    ///
    /// Fails only if the catalog lacks the type.
    pub fn load(self) -> Result<Arc<DataType>> {
        Ok(Catalog::standard().require(self.name, self.major, self.minor)?)
    }

    /// Schema of a message type.
    ///
    /// # Errors
    ///
    /// Fails if the type is unknown or is a service.
    pub fn message(self) -> Result<Arc<Composite>> {
        message_schema(&*self.load()?)
    }

    /// Request and response schemas of a service type.
    ///
    /// # Errors
    ///
    /// Fails if the type is unknown or is a message.
    pub fn service(self) -> Result<(Arc<Composite>, Arc<Composite>)> {
        service_schemas(&*self.load()?)
    }
}

/// Message schema of `dtype`.
///
/// # Errors
///
/// Returns [`NodeError::WrongKind`] for service types.
pub fn message_schema(dtype: &DataType) -> Result<Arc<Composite>> {
    dtype.message_schema().cloned().ok_or_else(|| NodeError::WrongKind {
        name: dtype.full_name(),
        expected: "message",
    })
}

/// Request and response schemas of `dtype`.
///
/// # Errors
///
/// Returns [`NodeError::WrongKind`] for message types.
pub fn service_schemas(dtype: &DataType) -> Result<(Arc<Composite>, Arc<Composite>)> {
    dtype
        .service_schemas()
        .map(|(q, r)| (Arc::clone(q), Arc::clone(r)))
        .ok_or_else(|| NodeError::WrongKind {
            name: dtype.full_name(),
            expected: "service",
        })
}

/// `uavcan.node.Heartbeat.1.0`
pub const HEARTBEAT: StandardType = StandardType::new("uavcan.node.Heartbeat", 1, 0);
/// `uavcan.node.GetInfo.1.0`
pub const GET_INFO: StandardType = StandardType::new("uavcan.node.GetInfo", 1, 0);
/// `uavcan.node.ExecuteCommand.1.1`
pub const EXECUTE_COMMAND: StandardType = StandardType::new("uavcan.node.ExecuteCommand", 1, 1);
/// `uavcan.node.port.List.0.1`
pub const PORT_LIST: StandardType = StandardType::new("uavcan.node.port.List", 0, 1);
/// `uavcan.register.Access.1.0`
pub const REGISTER_ACCESS: StandardType = StandardType::new("uavcan.register.Access", 1, 0);
/// `uavcan.register.List.1.0`
pub const REGISTER_LIST: StandardType = StandardType::new("uavcan.register.List", 1, 0);
/// `uavcan.file.GetInfo.0.2`
pub const FILE_GET_INFO: StandardType = StandardType::new("uavcan.file.GetInfo", 0, 2);
/// `uavcan.file.List.0.2`
pub const FILE_LIST: StandardType = StandardType::new("uavcan.file.List", 0, 2);
/// `uavcan.file.Modify.1.1`
pub const FILE_MODIFY: StandardType = StandardType::new("uavcan.file.Modify", 1, 1);
/// `uavcan.file.Read.1.1`
pub const FILE_READ: StandardType = StandardType::new("uavcan.file.Read", 1, 1);
/// `uavcan.file.Write.1.1`
pub const FILE_WRITE: StandardType = StandardType::new("uavcan.file.Write", 1, 1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_standard_handle_resolves() {
        for t in [HEARTBEAT, PORT_LIST] {
            assert!(t.message().is_ok(), "{t:?}");
        }
        for t in [
            GET_INFO,
            EXECUTE_COMMAND,
            REGISTER_ACCESS,
            REGISTER_LIST,
            FILE_GET_INFO,
            FILE_LIST,
            FILE_MODIFY,
            FILE_READ,
            FILE_WRITE,
        ] {
            assert!(t.service().is_ok(), "{t:?}");
        }
    }

    #[test]
    fn kinds_are_checked() {
        assert!(matches!(HEARTBEAT.service(), Err(NodeError::WrongKind { .. })));
        assert!(matches!(GET_INFO.message(), Err(NodeError::WrongKind { .. })));
    }
}

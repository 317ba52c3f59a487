//! Error types for the node layer.

use std::path::PathBuf;

use thiserror::Error;
use yakut_common::error::YakutError;
use yakut_dsdl::DsdlError;
use yakut_transport::TransportError;

/// Errors raised by nodes, ports and the services built on them.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The transport failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A value could not be encoded or decoded, or a type was not found.
    #[error(transparent)]
    Dsdl(#[from] DsdlError),

    /// A port-ID, node-ID or other argument is out of range.
    #[error(transparent)]
    Common(#[from] YakutError),

    /// The operation needs a node-ID but the node is anonymous.
    #[error("the local node is anonymous, which cannot be used {purpose}")]
    Anonymous {
        /// What was attempted.
        purpose: String,
    },

    /// A data type was used with the wrong kind of port.
    #[error("{name} is not a {expected} type")]
    WrongKind {
        /// Full name of the type.
        name: String,
        /// `message` or `service`.
        expected: &'static str,
    },

    /// The node info document is malformed.
    #[error("node info fields are not valid: {message}")]
    InvalidNodeInfo {
        /// Description of the problem.
        message: String,
    },

    /// Heartbeat settings are out of range.
    #[error("invalid heartbeat parameters: {message}")]
    InvalidHeartbeat {
        /// Description of the problem.
        message: String,
    },

    /// A register value could not be converted.
    #[error("register value conversion failed: {message}")]
    Conversion {
        /// Description of the problem.
        message: String,
    },

    /// Subject or service resolution failed.
    #[error("{message}")]
    Resolution {
        /// Description of the problem, suitable for the user.
        message: String,
    },

    /// The node has been closed.
    #[error("the node is closed")]
    Closed,

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// JSON handling failed.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying error.
        #[from]
        source: serde_json::Error,
    },
}

impl NodeError {
    pub(crate) fn conversion(message: impl Into<String>) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    pub(crate) fn resolution(message: impl Into<String>) -> Self {
        Self::Resolution {
            message: message.into(),
        }
    }
}

/// Convenience alias for node results.
pub type Result<T> = std::result::Result<T, NodeError>;

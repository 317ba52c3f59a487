//! Transport errors.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building or using a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport expression could not be parsed.
    #[error("invalid transport expression {expression:?}: {message}")]
    InvalidExpression {
        /// The expression text.
        expression: String,
        /// What is wrong.
        message: String,
    },

    /// The requested transport kind is recognized but not available in this build.
    #[error("transport {name} is not supported; use Loopback(<node-id>)")]
    Unsupported {
        /// Transport kind, such as `UDP`.
        name: String,
    },

    /// Neither an expression nor transport registers were given.
    #[error(
        "transport not configured; use --transport, YAKUT_TRANSPORT, or the uavcan.* registers (e.g. UAVCAN__LOOPBACK=1)"
    )]
    NotConfigured,

    /// Anonymous nodes cannot take part in service exchanges.
    #[error("anonymous node cannot emit service transfers")]
    Anonymous,

    /// The transport was closed.
    #[error("transport is closed")]
    Closed,

    /// A register value has the wrong type.
    #[error("register {name} has invalid value {value:?}")]
    InvalidRegister {
        /// Register name.
        name: String,
        /// Offending text.
        value: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A transfer-ID map could not be parsed or written.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

/// Convenience alias for this crate.
pub type Result<T> = std::result::Result<T, TransportError>;

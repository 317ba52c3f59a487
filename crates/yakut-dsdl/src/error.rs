//! Error type for data type handling.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while locating, encoding or decoding data types.
#[derive(Debug, Error)]
pub enum DsdlError {
    /// The type name does not follow `namespace.Type[.major[.minor]]`.
    #[error("data type name format not understood: {name:?}")]
    InvalidName {
        /// The offending text.
        name: String,
    },

    /// No definition matches the requested name and version.
    #[error("could not locate {name}. {suggestion}")]
    UnknownType {
        /// Requested name with version wildcards.
        name: String,
        /// Hint shown to the user.
        suggestion: String,
    },

    /// The type exists in a compiled namespace but cannot be encoded.
    #[error("data type {name} is defined in a compiled namespace but has no codec")]
    NoCodec {
        /// Full name of the type.
        name: String,
    },

    /// A builtin value does not match the schema.
    #[error("invalid value at {path}: {message}")]
    Value {
        /// Dotted path of the field.
        path: String,
        /// What is wrong.
        message: String,
    },

    /// A serialized payload is malformed.
    #[error("cannot deserialize {type_name}: {message}")]
    Deserialize {
        /// Full name of the type being decoded.
        type_name: String,
        /// What is wrong.
        message: String,
    },

    /// A namespace failed validation.
    #[error("namespace error in {path}: {message}")]
    Namespace {
        /// File or directory at fault.
        path: PathBuf,
        /// What is wrong.
        message: String,
    },

    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// An index file could not be read or written.
    #[error("serialization error: {source}")]
    Serialization {
        /// Underlying serialization error.
        #[from]
        source: serde_json::Error,
    },
}

impl DsdlError {
    pub(crate) fn value(path: &str, message: impl Into<String>) -> Self {
        Self::Value {
            path: if path.is_empty() { "<root>".to_owned() } else { path.to_owned() },
            message: message.into(),
        }
    }
}

/// Convenience alias for this crate.
pub type Result<T> = std::result::Result<T, DsdlError>;

//! Error codes of `uavcan.file.Error.1.0` and the errors of the file client.

use std::fmt;
use std::io;

use thiserror::Error;
use yakut_common::types::NodeId;

use crate::error::NodeError;

/// A `uavcan.file.Error.1.0` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileErrorCode {
    /// `OK`
    Ok,
    /// `NOT_FOUND`
    NotFound,
    /// `IO_ERROR`
    IoError,
    /// `ACCESS_DENIED`
    AccessDenied,
    /// `IS_DIRECTORY`
    IsDirectory,
    /// `INVALID_VALUE`
    InvalidValue,
    /// `FILE_TOO_LARGE`
    FileTooLarge,
    /// `OUT_OF_SPACE`
    OutOfSpace,
    /// `NOT_SUPPORTED`
    NotSupported,
    /// `UNKNOWN_ERROR` and any code not listed above.
    Unknown(u16),
}

impl FileErrorCode {
    /// The numeric code.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::Ok => 0,
            Self::NotFound => 2,
            Self::IoError => 5,
            Self::AccessDenied => 13,
            Self::IsDirectory => 21,
            Self::InvalidValue => 22,
            Self::FileTooLarge => 27,
            Self::OutOfSpace => 28,
            Self::NotSupported => 38,
            Self::Unknown(c) => c,
        }
    }

    /// Decodes a numeric code.
    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        match code {
            0 => Self::Ok,
            2 => Self::NotFound,
            5 => Self::IoError,
            13 => Self::AccessDenied,
            21 => Self::IsDirectory,
            22 => Self::InvalidValue,
            27 => Self::FileTooLarge,
            28 => Self::OutOfSpace,
            38 => Self::NotSupported,
            other => Self::Unknown(other),
        }
    }

    /// Maps a local I/O failure to the closest code.
    #[must_use]
    pub fn from_io(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::PermissionDenied => Self::AccessDenied,
            io::ErrorKind::IsADirectory => Self::IsDirectory,
            io::ErrorKind::InvalidInput => Self::InvalidValue,
            io::ErrorKind::FileTooLarge => Self::FileTooLarge,
            io::ErrorKind::StorageFull => Self::OutOfSpace,
            io::ErrorKind::Unsupported => Self::NotSupported,
            _ => Self::IoError,
        }
    }

    /// The builtin `uavcan.file.Error.1.0` object.
    #[must_use]
    pub fn to_builtin(self) -> serde_json::Value {
        serde_json::json!({"value": self.code()})
    }
}

impl fmt::Display for FileErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "OK",
            Self::NotFound => "NOT_FOUND",
            Self::IoError => "IO_ERROR",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::IsDirectory => "IS_DIRECTORY",
            Self::InvalidValue => "INVALID_VALUE",
            Self::FileTooLarge => "FILE_TOO_LARGE",
            Self::OutOfSpace => "OUT_OF_SPACE",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::Unknown(_) => "UNKNOWN_ERROR",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Failures of file service requests.
#[derive(Debug, Error)]
pub enum FileServiceError {
    /// The server did not answer in time.
    #[error("request to node {node_id} timed out")]
    Timeout {
        /// Server node-ID.
        node_id: NodeId,
    },

    /// The server answered with an error code.
    #[error("node {node_id} reported {code} for {path:?}")]
    Remote {
        /// Server node-ID.
        node_id: NodeId,
        /// Reported code.
        code: FileErrorCode,
        /// Path the request was about.
        path: String,
    },

    /// A local failure.
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl FileServiceError {
    /// Whether the server reported that the path does not exist.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Remote { code: FileErrorCode::NotFound, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_and_unknown_codes_are_kept() {
        for code in [0, 2, 5, 13, 21, 22, 27, 28, 38, 65535, 1234] {
            assert_eq!(FileErrorCode::from_code(code).code(), code);
        }
        assert_eq!(FileErrorCode::from_code(65535).to_string(), "UNKNOWN_ERROR (65535)");
        assert_eq!(FileErrorCode::NotFound.to_string(), "NOT_FOUND (2)");
    }

    #[test]
    fn io_errors_map_to_codes() {
        let e = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(FileErrorCode::from_io(&e), FileErrorCode::NotFound);
        let e = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(FileErrorCode::from_io(&e), FileErrorCode::AccessDenied);
        let e = io::Error::other("boom");
        assert_eq!(FileErrorCode::from_io(&e), FileErrorCode::IoError);
    }
}

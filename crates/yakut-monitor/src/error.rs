//! Error types of the monitor.

use thiserror::Error;
use yakut_node::NodeError;

/// Convenience alias for results in this crate.
pub type Result<T> = std::result::Result<T, MonitorError>;

/// Failures that end the monitor.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// The terminal could not be driven.
    #[error("terminal error: {0}")]
    Terminal(#[from] std::io::Error),

    /// The node layer failed.
    #[error(transparent)]
    Node(#[from] NodeError),
}

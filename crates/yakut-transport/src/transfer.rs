//! Transfer model shared by all transports.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use yakut_common::types::{NodeId, Priority, ServiceId, SubjectId};

static MONOTONIC_EPOCH: OnceLock<Instant> = OnceLock::new();

/// Reception or emission time.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Timestamp {
    /// Wall clock, seconds since the Unix epoch.
    pub system: f64,
    /// Monotonic clock, seconds since the first use in this process.
    pub monotonic: f64,
}

impl Timestamp {
    /// Samples both clocks.
    #[must_use]
    pub fn now() -> Self {
        let epoch = *MONOTONIC_EPOCH.get_or_init(Instant::now);
        let system = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |d| d.as_secs_f64());
        Self {
            system,
            monotonic: epoch.elapsed().as_secs_f64(),
        }
    }
}

/// What a transfer is about and where it goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataSpecifier {
    /// Broadcast message on a subject.
    Message(SubjectId),
    /// Service request addressed to a server.
    Request {
        /// Service-ID.
        service: ServiceId,
        /// Server node-ID.
        destination: NodeId,
    },
    /// Service response addressed to a client.
    Response {
        /// Service-ID.
        service: ServiceId,
        /// Client node-ID.
        destination: NodeId,
    },
}

impl DataSpecifier {
    /// Port-ID of the subject or service.
    #[must_use]
    pub const fn port_id(&self) -> u16 {
        match self {
            Self::Message(s) => s.get(),
            Self::Request { service, .. } | Self::Response { service, .. } => service.get(),
        }
    }

    /// Whether this is a request or a response.
    #[must_use]
    pub const fn is_service(&self) -> bool {
        !matches!(self, Self::Message(_))
    }

    /// Key identifying the output session, used for transfer-ID counters.
    #[must_use]
    pub fn session_key(&self) -> String {
        match self {
            Self::Message(s) => format!("m{s}"),
            Self::Request { service, destination } => format!("q{service}:{destination}"),
            Self::Response { service, destination } => format!("r{service}:{destination}"),
        }
    }
}

impl fmt::Display for DataSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Message(s) => write!(f, "subject {s}"),
            Self::Request { service, destination } => write!(f, "request {service} to {destination}"),
            Self::Response { service, destination } => write!(f, "response {service} to {destination}"),
        }
    }
}

/// A transfer as handed to [`crate::Transport::send`].
#[derive(Debug, Clone)]
pub struct OutgoingTransfer {
    /// Priority.
    pub priority: Priority,
    /// Transfer-ID.
    pub transfer_id: u64,
    /// Destination.
    pub specifier: DataSpecifier,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

/// A transfer observed on the network.
#[derive(Debug, Clone)]
pub struct Transfer {
    /// When the transfer was seen.
    pub timestamp: Timestamp,
    /// Priority.
    pub priority: Priority,
    /// Transfer-ID.
    pub transfer_id: u64,
    /// Source node-ID; `None` for anonymous transfers.
    pub source: Option<NodeId>,
    /// What the transfer carries.
    pub specifier: DataSpecifier,
    /// Serialized payload.
    pub payload: Vec<u8>,
}

/// Protocol limits of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolParameters {
    /// Number of distinct node-IDs.
    pub node_id_cardinality: u64,
    /// Transfer-IDs wrap modulo this value.
    pub transfer_id_modulo: u64,
    /// Largest payload carried in one frame.
    pub mtu: usize,
}

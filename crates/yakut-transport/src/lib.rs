//! # yakut-transport
//!
//! The seam between Yakut and the network. A [`Transport`] moves
//! [`Transfer`]s; the only built-in implementation is an in-process loopback
//! bus. Transports are selected either by an expression such as
//! `Loopback(42)` or by the standard `uavcan.*` transport registers.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod error;
pub mod expr;
pub mod loopback;
pub mod tid_map;
pub mod transfer;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use yakut_common::types::NodeId;

pub use error::{Result, TransportError};
pub use transfer::{DataSpecifier, OutgoingTransfer, ProtocolParameters, Timestamp, Transfer};

/// A medium that carries transfers between nodes.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Node-ID of this endpoint; `None` when anonymous.
    fn local_node_id(&self) -> Option<NodeId>;

    /// Limits of the underlying protocol.
    fn protocol_parameters(&self) -> ProtocolParameters;

    /// Emits a transfer. The transport stamps the source node-ID and timestamp.
    ///
    /// # Errors
    ///
    /// Fails when the transport is closed or an anonymous node tries to use a service.
    async fn send(&self, transfer: OutgoingTransfer) -> Result<()>;

    /// Every transfer visible to this endpoint, including its own.
    fn listen(&self) -> broadcast::Receiver<Arc<Transfer>>;

    /// Number of transfers lost by slow listeners or malformed on the medium.
    fn error_count(&self) -> u64 {
        0
    }

    /// Human-readable description in expression syntax.
    fn describe(&self) -> String;

    /// Stops accepting transfers.
    async fn close(&self);
}

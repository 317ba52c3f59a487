//! # yakut-node
//!
//! The application layer Yakut commands are built on. A [`Node`] wraps a
//! transport and offers typed publishers, subscribers, RPC clients and servers
//! on top of the generic codec. Non-anonymous nodes publish a heartbeat and
//! answer `uavcan.node.GetInfo` and the register services automatically.
//!
//! Above the node sit the remote register logic, the subject and service
//! resolvers, subscription synchronizers, the node tracker and the file
//! service.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod error;
pub mod file;
pub mod info;
pub mod node;
pub mod register;
pub mod resolver;
pub mod sync;
pub mod tracker;
pub mod types;

pub use error::{NodeError, Result};
pub use info::NodeInfo;
pub use node::{Client, HeartbeatSettings, Node, NodeSettings, Publisher, Subscriber, TransferMeta};
pub use register::{Register, RegisterValue, Registry};

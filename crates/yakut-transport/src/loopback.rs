//! In-process loopback transport.
//!
//! All loopback endpoints attached to the same named bus share one broadcast
//! channel, so nodes created within one process can talk to each other and
//! every endpoint also observes its own transfers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use yakut_common::types::NodeId;

use crate::error::{Result, TransportError};
use crate::transfer::{OutgoingTransfer, ProtocolParameters, Timestamp, Transfer};
use crate::Transport;

/// Name of the bus used when none is given.
pub const DEFAULT_BUS: &str = "default";

/// Transfers buffered per listener before the oldest are dropped.
const BUS_CAPACITY: usize = 4096;

static BUSES: LazyLock<Mutex<HashMap<String, broadcast::Sender<Arc<Transfer>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn bus(name: &str) -> broadcast::Sender<Arc<Transfer>> {
    let mut buses = BUSES.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    buses
        .entry(name.to_owned())
        .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
        .clone()
}

/// An endpoint on a named loopback bus.
#[derive(Debug)]
pub struct LoopbackTransport {
    node_id: Option<NodeId>,
    bus_name: String,
    sender: broadcast::Sender<Arc<Transfer>>,
    closed: AtomicBool,
    sent: AtomicU64,
}

impl LoopbackTransport {
    /// Attaches to the bus `bus_name`, creating it on first use.
    #[must_use]
    pub fn new(node_id: Option<NodeId>, bus_name: &str) -> Self {
        tracing::debug!(node_id = ?node_id, bus = bus_name, "loopback transport attached");
        Self {
            node_id,
            bus_name: bus_name.to_owned(),
            sender: bus(bus_name),
            closed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
        }
    }

    /// Name of the bus.
    #[must_use]
    pub fn bus_name(&self) -> &str {
        &self.bus_name
    }

    /// Number of transfers emitted by this endpoint.
    #[must_use]
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn local_node_id(&self) -> Option<NodeId> {
        self.node_id
    }

    fn protocol_parameters(&self) -> ProtocolParameters {
        ProtocolParameters {
            node_id_cardinality: 1 << 16,
            transfer_id_modulo: u64::MAX,
            mtu: usize::MAX,
        }
    }

    async fn send(&self, transfer: OutgoingTransfer) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if self.node_id.is_none() && transfer.specifier.is_service() {
            return Err(TransportError::Anonymous);
        }
        let observed = Transfer {
            timestamp: Timestamp::now(),
            priority: transfer.priority,
            transfer_id: transfer.transfer_id,
            source: self.node_id,
            specifier: transfer.specifier,
            payload: transfer.payload,
        };
        tracing::trace!(specifier = %observed.specifier, transfer_id = observed.transfer_id, "loopback send");
        // Having no listeners is not an error.
        let _ = self.sender.send(Arc::new(observed));
        let _ = self.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn listen(&self) -> broadcast::Receiver<Arc<Transfer>> {
        self.sender.subscribe()
    }

    fn describe(&self) -> String {
        let id = self.node_id.map_or_else(|| "None".to_owned(), |n| n.to_string());
        if self.bus_name == DEFAULT_BUS {
            format!("Loopback({id})")
        } else {
            format!("Loopback({id}, {:?})", self.bus_name)
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        tracing::debug!(bus = %self.bus_name, "loopback transport closed");
    }
}

#[cfg(test)]
mod tests {
    use yakut_common::types::{Priority, ServiceId, SubjectId};

    use super::*;
    use crate::transfer::DataSpecifier;

    fn message(payload: &[u8]) -> OutgoingTransfer {
        OutgoingTransfer {
            priority: Priority::Nominal,
            transfer_id: 3,
            specifier: DataSpecifier::Message(SubjectId::new(100).expect("subject")),
            payload: payload.to_vec(),
        }
    }

    #[tokio::test]
    async fn endpoints_on_same_bus_see_each_other() {
        let a = LoopbackTransport::new(Some(NodeId::new(1)), "lb-test-shared");
        let b = LoopbackTransport::new(Some(NodeId::new(2)), "lb-test-shared");
        let mut rx = b.listen();
        a.send(message(b"hi")).await.expect("send");
        let got = rx.recv().await.expect("recv");
        assert_eq!(got.source, Some(NodeId::new(1)));
        assert_eq!(got.payload, b"hi");
        assert_eq!(got.transfer_id, 3);
        assert_eq!(a.sent_count(), 1);
    }

    #[tokio::test]
    async fn separate_buses_are_isolated() {
        let a = LoopbackTransport::new(Some(NodeId::new(1)), "lb-test-x");
        let b = LoopbackTransport::new(Some(NodeId::new(2)), "lb-test-y");
        let mut rx = b.listen();
        a.send(message(b"x")).await.expect("send");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn anonymous_endpoint_cannot_send_requests() {
        let a = LoopbackTransport::new(None, "lb-test-anon");
        let request = OutgoingTransfer {
            specifier: DataSpecifier::Request {
                service: ServiceId::new(430).expect("service"),
                destination: NodeId::new(1),
            },
            ..message(&[])
        };
        assert!(matches!(a.send(request).await, Err(TransportError::Anonymous)));
        assert!(a.send(message(&[])).await.is_ok());
    }

    #[tokio::test]
    async fn closed_endpoint_rejects_sends() {
        let a = LoopbackTransport::new(Some(NodeId::new(9)), "lb-test-closed");
        a.close().await;
        assert!(matches!(a.send(message(&[])).await, Err(TransportError::Closed)));
    }

    #[test]
    fn describe_uses_expression_syntax() {
        assert_eq!(LoopbackTransport::new(Some(NodeId::new(42)), DEFAULT_BUS).describe(), "Loopback(42)");
        assert_eq!(LoopbackTransport::new(None, "bench").describe(), "Loopback(None, \"bench\")");
    }
}

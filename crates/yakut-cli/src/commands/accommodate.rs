//! `yakut accommodate` — Find a node-ID that no online node is using.

use std::collections::BTreeSet;
use std::time::Duration;

use clap::Args;
use rand::Rng;
use rand::seq::IteratorRandom;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use yakut_common::types::NodeId;
use yakut_node::tracker::Heartbeat;
use yakut_node::types;
use yakut_transport::{DataSpecifier, Transport};

use crate::context::{Context, run_async};
use crate::ui;

/// Longest heartbeat period a compliant node may use.
const HEARTBEAT_MAX_PERIOD: Duration = Duration::from_secs(1);
/// Heartbeat mode `INITIALIZATION`.
const MODE_INITIALIZATION: u8 = 1;
/// Above this, the set is too large to enumerate.
const HUGE_CARDINALITY: u64 = 1 << 24;
/// Above this, node-ID zero is avoided.
const ZERO_UNSAFE_CARDINALITY: u64 = 1000;

/// Arguments for the `accommodate` command.
#[derive(Args, Debug)]
#[command(after_help = "\
Listens to heartbeats for a few seconds and prints a random node-ID that none of the online nodes
uses. Listening is extended while any node is still initializing. This is not a substitute for
plug-and-play allocation: two instances run at once may pick the same value.

Example:
    export UAVCAN__CAN__NODE_ID=$(yakut accommodate)")]
pub struct AccommodateArgs {}

/// The node-IDs still free.
#[derive(Debug, Clone)]
struct Candidates {
    cardinality: u64,
    free: BTreeSet<u16>,
}

impl Candidates {
    fn new(cardinality: u64, local: Option<NodeId>) -> Self {
        let top = u16::try_from(cardinality.saturating_sub(1)).unwrap_or(u16::MAX);
        let mut free: BTreeSet<u16> = (0..=top).collect();
        if let Some(local) = local {
            let _ = free.remove(&local.get());
        }
        if cardinality > ZERO_UNSAFE_CARDINALITY {
            tracing::debug!("node-ID zero excluded to avoid platform-specific issues");
            let _ = free.remove(&0);
        }
        Self { cardinality, free }
    }

    /// Marks `nid` as occupied; returns how long to keep listening if it was
    /// newly seen.
    fn observe(&mut self, nid: NodeId, mode: u8) -> Option<Duration> {
        if !self.free.remove(&nid.get()) {
            return None;
        }
        let factor = if mode == MODE_INITIALIZATION { 3 } else { 1 };
        Some(HEARTBEAT_MAX_PERIOD * factor)
    }

    fn pick(&self, rng: &mut impl Rng) -> anyhow::Result<u16> {
        self.free.iter().copied().choose(rng).ok_or_else(|| {
            anyhow::anyhow!("All {} of the available node-ID values are occupied", self.cardinality)
        })
    }
}

/// Any node-ID of a set too large to track.
fn pick_unobserved(cardinality: u64, rng: &mut impl Rng) -> u64 {
    rng.gen_range(0..cardinality)
}

async fn listen(transport: &dyn Transport, candidates: &mut Candidates) -> anyhow::Result<()> {
    let dtype = types::HEARTBEAT.load()?;
    let schema = types::message_schema(&dtype)?;
    let subject = dtype.fixed_port_id().unwrap_or_default();
    let mut rx = transport.listen();
    let mut deadline = Instant::now() + HEARTBEAT_MAX_PERIOD * 2;
    loop {
        let transfer = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_) | Ok(Err(RecvError::Closed)) => break,
            Ok(Err(RecvError::Lagged(n))) => {
                tracing::warn!(lost = n, "listener lagged behind");
                continue;
            }
            Ok(Ok(t)) => t,
        };
        if !matches!(transfer.specifier, DataSpecifier::Message(s) if s.get() == subject) {
            continue;
        }
        let Ok(msg) = yakut_dsdl::deserialize(&schema, &transfer.payload) else {
            tracing::debug!(source = ?transfer.source, "malformed heartbeat ignored");
            continue;
        };
        let Some(nid) = transfer.source else {
            tracing::warn!(%msg, "an anonymous node publishes heartbeats, which is non-compliant");
            continue;
        };
        if let Some(advance) = candidates.observe(nid, Heartbeat::from_builtin(&msg).mode) {
            deadline = deadline.max(Instant::now() + advance);
            tracing::debug!(
                node_id = %nid,
                left = candidates.free.len(),
                cardinality = candidates.cardinality,
                "deadline advanced by {advance:?}"
            );
        }
    }
    Ok(())
}

/// Executes the `accommodate` command.
///
/// # Errors
///
/// Returns an error if the transport cannot be constructed or every
/// node-ID is taken.
pub fn execute(_args: AccommodateArgs, ctx: &Context) -> anyhow::Result<()> {
    let pick = run_async(async {
        let transport = ctx.make_transport()?;
        let cardinality = transport.protocol_parameters().node_id_cardinality;
        let result = if cardinality > HUGE_CARDINALITY {
            Ok(pick_unobserved(cardinality, &mut rand::thread_rng()))
        } else {
            let mut candidates = Candidates::new(cardinality, transport.local_node_id());
            let listened = listen(transport.as_ref(), &mut candidates).await;
            listened.and_then(|()| candidates.pick(&mut rand::thread_rng()).map(u64::from)).inspect(|pick| {
                tracing::info!(free = candidates.free.len(), cardinality, pick, "node-ID chosen");
            })
        };
        transport.close().await;
        result
    })?;
    ui::emit(&format!("{pick}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn local_and_zero_are_excluded() {
        let c = Candidates::new(128, Some(NodeId::new(5)));
        assert_eq!(c.free.len(), 127);
        assert!(c.free.contains(&0));
        assert!(!c.free.contains(&5));

        let c = Candidates::new(65536, None);
        assert_eq!(c.free.len(), 65535);
        assert!(!c.free.contains(&0));
    }

    #[test]
    fn initializing_nodes_extend_listening() {
        let mut c = Candidates::new(128, None);
        assert_eq!(c.observe(NodeId::new(3), 0), Some(Duration::from_secs(1)));
        assert_eq!(c.observe(NodeId::new(3), 0), None);
        assert_eq!(c.observe(NodeId::new(4), MODE_INITIALIZATION), Some(Duration::from_secs(3)));
    }

    #[test]
    fn pick_is_free_and_exhaustion_fails() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut c = Candidates::new(4, None);
        for nid in [0, 1, 3] {
            let _ = c.observe(NodeId::new(nid), 0);
        }
        assert_eq!(c.pick(&mut rng).expect("one left"), 2);
        let _ = c.observe(NodeId::new(2), 0);
        let err = c.pick(&mut rng).expect_err("none left");
        assert_eq!(err.to_string(), "All 4 of the available node-ID values are occupied");
    }

    #[test]
    fn huge_sets_reach_past_32_bits() {
        let mut rng = StdRng::seed_from_u64(7);
        let cardinality = 1_u64 << 48;
        let picks: Vec<u64> = (0..16).map(|_| pick_unobserved(cardinality, &mut rng)).collect();
        assert!(picks.iter().all(|&p| p < cardinality));
        assert!(picks.iter().any(|&p| p > u64::from(u32::MAX)));
    }
}

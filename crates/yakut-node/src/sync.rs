//! Subscription synchronizers.
//!
//! A synchronizer receives messages from several subscribers, one slot per
//! subscriber, and emits groups. A group has the same number of slots as there
//! are subscribers; slots without a message are `None`.

use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use yakut_common::types::NodeId;
use yakut_dsdl::{DataType, FieldType};

use crate::error::{NodeError, Result};
use crate::node::{Subscriber, TransferMeta};

/// A received message with its metadata.
pub type Sample = (Value, TransferMeta);

/// One output of a synchronizer, indexed like the subscribers.
pub type Group = Vec<Option<Sample>>;

/// Tolerance limits of the field-based monotonic clustering.
pub const FIELD_TOLERANCE_MINMAX: (f64, f64) = (1e-6, 10.0);
/// Tolerance limits of the arrival-based monotonic clustering.
pub const ARRIVAL_TOLERANCE_MINMAX: (f64, f64) = (0.02, 60.0);

/// Clusters kept open at once before the oldest are dropped.
const MAX_OPEN_CLUSTERS: usize = 15;

/// Full name of the timestamp type the field clustering relies on.
const TIMESTAMP_TYPE: &str = "uavcan.time.SynchronizedTimestamp";

/// Collects messages into groups.
pub trait Synchronizer: Send {
    /// Accepts a message from subscriber `index` and returns the groups that
    /// became complete.
    fn push(&mut self, index: usize, sample: Sample) -> Vec<Group>;
}

/// Emits each message alone; the other slots are empty. With a single
/// subscriber this is the unary synchronizer.
#[derive(Debug, Clone, Copy)]
pub struct AsyncSync {
    width: usize,
}

impl AsyncSync {
    /// A synchronizer over `width` subscribers.
    #[must_use]
    pub const fn new(width: usize) -> Self {
        Self { width }
    }

    /// A synchronizer for exactly one subscriber.
    ///
    /// # Errors
    ///
    /// Fails if `width` is not one.
    pub fn unary(width: usize) -> Result<Self> {
        if width != 1 {
            return Err(NodeError::resolution(format!(
                "Unary synchronizer requires exactly one subscriber; got {width}"
            )));
        }
        Ok(Self { width })
    }
}

impl Synchronizer for AsyncSync {
    fn push(&mut self, index: usize, sample: Sample) -> Vec<Group> {
        let mut group: Group = vec![None; self.width];
        if let Some(slot) = group.get_mut(index) {
            *slot = Some(sample);
        }
        vec![group]
    }
}

struct Cluster<K> {
    key: K,
    slots: Group,
}

impl<K> Cluster<K> {
    fn is_complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }
}

/// Groups messages that share the source node-ID and the transfer-ID.
pub struct TransferIdSync {
    width: usize,
    clusters: VecDeque<Cluster<(Option<NodeId>, u64)>>,
}

impl TransferIdSync {
    /// A synchronizer over `width` subscribers.
    #[must_use]
    pub const fn new(width: usize) -> Self {
        Self {
            width,
            clusters: VecDeque::new(),
        }
    }
}

impl Synchronizer for TransferIdSync {
    fn push(&mut self, index: usize, sample: Sample) -> Vec<Group> {
        let key = (sample.1.source_node_id, sample.1.transfer_id);
        let pos = self
            .clusters
            .iter()
            .position(|c| c.key == key && c.slots.get(index).is_some_and(Option::is_none));
        let pos = pos.unwrap_or_else(|| {
            self.clusters.push_back(Cluster {
                key,
                slots: vec![None; self.width],
            });
            if self.clusters.len() > MAX_OPEN_CLUSTERS {
                let _ = self.clusters.pop_front();
            }
            self.clusters.len() - 1
        });
        if let Some(slot) = self.clusters.get_mut(pos).and_then(|c| c.slots.get_mut(index)) {
            *slot = Some(sample);
        }
        if self.clusters.get(pos).is_some_and(Cluster::is_complete) {
            let done = self.clusters.drain(..=pos).last().map(|c| c.slots);
            return done.into_iter().collect();
        }
        Vec::new()
    }
}

/// What the monotonic clustering synchronizer orders messages by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterKey {
    /// Local reception time.
    Arrival,
    /// The `timestamp` field of the message.
    Field,
}

impl ClusterKey {
    /// The key of `sample` in seconds.
    #[must_use]
    pub fn of(self, sample: &Sample) -> f64 {
        match self {
            Self::Arrival => sample.1.timestamp.monotonic,
            Self::Field => {
                #[allow(clippy::cast_precision_loss)]
                let us = sample
                    .0
                    .pointer("/timestamp/microsecond")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as f64;
                us * 1e-6
            }
        }
    }

    /// Tolerance limits for this key.
    #[must_use]
    pub const fn minmax(self) -> (f64, f64) {
        match self {
            Self::Arrival => ARRIVAL_TOLERANCE_MINMAX,
            Self::Field => FIELD_TOLERANCE_MINMAX,
        }
    }
}

/// Checks that every type has a `timestamp` field of the synchronized timestamp type.
///
/// # Errors
///
/// Names the first type that lacks it.
pub fn require_timestamp_field<'a>(dtypes: impl IntoIterator<Item = &'a DataType>) -> Result<()> {
    for dt in dtypes {
        let ok = dt.message_schema().is_some_and(|schema| {
            schema.fields().iter().any(|f| {
                f.name == "timestamp" && matches!(&f.ty, FieldType::Composite(c) if c.name() == TIMESTAMP_TYPE)
            })
        });
        if !ok {
            return Err(NodeError::resolution(format!(
                "Synchronization on timestamp field is not possible for {} because there is no such field \
                 or its type is not {TIMESTAMP_TYPE}",
                dt.full_name()
            )));
        }
    }
    Ok(())
}

/// Tolerance from a user option: NaN asks for autotuning within `minmax`,
/// any other value is fixed.
#[must_use]
pub const fn tolerance_range(value: f64, minmax: (f64, f64)) -> (f64, f64) {
    if value.is_nan() { minmax } else { (value, value) }
}

/// Groups messages whose keys lie within a tolerance of each other, never
/// going back in time. The tolerance adapts to half the interval between
/// consecutive groups, clamped to the configured range.
pub struct MonoclustSync {
    width: usize,
    key: ClusterKey,
    minmax: (f64, f64),
    tolerance: f64,
    prev_key: Option<f64>,
    clusters: Vec<Cluster<f64>>,
}

impl MonoclustSync {
    /// A synchronizer over `width` subscribers with the tolerance range `minmax`.
    #[must_use]
    pub const fn new(width: usize, key: ClusterKey, minmax: (f64, f64)) -> Self {
        Self {
            width,
            key,
            minmax,
            tolerance: minmax.1.max(minmax.0),
            prev_key: None,
            clusters: Vec::new(),
        }
    }

    /// Current tolerance in seconds.
    #[must_use]
    pub const fn tolerance(&self) -> f64 {
        self.tolerance
    }

    fn autotune(&mut self, group: &Group) {
        let keys: Vec<f64> = group.iter().flatten().map(|s| self.key.of(s)).collect();
        #[allow(clippy::cast_precision_loss)]
        let key = keys.iter().sum::<f64>() / keys.len().max(1) as f64;
        if let Some(prev) = self.prev_key {
            let proposed = (self.tolerance + (key - prev) * 0.5) * 0.5;
            self.tolerance = proposed.clamp(self.minmax.0, self.minmax.1);
        }
        tracing::info!(tolerance = self.tolerance, "tolerance autotune");
        self.prev_key = Some(key);
    }
}

impl Synchronizer for MonoclustSync {
    fn push(&mut self, index: usize, sample: Sample) -> Vec<Group> {
        let k = self.key.of(&sample);
        if self
            .prev_key
            .is_some_and(|p| k < p - self.tolerance)
        {
            tracing::debug!(key = k, "message older than the last group dropped");
            return Vec::new();
        }
        let tolerance = self.tolerance;
        let pos = self
            .clusters
            .iter()
            .position(|c| (c.key - k).abs() <= tolerance && c.slots.get(index).is_some_and(Option::is_none));
        let pos = pos.unwrap_or_else(|| {
            let at = self.clusters.partition_point(|c| c.key <= k);
            self.clusters.insert(
                at,
                Cluster {
                    key: k,
                    slots: vec![None; self.width],
                },
            );
            if self.clusters.len() > MAX_OPEN_CLUSTERS {
                let _ = self.clusters.remove(0);
                at.saturating_sub(1)
            } else {
                at
            }
        });
        if let Some(slot) = self.clusters.get_mut(pos).and_then(|c| c.slots.get_mut(index)) {
            *slot = Some(sample);
        }
        if !self.clusters.get(pos).is_some_and(Cluster::is_complete) {
            return Vec::new();
        }
        let Some(done) = self.clusters.drain(..=pos).last() else {
            return Vec::new();
        };
        self.autotune(&done.slots);
        vec![done.slots]
    }
}

/// Feeds several subscribers through a synchronizer.
pub struct SyncStream {
    rx: mpsc::Receiver<(usize, Sample)>,
    sync: Box<dyn Synchronizer>,
    ready: VecDeque<Group>,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncStream {
    /// Starts receiving from every subscriber.
    #[must_use]
    pub fn new(subscribers: Vec<Subscriber>, sync: Box<dyn Synchronizer>) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let tasks = subscribers
            .into_iter()
            .enumerate()
            .map(|(index, mut sub)| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    while let Some(sample) = sub.receive().await {
                        if tx.send((index, sample)).await.is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        Self {
            rx,
            sync,
            ready: VecDeque::new(),
            tasks,
        }
    }

    /// The next group; `None` once every subscriber has ended.
    pub async fn next(&mut self) -> Option<Group> {
        loop {
            if let Some(group) = self.ready.pop_front() {
                return Some(group);
            }
            let (index, sample) = self.rx.recv().await?;
            self.ready.extend(self.sync.push(index, sample));
        }
    }
}

impl Drop for SyncStream {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use yakut_common::types::Priority;
    use yakut_dsdl::Catalog;
    use yakut_transport::Timestamp;

    use super::*;

    fn sample(value: i64, source: u16, transfer_id: u64, arrival: f64) -> Sample {
        (
            json!({"value": value, "timestamp": {"microsecond": value}}),
            TransferMeta {
                timestamp: Timestamp {
                    system: arrival,
                    monotonic: arrival,
                },
                priority: Priority::Nominal,
                transfer_id,
                source_node_id: Some(NodeId::new(source)),
            },
        )
    }

    fn values(group: &Group) -> Vec<Option<i64>> {
        group.iter().map(|s| s.as_ref().and_then(|(v, _)| v["value"].as_i64())).collect()
    }

    #[test]
    fn async_emits_each_message_alone() {
        let mut s = AsyncSync::new(2);
        let out = s.push(1, sample(52, 10, 0, 0.0));
        assert_eq!(out.len(), 1);
        assert_eq!(values(&out[0]), vec![None, Some(52)]);
    }

    #[test]
    fn unary_requires_one_subscriber() {
        assert!(AsyncSync::unary(1).is_ok());
        assert!(AsyncSync::unary(2).is_err());
    }

    #[test]
    fn transfer_id_groups_by_source_and_transfer_id() {
        let mut s = TransferIdSync::new(2);
        assert!(s.push(0, sample(1, 10, 5, 0.0)).is_empty());
        assert!(s.push(1, sample(2, 11, 5, 0.0)).is_empty());
        let out = s.push(1, sample(3, 10, 5, 0.0));
        assert_eq!(out.len(), 1);
        assert_eq!(values(&out[0]), vec![Some(1), Some(3)]);
        assert!(s.push(0, sample(4, 11, 6, 0.0)).is_empty());
    }

    #[test]
    fn monoclust_groups_close_keys_and_autotunes() {
        let mut s = MonoclustSync::new(2, ClusterKey::Arrival, ARRIVAL_TOLERANCE_MINMAX);
        assert!((s.tolerance() - 60.0).abs() < f64::EPSILON);
        assert!(s.push(0, sample(1, 1, 0, 1.0)).is_empty());
        let out = s.push(1, sample(2, 1, 0, 1.01));
        assert_eq!(values(&out[0]), vec![Some(1), Some(2)]);
        assert!(s.push(0, sample(3, 1, 0, 2.0)).is_empty());
        let out = s.push(1, sample(4, 1, 0, 2.0));
        assert_eq!(values(&out[0]), vec![Some(3), Some(4)]);
        // (60 + (2.0 - 1.005) / 2) / 2
        assert!((s.tolerance() - 30.248_75).abs() < 1e-9, "{}", s.tolerance());
    }

    #[test]
    fn monoclust_fixed_tolerance_separates_distant_messages() {
        let mut s = MonoclustSync::new(2, ClusterKey::Field, tolerance_range(0.5, FIELD_TOLERANCE_MINMAX));
        assert!(s.push(0, sample(1_000_000, 1, 0, 0.0)).is_empty());
        assert!(s.push(1, sample(3_000_000, 1, 0, 0.0)).is_empty());
        let out = s.push(1, sample(1_200_000, 1, 0, 0.0));
        assert_eq!(values(&out[0]), vec![Some(1_000_000), Some(1_200_000)]);
        assert!((s.tolerance() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn tolerance_range_autotunes_on_nan() {
        assert_eq!(tolerance_range(f64::NAN, (1.0, 2.0)), (1.0, 2.0));
        assert_eq!(tolerance_range(0.3, (1.0, 2.0)), (0.3, 0.3));
    }

    #[test]
    fn timestamp_field_is_required() {
        let cat = Catalog::standard();
        let sample_type = cat.require("uavcan.si.sample.length.Scalar", 1, 0).expect("type");
        let unit_type = cat.require("uavcan.si.unit.length.Scalar", 1, 0).expect("type");
        assert!(require_timestamp_field([sample_type.as_ref()]).is_ok());
        let err = require_timestamp_field([sample_type.as_ref(), unit_type.as_ref()]).expect_err("no field");
        assert!(err.to_string().contains("uavcan.si.unit.length.Scalar.1.0"), "{err}");
    }
}

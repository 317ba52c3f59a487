//! Traffic statistics per node and port.
//!
//! Counters grow with every transfer; once per refresh period the deltas are
//! turned into rates and smoothed with a moving average.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use yakut_transport::{DataSpecifier, Transfer};

use crate::model::NodeKey;

/// Refresh period of the monitor.
pub const PERIOD: Duration = Duration::from_secs(2);

/// Duration of the moving average window.
pub const AVERAGING_WINDOW: Duration = Duration::from_secs(10);

/// A port as seen in traffic; requests and responses are kept apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortKey {
    /// Messages on a subject.
    Subject(u16),
    /// Requests to a service.
    Request(u16),
    /// Responses from a service.
    Response(u16),
}

impl PortKey {
    /// The port a transfer belongs to.
    #[must_use]
    pub const fn of(specifier: &DataSpecifier) -> Self {
        match specifier {
            DataSpecifier::Message(s) => Self::Subject(s.get()),
            DataSpecifier::Request { service, .. } => Self::Request(service.get()),
            DataSpecifier::Response { service, .. } => Self::Response(service.get()),
        }
    }

    /// Service-ID, for requests and responses.
    #[must_use]
    pub const fn service(self) -> Option<u16> {
        match self {
            Self::Subject(_) => None,
            Self::Request(s) | Self::Response(s) => Some(s),
        }
    }
}

/// A session: who emitted what.
pub type Session = (NodeKey, PortKey);

/// A pair of transfer and byte quantities.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Load {
    /// Transfers.
    pub transfers: f64,
    /// Payload bytes.
    pub bytes: f64,
}

impl std::ops::AddAssign for Load {
    fn add_assign(&mut self, rhs: Self) {
        self.transfers += rhs.transfers;
        self.bytes += rhs.bytes;
    }
}

/// Rates over the averaging window plus which sessions were active during
/// the last period.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Traffic {
    /// Averaged per-second rates per session.
    pub rates: BTreeMap<Session, Load>,
    /// Sessions that emitted anything since the previous sample.
    pub recent: BTreeMap<Session, u64>,
}

impl Traffic {
    /// Rate of one session.
    #[must_use]
    pub fn rate(&self, node: NodeKey, port: PortKey) -> Load {
        self.rates.get(&(node, port)).copied().unwrap_or_default()
    }

    /// Whether the session emitted anything during the last period.
    #[must_use]
    pub fn is_recent(&self, node: NodeKey, port: PortKey) -> bool {
        self.recent.get(&(node, port)).is_some_and(|n| *n > 0)
    }

    /// Sum of the rates of the sessions matching `pred`.
    pub fn total(&self, mut pred: impl FnMut(&Session) -> bool) -> Load {
        let mut out = Load::default();
        for (k, v) in &self.rates {
            if pred(k) {
                out += *v;
            }
        }
        out
    }

    /// Whether any session matching `pred` was active during the last period.
    pub fn any_recent(&self, mut pred: impl FnMut(&Session) -> bool) -> bool {
        self.recent.iter().any(|(k, n)| *n > 0 && pred(k))
    }
}

/// Moving average of sparse samples over a fixed number of periods.
#[derive(Debug, Clone)]
struct MovingAverage {
    depth: usize,
    samples: VecDeque<BTreeMap<Session, Load>>,
}

impl MovingAverage {
    fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            samples: VecDeque::new(),
        }
    }

    fn update(&mut self, sample: BTreeMap<Session, Load>) {
        if self.samples.len() >= self.depth {
            let _ = self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    #[allow(clippy::cast_precision_loss)]
    fn compute(&self) -> BTreeMap<Session, Load> {
        let mut sum: BTreeMap<Session, Load> = BTreeMap::new();
        for sample in &self.samples {
            for (k, v) in sample {
                *sum.entry(*k).or_default() += *v;
            }
        }
        let n = self.samples.len().max(1) as f64;
        for v in sum.values_mut() {
            v.transfers /= n;
            v.bytes /= n;
        }
        sum
    }
}

/// Transfer and byte counters per session.
#[derive(Debug, Clone)]
pub struct TrafficStats {
    counts: BTreeMap<Session, (u64, u64)>,
    previous: BTreeMap<Session, (u64, u64)>,
    average: MovingAverage,
}

impl Default for TrafficStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficStats {
    /// Counters averaged over [`AVERAGING_WINDOW`] sampled every [`PERIOD`].
    #[must_use]
    pub fn new() -> Self {
        let depth = (AVERAGING_WINDOW.as_secs_f64() / PERIOD.as_secs_f64()).round();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let depth = (depth as usize).max(2);
        Self {
            counts: BTreeMap::new(),
            previous: BTreeMap::new(),
            average: MovingAverage::new(depth),
        }
    }

    /// Counts one transfer.
    pub fn count(&mut self, transfer: &Transfer) {
        let key = (NodeKey::from(transfer.source), PortKey::of(&transfer.specifier));
        let c = self.counts.entry(key).or_default();
        c.0 += 1;
        c.1 += transfer.payload.len() as u64;
    }

    /// Turns the counts since the previous sample into rates, given the
    /// seconds elapsed.
    #[allow(clippy::cast_precision_loss)]
    pub fn sample(&mut self, dt: f64) -> Traffic {
        let dt = if dt > 0.0 { dt } else { PERIOD.as_secs_f64() };
        let mut deltas = BTreeMap::new();
        let mut rates = BTreeMap::new();
        for (k, (t, b)) in &self.counts {
            let (pt, pb) = self.previous.get(k).copied().unwrap_or_default();
            let (dt_x, db) = (t - pt, b - pb);
            let _ = deltas.insert(*k, dt_x);
            let _ = rates.insert(
                *k,
                Load {
                    transfers: dt_x as f64 / dt,
                    bytes: db as f64 / dt,
                },
            );
        }
        self.previous.clone_from(&self.counts);
        self.average.update(rates);
        Traffic {
            rates: self.average.compute(),
            recent: deltas,
        }
    }
}

#[cfg(test)]
mod tests {
    use yakut_common::types::{NodeId, Priority, ServiceId, SubjectId};
    use yakut_transport::Timestamp;

    use super::*;

    fn transfer(source: Option<u16>, specifier: DataSpecifier, size: usize) -> Transfer {
        Transfer {
            timestamp: Timestamp::now(),
            priority: Priority::Nominal,
            transfer_id: 0,
            source: source.map(NodeId::new),
            specifier,
            payload: vec![0; size],
        }
    }

    #[test]
    fn rates_are_averaged_over_the_window() {
        let subject = DataSpecifier::Message(SubjectId::new(10).unwrap());
        let mut stats = TrafficStats::new();
        for _ in 0..4 {
            stats.count(&transfer(Some(1), subject, 10));
        }
        let t = stats.sample(2.0);
        let key = (NodeKey::Node(NodeId::new(1)), PortKey::Subject(10));
        assert!((t.rates[&key].transfers - 2.0).abs() < 1e-9);
        assert!((t.rates[&key].bytes - 20.0).abs() < 1e-9);
        assert!(t.is_recent(key.0, key.1));

        let t = stats.sample(2.0);
        assert!((t.rates[&key].transfers - 1.0).abs() < 1e-9);
        assert!(!t.is_recent(key.0, key.1));
    }

    #[test]
    fn sessions_are_split_by_role_and_source() {
        let service = ServiceId::new(430).unwrap();
        let mut stats = TrafficStats::new();
        stats.count(&transfer(Some(1), DataSpecifier::Request { service, destination: NodeId::new(2) }, 0));
        stats.count(&transfer(Some(2), DataSpecifier::Response { service, destination: NodeId::new(1) }, 100));
        stats.count(&transfer(None, DataSpecifier::Message(SubjectId::new(5).unwrap()), 1));
        let t = stats.sample(1.0);
        assert!((t.rate(NodeKey::Node(NodeId::new(2)), PortKey::Response(430)).bytes - 100.0).abs() < 1e-9);
        assert!(t.is_recent(NodeKey::Anonymous, PortKey::Subject(5)));
        let services = t.total(|(_, p)| p.service() == Some(430));
        assert!((services.transfers - 2.0).abs() < 1e-9);
        assert!(t.any_recent(|(n, _)| *n == NodeKey::Anonymous));
    }
}

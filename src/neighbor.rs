//! Neighbor records.
//!
//! The neighbor table owns one record per one-hop neighbor. Entries appear
//! lazily on the first packet seen from (or queued to) a node; creation
//! fires an ARP-add callback so the network interface can route replies.
//! Send and receive windows refer to neighbors by id and keep their own
//! state behind their own locks, so the table mutex is held only briefly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::clock::MonoTime;
use crate::estimator::Ema;
use crate::packet::NodeId;
use crate::seq::Seq;

/// Number of received-timestamp pairs retained per neighbor for time sync.
const TIMESTAMP_LOG: usize = 16;

/// Initial state given to newly discovered neighbors.
#[derive(Debug, Clone)]
pub struct NeighborDefaults {
    /// Initial ACK-delay estimate.
    pub ack_delay: Duration,
    /// Initial retransmission timeout.
    pub retransmission_delay: Duration,
    /// Initial MCS table index.
    pub mcsidx: usize,
}

/// Per-neighbor state shared across the link core.
#[derive(Debug)]
pub struct Neighbor {
    /// Node id.
    pub id: NodeId,
    /// Multiplicative (linear) TX gain toward this neighbor.
    pub gain: f32,
    /// Current MCS table index for transmissions to this neighbor.
    pub mcsidx: usize,
    /// Next sequence number to assign to this neighbor.
    pub seq: Seq,
    /// EMA of the observed ACK round trip, in seconds.
    pub ack_delay: Ema,
    /// Current retransmission timeout, in seconds.
    pub retransmission_delay: f64,
    /// The neighbor advertised itself as a gateway.
    pub is_gateway: bool,
    /// The neighbor is currently able to transmit (it holds TX slots).
    pub can_transmit: bool,
    /// When we last heard any valid frame from this neighbor.
    pub last_seen: Option<MonoTime>,
    /// Recent `(t_sent, t_recv)` timestamp pairs for external time sync.
    pub timestamps: Vec<(MonoTime, MonoTime)>,
}

impl Neighbor {
    fn new(id: NodeId, defaults: &NeighborDefaults) -> Neighbor {
        Neighbor {
            id,
            gain: 1.0,
            mcsidx: defaults.mcsidx,
            seq: Seq::default(),
            ack_delay: Ema::new(0.5, defaults.ack_delay.as_secs_f64()),
            retransmission_delay: defaults.retransmission_delay.as_secs_f64(),
            is_gateway: false,
            can_transmit: true,
            last_seen: None,
            timestamps: Vec::new(),
        }
    }

    /// Record a timestamp pair heard from this neighbor.
    pub fn record_timestamp(&mut self, t_sent: MonoTime, t_recv: MonoTime) {
        if self.timestamps.len() >= TIMESTAMP_LOG {
            self.timestamps.remove(0);
        }
        self.timestamps.push((t_sent, t_recv));
    }

    /// The most recently heard timestamp pair.
    pub fn last_timestamp(&self) -> Option<(MonoTime, MonoTime)> {
        self.timestamps.last().copied()
    }
}

/// The table of known neighbors, including the local node.
pub struct NeighborTable {
    me: NodeId,
    defaults: NeighborDefaults,
    nodes: Mutex<HashMap<NodeId, Arc<Mutex<Neighbor>>>>,
    arp_add: Mutex<Option<Arc<dyn Fn(NodeId) + Send + Sync>>>,
}

impl NeighborTable {
    /// Create a table containing only the local node.
    pub fn new(me: NodeId, defaults: NeighborDefaults) -> NeighborTable {
        let mut nodes = HashMap::new();
        nodes.insert(me, Arc::new(Mutex::new(Neighbor::new(me, &defaults))));

        NeighborTable {
            me,
            defaults,
            nodes: Mutex::new(nodes),
            arp_add: Mutex::new(None),
        }
    }

    /// Install the callback fired when a new neighbor is discovered.
    pub fn on_discover(&self, f: Arc<dyn Fn(NodeId) + Send + Sync>) {
        *self.arp_add.lock() = Some(f);
    }

    /// The local node id.
    pub fn me(&self) -> NodeId {
        self.me
    }

    /// The local node's record.
    pub fn me_entry(&self) -> Arc<Mutex<Neighbor>> {
        self.entry(self.me)
    }

    /// True if `id` is already known.
    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.lock().contains_key(&id)
    }

    /// Look up a neighbor without creating it.
    pub fn get(&self, id: NodeId) -> Option<Arc<Mutex<Neighbor>>> {
        self.nodes.lock().get(&id).cloned()
    }

    /// Look up a neighbor, creating it on first contact.
    pub fn entry(&self, id: NodeId) -> Arc<Mutex<Neighbor>> {
        let created;
        let entry = {
            let mut nodes = self.nodes.lock();
            match nodes.get(&id) {
                Some(n) => {
                    created = false;
                    n.clone()
                }
                None => {
                    created = true;
                    let n = Arc::new(Mutex::new(Neighbor::new(id, &self.defaults)));
                    nodes.insert(id, n.clone());
                    n
                }
            }
        };

        if created {
            info!("ARQ: discovered neighbor: node={}", id);
            let arp = self.arp_add.lock().clone();
            if let Some(arp) = arp {
                arp(id);
            }
        }

        entry
    }

    /// All known node ids.
    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.nodes.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// The elected time master: the lowest-id gateway, if any gateway is
    /// known.
    pub fn time_master(&self) -> Option<NodeId> {
        self.nodes
            .lock()
            .iter()
            .filter(|(_, n)| n.lock().is_gateway)
            .map(|(id, _)| *id)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> NeighborDefaults {
        NeighborDefaults {
            ack_delay: Duration::from_millis(100),
            retransmission_delay: Duration::from_millis(500),
            mcsidx: 0,
        }
    }

    #[test]
    fn test_lazy_creation_fires_arp() {
        let table = NeighborTable::new(1, defaults());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        table.on_discover(Arc::new(move |id| seen2.lock().push(id)));

        assert!(!table.contains(2));
        table.entry(2);
        assert!(table.contains(2));
        // Re-lookup does not re-fire
        table.entry(2);

        assert_eq!(&*seen.lock(), &[2]);
    }

    #[test]
    fn test_time_master_is_lowest_gateway() {
        let table = NeighborTable::new(5, defaults());
        assert_eq!(table.time_master(), None);

        table.entry(9).lock().is_gateway = true;
        assert_eq!(table.time_master(), Some(9));

        table.entry(3).lock().is_gateway = true;
        assert_eq!(table.time_master(), Some(3));
    }

    #[test]
    fn test_timestamp_log_is_bounded() {
        let table = NeighborTable::new(1, defaults());
        let entry = table.entry(2);
        let mut n = entry.lock();

        for i in 0..40 {
            let t = MonoTime::from_nanos(i);
            n.record_timestamp(t, t);
        }

        assert_eq!(n.timestamps.len(), TIMESTAMP_LOG);
        assert_eq!(n.last_timestamp().unwrap().0, MonoTime::from_nanos(39));
    }
}

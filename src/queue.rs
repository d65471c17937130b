//! The outbound network queue.
//!
//! A blocking FIFO between the network interface and the controller's
//! `pull` path. Control packets (ACKs, NAKs, HELLOs, retransmissions) are
//! inserted at high priority ahead of ordinary traffic. A per-destination
//! gate lets the controller pause delivery for a neighbor whose send window
//! is full; gated packets stay queued, in order, until the window reopens.

use std::collections::{HashSet, VecDeque};

use parking_lot::{Condvar, Mutex};

use crate::packet::{NetPacket, NodeId, BROADCAST};

#[derive(Default)]
struct State {
    hi: VecDeque<NetPacket>,
    lo: VecDeque<NetPacket>,
    closed: HashSet<NodeId>,
    done: bool,
}

impl State {
    /// Index of the first deliverable low-priority packet.
    ///
    /// Broadcast and control-only packets are never gated; data packets are
    /// gated while their destination's send window is closed.
    fn next_lo(&self) -> Option<usize> {
        self.lo.iter().position(|pkt| {
            pkt.hdr.nexthop == BROADCAST
                || pkt.data_len() == 0
                || !self.closed.contains(&pkt.hdr.nexthop)
        })
    }
}

/// Blocking outbound packet queue with priority insert and per-destination
/// gating.
pub struct NetQueue {
    state: Mutex<State>,
    cond: Condvar,
}

impl Default for NetQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NetQueue {
    /// Create an empty queue.
    pub fn new() -> NetQueue {
        NetQueue {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
        }
    }

    /// Enqueue an ordinary packet at the back.
    pub fn push(&self, pkt: NetPacket) {
        let mut state = self.state.lock();
        state.lo.push_back(pkt);
        drop(state);
        self.cond.notify_one();
    }

    /// Enqueue a high-priority packet at the very front.
    pub fn push_hi_front(&self, pkt: NetPacket) {
        let mut state = self.state.lock();
        state.hi.push_front(pkt);
        drop(state);
        self.cond.notify_one();
    }

    /// Enqueue a high-priority packet behind other high-priority packets.
    pub fn push_hi_back(&self, pkt: NetPacket) {
        let mut state = self.state.lock();
        state.hi.push_back(pkt);
        drop(state);
        self.cond.notify_one();
    }

    /// Dequeue the next deliverable packet, blocking until one is available
    /// or the queue is stopped.
    pub fn pop(&self) -> Option<NetPacket> {
        let mut state = self.state.lock();

        loop {
            if let Some(pkt) = state.hi.pop_front() {
                return Some(pkt);
            }
            if let Some(idx) = state.next_lo() {
                return state.lo.remove(idx);
            }
            if state.done {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Dequeue without blocking.
    pub fn try_pop(&self) -> Option<NetPacket> {
        let mut state = self.state.lock();
        if let Some(pkt) = state.hi.pop_front() {
            return Some(pkt);
        }
        state.next_lo().and_then(|idx| state.lo.remove(idx))
    }

    /// Open or close delivery of data packets for a destination.
    pub fn set_send_window_status(&self, node: NodeId, open: bool) {
        let mut state = self.state.lock();
        let changed = if open {
            state.closed.remove(&node)
        } else {
            state.closed.insert(node)
        };
        drop(state);

        if open && changed {
            self.cond.notify_all();
        }
    }

    /// Number of queued packets, deliverable or not.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.hi.len() + state.lo.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the queue; blocked and future `pop` calls drain what remains
    /// and then return `None`.
    pub fn stop(&self) {
        self.state.lock().done = true;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn data_pkt(dest: NodeId, tag: u8) -> NetPacket {
        NetPacket::data(1, dest, Bytes::copy_from_slice(&[tag]))
    }

    #[test]
    fn test_priority_order() {
        let q = NetQueue::new();
        q.push(data_pkt(2, 0));
        q.push_hi_back(data_pkt(2, 1));
        q.push_hi_front(data_pkt(2, 2));

        assert_eq!(q.pop().unwrap().data[0], 2);
        assert_eq!(q.pop().unwrap().data[0], 1);
        assert_eq!(q.pop().unwrap().data[0], 0);
    }

    #[test]
    fn test_gating_skips_closed_destination() {
        let q = NetQueue::new();
        q.set_send_window_status(2, false);
        q.push(data_pkt(2, 0));
        q.push(data_pkt(3, 1));

        // Node 2 is gated, so node 3's packet comes out first
        assert_eq!(q.try_pop().unwrap().data[0], 1);
        assert!(q.try_pop().is_none());

        q.set_send_window_status(2, true);
        assert_eq!(q.try_pop().unwrap().data[0], 0);
    }

    #[test]
    fn test_control_and_broadcast_bypass_gate() {
        let q = NetQueue::new();
        q.set_send_window_status(2, false);

        q.push(NetPacket::control(1, 2));
        assert!(q.try_pop().is_some());

        q.push(NetPacket::broadcast(1));
        assert!(q.try_pop().is_some());
    }

    #[test]
    fn test_stop_unblocks_pop() {
        let q = std::sync::Arc::new(NetQueue::new());

        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.pop());

        std::thread::sleep(std::time::Duration::from_millis(20));
        q.stop();
        assert!(handle.join().unwrap().is_none());
    }

    #[test]
    fn test_stop_drains_remaining() {
        let q = NetQueue::new();
        q.push(data_pkt(2, 0));
        q.stop();
        assert!(q.pop().is_some());
        assert!(q.pop().is_none());
    }
}

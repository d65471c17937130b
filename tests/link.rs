//! End-to-end ARQ scenarios over a perfect in-memory channel.
//!
//! Two controllers are wired back to back: packets pulled from one side
//! are serialized, re-parsed as radio packets and fed to the other side's
//! `received`, exactly as the demodulator callback would. Timer-driven
//! behavior is quieted with long delays except where a test exercises it.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use slotlink::arq::Controller;
use slotlink::clock::MonoClock;
use slotlink::neighbor::NeighborTable;
use slotlink::packet::{CtrlMsg, NetPacket, NodeId, RadioPacket};
use slotlink::phy::McsTable;
use slotlink::queue::NetQueue;
use slotlink::seq::Seq;
use slotlink::LinkConfig;

/// Samples of a full-MTU packet at any MCS, for PER window sizing.
const PACKET_SAMPS: usize = 1508;

struct Node {
    ctrl: Arc<Controller>,
    neighbors: Arc<NeighborTable>,
    delivered: Arc<Mutex<Vec<RadioPacket>>>,
}

impl Node {
    fn new(id: NodeId, cfg: LinkConfig) -> Node {
        let cfg = Arc::new(cfg);

        let table = Arc::new(
            McsTable::new(
                cfg.mcs_table.clone(),
                cfg.evm_thresholds.clone(),
                vec![PACKET_SAMPS; cfg.mcs_table.len()],
            )
            .unwrap(),
        );

        let neighbors = Arc::new(NeighborTable::new(id, cfg.neighbor_defaults()));
        let netq = Arc::new(NetQueue::new());
        let ctrl = Controller::new(cfg, table, neighbors.clone(), netq).unwrap();

        // Ten full-size packets per slot
        ctrl.set_tx_slot_samps(10 * PACKET_SAMPS);

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        ctrl.clone()
            .start(Box::new(move |pkt| sink.lock().push(pkt)));

        Node { ctrl, neighbors, delivered }
    }

    fn delivered_seqs(&self) -> Vec<u16> {
        self.delivered.lock().iter().map(|p| p.hdr.seq.0).collect()
    }

    fn push_data(&self, dest: NodeId, payload: &[u8]) {
        let me = self.neighbors.me();
        self.ctrl
            .push_net(NetPacket::data(me, dest, Bytes::copy_from_slice(payload)));
    }
}

/// A configuration whose timers never fire within a test.
fn quiet_cfg() -> LinkConfig {
    LinkConfig {
        hello_interval: Duration::ZERO,
        ack_delay: Duration::from_secs(10),
        sack_delay: Duration::from_secs(1),
        retransmission_delay: Duration::from_secs(10),
        min_retransmission_delay: Duration::from_secs(10),
        ..LinkConfig::default()
    }
}

/// Re-parse an outbound packet as the receiver's demodulator would see it.
fn as_radio(pkt: &NetPacket) -> RadioPacket {
    let mut radio =
        RadioPacket::parse(pkt.hdr, &pkt.payload_bytes()).expect("well-formed payload");
    radio.timestamp = MonoClock::now();
    radio.evm = -20.0;
    radio.rssi = -40.0;
    radio
}

/// An outbound packet whose payload failed its check at the receiver.
fn as_corrupt_radio(pkt: &NetPacket) -> RadioPacket {
    let mut radio = RadioPacket::header_only(pkt.hdr, true);
    radio.timestamp = MonoClock::now();
    radio.evm = -6.0;
    radio.rssi = -40.0;
    radio
}

/// Move every queued outbound packet from `from` to `to` over a lossless
/// channel. Returns the packets as transmitted.
fn pump(from: &Node, to: &Node) -> Vec<NetPacket> {
    let mut sent = Vec::new();

    while !from.ctrl.netq().is_empty() {
        let Some(pkt) = from.ctrl.pull() else { break };
        from.ctrl.transmitted(&pkt);
        to.ctrl.received(as_radio(&pkt));
        sent.push(pkt);
    }

    sent
}

fn count_naks(pkts: &[NetPacket]) -> usize {
    pkts.iter()
        .flat_map(|p| p.ctrl_iter())
        .filter(|m| matches!(m, CtrlMsg::Nak(_)))
        .count()
}

#[test]
fn test_clean_two_node_exchange() {
    let n1 = Node::new(1, quiet_cfg());
    let n2 = Node::new(2, quiet_cfg());

    for i in 0..10u8 {
        n1.push_data(2, &[i; 64]);
    }

    let sent = pump(&n1, &n2);
    assert_eq!(sent.len(), 10);
    assert!(sent[0].hdr.flags.syn());

    // Node 2 delivered all ten, in order
    assert_eq!(n2.delivered_seqs(), (0..10).collect::<Vec<u16>>());

    // The SYN triggered an immediate ACK; return it
    let acks = pump(&n2, &n1);
    assert!(!acks.is_empty());

    let sendw = n1.ctrl.send_window(2);
    let sw = sendw.lock();
    assert_eq!(sw.unack, Seq(10));
    assert_eq!(sw.per_end, Seq(10));

    // Every transmission scored as a success, none as a failure
    assert_eq!(sw.long_per.nsamples(), 10);
    assert_eq!(sw.long_per.value(), 0.0);
    assert_eq!(sw.short_per.value(), 0.0);
}

#[test]
fn test_single_loss_with_nak() {
    let cfg = LinkConfig {
        enforce_ordering: true,
        demod_always_ordered: true,
        ..quiet_cfg()
    };
    let n1 = Node::new(1, cfg.clone());
    let n2 = Node::new(2, cfg);

    for i in 0..10u8 {
        n1.push_data(2, &[i; 64]);
    }

    // Deliver all ten, but seq 3 arrives with a corrupt payload
    while !n1.ctrl.netq().is_empty() {
        let pkt = n1.ctrl.pull().unwrap();
        n1.ctrl.transmitted(&pkt);
        if pkt.hdr.seq == Seq(3) {
            n2.ctrl.received(as_corrupt_radio(&pkt));
        } else {
            n2.ctrl.received(as_radio(&pkt));
        }
    }

    // In-order delivery stalls at the hole
    assert_eq!(n2.delivered_seqs(), vec![0, 1, 2]);

    // Node 2's feedback carries exactly one explicit NAK for seq 3
    let feedback = pump(&n2, &n1);
    assert_eq!(count_naks(&feedback), 1);
    assert!(feedback
        .iter()
        .flat_map(|p| p.ctrl_iter())
        .any(|m| m == CtrlMsg::Nak(Seq(3))));

    // Node 1 retransmits seq 3 and nothing else
    let retrans = pump(&n1, &n2);
    assert_eq!(retrans.len(), 1);
    assert_eq!(retrans[0].hdr.seq, Seq(3));
    assert!(retrans[0].internal.retransmission);

    // Seq 3 is delivered after 2, then the parked tail drains in order
    assert_eq!(n2.delivered_seqs(), (0..10).collect::<Vec<u16>>());
}

#[test]
fn test_window_reopens_after_ack() {
    let cfg = LinkConfig {
        max_sendwin: 2,
        move_along: false,
        ..quiet_cfg()
    };
    let n1 = Node::new(1, cfg.clone());
    let n2 = Node::new(2, cfg);

    for i in 0..3u8 {
        n1.push_data(2, &[i; 32]);
    }

    let p0 = n1.ctrl.pull().unwrap();
    let p1 = n1.ctrl.pull().unwrap();
    assert_eq!(p0.hdr.seq, Seq(0));
    assert_eq!(p1.hdr.seq, Seq(1));

    // The window is full: the third packet is gated, not deliverable
    assert!(n1.ctrl.netq().try_pop().is_none());
    assert_eq!(n1.ctrl.netq().len(), 1);

    // ACK both in-flight packets
    n1.ctrl.transmitted(&p0);
    n1.ctrl.transmitted(&p1);
    n2.ctrl.received(as_radio(&p0));
    n2.ctrl.received(as_radio(&p1));
    pump(&n2, &n1);

    {
        let sendw = n1.ctrl.send_window(2);
        assert_eq!(sendw.lock().unack, Seq(2));
    }

    // The gate lifted; the third packet gets the next sequence
    let p2 = n1.ctrl.pull().unwrap();
    assert_eq!(p2.hdr.seq, Seq(2));
}

#[test]
fn test_mcs_steps_down_under_loss() {
    let cfg = LinkConfig {
        mcsidx_init: 3,
        short_per_nslots: 1,
        selective_ack_feedback_delay: Duration::ZERO,
        ..quiet_cfg()
    };
    let n1 = Node::new(1, cfg);
    let n2 = Node::new(2, quiet_cfg());

    for i in 0..20u8 {
        n1.push_data(2, &[i; 64]);
    }

    let sent = pump(&n1, &n2);
    assert_eq!(sent.len(), 20);
    assert_eq!(sent[1].mcsidx, 3);

    // Feedback reporting every odd sequence received, every even one lost
    let mut fb = NetPacket::control(2, 1);
    fb.hdr.flags.set_ack(true);
    fb.ack = Seq(0);
    for odd in (1..20u16).step_by(2) {
        fb.append_ctrl(CtrlMsg::SelectiveAck {
            begin: Seq(odd),
            end: Seq(odd + 1),
        });
    }
    n1.ctrl.received(as_radio(&fb));

    let sendw = n1.ctrl.send_window(2);
    let sw = sendw.lock();

    // Half the window failed: the MCS dropped and re-entry to level 3 got
    // harder
    assert!(sw.short_per.nsamples() == 0, "estimators reset by the move");
    assert!(sw.mcsidx < 3);
    assert!((sw.mcsidx_prob[3] - 0.5).abs() < 1e-9);

    // The gap packets were queued for retransmission
    assert!(!n1.ctrl.netq().is_empty());
}

#[test]
fn test_syn_restart_resets_receive_window() {
    let cfg = LinkConfig {
        recvwin: 8,
        ..quiet_cfg()
    };
    let n1 = Node::new(1, cfg.clone());
    let n2 = Node::new(2, cfg.clone());

    for i in 0..5u8 {
        n1.push_data(2, &[i; 32]);
    }
    pump(&n1, &n2);
    pump(&n2, &n1);
    assert_eq!(n2.delivered_seqs(), vec![0, 1, 2, 3, 4]);

    // The sender restarts: a SYN arrives with a sequence far outside the
    // receive window
    let restarted = Node::new(1, cfg);
    {
        let sendw = restarted.ctrl.send_window(2);
        let mut sw = sendw.lock();
        sw.unack = Seq(40);
        sw.max = Seq(39);
    }
    restarted.neighbors.entry(2).lock().seq = Seq(40);
    restarted.push_data(2, &[9; 32]);

    let sent = pump(&restarted, &n2);
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].hdr.seq, Seq(40));
    assert!(sent[0].hdr.flags.syn());

    // The old window was discarded and the packet delivered from the new
    // one
    assert_eq!(n2.delivered_seqs().last(), Some(&40));

    // The restart provoked an immediate full ACK for the new window
    let acks = pump(&n2, &restarted);
    assert!(acks.iter().any(|p| p.hdr.flags.ack() && p.ack == Seq(41)));
}

#[test]
fn test_window_of_one_holds_syn_until_acked() {
    let cfg = LinkConfig {
        max_sendwin: 1,
        ..quiet_cfg()
    };
    let n1 = Node::new(1, cfg.clone());
    let n2 = Node::new(2, cfg);

    n1.push_data(2, &[1; 32]);
    n1.push_data(2, &[2; 32]);

    let p0 = n1.ctrl.pull().unwrap();
    assert!(p0.hdr.flags.syn());

    // No second packet is pulled while the SYN is unacknowledged
    assert!(n1.ctrl.netq().try_pop().is_none());

    n1.ctrl.transmitted(&p0);
    n2.ctrl.received(as_radio(&p0));
    pump(&n2, &n1);

    let p1 = n1.ctrl.pull().unwrap();
    assert_eq!(p1.hdr.seq, Seq(1));
}

#[test]
fn test_zero_retransmissions_drops_on_first_timeout() {
    let cfg = LinkConfig {
        max_retransmissions: Some(0),
        retransmission_delay: Duration::from_millis(40),
        min_retransmission_delay: Duration::from_millis(40),
        retransmission_delay_slop: 0.0,
        hello_interval: Duration::ZERO,
        ack_delay: Duration::from_secs(10),
        sack_delay: Duration::from_secs(1),
        ..LinkConfig::default()
    };
    let n1 = Node::new(1, cfg);
    let n2 = Node::new(2, quiet_cfg());

    n1.push_data(2, &[1; 32]);
    n1.push_data(2, &[2; 32]);

    // Open the window: send and ACK the SYN without arming its timer
    let p0 = n1.ctrl.pull().unwrap();
    n2.ctrl.received(as_radio(&p0));
    pump(&n2, &n1);

    // The second packet's retransmission timer fires with no ACK in sight
    let p1 = n1.ctrl.pull().unwrap();
    assert_eq!(p1.hdr.seq, Seq(1));
    n1.ctrl.transmitted(&p1);

    std::thread::sleep(Duration::from_millis(150));

    let sendw = n1.ctrl.send_window(2);
    let sw = sendw.lock();

    // Dropped, not retransmitted: the window slid past it and nothing was
    // re-queued
    assert!(!sw.entry(Seq(1)).occupied());
    assert_eq!(sw.unack, Seq(2));
    assert!(sw.locally_updated);
    assert!(n1.ctrl.netq().try_pop().is_none());

    // The drop was scored as a failure
    assert!(sw.short_per.value() > 0.0);
}

#[test]
fn test_hello_advertises_gateway() {
    let n1 = Node::new(1, quiet_cfg());
    let n2 = Node::new(2, quiet_cfg());

    n1.neighbors.me_entry().lock().is_gateway = true;
    n1.ctrl.broadcast_hello();

    let sent = pump(&n1, &n2);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].hdr.flags.broadcast());

    let nbr = n2.neighbors.get(1).expect("neighbor discovered");
    assert!(nbr.lock().is_gateway);
    assert_eq!(n2.neighbors.time_master(), Some(1));
}

#[test]
fn test_broadcast_data_is_delivered_without_arq() {
    let n1 = Node::new(1, quiet_cfg());
    let n2 = Node::new(2, quiet_cfg());

    let me = n1.neighbors.me();
    let mut pkt = NetPacket::data(me, slotlink::packet::BROADCAST, Bytes::from_static(b"hi"));
    pkt.hdr.flags.set_broadcast(true);
    n1.ctrl.push_net(pkt);

    let sent = pump(&n1, &n2);
    assert_eq!(sent.len(), 1);

    // Delivered immediately, no window state created, nothing to ACK
    assert_eq!(n2.delivered.lock().len(), 1);
    assert!(n2.ctrl.netq().is_empty());
}

#[test]
fn test_duplicate_is_not_delivered_twice() {
    let n1 = Node::new(1, quiet_cfg());
    let n2 = Node::new(2, quiet_cfg());

    n1.push_data(2, &[7; 32]);
    let p0 = n1.ctrl.pull().unwrap();

    n2.ctrl.received(as_radio(&p0));
    n2.ctrl.received(as_radio(&p0));

    assert_eq!(n2.delivered.lock().len(), 1);
}

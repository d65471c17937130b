//! Packet types flowing through the link core.
//!
//! A [`NetPacket`] is born at the network interface, is assigned a sequence
//! number and control messages while the controller holds the send-window
//! lock, moves through the modulator into a slot, and is dropped when the
//! slot is transmitted. Its IP payload is a cheaply-cloneable [`Bytes`] so
//! the send window and the modulator pipeline can observe the same bytes
//! without copying.
//!
//! A [`RadioPacket`] is born in the demodulator callback and is either
//! delivered upstream once or parked in a receive-window slot until
//! delivery or expiry.

pub mod ctrl;
pub mod header;

use bytes::Bytes;

use crate::clock::MonoTime;
use crate::seq::Seq;

pub use ctrl::{CtrlIter, CtrlMsg, WireTime};
pub use header::{ExtendedHeader, Flags, Header, NodeId, BROADCAST};

/// Internal (non-wire) packet flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct InternalFlags {
    /// A sequence number has been assigned.
    pub has_seq: bool,
    /// This transmission is a retransmission.
    pub retransmission: bool,
    /// The synthesizer should stamp this packet with its transmission time.
    pub is_timestamp: bool,
    /// A selective ACK was appended; confirming transmission cancels the
    /// receive window's SACK timer.
    pub has_selective_ack: bool,
}

/// An outbound packet.
#[derive(Debug, Clone)]
pub struct NetPacket {
    /// PHY frame header.
    pub hdr: Header,
    /// Originating node.
    pub src: NodeId,
    /// Final destination node.
    pub dest: NodeId,
    /// Sequence number being cumulatively ACK'ed, valid when the ack flag
    /// is set.
    pub ack: Seq,
    /// Encoded control messages.
    ctrl: Vec<u8>,
    /// IP payload.
    pub data: Bytes,
    /// Index into the MCS table to modulate with.
    pub mcsidx: usize,
    /// Multiplicative (linear) TX gain.
    pub gain: f32,
    /// Delivery deadline, if the source imposed one.
    pub deadline: Option<MonoTime>,
    /// Internal flags.
    pub internal: InternalFlags,
}

impl NetPacket {
    /// Create a data packet destined for `dest`.
    pub fn data(src: NodeId, dest: NodeId, data: Bytes) -> NetPacket {
        let mut hdr = Header {
            curhop: src,
            nexthop: dest,
            ..Header::default()
        };
        hdr.flags.set_has_data(!data.is_empty());
        if dest == BROADCAST {
            hdr.flags.set_broadcast(true);
        }

        NetPacket {
            hdr,
            src,
            dest,
            ack: Seq::default(),
            ctrl: Vec::new(),
            data,
            mcsidx: 0,
            gain: 1.0,
            deadline: None,
            internal: InternalFlags::default(),
        }
    }

    /// Create an empty control-only packet destined for `dest`.
    ///
    /// The ACK number is filled in when the packet flows back through the
    /// controller on its way out of the radio.
    pub fn control(src: NodeId, dest: NodeId) -> NetPacket {
        NetPacket::data(src, dest, Bytes::new())
    }

    /// Create a broadcast packet.
    pub fn broadcast(src: NodeId) -> NetPacket {
        NetPacket::data(src, BROADCAST, Bytes::new())
    }

    /// Length of the IP payload.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Append a control message.
    pub fn append_ctrl(&mut self, msg: CtrlMsg) {
        msg.write(&mut self.ctrl);
        self.hdr.flags.set_has_control(true);
    }

    /// Remove the last control message, which must have been `msg`.
    ///
    /// Used by the synthesizer to undo a timestamp appended to a packet
    /// that was put back instead of committed to a slot.
    pub fn remove_last_ctrl(&mut self, msg: &CtrlMsg) {
        let len = msg.encoded_len();
        debug_assert!(self.ctrl.len() >= len);
        self.ctrl.truncate(self.ctrl.len().saturating_sub(len));
        if self.ctrl.is_empty() {
            self.hdr.flags.set_has_control(false);
        }
    }

    /// Drop all control messages.
    pub fn clear_ctrl(&mut self) {
        self.ctrl.clear();
        self.hdr.flags.set_has_control(false);
    }

    /// Iterate over the control messages.
    pub fn ctrl_iter(&self) -> CtrlIter<'_> {
        CtrlIter::new(&self.ctrl)
    }

    /// Size of the radio payload this packet will occupy on the wire.
    pub fn wire_size(&self) -> usize {
        let ctrl = if self.ctrl.is_empty() { 0 } else { 2 + self.ctrl.len() };
        ExtendedHeader::SIZE + ctrl + self.data.len()
    }

    /// Serialize the radio payload: extended header, control area, data.
    pub fn payload_bytes(&self) -> Vec<u8> {
        let ehdr = ExtendedHeader {
            src: self.src,
            dest: self.dest,
            ack: self.ack,
            data_len: self.data.len() as u16,
        };

        let mut buf = Vec::with_capacity(self.wire_size());
        buf.extend_from_slice(&ehdr.to_bytes());
        if !self.ctrl.is_empty() {
            buf.extend_from_slice(&(self.ctrl.len() as u16).to_le_bytes());
            buf.extend_from_slice(&self.ctrl);
        }
        buf.extend_from_slice(&self.data);
        buf
    }

    /// True if the packet's deadline has passed.
    pub fn deadline_passed(&self, now: MonoTime) -> bool {
        matches!(self.deadline, Some(d) if d < now)
    }

    /// True if this packet should be dropped rather than (re)sent.
    ///
    /// SYN packets are never dropped: they are needed to open the
    /// connection.
    pub fn should_drop(&self, now: MonoTime) -> bool {
        !self.hdr.flags.syn() && self.deadline_passed(now)
    }
}

/// An inbound packet as observed by the demodulator.
#[derive(Debug, Clone)]
pub struct RadioPacket {
    /// PHY frame header.
    pub hdr: Header,
    /// Originating node.
    pub src: NodeId,
    /// Final destination node.
    pub dest: NodeId,
    /// Cumulative ACK from the extended header.
    pub ack: Seq,
    /// Encoded control messages.
    ctrl: Vec<u8>,
    /// IP payload.
    pub data: Bytes,
    /// Error vector magnitude [dB].
    pub evm: f32,
    /// Received signal strength [dB].
    pub rssi: f32,
    /// Carrier frequency offset (f/Fs).
    pub cfo: f32,
    /// Channel the packet was received on.
    pub channel: usize,
    /// RX-timeline timestamp of the start of the frame.
    pub timestamp: MonoTime,
    /// MGEN flow id, when the payload carries an MGEN header.
    pub mgen_flow_uid: Option<u32>,
    /// MGEN sequence number, when the payload carries an MGEN header.
    pub mgen_seqno: Option<u32>,
    /// The frame header passed its check.
    pub header_valid: bool,
    /// The frame payload passed its check and parsed.
    pub payload_valid: bool,
}

impl RadioPacket {
    /// Construct a packet whose payload could not be recovered.
    ///
    /// Only the frame header is meaningful.
    pub fn header_only(hdr: Header, header_valid: bool) -> RadioPacket {
        RadioPacket {
            hdr,
            src: hdr.curhop,
            dest: hdr.nexthop,
            ack: Seq::default(),
            ctrl: Vec::new(),
            data: Bytes::new(),
            evm: 0.0,
            rssi: 0.0,
            cfo: 0.0,
            channel: 0,
            timestamp: MonoTime::ZERO,
            mgen_flow_uid: None,
            mgen_seqno: None,
            header_valid,
            payload_valid: false,
        }
    }

    /// Parse a recovered radio payload.
    ///
    /// Returns `None` when the payload does not hold a coherent extended
    /// header, control area and data region; the caller treats that exactly
    /// like a failed payload check.
    pub fn parse(hdr: Header, payload: &[u8]) -> Option<RadioPacket> {
        let ehdr = ExtendedHeader::from_bytes(payload)?;
        let mut rest = &payload[ExtendedHeader::SIZE..];

        let ctrl = if hdr.flags.has_control() {
            if rest.len() < 2 {
                return None;
            }
            let ctrl_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
            rest = &rest[2..];
            if rest.len() < ctrl_len {
                return None;
            }
            let ctrl = rest[..ctrl_len].to_vec();
            rest = &rest[ctrl_len..];
            ctrl
        } else {
            Vec::new()
        };

        if rest.len() < ehdr.data_len as usize {
            return None;
        }

        let mut pkt = RadioPacket::header_only(hdr, true);
        pkt.src = ehdr.src;
        pkt.dest = ehdr.dest;
        pkt.ack = ehdr.ack;
        pkt.ctrl = ctrl;
        pkt.data = Bytes::copy_from_slice(&rest[..ehdr.data_len as usize]);
        pkt.payload_valid = true;
        Some(pkt)
    }

    /// Length of the IP payload.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }

    /// Iterate over the control messages.
    pub fn ctrl_iter(&self) -> CtrlIter<'_> {
        CtrlIter::new(&self.ctrl)
    }

    /// Drop the control area, leaving only the deliverable payload.
    pub fn strip_ctrl(&mut self) {
        self.ctrl.clear();
        self.hdr.flags.set_has_control(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_roundtrip() {
        let mut pkt = NetPacket::data(1, 2, Bytes::from_static(b"payload"));
        pkt.hdr.seq = Seq(42);
        pkt.ack = Seq(7);
        pkt.hdr.flags.set_ack(true);
        pkt.append_ctrl(CtrlMsg::Nak(Seq(3)));
        pkt.append_ctrl(CtrlMsg::SelectiveAck { begin: Seq(5), end: Seq(6) });

        let wire = pkt.payload_bytes();
        assert_eq!(wire.len(), pkt.wire_size());

        let parsed = RadioPacket::parse(pkt.hdr, &wire).unwrap();
        assert_eq!(parsed.src, 1);
        assert_eq!(parsed.dest, 2);
        assert_eq!(parsed.ack, Seq(7));
        assert_eq!(&parsed.data[..], b"payload");

        let msgs: Vec<CtrlMsg> = parsed.ctrl_iter().collect();
        assert_eq!(
            msgs,
            vec![
                CtrlMsg::Nak(Seq(3)),
                CtrlMsg::SelectiveAck { begin: Seq(5), end: Seq(6) },
            ]
        );
    }

    #[test]
    fn test_zero_length_payload_roundtrip() {
        let pkt = NetPacket::control(1, 2);
        let wire = pkt.payload_bytes();
        assert_eq!(wire.len(), ExtendedHeader::SIZE);

        let parsed = RadioPacket::parse(pkt.hdr, &wire).unwrap();
        assert_eq!(parsed.data_len(), 0);
        assert_eq!(parsed.ctrl_iter().count(), 0);
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let mut pkt = NetPacket::data(1, 2, Bytes::from_static(b"payload"));
        pkt.append_ctrl(CtrlMsg::Nak(Seq(3)));

        let mut wire = pkt.payload_bytes();
        wire.truncate(wire.len() - 4);
        assert!(RadioPacket::parse(pkt.hdr, &wire).is_none());
    }

    #[test]
    fn test_remove_last_ctrl() {
        let mut pkt = NetPacket::control(1, 2);
        let ts = CtrlMsg::Timestamp {
            t_sent: WireTime { secs: 1, nanos: 0 },
        };
        pkt.append_ctrl(CtrlMsg::Nak(Seq(9)));
        pkt.append_ctrl(ts);
        pkt.remove_last_ctrl(&ts);

        let msgs: Vec<CtrlMsg> = pkt.ctrl_iter().collect();
        assert_eq!(msgs, vec![CtrlMsg::Nak(Seq(9))]);
        assert!(pkt.hdr.flags.has_control());
    }

    #[test]
    fn test_should_drop_spares_syn() {
        let now = MonoTime::from_secs_f64(10.0);

        let mut pkt = NetPacket::data(1, 2, Bytes::from_static(b"x"));
        pkt.deadline = Some(MonoTime::from_secs_f64(5.0));
        assert!(pkt.should_drop(now));

        pkt.hdr.flags.set_syn(true);
        assert!(!pkt.should_drop(now));
    }

    #[test]
    fn test_broadcast_flag() {
        let pkt = NetPacket::broadcast(4);
        assert!(pkt.hdr.flags.broadcast());
        assert_eq!(pkt.hdr.nexthop, BROADCAST);
    }
}

//! Control messages.
//!
//! Control messages are fixed-size TLVs concatenated into a packet's control
//! area. The receiver walks them with [`CtrlIter`], a lazy, restartable view
//! that never consumes the packet; the sender appends them with
//! [`CtrlWriter`] helpers on the packet types.
//!
//! Every message is a type byte followed by a type-determined payload, so
//! the stream needs no per-message length field and a truncated or unknown
//! tail simply ends iteration.

use crate::clock::MonoTime;
use crate::packet::header::NodeId;
use crate::seq::Seq;

/// A monotonic timestamp in wire form: whole seconds plus nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireTime {
    pub secs: u64,
    pub nanos: u32,
}

impl WireTime {
    const SIZE: usize = 12;

    pub fn from_mono(t: MonoTime) -> WireTime {
        let ns = t.as_nanos();
        WireTime {
            secs: ns / 1_000_000_000,
            nanos: (ns % 1_000_000_000) as u32,
        }
    }

    pub fn to_mono(self) -> MonoTime {
        MonoTime::from_nanos(self.secs * 1_000_000_000 + self.nanos as u64)
    }

    fn write(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.secs.to_le_bytes());
        out.extend_from_slice(&self.nanos.to_le_bytes());
    }

    fn read(buf: &[u8]) -> Option<WireTime> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(WireTime {
            secs: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            nanos: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        })
    }
}

/// A control message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CtrlMsg {
    /// Neighbor advertisement.
    Hello { is_gateway: bool },
    /// Transmission time of this packet at the transmitter.
    Timestamp { t_sent: WireTime },
    /// Echo of a neighbor's timestamp, sent by the time master.
    TimestampEcho {
        node: NodeId,
        t_sent: WireTime,
        t_recv: WireTime,
    },
    /// Receiver-side long-term EVM and RSSI, consumed by AMC.
    ReceiverStats { long_evm: f64, long_rssi: f64 },
    /// Explicit negative acknowledgment of one sequence number.
    Nak(Seq),
    /// Half-open range of received sequence numbers.
    SelectiveAck { begin: Seq, end: Seq },
    /// Sender's first un-ACK'ed sequence; receiver should give up on
    /// anything earlier.
    SetUnack { unack: Seq },
}

const TYPE_HELLO: u8 = 0;
const TYPE_TIMESTAMP: u8 = 1;
const TYPE_TIMESTAMP_ECHO: u8 = 2;
const TYPE_RECEIVER_STATS: u8 = 3;
const TYPE_NAK: u8 = 4;
const TYPE_SELECTIVE_ACK: u8 = 5;
const TYPE_SET_UNACK: u8 = 6;

impl CtrlMsg {
    /// Encoded size of a selective-ACK TLV; the feedback builder uses this
    /// to budget against the MTU.
    pub const SELECTIVE_ACK_SIZE: usize = 5;

    /// Encoded size of this message, including the type byte.
    pub fn encoded_len(&self) -> usize {
        match self {
            CtrlMsg::Hello { .. } => 2,
            CtrlMsg::Timestamp { .. } => 1 + WireTime::SIZE,
            CtrlMsg::TimestampEcho { .. } => 2 + 2 * WireTime::SIZE,
            CtrlMsg::ReceiverStats { .. } => 17,
            CtrlMsg::Nak(_) => 3,
            CtrlMsg::SelectiveAck { .. } => Self::SELECTIVE_ACK_SIZE,
            CtrlMsg::SetUnack { .. } => 3,
        }
    }

    /// Append the encoded message to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        match *self {
            CtrlMsg::Hello { is_gateway } => {
                out.push(TYPE_HELLO);
                out.push(is_gateway as u8);
            }
            CtrlMsg::Timestamp { t_sent } => {
                out.push(TYPE_TIMESTAMP);
                t_sent.write(out);
            }
            CtrlMsg::TimestampEcho { node, t_sent, t_recv } => {
                out.push(TYPE_TIMESTAMP_ECHO);
                out.push(node);
                t_sent.write(out);
                t_recv.write(out);
            }
            CtrlMsg::ReceiverStats { long_evm, long_rssi } => {
                out.push(TYPE_RECEIVER_STATS);
                out.extend_from_slice(&long_evm.to_le_bytes());
                out.extend_from_slice(&long_rssi.to_le_bytes());
            }
            CtrlMsg::Nak(seq) => {
                out.push(TYPE_NAK);
                out.extend_from_slice(&seq.0.to_le_bytes());
            }
            CtrlMsg::SelectiveAck { begin, end } => {
                out.push(TYPE_SELECTIVE_ACK);
                out.extend_from_slice(&begin.0.to_le_bytes());
                out.extend_from_slice(&end.0.to_le_bytes());
            }
            CtrlMsg::SetUnack { unack } => {
                out.push(TYPE_SET_UNACK);
                out.extend_from_slice(&unack.0.to_le_bytes());
            }
        }
    }

    /// Decode one message from the head of `buf`.
    ///
    /// Returns the message and its encoded length, or `None` on an unknown
    /// type or a truncated message.
    pub fn read(buf: &[u8]) -> Option<(CtrlMsg, usize)> {
        let ty = *buf.first()?;
        let body = &buf[1..];

        let msg = match ty {
            TYPE_HELLO => CtrlMsg::Hello {
                is_gateway: *body.first()? != 0,
            },
            TYPE_TIMESTAMP => CtrlMsg::Timestamp {
                t_sent: WireTime::read(body)?,
            },
            TYPE_TIMESTAMP_ECHO => {
                let node = *body.first()?;
                let t_sent = WireTime::read(&body[1..])?;
                let t_recv = WireTime::read(&body[1 + WireTime::SIZE..])?;
                CtrlMsg::TimestampEcho { node, t_sent, t_recv }
            }
            TYPE_RECEIVER_STATS => {
                if body.len() < 16 {
                    return None;
                }
                CtrlMsg::ReceiverStats {
                    long_evm: f64::from_le_bytes(body[0..8].try_into().unwrap()),
                    long_rssi: f64::from_le_bytes(body[8..16].try_into().unwrap()),
                }
            }
            TYPE_NAK => {
                if body.len() < 2 {
                    return None;
                }
                CtrlMsg::Nak(Seq(u16::from_le_bytes([body[0], body[1]])))
            }
            TYPE_SELECTIVE_ACK => {
                if body.len() < 4 {
                    return None;
                }
                CtrlMsg::SelectiveAck {
                    begin: Seq(u16::from_le_bytes([body[0], body[1]])),
                    end: Seq(u16::from_le_bytes([body[2], body[3]])),
                }
            }
            TYPE_SET_UNACK => {
                if body.len() < 2 {
                    return None;
                }
                CtrlMsg::SetUnack {
                    unack: Seq(u16::from_le_bytes([body[0], body[1]])),
                }
            }
            _ => return None,
        };

        Some((msg, msg.encoded_len()))
    }
}

/// Lazy iterator over a packet's control area.
///
/// Restartable and non-consuming: construct it as often as needed from the
/// same borrowed bytes.
#[derive(Debug, Clone)]
pub struct CtrlIter<'a> {
    buf: &'a [u8],
}

impl<'a> CtrlIter<'a> {
    /// Iterate over the control messages encoded in `buf`.
    pub fn new(buf: &'a [u8]) -> CtrlIter<'a> {
        CtrlIter { buf }
    }
}

impl Iterator for CtrlIter<'_> {
    type Item = CtrlMsg;

    fn next(&mut self) -> Option<CtrlMsg> {
        let (msg, len) = CtrlMsg::read(self.buf)?;
        self.buf = &self.buf[len..];
        Some(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msgs: &[CtrlMsg]) {
        let mut buf = Vec::new();
        for m in msgs {
            m.write(&mut buf);
        }

        let parsed: Vec<CtrlMsg> = CtrlIter::new(&buf).collect();
        assert_eq!(parsed, msgs);
    }

    #[test]
    fn test_roundtrip_all_types() {
        roundtrip(&[
            CtrlMsg::Hello { is_gateway: true },
            CtrlMsg::Timestamp {
                t_sent: WireTime { secs: 12, nanos: 345_678_901 },
            },
            CtrlMsg::TimestampEcho {
                node: 9,
                t_sent: WireTime { secs: 1, nanos: 2 },
                t_recv: WireTime { secs: 3, nanos: 4 },
            },
            CtrlMsg::ReceiverStats { long_evm: -22.5, long_rssi: -48.25 },
            CtrlMsg::Nak(Seq(3)),
            CtrlMsg::SelectiveAck { begin: Seq(5), end: Seq(9) },
            CtrlMsg::SetUnack { unack: Seq(65534) },
        ]);
    }

    #[test]
    fn test_ordering_preserved() {
        roundtrip(&[
            CtrlMsg::Nak(Seq(1)),
            CtrlMsg::SelectiveAck { begin: Seq(2), end: Seq(3) },
            CtrlMsg::SelectiveAck { begin: Seq(5), end: Seq(8) },
        ]);
    }

    #[test]
    fn test_encoded_len_matches_wire() {
        let msgs = [
            CtrlMsg::Hello { is_gateway: false },
            CtrlMsg::ReceiverStats { long_evm: 0.0, long_rssi: 0.0 },
            CtrlMsg::SelectiveAck { begin: Seq(0), end: Seq(0) },
        ];

        for m in msgs {
            let mut buf = Vec::new();
            m.write(&mut buf);
            assert_eq!(buf.len(), m.encoded_len());
        }
    }

    #[test]
    fn test_truncated_stops_iteration() {
        let mut buf = Vec::new();
        CtrlMsg::Nak(Seq(7)).write(&mut buf);
        CtrlMsg::SelectiveAck { begin: Seq(1), end: Seq(2) }.write(&mut buf);
        buf.truncate(buf.len() - 1);

        let parsed: Vec<CtrlMsg> = CtrlIter::new(&buf).collect();
        assert_eq!(parsed, vec![CtrlMsg::Nak(Seq(7))]);
    }

    #[test]
    fn test_wire_time_roundtrip() {
        let t = MonoTime::from_nanos(5_500_000_123);
        assert_eq!(WireTime::from_mono(t).to_mono(), t);
    }

    #[test]
    fn test_iterator_is_restartable() {
        let mut buf = Vec::new();
        CtrlMsg::Nak(Seq(7)).write(&mut buf);

        let iter = CtrlIter::new(&buf);
        assert_eq!(iter.clone().count(), 1);
        assert_eq!(iter.count(), 1);
    }
}

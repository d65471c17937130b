//! Fixed-layout wire headers.
//!
//! The PHY frame header carries [`Header`]: 8 bytes, small enough for the
//! codec to protect it with the header MCS. The first bytes of the payload
//! carry [`ExtendedHeader`], followed by optional control messages and then
//! `data_len` bytes of IP payload.
//!
//! # Wire format
//!
//! ```text
//! Header (8 bytes):
//! ┌─────────┬─────────┬───────────────┬────────┬───────────────┐
//! │ curhop  │ nexthop │ seq (LE)      │ flags  │ reserved      │
//! │ (1B)    │ (1B)    │ (2B)          │ (1B)   │ (3B, zero)    │
//! └─────────┴─────────┴───────────────┴────────┴───────────────┘
//!
//! ExtendedHeader (6 bytes):
//! ┌─────────┬─────────┬───────────────┬───────────────┐
//! │ src     │ dest    │ ack (LE)      │ data_len (LE) │
//! │ (1B)    │ (1B)    │ (2B)          │ (2B)          │
//! └─────────┴─────────┴───────────────┴───────────────┘
//! ```

use crate::seq::Seq;

/// An 8-bit node identifier.
pub type NodeId = u8;

/// The broadcast node id.
pub const BROADCAST: NodeId = 255;

/// Packet flags carried in the PHY frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Flags(u8);

impl Flags {
    const SYN: u8 = 1 << 0;
    const ACK: u8 = 1 << 1;
    const BROADCAST: u8 = 1 << 2;
    const HAS_DATA: u8 = 1 << 3;
    const HAS_CONTROL: u8 = 1 << 4;
    const RESERVED: u8 = 0b1110_0000;

    /// First packet of a new send-window session.
    pub fn syn(self) -> bool {
        self.0 & Self::SYN != 0
    }

    /// The extended header's ack field is meaningful.
    pub fn ack(self) -> bool {
        self.0 & Self::ACK != 0
    }

    /// Packet is addressed to every neighbor.
    pub fn broadcast(self) -> bool {
        self.0 & Self::BROADCAST != 0
    }

    /// Packet carries IP payload.
    pub fn has_data(self) -> bool {
        self.0 & Self::HAS_DATA != 0
    }

    /// Packet carries control messages.
    pub fn has_control(self) -> bool {
        self.0 & Self::HAS_CONTROL != 0
    }

    pub fn set_syn(&mut self, on: bool) {
        self.set(Self::SYN, on);
    }

    pub fn set_ack(&mut self, on: bool) {
        self.set(Self::ACK, on);
    }

    pub fn set_broadcast(&mut self, on: bool) {
        self.set(Self::BROADCAST, on);
    }

    pub fn set_has_data(&mut self, on: bool) {
        self.set(Self::HAS_DATA, on);
    }

    pub fn set_has_control(&mut self, on: bool) {
        self.set(Self::HAS_CONTROL, on);
    }

    fn set(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// Raw bits, with reserved bits cleared.
    pub fn bits(self) -> u8 {
        self.0 & !Self::RESERVED
    }

    /// Construct from raw bits; reserved bits are dropped.
    pub fn from_bits(bits: u8) -> Flags {
        Flags(bits & !Self::RESERVED)
    }
}

/// PHY frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Node that transmitted this frame.
    pub curhop: NodeId,
    /// Node this frame is addressed to.
    pub nexthop: NodeId,
    /// Sequence number.
    pub seq: Seq,
    /// Packet flags.
    pub flags: Flags,
}

impl Header {
    /// Header size on the wire.
    pub const SIZE: usize = 8;

    /// Serialize to the fixed 8-byte layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.curhop;
        buf[1] = self.nexthop;
        buf[2..4].copy_from_slice(&self.seq.0.to_le_bytes());
        buf[4] = self.flags.bits();
        buf
    }

    /// Deserialize from the fixed 8-byte layout.
    pub fn from_bytes(buf: &[u8]) -> Option<Header> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(Header {
            curhop: buf[0],
            nexthop: buf[1],
            seq: Seq(u16::from_le_bytes([buf[2], buf[3]])),
            flags: Flags::from_bits(buf[4]),
        })
    }
}

/// Extended header at the head of the radio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedHeader {
    /// Originating node.
    pub src: NodeId,
    /// Final destination node.
    pub dest: NodeId,
    /// Sequence number being cumulatively ACK'ed.
    pub ack: Seq,
    /// Length of the IP payload within the radio payload.
    pub data_len: u16,
}

impl ExtendedHeader {
    /// Extended header size on the wire.
    pub const SIZE: usize = 6;

    /// Serialize to the fixed 6-byte layout.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.src;
        buf[1] = self.dest;
        buf[2..4].copy_from_slice(&self.ack.0.to_le_bytes());
        buf[4..6].copy_from_slice(&self.data_len.to_le_bytes());
        buf
    }

    /// Deserialize from the fixed 6-byte layout.
    pub fn from_bytes(buf: &[u8]) -> Option<ExtendedHeader> {
        if buf.len() < Self::SIZE {
            return None;
        }

        Some(ExtendedHeader {
            src: buf[0],
            dest: buf[1],
            ack: Seq(u16::from_le_bytes([buf[2], buf[3]])),
            data_len: u16::from_le_bytes([buf[4], buf[5]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut flags = Flags::default();
        flags.set_syn(true);
        flags.set_ack(true);
        flags.set_has_data(true);

        let hdr = Header {
            curhop: 3,
            nexthop: 7,
            seq: Seq(0xBEEF),
            flags,
        };

        let bytes = hdr.to_bytes();
        assert_eq!(bytes.len(), Header::SIZE);

        let parsed = Header::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, hdr);
    }

    #[test]
    fn test_header_reserved_bits_dropped() {
        let mut bytes = [0u8; Header::SIZE];
        bytes[4] = 0xFF;

        let parsed = Header::from_bytes(&bytes).unwrap();
        assert!(parsed.flags.syn());
        assert!(parsed.flags.has_control());
        // Reserved bits do not survive the roundtrip
        assert_eq!(parsed.to_bytes()[4] & 0b1110_0000, 0);
    }

    #[test]
    fn test_header_too_short() {
        assert!(Header::from_bytes(&[0u8; 4]).is_none());
    }

    #[test]
    fn test_extended_header_roundtrip() {
        let ehdr = ExtendedHeader {
            src: 1,
            dest: 2,
            ack: Seq(65530),
            data_len: 0,
        };

        let parsed = ExtendedHeader::from_bytes(&ehdr.to_bytes()).unwrap();
        assert_eq!(parsed, ehdr);
    }
}

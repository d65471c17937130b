//! The network-interface collaborator and the outbound packet filter.
//!
//! Raw frames are Ethernet as read from a tap device. Node addressing is
//! by convention: the last octet of a MAC address encodes the node id, the
//! internal subnet is `10.10.10.0/24`, and each node also routes an
//! external `192.168.(100+n).0/24` subnet. The filter derives
//! `(src, dest, curhop, nexthop)` from those conventions; everything else
//! about the frame is opaque payload.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::packet::{NetPacket, NodeId, BROADCAST};

/// A raw Ethernet frame.
pub type RawFrame = Vec<u8>;

/// The OS network interface.
pub trait NetIo: Send + Sync {
    /// Maximum transfer unit of the interface.
    fn mtu(&self) -> usize;

    /// Next outbound frame, waiting up to `deadline` if given.
    fn next_outbound(&self, deadline: Option<Duration>) -> Option<RawFrame>;

    /// Hand an inbound frame to the OS.
    fn deliver(&self, frame: RawFrame);

    /// Install an ARP entry for a discovered neighbor.
    fn add_arp_entry(&self, node: NodeId, ip: Ipv4Addr);
}

const ETH_HLEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

/// The internal IP address of a node.
pub fn node_ip(node: NodeId) -> Ipv4Addr {
    Ipv4Addr::new(10, 10, 10, node)
}

/// Derive the destination node of an outbound frame.
///
/// Prefers the IPv4 destination (internal or external subnet); falls back
/// to the destination MAC's last octet.
pub fn dest_node(frame: &[u8]) -> Option<NodeId> {
    if frame.len() < ETH_HLEN {
        return None;
    }

    // Broadcast MAC
    if frame[..6] == [0xff; 6] {
        return Some(BROADCAST);
    }

    if let Some(ip) = ipv4_header(frame) {
        let dst = [ip[16], ip[17], ip[18], ip[19]];

        // Internal subnet: 10.10.10.n
        if dst[0] == 10 && dst[1] == 10 && dst[2] == 10 {
            if dst[3] == 255 {
                return Some(BROADCAST);
            }
            return Some(dst[3]);
        }

        // External subnet: 192.168.(100+n).x
        if dst[0] == 192 && dst[1] == 168 && dst[2] >= 100 {
            return Some(dst[2] - 100);
        }
    }

    Some(frame[5])
}

/// Build an outbound link packet from a raw frame.
///
/// Sets src and curhop to the local node and dest and nexthop from the
/// frame (one-hop delivery). Frames without a derivable destination are
/// dropped.
pub fn filter_outbound(me: NodeId, frame: RawFrame) -> Option<NetPacket> {
    let dest = dest_node(&frame)?;
    Some(NetPacket::data(me, dest, frame.into()))
}

/// The IPv4 header of a frame, if it is an IPv4 frame.
fn ipv4_header(frame: &[u8]) -> Option<&[u8]> {
    if frame.len() < ETH_HLEN + 20 {
        return None;
    }
    let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
    if ethertype != ETHERTYPE_IPV4 {
        return None;
    }

    let ip = &frame[ETH_HLEN..];
    if ip[0] >> 4 != 4 {
        return None;
    }
    let ihl = (ip[0] & 0x0f) as usize * 4;
    if ihl < 20 || ip.len() < ihl {
        return None;
    }

    Some(ip)
}

fn ip_proto(frame: &[u8]) -> Option<u8> {
    ipv4_header(frame).map(|ip| ip[9])
}

/// True if the frame carries TCP.
///
/// TCP payloads are never delivered out of order even when ordering is
/// not otherwise enforced.
pub fn is_tcp(frame: &[u8]) -> bool {
    ip_proto(frame) == Some(IPPROTO_TCP)
}

/// True if the frame carries UDP.
pub fn is_udp(frame: &[u8]) -> bool {
    ip_proto(frame) == Some(IPPROTO_UDP)
}

/// The UDP payload of a frame, if any.
fn udp_payload(frame: &[u8]) -> Option<&[u8]> {
    let ip = ipv4_header(frame)?;
    if ip[9] != IPPROTO_UDP {
        return None;
    }

    let ihl = (ip[0] & 0x0f) as usize * 4;
    let udp = ip.get(ihl..)?;
    udp.get(8..)
}

/// MGEN flow id and sequence number, when the frame carries an MGEN
/// payload over UDP.
pub fn mgen_info(frame: &[u8]) -> Option<(u32, u32)> {
    let payload = udp_payload(frame)?;
    if payload.len() < 12 {
        return None;
    }

    // MGEN header: messageSize, version, flags, flow id, sequence number
    let version = payload[2];
    if version != 2 && version != 4 {
        return None;
    }

    let flow = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]);
    let seqno = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
    Some((flow, seqno))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth_frame(dst_mac_last: u8, ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, dst_mac_last]);
        f.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        f.extend_from_slice(&ethertype.to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    fn ipv4_packet(proto: u8, dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[9] = proto;
        ip[12..16].copy_from_slice(&[10, 10, 10, 1]);
        ip[16..20].copy_from_slice(&dst);
        ip.extend_from_slice(payload);
        ip
    }

    #[test]
    fn test_dest_from_internal_subnet() {
        let frame = eth_frame(9, ETHERTYPE_IPV4, &ipv4_packet(IPPROTO_UDP, [10, 10, 10, 2], &[0; 8]));
        assert_eq!(dest_node(&frame), Some(2));
    }

    #[test]
    fn test_dest_from_external_subnet() {
        let frame = eth_frame(9, ETHERTYPE_IPV4, &ipv4_packet(IPPROTO_UDP, [192, 168, 103, 7], &[0; 8]));
        assert_eq!(dest_node(&frame), Some(3));
    }

    #[test]
    fn test_dest_from_mac_fallback() {
        let frame = eth_frame(4, 0x0806, &[0; 28]);
        assert_eq!(dest_node(&frame), Some(4));
    }

    #[test]
    fn test_broadcast_mac() {
        let mut frame = eth_frame(0, 0x0800, &[0; 20]);
        frame[..6].copy_from_slice(&[0xff; 6]);
        assert_eq!(dest_node(&frame), Some(BROADCAST));
    }

    #[test]
    fn test_is_tcp() {
        let tcp = eth_frame(2, ETHERTYPE_IPV4, &ipv4_packet(IPPROTO_TCP, [10, 10, 10, 2], &[0; 20]));
        let udp = eth_frame(2, ETHERTYPE_IPV4, &ipv4_packet(IPPROTO_UDP, [10, 10, 10, 2], &[0; 8]));
        assert!(is_tcp(&tcp));
        assert!(!is_tcp(&udp));
        assert!(is_udp(&udp));
        assert!(!is_tcp(b"short"));
    }

    #[test]
    fn test_filter_outbound() {
        let frame = eth_frame(9, ETHERTYPE_IPV4, &ipv4_packet(IPPROTO_UDP, [10, 10, 10, 2], &[0; 8]));
        let pkt = filter_outbound(1, frame.clone()).unwrap();

        assert_eq!(pkt.hdr.curhop, 1);
        assert_eq!(pkt.hdr.nexthop, 2);
        assert_eq!(pkt.src, 1);
        assert_eq!(pkt.dest, 2);
        assert_eq!(&pkt.data[..], &frame[..]);
        assert!(pkt.hdr.flags.has_data());
    }

    #[test]
    fn test_mgen_info() {
        let mut udp = vec![0u8; 8];
        let mut mgen = vec![0u8; 12];
        mgen[0..2].copy_from_slice(&12u16.to_be_bytes());
        mgen[2] = 2; // version
        mgen[4..8].copy_from_slice(&7u32.to_be_bytes());
        mgen[8..12].copy_from_slice(&42u32.to_be_bytes());
        udp.extend_from_slice(&mgen);

        let frame = eth_frame(2, ETHERTYPE_IPV4, &ipv4_packet(IPPROTO_UDP, [10, 10, 10, 2], &udp));
        assert_eq!(mgen_info(&frame), Some((7, 42)));

        // Wrong version byte
        let mut bad = mgen.clone();
        bad[2] = 9;
        let mut udp_bad = vec![0u8; 8];
        udp_bad.extend_from_slice(&bad);
        let frame = eth_frame(2, ETHERTYPE_IPV4, &ipv4_packet(IPPROTO_UDP, [10, 10, 10, 2], &udp_bad));
        assert_eq!(mgen_info(&frame), None);
    }

    #[test]
    fn test_node_ip() {
        assert_eq!(node_ip(7), Ipv4Addr::new(10, 10, 10, 7));
    }
}

//! Ethernet II / IPv4 / UDP framing for the capture path: layer decoding on
//! ingest, full-stack serialization with computed checksums on egress.

use std::net::Ipv4Addr;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

pub const IPPROTO_UDP: u8 = 17;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

pub const ETHER_BROADCAST: [u8; 6] = [0xff; 6];

const ETHER_HEADER_LEN: usize = 14;
const IPV4_MIN_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;

/// Ethernet II header.
#[derive(Debug, Clone, Copy)]
pub struct EtherHeader {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: u16,
}

/// Splits an Ethernet II frame into header and payload.
pub fn decode_ethernet(frame: &[u8]) -> Option<(EtherHeader, &[u8])> {
    if frame.len() < ETHER_HEADER_LEN {
        return None;
    }
    let header = EtherHeader {
        dst: frame[0..6].try_into().ok()?,
        src: frame[6..12].try_into().ok()?,
        ethertype: u16::from_be_bytes([frame[12], frame[13]]),
    };
    Some((header, &frame[ETHER_HEADER_LEN..]))
}

/// Fields of an IPv4 header the dispatcher cares about.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub protocol: u8,
}

/// Splits an IPv4 packet into header and payload, honoring IHL and the
/// total-length field (frames may carry trailing padding).
pub fn decode_ipv4(packet: &[u8]) -> Option<(Ipv4Header, &[u8])> {
    if packet.len() < IPV4_MIN_HEADER_LEN || packet[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(packet[0] & 0x0f) * 4;
    let total = usize::from(u16::from_be_bytes([packet[2], packet[3]]));
    if ihl < IPV4_MIN_HEADER_LEN || total < ihl || packet.len() < total {
        return None;
    }
    let header = Ipv4Header {
        src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
        dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        protocol: packet[9],
    };
    Some((header, &packet[ihl..total]))
}

/// UDP ports of a datagram.
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
}

/// Splits a UDP datagram into header and payload, honoring the length field.
pub fn decode_udp(datagram: &[u8]) -> Option<(UdpHeader, &[u8])> {
    if datagram.len() < UDP_HEADER_LEN {
        return None;
    }
    let len = usize::from(u16::from_be_bytes([datagram[4], datagram[5]]));
    if len < UDP_HEADER_LEN || datagram.len() < len {
        return None;
    }
    let header = UdpHeader {
        src_port: u16::from_be_bytes([datagram[0], datagram[1]]),
        dst_port: u16::from_be_bytes([datagram[2], datagram[3]]),
    };
    Some((header, &datagram[UDP_HEADER_LEN..len]))
}

/// Serializes a full Ethernet/IPv4/UDP stack around `payload`, with the IP
/// header checksum and the pseudo-header UDP checksum computed.
pub fn encode_udp_frame(
    src_mac: &[u8; 6],
    dst_mac: &[u8; 6],
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IPV4_MIN_HEADER_LEN + udp_len;

    // UDP segment with a zero checksum, patched after the pseudo-header sum.
    let mut udp = Vec::with_capacity(udp_len);
    udp.extend_from_slice(&src_port.to_be_bytes());
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend_from_slice(&(udp_len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    let udp_sum = udp_checksum(src_ip, dst_ip, &udp);
    udp[6..8].copy_from_slice(&udp_sum.to_be_bytes());

    let mut ip = Vec::with_capacity(IPV4_MIN_HEADER_LEN);
    ip.push(0x45); // version 4, IHL 5
    ip.push(0);
    ip.extend_from_slice(&(total_len as u16).to_be_bytes());
    ip.extend_from_slice(&[0, 0, 0, 0]); // id, flags, fragment offset
    ip.push(64); // TTL
    ip.push(IPPROTO_UDP);
    ip.extend_from_slice(&[0, 0]);
    ip.extend_from_slice(&src_ip.octets());
    ip.extend_from_slice(&dst_ip.octets());
    let ip_sum = checksum(&ip);
    ip[10..12].copy_from_slice(&ip_sum.to_be_bytes());

    let mut frame = Vec::with_capacity(ETHER_HEADER_LEN + total_len);
    frame.extend_from_slice(dst_mac);
    frame.extend_from_slice(src_mac);
    frame.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    frame.extend_from_slice(&ip);
    frame.extend_from_slice(&udp);
    frame
}

/// RFC 1071 ones'-complement sum over 16-bit words.
fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for c in &mut chunks {
        sum += u32::from(u16::from_be_bytes([c[0], c[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// UDP checksum over the IPv4 pseudo-header and the segment. An all-zero
/// result is transmitted as 0xFFFF (RFC 768).
fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, udp: &[u8]) -> u16 {
    let mut buf = Vec::with_capacity(12 + udp.len());
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());
    buf.push(0);
    buf.push(IPPROTO_UDP);
    buf.extend_from_slice(&(udp.len() as u16).to_be_bytes());
    buf.extend_from_slice(udp);
    match checksum(&buf) {
        0 => 0xffff,
        sum => sum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_rfc1071_example() {
        // Worked example from RFC 1071 §3.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), 0x220d);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(checksum(&[0xff]), 0x00ff);
    }

    #[test]
    fn test_frame_roundtrip() {
        let src_ip = Ipv4Addr::new(192, 168, 0, 1);
        let payload = b"hello dhcp";
        let frame = encode_udp_frame(
            &[0x02, 0, 0, 0, 0, 1],
            &ETHER_BROADCAST,
            src_ip,
            Ipv4Addr::BROADCAST,
            DHCP_SERVER_PORT,
            DHCP_CLIENT_PORT,
            payload,
        );

        let (eth, rest) = decode_ethernet(&frame).unwrap();
        assert_eq!(eth.dst, ETHER_BROADCAST);
        assert_eq!(eth.ethertype, ETHERTYPE_IPV4);

        let (ip, rest) = decode_ipv4(rest).unwrap();
        assert_eq!(ip.src, src_ip);
        assert_eq!(ip.dst, Ipv4Addr::BROADCAST);
        assert_eq!(ip.protocol, IPPROTO_UDP);

        let (udp, body) = decode_udp(rest).unwrap();
        assert_eq!(udp.src_port, DHCP_SERVER_PORT);
        assert_eq!(udp.dst_port, DHCP_CLIENT_PORT);
        assert_eq!(body, payload);
    }

    #[test]
    fn test_encoded_ip_header_checksum_verifies() {
        let frame = encode_udp_frame(
            &[2, 0, 0, 0, 0, 1],
            &ETHER_BROADCAST,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::BROADCAST,
            67,
            68,
            &[1, 2, 3],
        );
        // Summing a header over its own checksum field yields zero.
        assert_eq!(checksum(&frame[14..34]), 0);
    }

    #[test]
    fn test_decode_rejects_truncated_layers() {
        assert!(decode_ethernet(&[0u8; 10]).is_none());
        assert!(decode_ipv4(&[0x45; 10]).is_none());
        assert!(decode_udp(&[0u8; 4]).is_none());

        // IPv6 version nibble is not ours.
        let mut v6 = [0u8; 40];
        v6[0] = 0x60;
        assert!(decode_ipv4(&v6).is_none());
    }

    #[test]
    fn test_decode_ipv4_honors_total_length_padding() {
        let mut frame = encode_udp_frame(
            &[2, 0, 0, 0, 0, 1],
            &ETHER_BROADCAST,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::BROADCAST,
            68,
            67,
            &[0xAB; 8],
        );
        // Ethernet minimum-size padding after the IP datagram.
        frame.extend_from_slice(&[0u8; 12]);
        let (_, rest) = decode_ethernet(&frame).unwrap();
        let (_, udp) = decode_ipv4(rest).unwrap();
        let (_, body) = decode_udp(udp).unwrap();
        assert_eq!(body, &[0xAB; 8]);
    }
}

//! DHCPv6 ingress stub. Address-family v6 leasing is the v6 subsystem's
//! business; this path only keeps the dispatcher uniform by recognising a
//! DHCPv6 datagram and reporting it unhandled.

use crate::frame::IPPROTO_UDP;
use crate::{DhcpError, Result};

/// DHCPv6 server port.
const DHCPV6_SERVER_PORT: u16 = 547;

/// Fixed IPv6 header length; extension headers are not walked here.
const IPV6_HEADER_LEN: usize = 40;

/// Inspects an IPv6 packet; a DHCPv6 request yields a "not implemented"
/// protocol error, anything else is silently skipped.
pub(crate) fn handle_packet(packet: &[u8]) -> Result<()> {
    if packet.len() < IPV6_HEADER_LEN + 8 || packet[0] >> 4 != 6 {
        return Ok(());
    }
    let next_header = packet[6];
    if next_header != IPPROTO_UDP {
        return Ok(());
    }
    let udp = &packet[IPV6_HEADER_LEN..];
    let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
    if dst_port != DHCPV6_SERVER_PORT {
        return Ok(());
    }
    Err(DhcpError::Protocol("DHCPv6 is not implemented".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v6_udp(dst_port: u16) -> Vec<u8> {
        let mut packet = vec![0u8; IPV6_HEADER_LEN + 8];
        packet[0] = 0x60;
        packet[6] = IPPROTO_UDP;
        packet[IPV6_HEADER_LEN + 2..IPV6_HEADER_LEN + 4]
            .copy_from_slice(&dst_port.to_be_bytes());
        packet
    }

    #[test]
    fn test_dhcpv6_reports_unimplemented() {
        assert!(handle_packet(&v6_udp(547)).is_err());
    }

    #[test]
    fn test_other_v6_traffic_is_skipped() {
        assert!(handle_packet(&v6_udp(53)).is_ok());
        assert!(handle_packet(&[0u8; 10]).is_ok());
        let mut tcp = v6_udp(547);
        tcp[6] = 6;
        assert!(handle_packet(&tcp).is_ok());
    }
}

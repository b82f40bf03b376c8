//! DHCPv4 message codec (RFC 2131 fixed header plus options).

use std::net::Ipv4Addr;

use crate::lease::HwAddr;
use crate::options::{
    self, DhcpOption, OPT_HOSTNAME, OPT_MSG_TYPE, OPT_PARAM_REQUEST, OPT_REQUESTED_IP,
    OPT_SERVER_ID,
};
use crate::{DhcpError, Result};

/// DHCP magic cookie at offset 236.
pub const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;

/// htype for Ethernet (ARP hardware type 1).
pub const HTYPE_ETHERNET: u8 = 1;

/// Parsed DHCPv4 message.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

impl DhcpPacket {
    /// Parse a DHCP message from raw bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 240 {
            return Err(DhcpError::Protocol(format!(
                "DHCP message too short: {} bytes (minimum 240)",
                data.len()
            )));
        }

        if data[236..240] != MAGIC_COOKIE {
            return Err(DhcpError::Protocol("invalid DHCP magic cookie".into()));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);
        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        Ok(DhcpPacket {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            secs: u16::from_be_bytes([data[8], data[9]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            yiaddr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            siaddr: Ipv4Addr::new(data[20], data[21], data[22], data[23]),
            giaddr: Ipv4Addr::new(data[24], data[25], data[26], data[27]),
            chaddr,
            sname,
            file,
            options: options::parse_options(&data[240..]),
        })
    }

    /// Serialize to wire form, padded to the common 300-byte minimum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(576);

        buf.push(self.op);
        buf.push(self.htype);
        buf.push(self.hlen);
        buf.push(self.hops);
        buf.extend_from_slice(&self.xid.to_be_bytes());
        buf.extend_from_slice(&self.secs.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.ciaddr.octets());
        buf.extend_from_slice(&self.yiaddr.octets());
        buf.extend_from_slice(&self.siaddr.octets());
        buf.extend_from_slice(&self.giaddr.octets());
        buf.extend_from_slice(&self.chaddr);
        buf.extend_from_slice(&self.sname);
        buf.extend_from_slice(&self.file);
        buf.extend_from_slice(&MAGIC_COOKIE);
        buf.extend_from_slice(&options::encode_options(&self.options));

        while buf.len() < 300 {
            buf.push(0);
        }

        buf
    }

    /// The client hardware address, when `hlen` carries a usable length.
    pub fn hwaddr(&self) -> Option<HwAddr> {
        match self.hlen {
            6 | 8 => Some(HwAddr::new(&self.chaddr[..self.hlen as usize])),
            _ => None,
        }
    }

    /// Find an option by code.
    pub fn get_option(&self, code: u8) -> Option<&DhcpOption> {
        self.options.iter().find(|o| o.code == code)
    }

    /// DHCP message type (option 53).
    pub fn msg_type(&self) -> Option<u8> {
        self.get_option(OPT_MSG_TYPE)?.as_u8()
    }

    /// Requested IP address (option 50).
    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_REQUESTED_IP)?.as_ipv4()
    }

    /// Server identifier (option 54).
    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.get_option(OPT_SERVER_ID)?.as_ipv4()
    }

    /// Client hostname (option 12).
    pub fn hostname(&self) -> Option<String> {
        self.get_option(OPT_HOSTNAME)?.as_str()
    }

    /// Parameter request list (option 55), in the client's order.
    pub fn param_request_list(&self) -> Option<&[u8]> {
        Some(self.get_option(OPT_PARAM_REQUEST)?.data.as_slice())
    }

    /// Broadcast flag (RFC 2131 §2, FLAGS field).
    pub fn is_broadcast(&self) -> bool {
        self.flags & 0x8000 != 0
    }

    /// Build a reply echoing this request's transaction id and client
    /// hardware identity. `giaddr` is forced to zero (no relay support);
    /// the message-type option comes in via `options`.
    pub fn build_reply(
        &self,
        yiaddr: Ipv4Addr,
        ciaddr: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> DhcpPacket {
        DhcpPacket {
            op: BOOTREPLY,
            htype: self.htype,
            hlen: self.hlen,
            hops: 0,
            xid: self.xid,
            secs: 0,
            flags: self.flags,
            ciaddr,
            yiaddr,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: self.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DHCPDISCOVER, DHCPOFFER};

    fn make_discover() -> Vec<u8> {
        let mut pkt = vec![0u8; 300];
        pkt[0] = BOOTREQUEST;
        pkt[1] = HTYPE_ETHERNET;
        pkt[2] = 6;
        pkt[4..8].copy_from_slice(&0x12345678u32.to_be_bytes());
        pkt[28..34].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        pkt[236..240].copy_from_slice(&MAGIC_COOKIE);
        // Message type DISCOVER, parameter request list [1, 3].
        pkt[240..243].copy_from_slice(&[53, 1, DHCPDISCOVER]);
        pkt[243..247].copy_from_slice(&[55, 2, 1, 3]);
        pkt[247] = 255;
        pkt
    }

    #[test]
    fn test_parse_discover() {
        let pkt = DhcpPacket::parse(&make_discover()).unwrap();
        assert_eq!(pkt.op, BOOTREQUEST);
        assert_eq!(pkt.xid, 0x12345678);
        assert_eq!(pkt.hwaddr().unwrap().to_string(), "aa:bb:cc:dd:ee:ff");
        assert_eq!(pkt.msg_type(), Some(DHCPDISCOVER));
        assert_eq!(pkt.param_request_list(), Some(&[1u8, 3][..]));
    }

    #[test]
    fn test_parse_rejects_short_and_bad_cookie() {
        assert!(DhcpPacket::parse(&[0u8; 100]).is_err());
        let mut bad = make_discover();
        bad[236] = 0;
        assert!(DhcpPacket::parse(&bad).is_err());
    }

    #[test]
    fn test_roundtrip() {
        let pkt = DhcpPacket::parse(&make_discover()).unwrap();
        let reparsed = DhcpPacket::parse(&pkt.to_bytes()).unwrap();
        assert_eq!(reparsed.xid, pkt.xid);
        assert_eq!(reparsed.chaddr, pkt.chaddr);
        assert_eq!(reparsed.msg_type(), pkt.msg_type());
    }

    #[test]
    fn test_build_reply() {
        let request = DhcpPacket::parse(&make_discover()).unwrap();
        let reply = request.build_reply(
            Ipv4Addr::new(10, 0, 0, 100),
            Ipv4Addr::UNSPECIFIED,
            vec![DhcpOption::msg_type(DHCPOFFER)],
        );
        assert_eq!(reply.op, BOOTREPLY);
        assert_eq!(reply.xid, request.xid);
        assert_eq!(reply.yiaddr, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(reply.giaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(reply.msg_type(), Some(DHCPOFFER));
        assert_eq!(reply.hwaddr(), request.hwaddr());
    }

    #[test]
    fn test_hwaddr_rejects_odd_hlen() {
        let mut raw = make_discover();
        raw[2] = 11;
        let pkt = DhcpPacket::parse(&raw).unwrap();
        assert!(pkt.hwaddr().is_none());
    }
}

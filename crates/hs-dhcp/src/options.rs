//! DHCP options (RFC 2132): wire codec, the implicit host defaults and
//! per-response assembly.

use std::net::Ipv4Addr;

/// Option codes used by name in the engine.
pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_ROUTER: u8 = 3;
pub const OPT_HOSTNAME: u8 = 12;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MSG_TYPE: u8 = 53;
pub const OPT_SERVER_ID: u8 = 54;
pub const OPT_PARAM_REQUEST: u8 = 55;
pub const OPT_END: u8 = 255;
pub const OPT_PAD: u8 = 0;

/// DHCP message types (option 53 values).
pub const DHCPDISCOVER: u8 = 1;
pub const DHCPOFFER: u8 = 2;
pub const DHCPREQUEST: u8 = 3;
pub const DHCPDECLINE: u8 = 4;
pub const DHCPACK: u8 = 5;
pub const DHCPNAK: u8 = 6;
pub const DHCPRELEASE: u8 = 7;
pub const DHCPINFORM: u8 = 8;

/// Path MTU plateau table advertised in option 25.
const MTU_PLATEAU: [u16; 9] = [68, 296, 508, 1006, 1492, 2002, 4352, 8166, 17914];

/// A single DHCP option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpOption {
    pub code: u8,
    pub data: Vec<u8>,
}

impl DhcpOption {
    pub fn new(code: u8, data: Vec<u8>) -> Self {
        Self { code, data }
    }

    pub fn msg_type(t: u8) -> Self {
        Self::new(OPT_MSG_TYPE, vec![t])
    }

    pub fn server_id(ip: Ipv4Addr) -> Self {
        Self::new(OPT_SERVER_ID, ip.octets().to_vec())
    }

    pub fn lease_time(secs: u32) -> Self {
        Self::new(OPT_LEASE_TIME, secs.to_be_bytes().to_vec())
    }

    pub fn hostname(name: &str) -> Self {
        Self::new(OPT_HOSTNAME, name.as_bytes().to_vec())
    }

    /// Extract an IPv4 address from the option data.
    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        let octets: [u8; 4] = self.data.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }

    /// Extract a big-endian u32 from the option data.
    pub fn as_u32(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.data.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn as_u8(&self) -> Option<u8> {
        self.data.first().copied()
    }

    pub fn as_str(&self) -> Option<String> {
        String::from_utf8(self.data.clone()).ok()
    }
}

/// Parse DHCP options from the bytes following the magic cookie.
pub fn parse_options(data: &[u8]) -> Vec<DhcpOption> {
    let mut options = Vec::new();
    let mut i = 0;

    while i < data.len() {
        let code = data[i];
        if code == OPT_END {
            break;
        }
        if code == OPT_PAD {
            i += 1;
            continue;
        }

        i += 1;
        if i >= data.len() {
            break;
        }

        let len = data[i] as usize;
        i += 1;

        if i + len > data.len() {
            break;
        }

        options.push(DhcpOption::new(code, data[i..i + len].to_vec()));
        i += len;
    }

    options
}

/// Encode options to wire form, terminated by END.
pub fn encode_options(options: &[DhcpOption]) -> Vec<u8> {
    let mut buf = Vec::new();
    for opt in options {
        buf.push(opt.code);
        buf.push(opt.data.len() as u8);
        buf.extend_from_slice(&opt.data);
    }
    buf.push(OPT_END);
    buf
}

/// The implicit option set: RFC 2131 Appendix A host defaults plus the
/// subnet mask and router taken from configuration. Kept sorted by code.
pub fn implicit_options(mask: Ipv4Addr, router: Ipv4Addr) -> Vec<DhcpOption> {
    let plateau: Vec<u8> = MTU_PLATEAU.iter().flat_map(|v| v.to_be_bytes()).collect();

    vec![
        DhcpOption::new(OPT_SUBNET_MASK, mask.octets().to_vec()),
        DhcpOption::new(OPT_ROUTER, router.octets().to_vec()),
        DhcpOption::new(19, vec![0]),  // IP forwarding: off
        DhcpOption::new(20, vec![0]),  // non-local source routing: off
        DhcpOption::new(23, vec![64]), // default IP TTL
        DhcpOption::new(24, 600u32.to_be_bytes().to_vec()), // path MTU aging timeout
        DhcpOption::new(25, plateau),
        DhcpOption::new(26, 576u16.to_be_bytes().to_vec()), // datagram MTU
        DhcpOption::new(27, vec![0]), // all subnets are local: no
        DhcpOption::new(28, Ipv4Addr::BROADCAST.octets().to_vec()),
        DhcpOption::new(29, vec![0]), // perform mask discovery: no
        DhcpOption::new(30, vec![0]), // mask supplier: no
        DhcpOption::new(31, vec![1]), // perform router discovery: yes
        DhcpOption::new(32, Ipv4Addr::new(224, 0, 0, 2).octets().to_vec()),
        DhcpOption::new(34, vec![0]), // trailer encapsulation: no
        DhcpOption::new(35, 60u32.to_be_bytes().to_vec()), // ARP cache timeout
        DhcpOption::new(36, vec![0]), // ethernet encapsulation: no
        DhcpOption::new(37, vec![60]), // TCP default TTL
        DhcpOption::new(38, 7200u32.to_be_bytes().to_vec()), // TCP keep-alive interval
        DhcpOption::new(39, vec![1]), // TCP keep-alive garbage: yes
    ]
}

/// Folds operator options into the catalog: each operator code drops the
/// matching implicit entry; non-empty values form the explicit list, empty
/// values mark the code as suppressed in responses.
pub fn merge_explicit(
    implicit: &mut Vec<DhcpOption>,
    operator: &[DhcpOption],
) -> (Vec<DhcpOption>, Vec<u8>) {
    let mut explicit: Vec<DhcpOption> = Vec::new();
    let mut suppressed: Vec<u8> = Vec::new();

    for opt in operator {
        implicit.retain(|o| o.code != opt.code);
        explicit.retain(|o| o.code != opt.code);
        suppressed.retain(|c| *c != opt.code);
        if opt.data.is_empty() {
            suppressed.push(opt.code);
        } else {
            explicit.push(opt.clone());
        }
    }

    (explicit, suppressed)
}

/// Builds the option list for one reply: message type, server identifier,
/// the client's requested implicit options in the client's order, the
/// explicit operator options, the lease hostname when known, and the lease
/// time.
#[allow(clippy::too_many_arguments)]
pub fn assemble(
    msg_type: u8,
    server_id: Ipv4Addr,
    requested: Option<&[u8]>,
    implicit: &[DhcpOption],
    explicit: &[DhcpOption],
    suppressed: &[u8],
    hostname: Option<&str>,
    lease_secs: u32,
) -> Vec<DhcpOption> {
    let mut out = vec![DhcpOption::msg_type(msg_type), DhcpOption::server_id(server_id)];

    if let Some(codes) = requested {
        for &code in codes {
            if out.iter().any(|o| o.code == code) {
                continue;
            }
            if let Some(opt) = implicit.iter().find(|o| o.code == code) {
                out.push(opt.clone());
            }
        }
    }

    for opt in explicit {
        if out.iter().all(|o| o.code != opt.code) {
            out.push(opt.clone());
        }
    }

    out.retain(|o| !suppressed.contains(&o.code));

    match hostname {
        Some(name) if !name.is_empty() => out.push(DhcpOption::hostname(name)),
        _ => {}
    }

    out.push(DhcpOption::lease_time(lease_secs));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask() -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    fn router() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 0, 1)
    }

    #[test]
    fn test_implicit_catalog_values() {
        let opts = implicit_options(mask(), router());

        // Sorted by code, no duplicates.
        let codes: Vec<u8> = opts.iter().map(|o| o.code).collect();
        let mut sorted = codes.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(codes, sorted);

        let get = |c: u8| opts.iter().find(|o| o.code == c).unwrap();
        assert_eq!(get(1).data, vec![255, 255, 255, 0]);
        assert_eq!(get(3).data, vec![192, 168, 0, 1]);
        assert_eq!(get(26).data, vec![0x02, 0x40]); // 576
        assert_eq!(
            get(25).data,
            vec![
                0x00, 0x44, 0x01, 0x28, 0x01, 0xFC, 0x03, 0xEE, 0x05, 0xD4, 0x07, 0xD2, 0x11,
                0x00, 0x1F, 0xE6, 0x45, 0xFA,
            ]
        );
        assert_eq!(get(31).data, vec![1]);
        assert_eq!(get(32).data, vec![224, 0, 0, 2]);
        assert_eq!(get(38).data, 7200u32.to_be_bytes().to_vec());
    }

    #[test]
    fn test_merge_override_and_suppress() {
        let mut implicit = implicit_options(mask(), router());
        let operator = vec![
            DhcpOption::new(23, vec![128]), // override default TTL
            DhcpOption::new(31, vec![]),    // suppress router discovery
            DhcpOption::new(6, vec![192, 168, 0, 1]), // add DNS server
        ];

        let (explicit, suppressed) = merge_explicit(&mut implicit, &operator);

        assert!(implicit.iter().all(|o| o.code != 23 && o.code != 31));
        assert_eq!(suppressed, vec![31]);
        assert_eq!(explicit.len(), 2);
        assert_eq!(explicit[0].data, vec![128]);
        assert_eq!(explicit[1].code, 6);
    }

    #[test]
    fn test_assemble_respects_request_order() {
        let mut implicit = implicit_options(mask(), router());
        let (explicit, suppressed) = merge_explicit(&mut implicit, &[]);

        let opts = assemble(
            DHCPOFFER,
            router(),
            Some(&[3, 1, 99, 1]), // router, mask, unknown, duplicate
            &implicit,
            &explicit,
            &suppressed,
            None,
            86_400,
        );

        let codes: Vec<u8> = opts.iter().map(|o| o.code).collect();
        assert_eq!(codes, vec![OPT_MSG_TYPE, OPT_SERVER_ID, 3, 1, OPT_LEASE_TIME]);
        assert_eq!(opts.last().unwrap().data, 86_400u32.to_be_bytes().to_vec());
    }

    #[test]
    fn test_assemble_appends_explicit_and_hostname() {
        let mut implicit = implicit_options(mask(), router());
        let operator = vec![
            DhcpOption::new(6, vec![192, 168, 0, 1]),
            DhcpOption::new(28, vec![]), // suppress broadcast address
        ];
        let (explicit, suppressed) = merge_explicit(&mut implicit, &operator);

        let opts = assemble(
            DHCPACK,
            router(),
            Some(&[28]),
            &implicit,
            &explicit,
            &suppressed,
            Some("printer"),
            3600,
        );

        assert!(opts.iter().all(|o| o.code != 28));
        assert!(opts.iter().any(|o| o.code == 6));
        let host = opts.iter().find(|o| o.code == OPT_HOSTNAME).unwrap();
        assert_eq!(host.data, b"printer");
    }

    #[test]
    fn test_options_wire_roundtrip() {
        let opts = vec![
            DhcpOption::msg_type(DHCPDISCOVER),
            DhcpOption::new(OPT_REQUESTED_IP, vec![10, 0, 0, 5]),
        ];
        let wire = encode_options(&opts);
        assert_eq!(*wire.last().unwrap(), OPT_END);
        let parsed = parse_options(&wire);
        assert_eq!(parsed, opts);
    }

    #[test]
    fn test_parse_options_truncated() {
        // Length byte promises more data than remains.
        assert!(parse_options(&[53, 4, 1]).is_empty());
        // PAD bytes are skipped.
        let parsed = parse_options(&[0, 0, 53, 1, 2, 255]);
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].as_u8(), Some(2));
    }
}

//! Per-interface DHCPv4 state: the subnet, the allocation pool with its
//! offset bitset, merged response options, the MAC-keyed lease table,
//! blocked reservations and the pending-OFFER scratch.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};

use crate::config::V4InterfaceConfig;
use crate::lease::{HwAddr, Lease};
use crate::options::{self, DhcpOption};
use crate::range::IpRange;
use crate::{DhcpError, Result};

/// How long an un-requested OFFER keeps its address out of the pool.
pub const OFFER_HOLD_SECS: i64 = 60;

/// An address promised to a client that has not requested it yet.
#[derive(Debug, Clone, Copy)]
struct PendingOffer {
    ip: Ipv4Addr,
    until: DateTime<Utc>,
}

/// Fixed-capacity bitset over pool offsets.
#[derive(Debug, Clone)]
struct OffsetSet {
    words: Vec<u64>,
}

impl OffsetSet {
    fn new(len: u64) -> Self {
        Self {
            words: vec![0; len.div_ceil(64) as usize],
        }
    }

    fn get(&self, i: u64) -> bool {
        self.words[(i / 64) as usize] & (1 << (i % 64)) != 0
    }

    fn set(&mut self, i: u64, v: bool) {
        let word = &mut self.words[(i / 64) as usize];
        if v {
            *word |= 1 << (i % 64);
        } else {
            *word &= !(1 << (i % 64));
        }
    }

    fn clear(&mut self) {
        self.words.fill(0);
    }
}

/// State of one served interface.
pub struct IfaceV4 {
    pub name: String,
    pub gateway: Ipv4Addr,
    pub mask: Ipv4Addr,
    range: IpRange,
    pub lease_ttl: Duration,

    implicit: Vec<DhcpOption>,
    explicit: Vec<DhcpOption>,
    suppressed: Vec<u8>,

    leases: HashMap<HwAddr, Lease>,
    /// Declined addresses held out of the pool; all carry the zero MAC, so
    /// they live beside the MAC-keyed table rather than in it.
    blocked: HashMap<Ipv4Addr, Lease>,
    leased_offsets: OffsetSet,
    offers: HashMap<HwAddr, PendingOffer>,

    /// Learned from the capture device at start.
    pub(crate) server_ip: Ipv4Addr,
    pub(crate) server_hw: HwAddr,
}

impl IfaceV4 {
    /// Builds interface state from its configuration block, reporting the
    /// first failing condition. A disabled interface yields `None`.
    pub fn from_config(name: &str, conf: &V4InterfaceConfig) -> Result<Option<Self>> {
        if !conf.enabled {
            return Ok(None);
        }

        let fail = |msg: String| DhcpError::Config(format!("{name}: {msg}"));

        let gateway: Ipv4Addr = conf
            .gateway
            .parse()
            .map_err(|_| fail(format!("invalid gateway {:?}", conf.gateway)))?;
        let mask: Ipv4Addr = conf
            .mask
            .parse()
            .map_err(|_| fail(format!("invalid subnet mask {:?}", conf.mask)))?;
        let range_start: Ipv4Addr = conf
            .range_start
            .parse()
            .map_err(|_| fail(format!("invalid range start {:?}", conf.range_start)))?;
        let range_end: Ipv4Addr = conf
            .range_end
            .parse()
            .map_err(|_| fail(format!("invalid range end {:?}", conf.range_end)))?;

        let m = u32::from(mask);
        if m == 0 || m.leading_ones() + m.trailing_zeros() != 32 {
            return Err(fail(format!("subnet mask {mask} is not contiguous")));
        }

        let range = IpRange::new(range_start, range_end)
            .map_err(|e| fail(e.to_string()))?;

        let subnet = u32::from(gateway) & m;
        for ip in [range_start, range_end] {
            if u32::from(ip) & m != subnet {
                return Err(fail(format!("{ip} is outside the subnet {gateway}/{mask}")));
            }
        }

        if range.contains(gateway) {
            return Err(fail(format!("gateway {gateway} must not be inside the pool")));
        }

        if conf.lease_ttl == 0 {
            return Err(fail("lease TTL must be positive".to_string()));
        }

        let mut implicit = options::implicit_options(mask, gateway);
        let operator: Vec<DhcpOption> = conf
            .options
            .iter()
            .map(|o| o.to_option())
            .collect::<Result<_>>()
            .map_err(|e| match e {
                DhcpError::Config(msg) => fail(msg),
                other => other,
            })?;
        let (explicit, suppressed) = options::merge_explicit(&mut implicit, &operator);

        let leased_offsets = OffsetSet::new(range.len());

        Ok(Some(Self {
            name: name.to_string(),
            gateway,
            mask,
            range,
            lease_ttl: Duration::seconds(conf.lease_ttl as i64),
            implicit,
            explicit,
            suppressed,
            leases: HashMap::new(),
            blocked: HashMap::new(),
            leased_offsets,
            offers: HashMap::new(),
            server_ip: Ipv4Addr::UNSPECIFIED,
            server_hw: HwAddr::BLOCKED,
        }))
    }

    pub fn subnet_contains(&self, ip: Ipv4Addr) -> bool {
        let m = u32::from(self.mask);
        u32::from(ip) & m == u32::from(self.gateway) & m
    }

    pub fn pool_contains(&self, ip: Ipv4Addr) -> bool {
        self.range.contains(ip)
    }

    /// Whether a lease or blocked reservation occupies the pool offset of
    /// `ip`.
    pub fn is_offset_taken(&self, ip: Ipv4Addr) -> bool {
        match self.range.offset(ip) {
            Some(off) => self.leased_offsets.get(off),
            None => false,
        }
    }

    pub fn lease_for(&self, hw: &HwAddr) -> Option<&Lease> {
        self.leases.get(hw)
    }

    pub(crate) fn lease_mut(&mut self, hw: &HwAddr) -> Option<&mut Lease> {
        self.leases.get_mut(hw)
    }

    /// Every record on this interface, blocked reservations included.
    pub fn all_leases(&self) -> impl Iterator<Item = &Lease> {
        self.leases.values().chain(self.blocked.values())
    }

    /// Inserts a new record. Fails when the MAC key is already present.
    pub fn insert_lease(&mut self, lease: Lease) -> Result<()> {
        if self.leases.contains_key(&lease.hwaddr) {
            return Err(DhcpError::State(format!(
                "{}: lease for {} already exists",
                self.name, lease.hwaddr
            )));
        }
        if let Some(off) = self.range.offset(lease.ip) {
            self.leased_offsets.set(off, true);
        }
        self.leases.insert(lease.hwaddr, lease);
        Ok(())
    }

    /// Replaces the record under the same MAC key, moving the offset bit
    /// when the address changed.
    pub fn update_lease(&mut self, lease: Lease) -> Result<()> {
        let Some(old) = self.leases.get(&lease.hwaddr) else {
            return Err(DhcpError::State(format!(
                "{}: no lease for {}",
                self.name, lease.hwaddr
            )));
        };
        if let Some(off) = self.range.offset(old.ip) {
            self.leased_offsets.set(off, false);
        }
        if let Some(off) = self.range.offset(lease.ip) {
            self.leased_offsets.set(off, true);
        }
        self.leases.insert(lease.hwaddr, lease);
        Ok(())
    }

    /// Removes the record under the MAC key and frees its offset.
    pub fn remove_lease(&mut self, lease: &Lease) -> Result<()> {
        let Some(old) = self.leases.remove(&lease.hwaddr) else {
            return Err(DhcpError::State(format!(
                "{}: no lease for {}",
                self.name, lease.hwaddr
            )));
        };
        if let Some(off) = self.range.offset(old.ip) {
            self.leased_offsets.set(off, false);
        }
        Ok(())
    }

    /// First pool address neither leased, blocked, nor promised in a
    /// still-held OFFER.
    pub fn next_ip(&self, now: DateTime<Utc>) -> Option<Ipv4Addr> {
        self.range.find(|ip| {
            let off = self.range.offset(ip).unwrap_or(0);
            if self.leased_offsets.get(off) {
                return false;
            }
            !self
                .offers
                .values()
                .any(|o| o.ip == ip && o.until > now)
        })
    }

    /// Non-static records whose deadline has passed; order unspecified.
    pub fn find_expired(&self, now: DateTime<Utc>) -> Vec<Lease> {
        self.all_leases()
            .filter(|l| l.is_expired(now))
            .cloned()
            .collect()
    }

    /// True while a declined address is reserved.
    pub fn is_blocked(&self, ip: Ipv4Addr) -> bool {
        self.blocked.contains_key(&ip)
    }

    pub(crate) fn add_blocked(&mut self, ip: Ipv4Addr, until: DateTime<Utc>) {
        if let Some(off) = self.range.offset(ip) {
            self.leased_offsets.set(off, true);
        }
        self.blocked.insert(ip, Lease::blocked(ip, until));
    }

    pub(crate) fn remove_blocked(&mut self, ip: Ipv4Addr) {
        if self.blocked.remove(&ip).is_some() {
            if let Some(off) = self.range.offset(ip) {
                self.leased_offsets.set(off, false);
            }
        }
    }

    /// Records an OFFER hold so duplicate DISCOVERs answer consistently and
    /// the address is not promised twice.
    pub(crate) fn offer(&mut self, hw: HwAddr, ip: Ipv4Addr, until: DateTime<Utc>) {
        self.offers.insert(hw, PendingOffer { ip, until });
    }

    /// The address currently promised to `hw`, if the hold is still fresh.
    pub(crate) fn offered_ip(&self, hw: &HwAddr, now: DateTime<Utc>) -> Option<Ipv4Addr> {
        self.offers
            .get(hw)
            .filter(|o| o.until > now)
            .map(|o| o.ip)
    }

    pub(crate) fn clear_offer(&mut self, hw: &HwAddr) {
        self.offers.remove(hw);
    }

    /// Wipes every record, reservation, hold and offset bit.
    pub fn reset(&mut self) {
        self.leases.clear();
        self.blocked.clear();
        self.offers.clear();
        self.leased_offsets.clear();
    }

    /// Assembles reply options for this interface (§ RFC 2132 ordering
    /// rules live in [`options::assemble`]).
    pub fn response_options(
        &self,
        msg_type: u8,
        requested: Option<&[u8]>,
        hostname: Option<&str>,
        lease_secs: u32,
    ) -> Vec<DhcpOption> {
        options::assemble(
            msg_type,
            self.server_ip,
            requested,
            &self.implicit,
            &self.explicit,
            &self.suppressed,
            hostname,
            lease_secs,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(start: &str, end: &str) -> V4InterfaceConfig {
        serde_json::from_str(&format!(
            r#"{{
                "enabled": true,
                "gateway": "192.168.0.1",
                "mask": "255.255.255.0",
                "range_start": "{start}",
                "range_end": "{end}",
                "lease_ttl": 86400
            }}"#
        ))
        .unwrap()
    }

    fn iface() -> IfaceV4 {
        IfaceV4::from_config("eth0", &conf("192.168.0.100", "192.168.0.200"))
            .unwrap()
            .unwrap()
    }

    fn hw(s: &str) -> HwAddr {
        HwAddr::parse(s).unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_validation_failures() {
        let mut c = conf("192.168.0.100", "192.168.0.200");
        c.gateway = "not-an-ip".into();
        assert!(IfaceV4::from_config("eth0", &c).is_err());

        let mut c = conf("192.168.0.100", "192.168.0.200");
        c.mask = "255.0.255.0".into();
        assert!(IfaceV4::from_config("eth0", &c).is_err());

        // Range outside the gateway subnet.
        let c = conf("192.168.5.100", "192.168.5.200");
        assert!(IfaceV4::from_config("eth0", &c).is_err());

        // Gateway inside the pool.
        let c = conf("192.168.0.1", "192.168.0.200");
        assert!(IfaceV4::from_config("eth0", &c).is_err());

        let mut c = conf("192.168.0.100", "192.168.0.200");
        c.lease_ttl = 0;
        assert!(IfaceV4::from_config("eth0", &c).is_err());

        let mut c = conf("192.168.0.100", "192.168.0.200");
        c.enabled = false;
        assert!(IfaceV4::from_config("eth0", &c).unwrap().is_none());
    }

    #[test]
    fn test_insert_update_remove_track_offsets() {
        let mut iface = iface();
        let a = hw("aa:00:00:00:00:01");
        let lease = Lease::dynamic(ip("192.168.0.100"), a, "pc".into(), t0(), Duration::hours(1));

        iface.insert_lease(lease.clone()).unwrap();
        assert!(iface.is_offset_taken(ip("192.168.0.100")));
        assert!(iface.insert_lease(lease.clone()).is_err());

        let mut moved = lease.clone();
        moved.ip = ip("192.168.0.101");
        iface.update_lease(moved.clone()).unwrap();
        assert!(!iface.is_offset_taken(ip("192.168.0.100")));
        assert!(iface.is_offset_taken(ip("192.168.0.101")));

        iface.remove_lease(&moved).unwrap();
        assert!(!iface.is_offset_taken(ip("192.168.0.101")));
        assert!(iface.remove_lease(&moved).is_err());
    }

    #[test]
    fn test_next_ip_skips_leased_blocked_and_offered() {
        let mut iface = iface();
        assert_eq!(iface.next_ip(t0()), Some(ip("192.168.0.100")));

        let a = hw("aa:00:00:00:00:01");
        iface
            .insert_lease(Lease::dynamic(
                ip("192.168.0.100"),
                a,
                String::new(),
                t0(),
                Duration::hours(1),
            ))
            .unwrap();
        assert_eq!(iface.next_ip(t0()), Some(ip("192.168.0.101")));

        iface.add_blocked(ip("192.168.0.101"), t0() + Duration::hours(1));
        assert_eq!(iface.next_ip(t0()), Some(ip("192.168.0.102")));

        iface.offer(
            hw("aa:00:00:00:00:02"),
            ip("192.168.0.102"),
            t0() + Duration::seconds(OFFER_HOLD_SECS),
        );
        assert_eq!(iface.next_ip(t0()), Some(ip("192.168.0.103")));

        // An expired hold no longer reserves the address.
        assert_eq!(
            iface.next_ip(t0() + Duration::seconds(OFFER_HOLD_SECS + 1)),
            Some(ip("192.168.0.102"))
        );
    }

    #[test]
    fn test_two_address_pool_exhausts() {
        let mut iface = IfaceV4::from_config("eth0", &conf("192.168.0.100", "192.168.0.101"))
            .unwrap()
            .unwrap();
        iface.offer(hw("aa:00:00:00:00:01"), ip("192.168.0.100"), t0() + Duration::minutes(1));
        iface.offer(hw("aa:00:00:00:00:02"), ip("192.168.0.101"), t0() + Duration::minutes(1));
        assert_eq!(iface.next_ip(t0()), None);
    }

    #[test]
    fn test_find_expired_covers_blocked() {
        let mut iface = iface();
        let a = hw("aa:00:00:00:00:01");
        iface
            .insert_lease(Lease::dynamic(
                ip("192.168.0.100"),
                a,
                String::new(),
                t0() - Duration::hours(2),
                Duration::hours(1),
            ))
            .unwrap();
        iface.add_blocked(ip("192.168.0.101"), t0() - Duration::seconds(1));
        iface
            .insert_lease(Lease::statik(
                ip("192.168.0.102"),
                hw("aa:00:00:00:00:03"),
                "nas".into(),
            ))
            .unwrap();

        let expired = iface.find_expired(t0());
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|l| !l.is_static));
    }

    #[test]
    fn test_static_outside_pool_takes_no_offset() {
        let mut iface = iface();
        iface
            .insert_lease(Lease::statik(
                ip("192.168.0.50"),
                hw("aa:00:00:00:00:01"),
                "printer".into(),
            ))
            .unwrap();
        assert!(!iface.is_offset_taken(ip("192.168.0.50")));
        assert_eq!(iface.next_ip(t0()), Some(ip("192.168.0.100")));
    }
}

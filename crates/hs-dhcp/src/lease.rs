use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};

use crate::clock::Clock;
use crate::{DhcpError, Result};

/// Largest link-layer address carried (20-byte InfiniBand link address).
const MAX_HWADDR_LEN: usize = 20;

/// Fixed-size link-layer address usable as a map key: two addresses of the
/// same length compare by value. Valid lengths are 6 (EUI-48), 8 (EUI-64)
/// and 20 (InfiniBand). Unused tail bytes stay zeroed so the derived
/// equality and hash are well defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwAddr {
    len: u8,
    bytes: [u8; MAX_HWADDR_LEN],
}

impl HwAddr {
    /// All-zero EUI-48; marks a blocked (declined) address.
    pub const BLOCKED: HwAddr = HwAddr {
        len: 6,
        bytes: [0; MAX_HWADDR_LEN],
    };

    /// Wraps raw address bytes. Panics on a length other than 6, 8 or 20;
    /// wire input is validated before this is reached.
    pub fn new(raw: &[u8]) -> Self {
        assert!(
            matches!(raw.len(), 6 | 8 | 20),
            "invalid hardware address length {}",
            raw.len()
        );
        let mut bytes = [0; MAX_HWADDR_LEN];
        bytes[..raw.len()].copy_from_slice(raw);
        Self {
            len: raw.len() as u8,
            bytes,
        }
    }

    /// Parses colon- or dash-separated hex (`aa:bb:cc:dd:ee:ff`).
    pub fn parse(s: &str) -> Result<Self> {
        let mut bytes = [0u8; MAX_HWADDR_LEN];
        let mut len = 0usize;
        for part in s.split([':', '-']) {
            if part.len() != 2 || len == MAX_HWADDR_LEN {
                return Err(DhcpError::State(format!("invalid hardware address {s:?}")));
            }
            bytes[len] = u8::from_str_radix(part, 16)
                .map_err(|_| DhcpError::State(format!("invalid hardware address {s:?}")))?;
            len += 1;
        }
        if !matches!(len, 6 | 8 | 20) {
            return Err(DhcpError::State(format!(
                "invalid hardware address length {len} in {s:?}"
            )));
        }
        Ok(Self {
            len: len as u8,
            bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// True for the all-zero EUI-48 sentinel.
    pub fn is_zero(&self) -> bool {
        *self == Self::BLOCKED
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// One client binding: either granted over the wire or configured by the
/// operator (static).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub ip: Ipv4Addr,
    pub hwaddr: HwAddr,
    /// Possibly empty; empty hostnames are not indexed.
    pub hostname: String,
    /// Absolute expiry instant. Kept at the epoch and ignored by TTL checks
    /// for static leases.
    pub expiry: DateTime<Utc>,
    pub is_static: bool,
}

impl Lease {
    /// A dynamic lease granted now for `ttl`.
    pub fn dynamic(
        ip: Ipv4Addr,
        hwaddr: HwAddr,
        hostname: String,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            ip,
            hwaddr,
            hostname,
            expiry: now + ttl,
            is_static: false,
        }
    }

    /// An operator-configured binding with no expiry.
    pub fn statik(ip: Ipv4Addr, hwaddr: HwAddr, hostname: String) -> Self {
        Self {
            ip,
            hwaddr,
            hostname,
            expiry: DateTime::UNIX_EPOCH,
            is_static: true,
        }
    }

    /// A blocked reservation: the address was declined as in use elsewhere
    /// and stays out of the pool until `until`.
    pub fn blocked(ip: Ipv4Addr, until: DateTime<Utc>) -> Self {
        Self {
            ip,
            hwaddr: HwAddr::BLOCKED,
            hostname: String::new(),
            expiry: until,
            is_static: false,
        }
    }

    /// True iff the hardware address is the zero sentinel.
    pub fn is_blocked(&self) -> bool {
        self.hwaddr.is_zero()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_static && self.expiry < now
    }

    /// Pushes the expiry forward once it has passed; a still-valid lease
    /// keeps its deadline. Static leases never move.
    pub fn update_expiry(&mut self, clock: &dyn Clock, ttl: Duration) {
        if self.is_static {
            return;
        }
        let now = clock.now();
        if now >= self.expiry {
            self.expiry = now + ttl;
        }
    }

    /// Seconds to advertise in the lease-time option: the configured TTL for
    /// static leases, the clamped remainder for dynamic ones.
    pub fn remaining_secs(&self, now: DateTime<Utc>, iface_ttl: Duration) -> u32 {
        let secs = if self.is_static {
            iface_ttl.num_seconds()
        } else {
            (self.expiry - now).num_seconds().max(0)
        };
        secs.clamp(0, i64::from(u32::MAX)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FrozenClock(DateTime<Utc>);

    impl Clock for FrozenClock {
        fn now(&self) -> DateTime<Utc> {
            self.0
        }
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_hwaddr_parse_format() {
        let hw = HwAddr::parse("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(hw.as_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(hw.to_string(), "aa:bb:cc:dd:ee:ff");

        let eui64 = HwAddr::parse("00-11-22-33-44-55-66-77").unwrap();
        assert_eq!(eui64.len(), 8);

        assert!(HwAddr::parse("aa:bb:cc").is_err());
        assert!(HwAddr::parse("zz:bb:cc:dd:ee:ff").is_err());
        assert!(HwAddr::parse("").is_err());
    }

    #[test]
    fn test_blocked_sentinel() {
        assert!(HwAddr::parse("00:00:00:00:00:00").unwrap().is_zero());
        assert!(!HwAddr::parse("00:00:00:00:00:01").unwrap().is_zero());

        let l = Lease::blocked("10.0.0.5".parse().unwrap(), t0());
        assert!(l.is_blocked());
        assert!(l.hostname.is_empty());
        assert!(!l.is_static);
    }

    #[test]
    fn test_update_expiry_static_is_noop() {
        let clock = FrozenClock(t0());
        let mut l = Lease::statik(
            "10.0.0.5".parse().unwrap(),
            HwAddr::parse("aa:bb:cc:dd:ee:ff").unwrap(),
            "printer".into(),
        );
        l.update_expiry(&clock, Duration::hours(1));
        assert_eq!(l.expiry, DateTime::UNIX_EPOCH);
        assert!(!l.is_expired(t0()));
    }

    #[test]
    fn test_update_expiry_extends_only_when_passed() {
        let clock = FrozenClock(t0());
        let hw = HwAddr::parse("aa:bb:cc:dd:ee:ff").unwrap();

        let mut valid = Lease::dynamic(
            "10.0.0.5".parse().unwrap(),
            hw,
            String::new(),
            t0(),
            Duration::minutes(30),
        );
        let deadline = valid.expiry;
        valid.update_expiry(&clock, Duration::hours(24));
        assert_eq!(valid.expiry, deadline);

        let mut expired = valid.clone();
        expired.expiry = t0() - Duration::seconds(1);
        expired.update_expiry(&clock, Duration::hours(24));
        assert_eq!(expired.expiry, t0() + Duration::hours(24));
    }

    #[test]
    fn test_remaining_secs() {
        let hw = HwAddr::parse("aa:bb:cc:dd:ee:ff").unwrap();
        let l = Lease::dynamic(
            "10.0.0.5".parse().unwrap(),
            hw,
            String::new(),
            t0(),
            Duration::minutes(30),
        );
        assert_eq!(l.remaining_secs(t0(), Duration::hours(24)), 1800);
        assert_eq!(
            l.remaining_secs(t0() + Duration::hours(1), Duration::hours(24)),
            0
        );

        let s = Lease::statik("10.0.0.6".parse().unwrap(), hw, "nas".into());
        assert_eq!(s.remaining_secs(t0(), Duration::hours(24)), 86_400);
    }

    #[test]
    #[should_panic(expected = "invalid hardware address length")]
    fn test_hwaddr_new_rejects_bad_length() {
        HwAddr::new(&[1, 2, 3, 4]);
    }
}

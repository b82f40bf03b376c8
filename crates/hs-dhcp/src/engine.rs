//! DHCPv4 message engine (RFC 2131 §4.3): DISCOVER, the three REQUEST
//! dispositions, DECLINE and RELEASE.
//!
//! The engine is stateless between packets; state lives in the lease tables
//! and the pending-OFFER scratch, all mutated under the writer lock the
//! dispatcher holds around each call.

use std::net::Ipv4Addr;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::device::AddrChecker;
use crate::iface::OFFER_HOLD_SECS;
use crate::lease::{HwAddr, Lease};
use crate::options::{
    DHCPACK, DHCPDECLINE, DHCPDISCOVER, DHCPINFORM, DHCPNAK, DHCPOFFER, DHCPRELEASE, DHCPREQUEST,
    DhcpOption, OPT_SERVER_ID,
};
use crate::packet::DhcpPacket;
use crate::{DhcpError, Registry, Result};

/// A reply bound for the broadcast address on one interface.
#[derive(Debug)]
pub struct Reply {
    pub iface: usize,
    pub packet: DhcpPacket,
}

/// Routes one validated BOOTREQUEST by message type. `rx_iface` is the
/// interface the frame arrived on.
pub fn handle_packet(
    reg: &mut Registry,
    rx_iface: usize,
    req: &DhcpPacket,
    clock: &dyn Clock,
    checker: &dyn AddrChecker,
) -> Result<Option<Reply>> {
    let Some(msg_type) = req.msg_type() else {
        return Err(DhcpError::Protocol("message type option missing".into()));
    };
    let Some(hw) = req.hwaddr() else {
        return Err(DhcpError::Protocol(format!(
            "unsupported hardware address length {}",
            req.hlen
        )));
    };
    if hw.is_zero() {
        return Err(DhcpError::Protocol("zero client hardware address".into()));
    }

    match msg_type {
        DHCPDISCOVER => Ok(handle_discover(reg, rx_iface, req, &hw, clock, checker)),
        DHCPREQUEST => Ok(handle_request(reg, rx_iface, req, &hw, clock)),
        DHCPDECLINE => {
            handle_decline(reg, req, &hw, clock);
            Ok(None)
        }
        DHCPRELEASE => {
            handle_release(reg, req, &hw);
            Ok(None)
        }
        DHCPINFORM | DHCPOFFER | DHCPACK | DHCPNAK => {
            debug!("ignoring DHCP message type {msg_type}");
            Ok(None)
        }
        other => Err(DhcpError::Protocol(format!(
            "invalid DHCP message type {other}"
        ))),
    }
}

enum Selection {
    /// The client already holds a usable record on this interface.
    Existing,
    /// A still-fresh OFFER hold.
    Offered(Ipv4Addr),
    /// Allocate from the pool.
    Fresh,
}

fn handle_discover(
    reg: &mut Registry,
    idx: usize,
    req: &DhcpPacket,
    hw: &HwAddr,
    clock: &dyn Clock,
    checker: &dyn AddrChecker,
) -> Option<Reply> {
    let now = clock.now();

    // Return expired records to the pool first; the discovering client's own
    // record survives so it can be re-offered with a fresh deadline.
    reg.reclaim_expired(idx, now, hw);

    let ttl = reg.ifaces[idx].lease_ttl;
    let selection = {
        let iface = &reg.ifaces[idx];
        match iface.lease_for(hw) {
            Some(l) if iface.pool_contains(l.ip) && !iface.is_blocked(l.ip) => Selection::Existing,
            _ => match iface.offered_ip(hw, now) {
                Some(ip) => Selection::Offered(ip),
                None => Selection::Fresh,
            },
        }
    };

    let (yiaddr, hostname, lease_secs) = match selection {
        Selection::Existing => {
            let (lease, extended) = {
                let l = reg.ifaces[idx].lease_mut(hw)?;
                let before = l.expiry;
                l.update_expiry(clock, ttl);
                (l.clone(), l.expiry != before)
            };
            if extended {
                reg.persist_logged();
            }
            let remaining = lease.remaining_secs(now, ttl);
            (lease.ip, lease.hostname, remaining)
        }
        Selection::Offered(ip) => (ip, String::new(), duration_secs(ttl)),
        Selection::Fresh => {
            let Some(ip) = allocate(reg, idx, now, checker) else {
                debug!(
                    "{}: no address available for {hw}, not offering",
                    reg.ifaces[idx].name
                );
                return None;
            };
            reg.ifaces[idx].offer(*hw, ip, now + Duration::seconds(OFFER_HOLD_SECS));
            (ip, String::new(), duration_secs(ttl))
        }
    };

    info!("DHCPOFFER {yiaddr} to {hw} on {}", reg.ifaces[idx].name);
    let iface = &reg.ifaces[idx];
    let opts = iface.response_options(
        DHCPOFFER,
        req.param_request_list(),
        Some(hostname.as_str()),
        lease_secs,
    );
    Some(Reply {
        iface: idx,
        packet: req.build_reply(yiaddr, Ipv4Addr::UNSPECIFIED, opts),
    })
}

/// Next free pool address that passes the availability probe. Addresses the
/// probe reports in use become blocked reservations and the scan continues.
fn allocate(
    reg: &mut Registry,
    idx: usize,
    now: DateTime<Utc>,
    checker: &dyn AddrChecker,
) -> Option<Ipv4Addr> {
    loop {
        let candidate = reg.ifaces[idx].next_ip(now)?;
        match checker.is_available(candidate) {
            Ok(true) => return Some(candidate),
            Ok(false) => {
                let ttl = reg.ifaces[idx].lease_ttl;
                info!("{candidate} is already in use, blocking it");
                reg.ifaces[idx].add_blocked(candidate, now + ttl);
                reg.persist_logged();
            }
            Err(e) => {
                debug!("availability probe for {candidate} failed: {e}");
                return Some(candidate);
            }
        }
    }
}

fn handle_request(
    reg: &mut Registry,
    rx_iface: usize,
    req: &DhcpPacket,
    hw: &HwAddr,
    clock: &dyn Clock,
) -> Option<Reply> {
    let now = clock.now();
    let server_id = req.server_id();
    let requested = req.requested_ip();

    // Any REQUEST ends this client's OFFER holds: either it committed to us
    // or it selected another server.
    reg.clear_offers(hw);

    if let Some(sid) = server_id {
        // SELECTING
        let Some(idx) = reg.iface_for_server_id(sid) else {
            debug!("REQUEST selects foreign server {sid}, staying silent");
            return None;
        };
        if req.ciaddr != Ipv4Addr::UNSPECIFIED {
            debug!("SELECTING with non-zero ciaddr from {hw}, dropping");
            return None;
        }
        return handle_selecting(reg, idx, req, hw, requested, now);
    }

    if let Some(rip) = requested {
        // INIT-REBOOT
        if req.ciaddr != Ipv4Addr::UNSPECIFIED {
            debug!("INIT-REBOOT with non-zero ciaddr from {hw}, dropping");
            return None;
        }
        return handle_init_reboot(reg, rx_iface, req, hw, rip, clock, now);
    }

    if req.ciaddr != Ipv4Addr::UNSPECIFIED {
        // RENEWING (unicast) / REBINDING (broadcast)
        return handle_renew(reg, req, hw, clock, now);
    }

    debug!("REQUEST from {hw} carries neither server id, requested address nor ciaddr");
    None
}

fn handle_selecting(
    reg: &mut Registry,
    idx: usize,
    req: &DhcpPacket,
    hw: &HwAddr,
    requested: Option<Ipv4Addr>,
    now: DateTime<Utc>,
) -> Option<Reply> {
    let Some(rip) = requested else {
        info!("DHCPNAK to {hw}: SELECTING without a requested address");
        return Some(nak(reg, idx, req));
    };

    let ttl = reg.ifaces[idx].lease_ttl;
    let (had_record, static_verdict) = {
        let iface = &reg.ifaces[idx];
        match iface.lease_for(hw) {
            Some(l) if l.is_static => (true, Some((l.clone(), l.ip == rip))),
            Some(_) => (true, None),
            None => (false, None),
        }
    };

    // Re-request of a static binding: mirror it, never overwrite it.
    if let Some((lease, matches)) = static_verdict {
        return if matches {
            info!("DHCPACK {rip} to {hw} (static)");
            Some(ack(reg, idx, req, &lease, now, Ipv4Addr::UNSPECIFIED))
        } else {
            info!("DHCPNAK to {hw}: {rip} does not match its static binding");
            Some(nak(reg, idx, req))
        };
    }

    if !reg.ifaces[idx].pool_contains(rip) {
        info!("DHCPNAK to {hw}: {rip} is outside the pool");
        return Some(nak(reg, idx, req));
    }

    let hostname = req.hostname().unwrap_or_default();
    let lease = Lease::dynamic(rip, *hw, hostname, now, ttl);
    let committed = if had_record {
        reg.update_lease(idx, &lease)
    } else {
        reg.add_lease(idx, &lease)
    };

    match committed {
        Ok(()) => {}
        Err(DhcpError::Store(e)) => {
            // The in-memory commit stands; only the rewrite failed.
            warn!("lease for {hw} committed but not persisted: {e}");
        }
        Err(e) => {
            info!("DHCPNAK to {hw} for {rip}: {e}");
            return Some(nak(reg, idx, req));
        }
    }

    info!("DHCPACK {rip} to {hw} on {}", reg.ifaces[idx].name);
    Some(ack(reg, idx, req, &lease, now, Ipv4Addr::UNSPECIFIED))
}

fn handle_init_reboot(
    reg: &mut Registry,
    rx_iface: usize,
    req: &DhcpPacket,
    hw: &HwAddr,
    rip: Ipv4Addr,
    clock: &dyn Clock,
    now: DateTime<Utc>,
) -> Option<Reply> {
    let Some(idx) = reg.iface_for_addr(rip) else {
        // The client moved networks; answer from the receiving interface.
        info!("DHCPNAK to {hw}: {rip} is on no served subnet");
        return Some(nak(reg, rx_iface, req));
    };

    let held = reg.ifaces[idx].lease_for(hw).map(|l| l.ip);
    if held != Some(rip) {
        info!("DHCPNAK to {hw}: no record of {rip} for this client");
        return Some(nak(reg, idx, req));
    }

    let lease = refresh(reg, idx, hw, clock)?;
    info!("DHCPACK {rip} to {hw} (init-reboot)");
    Some(ack(reg, idx, req, &lease, now, Ipv4Addr::UNSPECIFIED))
}

fn handle_renew(
    reg: &mut Registry,
    req: &DhcpPacket,
    hw: &HwAddr,
    clock: &dyn Clock,
    now: DateTime<Utc>,
) -> Option<Reply> {
    let ciaddr = req.ciaddr;
    let Some(idx) = reg.iface_for_addr(ciaddr) else {
        debug!("RENEW from {hw} for {ciaddr} on no served subnet, dropping");
        return None;
    };

    let held = reg.ifaces[idx].lease_for(hw).map(|l| l.ip);
    if held != Some(ciaddr) {
        info!("DHCPNAK to {hw}: no record of {ciaddr} for this client");
        return Some(nak(reg, idx, req));
    }

    let lease = refresh(reg, idx, hw, clock)?;
    info!("DHCPACK {ciaddr} to {hw} (renew)");
    Some(ack(reg, idx, req, &lease, now, ciaddr))
}

fn handle_decline(reg: &mut Registry, req: &DhcpPacket, hw: &HwAddr, clock: &dyn Clock) {
    let Some(rip) = req.requested_ip() else {
        debug!("DECLINE from {hw} without a requested address");
        return;
    };
    let Some(idx) = reg.iface_for_addr(rip) else {
        debug!("DECLINE from {hw} for {rip} on no served subnet");
        return;
    };
    let owned = reg.ifaces[idx].lease_for(hw).map(|l| l.ip);
    if owned != Some(rip) {
        debug!("DECLINE from {hw} for {rip} does not match its record");
        return;
    }

    let until = clock.now() + reg.ifaces[idx].lease_ttl;
    match reg.block_lease(idx, hw, until) {
        Ok(()) => info!("DHCPDECLINE from {hw}: {rip} blocked until {until}"),
        Err(DhcpError::Store(e)) => warn!("{rip} blocked but not persisted: {e}"),
        Err(e) => warn!("failed to block {rip}: {e}"),
    }
}

fn handle_release(reg: &mut Registry, req: &DhcpPacket, hw: &HwAddr) {
    let ciaddr = req.ciaddr;
    if ciaddr == Ipv4Addr::UNSPECIFIED {
        debug!("RELEASE from {hw} without ciaddr");
        return;
    }
    let Some(idx) = reg.iface_for_addr(ciaddr) else {
        debug!("RELEASE from {hw} for {ciaddr} on no served subnet");
        return;
    };
    let lease = match reg.ifaces[idx].lease_for(hw) {
        Some(l) if l.ip == ciaddr => l.clone(),
        _ => {
            debug!("RELEASE from {hw} for {ciaddr} does not match its record");
            return;
        }
    };

    match reg.remove_lease(idx, &lease) {
        Ok(()) => info!("DHCPRELEASE from {hw}: {ciaddr} released"),
        Err(DhcpError::Store(e)) => warn!("{ciaddr} released but not persisted: {e}"),
        Err(e) => warn!("failed to release {ciaddr}: {e}"),
    }
}

/// Extends the record's deadline when it has lapsed, persisting on change.
fn refresh(reg: &mut Registry, idx: usize, hw: &HwAddr, clock: &dyn Clock) -> Option<Lease> {
    let ttl = reg.ifaces[idx].lease_ttl;
    let (lease, extended) = {
        let l = reg.ifaces[idx].lease_mut(hw)?;
        let before = l.expiry;
        l.update_expiry(clock, ttl);
        (l.clone(), l.expiry != before)
    };
    if extended {
        reg.persist_logged();
    }
    Some(lease)
}

fn ack(
    reg: &Registry,
    idx: usize,
    req: &DhcpPacket,
    lease: &Lease,
    now: DateTime<Utc>,
    ciaddr: Ipv4Addr,
) -> Reply {
    let iface = &reg.ifaces[idx];
    let secs = lease.remaining_secs(now, iface.lease_ttl);
    let opts = iface.response_options(
        DHCPACK,
        req.param_request_list(),
        Some(lease.hostname.as_str()),
        secs,
    );
    Reply {
        iface: idx,
        packet: req.build_reply(lease.ip, ciaddr, opts),
    }
}

/// NAK: zero yiaddr, server id carries the interface gateway, broadcast.
fn nak(reg: &Registry, idx: usize, req: &DhcpPacket) -> Reply {
    let iface = &reg.ifaces[idx];
    let options = vec![
        DhcpOption::msg_type(DHCPNAK),
        DhcpOption::new(OPT_SERVER_ID, iface.gateway.octets().to_vec()),
    ];
    Reply {
        iface: idx,
        packet: req.build_reply(Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, options),
    }
}

fn duration_secs(d: Duration) -> u32 {
    d.num_seconds().clamp(0, i64::from(u32::MAX)) as u32
}

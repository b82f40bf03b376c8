//! Process-wide lease index: by address and by case-folded hostname, with
//! cross-interface uniqueness. The index stores keys; the owning interface's
//! MAC-keyed table stores the records. Every call here happens under the
//! server's writer lock.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::iface::IfaceV4;
use crate::lease::{HwAddr, Lease};
use crate::{DhcpError, Result};

#[derive(Debug, Default)]
pub struct LeaseIndex {
    by_addr: HashMap<Ipv4Addr, HwAddr>,
    by_name: HashMap<String, Ipv4Addr>,
}

impl LeaseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a lease to the index and its interface. Fails on a duplicate
    /// address, a duplicate hostname, a blocked address, or a duplicate MAC
    /// on the interface; on success the caller persists.
    pub fn add(&mut self, lease: &Lease, iface: &mut IfaceV4) -> Result<()> {
        if self.by_addr.contains_key(&lease.ip) {
            return Err(DhcpError::State(format!("{} is already leased", lease.ip)));
        }
        if iface.is_blocked(lease.ip) {
            return Err(DhcpError::State(format!("{} is blocked", lease.ip)));
        }
        let name = lease.hostname.to_lowercase();
        if !name.is_empty() && self.by_name.contains_key(&name) {
            return Err(DhcpError::State(format!(
                "hostname {:?} is already in use",
                lease.hostname
            )));
        }

        iface.insert_lease(lease.clone())?;
        self.by_addr.insert(lease.ip, lease.hwaddr);
        if !name.is_empty() {
            self.by_name.insert(name, lease.ip);
        }
        Ok(())
    }

    /// Replaces the record owned by `lease.hwaddr`, swapping the (ip,
    /// hostname) keys. Fails when another MAC owns either key.
    pub fn update(&mut self, lease: &Lease, iface: &mut IfaceV4) -> Result<()> {
        let Some(old) = iface.lease_for(&lease.hwaddr).cloned() else {
            return Err(DhcpError::State(format!("no lease for {}", lease.hwaddr)));
        };

        if let Some(owner) = self.by_addr.get(&lease.ip) {
            if *owner != lease.hwaddr {
                return Err(DhcpError::State(format!(
                    "{} is leased to {owner}",
                    lease.ip
                )));
            }
        }
        if iface.is_blocked(lease.ip) {
            return Err(DhcpError::State(format!("{} is blocked", lease.ip)));
        }
        let name = lease.hostname.to_lowercase();
        if !name.is_empty() {
            if let Some(owner_ip) = self.by_name.get(&name) {
                let owner = self.by_addr.get(owner_ip);
                if owner != Some(&lease.hwaddr) {
                    return Err(DhcpError::State(format!(
                        "hostname {:?} is already in use",
                        lease.hostname
                    )));
                }
            }
        }

        self.by_addr.remove(&old.ip);
        let old_name = old.hostname.to_lowercase();
        if !old_name.is_empty() {
            self.by_name.remove(&old_name);
        }

        iface.update_lease(lease.clone())?;
        self.by_addr.insert(lease.ip, lease.hwaddr);
        if !name.is_empty() {
            self.by_name.insert(name, lease.ip);
        }
        Ok(())
    }

    /// Removes a lease and its keys. Fails when the address key — or, for a
    /// named lease, the hostname key — is missing.
    pub fn remove(&mut self, lease: &Lease, iface: &mut IfaceV4) -> Result<()> {
        if !self.by_addr.contains_key(&lease.ip) {
            return Err(DhcpError::State(format!("{} is not leased", lease.ip)));
        }
        let name = lease.hostname.to_lowercase();
        if !name.is_empty() && !self.by_name.contains_key(&name) {
            return Err(DhcpError::State(format!(
                "hostname {:?} is not indexed",
                lease.hostname
            )));
        }

        iface.remove_lease(lease)?;
        self.by_addr.remove(&lease.ip);
        if !name.is_empty() {
            self.by_name.remove(&name);
        }
        Ok(())
    }

    /// Wipes both maps; callers also reset each interface and persist.
    pub fn clear(&mut self) {
        self.by_addr.clear();
        self.by_name.clear();
    }

    /// MAC that owns `ip`, if any.
    pub fn owner_of(&self, ip: Ipv4Addr) -> Option<HwAddr> {
        self.by_addr.get(&ip).copied()
    }

    /// Address bound to `hostname` (case-insensitive), if any.
    pub fn addr_of(&self, hostname: &str) -> Option<Ipv4Addr> {
        self.by_name.get(&hostname.to_lowercase()).copied()
    }
}

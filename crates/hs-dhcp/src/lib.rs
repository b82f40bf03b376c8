//! DHCPv4 server core: per-interface capture loops, the RFC 2131 message
//! engine, the process-wide lease index and the persistent lease database.
//!
//! The surrounding platform (DNS resolution of lease hostnames, the admin
//! surface, DHCPv6) consumes this crate through [`DhcpServer`].

pub mod clock;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod engine;
pub mod frame;
pub mod iface;
pub mod index;
pub mod lease;
pub mod options;
pub mod packet;
pub mod range;
pub mod server;
pub mod store;
pub mod v6;

pub use config::DhcpConfig;
pub use lease::{HwAddr, Lease};
pub use server::DhcpServer;

use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::warn;

use crate::iface::IfaceV4;
use crate::index::LeaseIndex;
use crate::store::LeaseDb;

#[derive(Error, Debug)]
pub enum DhcpError {
    /// Invalid operator configuration; joined per-field messages.
    #[error("configuration: {0}")]
    Config(String),

    /// Malformed or unexpected wire data; the packet is dropped.
    #[error("protocol: {0}")]
    Protocol(String),

    /// A lease mutation precondition failed (duplicate IP, duplicate
    /// hostname, missing key). Never surfaced to DHCP clients.
    #[error("lease state: {0}")]
    State(String),

    /// Lease database I/O. In-memory state stays committed; persistence is
    /// strictly the last step of every mutation.
    #[error("lease db: {0}")]
    Store(#[source] std::io::Error),

    /// Capture device I/O.
    #[error("device: {0}")]
    Device(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DhcpError>;

/// Process-wide lease state. One reader/writer lock guards the whole of it:
/// the index, every interface's lease table and offset bits, and the pending
/// OFFER scratch. Mutating handlers hold the writer side for their full
/// compute-and-commit sequence; lookups take the reader side.
pub struct Registry {
    pub(crate) ifaces: Vec<IfaceV4>,
    pub(crate) index: LeaseIndex,
    pub(crate) db: LeaseDb,
}

pub type SharedRegistry = Arc<RwLock<Registry>>;

impl Registry {
    pub(crate) fn new(ifaces: Vec<IfaceV4>, db: LeaseDb) -> Self {
        Self {
            ifaces,
            index: LeaseIndex::new(),
            db,
        }
    }

    /// Index of the unique interface whose subnet contains `ip`.
    pub(crate) fn iface_for_addr(&self, ip: Ipv4Addr) -> Option<usize> {
        self.ifaces.iter().position(|i| i.subnet_contains(ip))
    }

    /// Index of the interface answering to `server_id` (option 54).
    pub(crate) fn iface_for_server_id(&self, server_id: Ipv4Addr) -> Option<usize> {
        self.ifaces.iter().position(|i| i.server_ip == server_id)
    }

    /// Every live lease, blocked reservations included.
    pub(crate) fn all_leases(&self) -> Vec<Lease> {
        self.ifaces
            .iter()
            .flat_map(|i| i.all_leases().cloned())
            .collect()
    }

    /// Rewrites the lease database from the in-memory state. Callers invoke
    /// this strictly after the in-memory commit.
    pub(crate) fn persist(&self) -> Result<()> {
        self.db.store(&self.all_leases())
    }

    /// Persist for wire-driven paths: the mutation stays committed, a disk
    /// fault is only logged.
    pub(crate) fn persist_logged(&self) {
        if let Err(e) = self.persist() {
            warn!("failed to persist leases: {e}");
        }
    }

    /// Adds `lease` on interface `idx` with full uniqueness checks, then
    /// persists. A persist failure is returned, but the lease stays added.
    pub(crate) fn add_lease(&mut self, idx: usize, lease: &Lease) -> Result<()> {
        let Registry { ifaces, index, .. } = self;
        index.add(lease, &mut ifaces[idx])?;
        self.persist()
    }

    pub(crate) fn update_lease(&mut self, idx: usize, lease: &Lease) -> Result<()> {
        let Registry { ifaces, index, .. } = self;
        index.update(lease, &mut ifaces[idx])?;
        self.persist()
    }

    pub(crate) fn remove_lease(&mut self, idx: usize, lease: &Lease) -> Result<()> {
        let Registry { ifaces, index, .. } = self;
        index.remove(lease, &mut ifaces[idx])?;
        self.persist()
    }

    /// Converts the record owned by `hw` on interface `idx` into a blocked
    /// reservation held until `until` (DHCPDECLINE).
    pub(crate) fn block_lease(
        &mut self,
        idx: usize,
        hw: &HwAddr,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let Registry { ifaces, index, .. } = self;
        let iface = &mut ifaces[idx];
        let Some(lease) = iface.lease_for(hw).cloned() else {
            return Err(DhcpError::State(format!("no lease for {hw}")));
        };
        index.remove(&lease, iface)?;
        iface.add_blocked(lease.ip, until);
        self.persist()
    }

    /// Drops expired dynamic leases and expired blocked reservations on
    /// interface `idx`, returning their addresses to the pool. Records owned
    /// by `keep` survive, so an expired lease can be re-offered to its
    /// previous holder.
    pub(crate) fn reclaim_expired(&mut self, idx: usize, now: DateTime<Utc>, keep: &HwAddr) {
        let Registry { ifaces, index, .. } = self;
        let iface = &mut ifaces[idx];

        let expired: Vec<Lease> = iface
            .find_expired(now)
            .into_iter()
            .filter(|l| l.hwaddr != *keep)
            .collect();
        if expired.is_empty() {
            return;
        }
        for lease in &expired {
            if lease.is_blocked() {
                iface.remove_blocked(lease.ip);
            } else if let Err(e) = index.remove(lease, iface) {
                warn!("failed to reclaim {}: {e}", lease.ip);
            }
        }
        self.persist_logged();
    }

    /// Ends every pending OFFER held for `hw` (a REQUEST arrived, ours or an
    /// opposing server's).
    pub(crate) fn clear_offers(&mut self, hw: &HwAddr) {
        for iface in &mut self.ifaces {
            iface.clear_offer(hw);
        }
    }

    /// Wipes the index and every interface's state, then persists the empty
    /// database.
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.index.clear();
        for iface in &mut self.ifaces {
            iface.reset();
        }
        self.persist()
    }
}

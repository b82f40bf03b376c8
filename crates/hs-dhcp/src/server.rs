//! Server façade: lifecycle, the lease CRUD and lookup API consumed by the
//! DNS and admin subsystems, and lease database wiring.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::DateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::DhcpConfig;
use crate::device::{AddrChecker, DeviceManager, LinkType, NetDevice};
use crate::dispatcher::{self, ReaderCtx};
use crate::iface::IfaceV4;
use crate::lease::{HwAddr, Lease};
use crate::store::LeaseDb;
use crate::{DhcpError, Registry, Result, SharedRegistry};

#[derive(Default)]
struct RunState {
    devices: Arc<Vec<Arc<dyn NetDevice>>>,
    tasks: Vec<JoinHandle<()>>,
}

/// The DHCPv4 server: one capture reader per configured interface over a
/// shared lease registry.
pub struct DhcpServer {
    enabled: bool,
    local_domain: String,
    registry: SharedRegistry,
    clock: Arc<dyn Clock>,
    checker: Arc<dyn AddrChecker>,
    run: Mutex<RunState>,
}

impl DhcpServer {
    /// Validates the configuration, builds per-interface state and loads
    /// the lease database. Validation failures across interfaces are
    /// joined into one configuration error.
    pub fn new(
        conf: &DhcpConfig,
        clock: Arc<dyn Clock>,
        checker: Arc<dyn AddrChecker>,
    ) -> Result<Self> {
        let mut errors: Vec<String> = Vec::new();
        if conf.enabled && conf.db_path.is_empty() {
            errors.push("db_path is required".to_string());
        }

        let mut names: Vec<&String> = conf.interfaces.keys().collect();
        names.sort();

        let mut ifaces: Vec<IfaceV4> = Vec::new();
        for name in names {
            match IfaceV4::from_config(name, &conf.interfaces[name].v4) {
                Ok(Some(iface)) => ifaces.push(iface),
                Ok(None) => {}
                Err(DhcpError::Config(msg)) => errors.push(msg),
                Err(e) => errors.push(e.to_string()),
            }
        }
        if !errors.is_empty() {
            return Err(DhcpError::Config(errors.join("; ")));
        }

        let mut registry = Registry::new(ifaces, LeaseDb::new(&conf.db_path));
        if conf.enabled {
            load_db(&mut registry)?;
        }

        Ok(Self {
            enabled: conf.enabled,
            local_domain: conf.local_domain.clone(),
            registry: Arc::new(RwLock::new(registry)),
            clock,
            checker,
            run: Mutex::new(RunState::default()),
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// TLD the DNS subsystem appends to lease hostnames.
    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    /// Opens one capture device per interface, learns each interface's
    /// server identity from its device, and spawns the reader tasks.
    pub fn start(&self, manager: &dyn DeviceManager) -> Result<()> {
        if !self.enabled {
            info!("DHCP server disabled");
            return Ok(());
        }

        let names: Vec<String> = self.read().ifaces.iter().map(|i| i.name.clone()).collect();

        let mut devices: Vec<Arc<dyn NetDevice>> = Vec::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            let device = manager.open(name).map_err(DhcpError::Device)?;
            if device.link_type() != LinkType::Ethernet {
                return Err(DhcpError::Device(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{name}: not an Ethernet device"),
                )));
            }
            let addrs = device.addresses().map_err(DhcpError::Device)?;
            let hw = device.hwaddr().map_err(DhcpError::Device)?;

            let server_ip = {
                let mut reg = self.write();
                let iface = &mut reg.ifaces[idx];
                let v4: Vec<Ipv4Addr> = addrs
                    .iter()
                    .filter_map(|a| match a {
                        IpAddr::V4(v4) => Some(*v4),
                        IpAddr::V6(_) => None,
                    })
                    .collect();
                let server_ip = v4
                    .iter()
                    .copied()
                    .find(|a| iface.subnet_contains(*a))
                    .or_else(|| v4.first().copied())
                    .ok_or_else(|| {
                        DhcpError::Device(io::Error::new(
                            io::ErrorKind::AddrNotAvailable,
                            format!("{name}: no IPv4 address on device"),
                        ))
                    })?;
                iface.server_ip = server_ip;
                iface.server_hw = hw;
                server_ip
            };

            info!("{name}: serving DHCPv4 as {server_ip} ({hw})");
            devices.push(device);
        }

        let devices = Arc::new(devices);
        let mut tasks = Vec::with_capacity(names.len());
        for (idx, name) in names.iter().enumerate() {
            let ctx = ReaderCtx {
                registry: self.registry.clone(),
                clock: self.clock.clone(),
                checker: self.checker.clone(),
                devices: devices.clone(),
                iface: idx,
                iface_name: name.clone(),
            };
            tasks.push(tokio::task::spawn_blocking(move || {
                dispatcher::run_reader(ctx)
            }));
        }

        let mut run = self.lock_run();
        run.devices = devices;
        run.tasks = tasks;
        Ok(())
    }

    /// Runs until every reader exits (shutdown closes the devices, readers
    /// observe EOF).
    pub async fn serve(&self, manager: &dyn DeviceManager) -> Result<()> {
        self.start(manager)?;
        let tasks = {
            let mut run = self.lock_run();
            std::mem::take(&mut run.tasks)
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!("reader task failed: {e}");
            }
        }
        Ok(())
    }

    /// Closes every device and waits for readers still tracked here (those
    /// not already consumed by [`serve`]).
    pub async fn shutdown(&self) {
        let (devices, tasks) = {
            let mut run = self.lock_run();
            (
                std::mem::take(&mut run.devices),
                std::mem::take(&mut run.tasks),
            )
        };
        for device in devices.iter() {
            device.close();
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    // ── Lease API for the surrounding subsystems ───────────────────────

    /// Snapshot of every lease, blocked reservations included.
    pub fn leases(&self) -> Vec<Lease> {
        self.read().all_leases()
    }

    /// Hostname bound to `ip`, when a lease with a hostname owns it.
    pub fn host_by_ip(&self, ip: Ipv4Addr) -> Option<String> {
        let reg = self.read();
        let hw = reg.index.owner_of(ip)?;
        let idx = reg.iface_for_addr(ip)?;
        let lease = reg.ifaces[idx].lease_for(&hw)?;
        if lease.hostname.is_empty() {
            None
        } else {
            Some(lease.hostname.clone())
        }
    }

    /// MAC bound to `ip`, when leased.
    pub fn mac_by_ip(&self, ip: Ipv4Addr) -> Option<HwAddr> {
        self.read().index.owner_of(ip)
    }

    /// Address bound to `hostname` (case-insensitive), when leased.
    pub fn ip_by_host(&self, hostname: &str) -> Option<Ipv4Addr> {
        self.read().index.addr_of(hostname)
    }

    /// Adds an administrative lease. Static leases get their expiry pinned
    /// to the epoch regardless of input.
    pub fn add_lease(&self, lease: Lease) -> Result<()> {
        let mut lease = lease;
        if lease.is_static {
            lease.expiry = DateTime::UNIX_EPOCH;
        }
        let mut reg = self.write();
        let idx = reg.iface_for_addr(lease.ip).ok_or_else(|| {
            DhcpError::State(format!("no configured interface serves {}", lease.ip))
        })?;
        reg.add_lease(idx, &lease)
    }

    /// Replaces the static lease owned by `lease.hwaddr`. The record cannot
    /// move to another interface's subnet.
    pub fn update_static_lease(&self, lease: Lease) -> Result<()> {
        let lease = Lease::statik(lease.ip, lease.hwaddr, lease.hostname);
        let mut reg = self.write();
        let idx = reg.iface_for_addr(lease.ip).ok_or_else(|| {
            DhcpError::State(format!("no configured interface serves {}", lease.ip))
        })?;
        let holder = reg
            .ifaces
            .iter()
            .position(|i| i.lease_for(&lease.hwaddr).is_some());
        match holder {
            Some(owner) if owner == idx => reg.update_lease(idx, &lease),
            Some(_) => Err(DhcpError::State(format!(
                "lease for {} cannot move across interfaces",
                lease.hwaddr
            ))),
            None => Err(DhcpError::State(format!("no lease for {}", lease.hwaddr))),
        }
    }

    /// Removes the lease matching `lease`'s address, MAC and hostname.
    pub fn remove_lease(&self, lease: &Lease) -> Result<()> {
        let mut reg = self.write();
        let idx = reg.iface_for_addr(lease.ip).ok_or_else(|| {
            DhcpError::State(format!("no configured interface serves {}", lease.ip))
        })?;
        if reg.index.owner_of(lease.ip) != Some(lease.hwaddr) {
            return Err(DhcpError::State(format!(
                "{} is not leased to {}",
                lease.ip, lease.hwaddr
            )));
        }
        reg.remove_lease(idx, lease)
    }

    /// Drops every lease and reservation and persists the empty database.
    pub fn reset(&self) -> Result<()> {
        self.write().clear()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        match self.registry.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, RunState> {
        match self.run.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Replays the lease database into the registry. Records that no longer
/// match a configured interface, or collide, are logged and skipped.
fn load_db(registry: &mut Registry) -> Result<()> {
    let (leases, stats) = registry.db.load()?;
    let mut restored = 0usize;
    for lease in leases {
        let Some(idx) = registry.iface_for_addr(lease.ip) else {
            warn!("lease db: no configured interface serves {}, skipping", lease.ip);
            continue;
        };
        if lease.is_blocked() {
            registry.ifaces[idx].add_blocked(lease.ip, lease.expiry);
            restored += 1;
            continue;
        }
        let Registry { ifaces, index, .. } = registry;
        match index.add(&lease, &mut ifaces[idx]) {
            Ok(()) => restored += 1,
            Err(e) => warn!("lease db: skipping {}: {e}", lease.ip),
        }
    }
    info!(
        "lease db: loaded {} v4 and {} v6 leases ({} total, {} restored)",
        stats.v4,
        stats.v6,
        stats.total(),
        restored
    );
    Ok(())
}

//! Per-interface capture loop: drains frames in arrival order, peels
//! Ethernet → IPv4 → UDP, and hands BOOTREQUESTs to the engine. One reader
//! runs per device; handlers across interfaces serialize on the registry
//! lock.

use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::device::{AddrChecker, NetDevice};
use crate::engine::{self, Reply};
use crate::frame::{
    self, DHCP_SERVER_PORT, ETHER_BROADCAST, ETHERTYPE_IPV4, ETHERTYPE_IPV6, IPPROTO_UDP,
};
use crate::packet::{BOOTREQUEST, DhcpPacket};
use crate::{Registry, Result, SharedRegistry, v6};

/// Everything one reader task needs. Devices are indexed like the
/// registry's interfaces so a reply can leave through the interface that
/// owns it.
pub(crate) struct ReaderCtx {
    pub registry: SharedRegistry,
    pub clock: Arc<dyn Clock>,
    pub checker: Arc<dyn AddrChecker>,
    pub devices: Arc<Vec<Arc<dyn NetDevice>>>,
    pub iface: usize,
    pub iface_name: String,
}

impl ReaderCtx {
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
}

/// Blocking capture loop; runs until the device reports EOF.
pub(crate) fn run_reader(ctx: ReaderCtx) {
    let device = ctx.devices[ctx.iface].clone();
    loop {
        let raw = match device.read_packet_data() {
            Ok(frame) => frame,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("{}: capture closed", ctx.iface_name);
                return;
            }
            Err(e) => {
                warn!("{}: capture read failed: {e}", ctx.iface_name);
                return;
            }
        };

        if let Err(e) = handle_frame(&ctx, &raw) {
            debug!("{}: dropping frame: {e}", ctx.iface_name);
        }
    }
}

fn handle_frame(ctx: &ReaderCtx, raw: &[u8]) -> Result<()> {
    let Some((eth, ip_packet)) = frame::decode_ethernet(raw) else {
        debug!("{}: frame below Ethernet minimum, skipping", ctx.iface_name);
        return Ok(());
    };

    match eth.ethertype {
        ETHERTYPE_IPV4 => {}
        ETHERTYPE_IPV6 => return v6::handle_packet(ip_packet),
        other => {
            trace!("{}: ignoring ethertype {other:#06x}", ctx.iface_name);
            return Ok(());
        }
    }

    let Some((ip, datagram)) = frame::decode_ipv4(ip_packet) else {
        debug!("{}: not an IPv4 packet, skipping", ctx.iface_name);
        return Ok(());
    };
    if ip.protocol != IPPROTO_UDP {
        return Ok(());
    }

    let Some((udp, payload)) = frame::decode_udp(datagram) else {
        debug!("{}: truncated UDP datagram, skipping", ctx.iface_name);
        return Ok(());
    };
    if udp.dst_port != DHCP_SERVER_PORT {
        return Ok(());
    }

    let packet = DhcpPacket::parse(payload)?;
    if packet.op != BOOTREQUEST {
        debug!("{}: ignoring non-BOOTREQUEST op {}", ctx.iface_name, packet.op);
        return Ok(());
    }

    let reply = {
        let mut reg = ctx.write();
        engine::handle_packet(&mut reg, ctx.iface, &packet, &*ctx.clock, &*ctx.checker)?
    };

    if let Some(reply) = reply {
        send_reply(ctx, reply);
    }
    Ok(())
}

/// Serializes the reply into a broadcast Ethernet/IPv4/UDP frame and writes
/// it through the owning interface's device.
fn send_reply(ctx: &ReaderCtx, reply: Reply) {
    let (server_ip, server_hw) = {
        let reg = ctx.read();
        let iface = &reg.ifaces[reply.iface];
        (iface.server_ip, iface.server_hw)
    };

    let mut src_mac = [0u8; 6];
    src_mac.copy_from_slice(&server_hw.as_bytes()[..6]);

    let payload = reply.packet.to_bytes();
    let wire = frame::encode_udp_frame(
        &src_mac,
        &ETHER_BROADCAST,
        server_ip,
        Ipv4Addr::BROADCAST,
        frame::DHCP_SERVER_PORT,
        frame::DHCP_CLIENT_PORT,
        &payload,
    );

    let device = &ctx.devices[reply.iface];
    if let Err(e) = device.write_packet_data(&wire) {
        warn!("failed to send reply on device {}: {e}", reply.iface);
    }
}

//! Capture-device capability consumed by the dispatcher, the availability
//! probe hook, and the Linux AF_PACKET implementation used in production.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

/// Link layer reported by a device. The dispatcher only serves Ethernet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
    Other,
}

/// One opened capture handle.
///
/// `read_packet_data` blocks until a frame arrives; once the device is
/// closed it returns `ErrorKind::UnexpectedEof`, which readers treat as a
/// normal shutdown. Writes to one device serialize internally; distinct
/// devices never serialize on each other.
pub trait NetDevice: Send + Sync {
    /// Next captured frame, starting at the Ethernet header.
    fn read_packet_data(&self) -> io::Result<Vec<u8>>;

    /// Transmit one raw frame.
    fn write_packet_data(&self, frame: &[u8]) -> io::Result<()>;

    /// Addresses assigned to the underlying interface.
    fn addresses(&self) -> io::Result<Vec<IpAddr>>;

    /// Hardware address of the underlying interface.
    fn hwaddr(&self) -> io::Result<crate::lease::HwAddr>;

    fn link_type(&self) -> LinkType;

    /// Releases resources and unblocks pending readers with EOF.
    fn close(&self);
}

/// Opens capture devices for configured interface names.
pub trait DeviceManager: Send + Sync {
    fn open(&self, iface: &str) -> io::Result<Arc<dyn NetDevice>>;
}

/// Pre-offer address probe. Deployments may answer with an ICMP echo under
/// the configured deadline; an address reported unavailable becomes a
/// blocked reservation instead of an OFFER.
pub trait AddrChecker: Send + Sync {
    fn is_available(&self, ip: Ipv4Addr) -> io::Result<bool>;
}

/// Default probe: every address is available.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopChecker;

impl AddrChecker for NoopChecker {
    fn is_available(&self, _ip: Ipv4Addr) -> io::Result<bool> {
        Ok(true)
    }
}

#[cfg(target_os = "linux")]
pub use linux::PacketCaptureManager;

#[cfg(target_os = "linux")]
pub mod linux {
    //! Raw packet sockets bound to one interface each.

    use std::fs;
    use std::io::{self, ErrorKind};
    use std::mem::MaybeUninit;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use socket2::{Domain, Protocol, Socket, Type};

    use super::{DeviceManager, LinkType, NetDevice};
    use crate::lease::HwAddr;

    /// ETH_P_ALL; packet sockets take the protocol in network byte order.
    const ETH_P_ALL: u16 = 0x0003;

    /// ARPHRD_ETHER in /sys/class/net/<if>/type.
    const ARPHRD_ETHER: u32 = 1;

    /// Poll interval that lets a blocked reader observe `close()`.
    const READ_TIMEOUT: Duration = Duration::from_millis(500);

    const CAPTURE_BUF: usize = 2048;

    pub struct PacketCapture {
        name: String,
        rx: Socket,
        tx: Socket,
        closed: AtomicBool,
    }

    impl PacketCapture {
        pub fn open(name: &str) -> io::Result<Self> {
            let rx = raw_socket(name)?;
            rx.set_read_timeout(Some(READ_TIMEOUT))?;
            let tx = raw_socket(name)?;
            Ok(Self {
                name: name.to_string(),
                rx,
                tx,
                closed: AtomicBool::new(false),
            })
        }

        fn sysfs(&self, attr: &str) -> io::Result<String> {
            let raw = fs::read_to_string(format!("/sys/class/net/{}/{attr}", self.name))?;
            Ok(raw.trim().to_string())
        }
    }

    fn raw_socket(name: &str) -> io::Result<Socket> {
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(i32::from(ETH_P_ALL.to_be()))),
        )?;
        socket.bind_device(Some(name.as_bytes()))?;
        Ok(socket)
    }

    impl NetDevice for PacketCapture {
        fn read_packet_data(&self) -> io::Result<Vec<u8>> {
            let mut buf = [MaybeUninit::<u8>::uninit(); CAPTURE_BUF];
            loop {
                if self.closed.load(Ordering::Acquire) {
                    return Err(ErrorKind::UnexpectedEof.into());
                }
                match self.rx.recv(&mut buf) {
                    Ok(n) => {
                        // SAFETY: recv initialized the first n bytes.
                        let frame = buf[..n]
                            .iter()
                            .map(|b| unsafe { b.assume_init() })
                            .collect();
                        return Ok(frame);
                    }
                    Err(e)
                        if e.kind() == ErrorKind::WouldBlock
                            || e.kind() == ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        fn write_packet_data(&self, frame: &[u8]) -> io::Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(ErrorKind::UnexpectedEof.into());
            }
            self.tx.send(frame)?;
            Ok(())
        }

        fn addresses(&self) -> io::Result<Vec<IpAddr>> {
            // A connected datagram socket bound to the device reveals the
            // address the kernel sources traffic from on that interface; no
            // packet leaves the host for this.
            let probe = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
            probe.bind_device(Some(self.name.as_bytes()))?;
            let target: SocketAddr = (Ipv4Addr::new(198, 51, 100, 1), 53).into();
            probe.connect(&target.into())?;
            let local = probe
                .local_addr()?
                .as_socket()
                .ok_or_else(|| io::Error::new(ErrorKind::Other, "no local address"))?;
            Ok(vec![local.ip()])
        }

        fn hwaddr(&self) -> io::Result<HwAddr> {
            let raw = self.sysfs("address")?;
            HwAddr::parse(&raw)
                .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))
        }

        fn link_type(&self) -> LinkType {
            match self.sysfs("type").ok().and_then(|t| t.parse::<u32>().ok()) {
                Some(ARPHRD_ETHER) => LinkType::Ethernet,
                _ => LinkType::Other,
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }
    }

    /// Opens one AF_PACKET capture per configured interface.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct PacketCaptureManager;

    impl DeviceManager for PacketCaptureManager {
        fn open(&self, iface: &str) -> io::Result<Arc<dyn NetDevice>> {
            Ok(Arc::new(PacketCapture::open(iface)?))
        }
    }
}

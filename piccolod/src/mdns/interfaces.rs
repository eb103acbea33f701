//! Link-layer interface enumeration.
//!
//! The watcher only produces observations; all per-interface state (sockets,
//! health, tasks) is owned by the responder, which diffs each snapshot
//! against what it already runs.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tracing::trace;

/// What one poll of the OS interface list saw for a single interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceObservation {
    pub name: String,
    pub index: u32,
    /// Best advertisable addresses per family.
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    /// Every address configured on the interface, used to tell our own
    /// looped-back traffic from foreign responders.
    pub addresses: Vec<std::net::IpAddr>,
}

impl InterfaceObservation {
    pub fn has_address(&self) -> bool {
        self.ipv4.is_some() || self.ipv6.is_some()
    }
}

/// Source of interface observations. The system implementation reads
/// `getifaddrs`; tests inject fixed snapshots.
pub trait InterfaceSource: Send + Sync {
    fn enumerate(&self) -> io::Result<Vec<InterfaceObservation>>;
}

/// IPv6 scope preference: global beats unique-local beats link-local.
/// Link-local stays eligible because RFC 6762 requires answering on
/// link-local-only interfaces.
fn v6_rank(addr: &Ipv6Addr) -> u8 {
    let head = addr.segments()[0];
    if (head & 0xffc0) == 0xfe80 {
        0 // link-local
    } else if (head & 0xfe00) == 0xfc00 {
        1 // unique-local
    } else {
        2 // global
    }
}

fn is_v4_link_local(addr: &Ipv4Addr) -> bool {
    let octets = addr.octets();
    octets[0] == 169 && octets[1] == 254
}

pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn enumerate(&self) -> io::Result<Vec<InterfaceObservation>> {
        let addrs = getifaddrs().map_err(io::Error::from)?;
        let mut observations: Vec<InterfaceObservation> = Vec::new();

        for ifaddr in addrs {
            let flags = ifaddr.flags;
            if flags.contains(InterfaceFlags::IFF_LOOPBACK)
                || !flags.contains(InterfaceFlags::IFF_UP)
                || !flags.contains(InterfaceFlags::IFF_MULTICAST)
            {
                continue;
            }

            let position = observations
                .iter()
                .position(|obs| obs.name == ifaddr.interface_name);
            let position = match position {
                Some(position) => position,
                None => {
                    let index = nix::net::if_::if_nametoindex(ifaddr.interface_name.as_str())
                        .unwrap_or(0);
                    observations.push(InterfaceObservation {
                        name: ifaddr.interface_name.clone(),
                        index,
                        ipv4: None,
                        ipv6: None,
                        addresses: Vec::new(),
                    });
                    observations.len() - 1
                }
            };
            let entry = &mut observations[position];

            let Some(address) = ifaddr.address else {
                continue;
            };
            if let Some(sin) = address.as_sockaddr_in() {
                let ip = Ipv4Addr::from(sin.ip());
                entry.addresses.push(ip.into());
                // IPv4 link-local is useless for advertising.
                if !is_v4_link_local(&ip) {
                    entry.ipv4 = Some(ip);
                }
            } else if let Some(sin6) = address.as_sockaddr_in6() {
                let ip = sin6.ip();
                entry.addresses.push(ip.into());
                let better = match entry.ipv6 {
                    Some(current) => v6_rank(&ip) > v6_rank(&current),
                    None => true,
                };
                if better {
                    entry.ipv6 = Some(ip);
                }
            }
        }

        observations.retain(InterfaceObservation::has_address);
        trace!(count = observations.len(), "interface scan complete");
        Ok(observations)
    }
}

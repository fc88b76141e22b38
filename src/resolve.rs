//! Bind address resolution for the table store transport.
//!
//! The configured value is either a literal IP address, used as-is, or
//! the name of a local network interface whose first usable unicast
//! address becomes the bind address.

use std::net::{IpAddr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

use log::debug;

use crate::error::{Error, Result};

/// Resolve a literal address or interface name into a bind address.
pub fn resolve_addr(addr_or_interface: &str) -> Result<String> {
    if addr_or_interface.parse::<IpAddr>().is_ok() {
        return Ok(addr_or_interface.to_string());
    }

    get_bind_addr(addr_or_interface)
}

fn get_bind_addr(iface_name: &str) -> Result<String> {
    let addrs = interface_addrs(iface_name)?;
    let addr = select_bind_addr(iface_name, addrs)?;
    debug!("Resolved interface {} to bind address {}", iface_name, addr);
    Ok(addr.to_string())
}

/// Addresses assigned to the named interface, in kernel order.
///
/// Fails with [`Error::InterfaceNotFound`] when no interface carries the
/// name. An interface without IP addresses yields an empty list.
fn interface_addrs(iface_name: &str) -> Result<Vec<IpAddr>> {
    let ifaddrs = nix::ifaddrs::getifaddrs().map_err(Error::InterfaceAddrs)?;

    let mut found = false;
    let mut addrs = Vec::new();
    for ifaddr in ifaddrs {
        if ifaddr.interface_name != iface_name {
            continue;
        }
        found = true;

        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            addrs.push(IpAddr::V4(*SocketAddrV4::from(*sin).ip()));
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            addrs.push(IpAddr::V6(*SocketAddrV6::from(*sin6).ip()));
        }
    }

    if !found {
        return Err(Error::InterfaceNotFound(iface_name.to_string()));
    }
    Ok(addrs)
}

/// Pick the first address that is neither link-local nor multicast.
pub(crate) fn select_bind_addr<I>(iface_name: &str, addrs: I) -> Result<IpAddr>
where
    I: IntoIterator<Item = IpAddr>,
{
    addrs
        .into_iter()
        .find(|ip| !ip.is_multicast() && !is_link_local_unicast(ip))
        .ok_or_else(|| Error::NoBindAddress(iface_name.to_string()))
}

fn is_link_local_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => is_unicast_link_local_v6(v6),
    }
}

// fe80::/10
fn is_unicast_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

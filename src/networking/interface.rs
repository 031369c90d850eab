use if_addrs::{get_if_addrs, IfAddr};
use local_ip_address::local_ip;
use log::{debug, info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr};

use crate::error::{Result, TransferError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceType {
    Ethernet,
    Wifi,
    Loopback,
    Other,
}

#[derive(Debug, Clone)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: IpAddr,
    /// Directed broadcast address, IPv4 only
    pub broadcast: Option<Ipv4Addr>,
    pub interface_type: InterfaceType,
    pub priority: u8, // Higher number = higher priority
}

impl NetworkInterface {
    pub fn new(name: String, ip: IpAddr, broadcast: Option<Ipv4Addr>) -> Self {
        let interface_type = Self::detect_interface_type(&name, &ip);
        let priority = match interface_type {
            InterfaceType::Ethernet => 80,
            InterfaceType::Wifi => 60,
            InterfaceType::Loopback => 10,
            InterfaceType::Other => 1,
        };

        Self {
            name,
            ip,
            broadcast,
            interface_type,
            priority,
        }
    }

    fn is_ethernet(name: &str) -> bool {
        name.starts_with("eth") || name.starts_with("en")
    }

    fn is_wifi(name: &str) -> bool {
        name.contains("wlan") || name.contains("wifi") || name.starts_with("wl")
    }

    fn is_loopback(name: &str, ip: &IpAddr) -> bool {
        name == "lo" || name.starts_with("lo0") || ip.is_loopback()
    }

    /// Detect the interface type based on interface name and address
    fn detect_interface_type(name: &str, ip: &IpAddr) -> InterfaceType {
        if Self::is_loopback(name, ip) {
            InterfaceType::Loopback
        } else if Self::is_wifi(name) {
            InterfaceType::Wifi
        } else if Self::is_ethernet(name) {
            InterfaceType::Ethernet
        } else {
            InterfaceType::Other
        }
    }
}

/// Broadcast address of an IPv4 network given the host address and netmask
pub fn broadcast_for(ip: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(netmask))
}

/// Discover all network interfaces on the system, highest priority first
pub fn discover_interfaces() -> Result<Vec<NetworkInterface>> {
    let if_addrs = get_if_addrs()
        .map_err(|e| TransferError::connection("failed to get network interfaces", e))?;

    let mut interfaces = Vec::new();
    for interface in if_addrs {
        let (ip, broadcast) = match &interface.addr {
            IfAddr::V4(addr) => (IpAddr::V4(addr.ip), Some(broadcast_for(addr.ip, addr.netmask))),
            IfAddr::V6(addr) => (IpAddr::V6(addr.ip), None),
        };

        if ip.is_unspecified() || ip.is_multicast() {
            continue;
        }

        let interface = NetworkInterface::new(interface.name.clone(), ip, broadcast);
        debug!(
            "Discovered interface: {}, IP: {}, Type: {:?}",
            interface.name, interface.ip, interface.interface_type
        );
        interfaces.push(interface);
    }

    interfaces.sort_by(|a, b| b.priority.cmp(&a.priority));

    if interfaces.is_empty() {
        warn!("No usable network interfaces found!");
    }

    Ok(interfaces)
}

/// Get the best non-loopback IPv4 interface for LAN transfers
pub fn get_best_interface() -> Result<NetworkInterface> {
    discover_interfaces()?
        .into_iter()
        .find(|i| i.interface_type != InterfaceType::Loopback && i.ip.is_ipv4())
        .ok_or_else(|| TransferError::Protocol("no suitable network interface found".to_string()))
}

fn find_ipv4_interface(name: &str) -> Result<(NetworkInterface, Ipv4Addr)> {
    discover_interfaces()?
        .into_iter()
        .find_map(|i| {
            let ip = match i.ip {
                IpAddr::V4(ip) => ip,
                IpAddr::V6(_) => return None,
            };
            (i.name == name).then(|| (i, ip))
        })
        .ok_or_else(|| {
            TransferError::connection(
                format!("failed to get IP address of interface '{}'", name),
                io::Error::new(io::ErrorKind::NotFound, "no IPv4 address on this interface"),
            )
        })
}

/// IPv4 address assigned to the named interface
pub fn resolve_interface_ip(name: &str) -> Result<Ipv4Addr> {
    find_ipv4_interface(name).map(|(_, ip)| ip)
}

/// Broadcast address of the named interface
pub fn resolve_interface_broadcast(name: &str) -> Result<Ipv4Addr> {
    let (interface, _) = find_ipv4_interface(name)?;
    let broadcast = interface.broadcast.ok_or_else(|| {
        TransferError::Protocol(format!("interface '{}' has no broadcast address", name))
    })?;

    info!("Broadcast address for {}: {}", name, broadcast);
    Ok(broadcast)
}

/// Host name of this machine, or "unknown" when the OS will not tell
pub fn local_hostname() -> String {
    match hostname::get() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            warn!("Failed to get hostname: {}", e);
            "unknown".to_string()
        }
    }
}

/// The local machine's main IPv4 address, if one can be determined
pub fn local_ipv4() -> Option<Ipv4Addr> {
    match local_ip() {
        Ok(IpAddr::V4(ip)) => Some(ip),
        Ok(IpAddr::V6(ip)) => {
            debug!("Local address is IPv6 ({}), no IPv4 available", ip);
            None
        }
        Err(err) => {
            debug!("Failed to determine local IP: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_for() {
        assert_eq!(
            broadcast_for(Ipv4Addr::new(192, 168, 1, 42), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 1, 255)
        );
        assert_eq!(
            broadcast_for(Ipv4Addr::new(10, 1, 2, 3), Ipv4Addr::new(255, 0, 0, 0)),
            Ipv4Addr::new(10, 255, 255, 255)
        );
    }

    #[test]
    fn test_interface_type_detection() {
        let v4 = IpAddr::V4(Ipv4Addr::new(192, 168, 0, 2));
        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);

        assert_eq!(NetworkInterface::new("lo".into(), lo, None).interface_type, InterfaceType::Loopback);
        assert_eq!(NetworkInterface::new("wlan0".into(), v4, None).interface_type, InterfaceType::Wifi);
        assert_eq!(NetworkInterface::new("wlp2s0".into(), v4, None).interface_type, InterfaceType::Wifi);
        assert_eq!(NetworkInterface::new("eth0".into(), v4, None).interface_type, InterfaceType::Ethernet);
        assert_eq!(NetworkInterface::new("docker0".into(), v4, None).interface_type, InterfaceType::Other);
    }

    #[test]
    fn test_unknown_interface_is_a_connection_error() {
        let err = resolve_interface_broadcast("no-such-interface-0").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Connection);
    }

    #[test]
    fn test_hostname_is_not_empty() {
        assert!(!local_hostname().is_empty());
    }
}

//! IPv4 endpoint addresses.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::str::FromStr;

/// Errors produced while parsing or resolving a [`NetAddress`].
#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    /// The string had no `:port` suffix or the port was not a number.
    #[error("invalid address '{0}', expected host:port")]
    Malformed(String),

    /// Name resolution produced no IPv4 address.
    #[error("no IPv4 address found for '{0}'")]
    Unresolved(String),
}

/// An IPv4 host and port. Equality and hashing compare both parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetAddress(SocketAddrV4);

impl NetAddress {
    /// Build an address from its parts.
    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self(SocketAddrV4::new(ip, port))
    }

    /// `127.0.0.1:port`.
    pub const fn loopback(port: u16) -> Self {
        Self::new(Ipv4Addr::LOCALHOST, port)
    }

    /// `0.0.0.0:port`, used when binding to every interface.
    pub const fn any(port: u16) -> Self {
        Self::new(Ipv4Addr::UNSPECIFIED, port)
    }

    /// The machine's primary IPv4 address with the given port.
    ///
    /// Determined by asking the OS which interface would route to a public
    /// address (no packet is sent). Falls back to loopback when the machine
    /// has no route.
    pub fn local(port: u16) -> Self {
        Self::new(primary_local_ip().unwrap_or(Ipv4Addr::LOCALHOST), port)
    }

    /// Host part.
    pub fn ip(&self) -> Ipv4Addr {
        *self.0.ip()
    }

    /// Port part.
    pub fn port(&self) -> u16 {
        self.0.port()
    }

    /// Same host, different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.ip(), port)
    }

    /// Whether the host is `127.0.0.0/8`.
    pub fn is_loopback(&self) -> bool {
        self.ip().is_loopback()
    }

    /// Resolve `host:port`, accepting names as well as dotted quads.
    pub fn resolve(text: &str) -> Result<Self, AddressError> {
        if let Ok(addr) = text.parse::<SocketAddrV4>() {
            return Ok(Self(addr));
        }
        let (_, port) = text
            .rsplit_once(':')
            .ok_or_else(|| AddressError::Malformed(text.to_owned()))?;
        port.parse::<u16>()
            .map_err(|_| AddressError::Malformed(text.to_owned()))?;

        text.to_socket_addrs()
            .map_err(|_| AddressError::Unresolved(text.to_owned()))?
            .find_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(Self(v4)),
                SocketAddr::V6(_) => None,
            })
            .ok_or_else(|| AddressError::Unresolved(text.to_owned()))
    }
}

fn primary_local_ip() -> Option<Ipv4Addr> {
    let probe = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.connect(SocketAddrV4::new(Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    match probe.local_addr().ok()? {
        SocketAddr::V4(v4) if !v4.ip().is_unspecified() => Some(*v4.ip()),
        _ => None,
    }
}

impl FromStr for NetAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::resolve(s)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddrV4> for NetAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self(addr)
    }
}

impl From<NetAddress> for SocketAddr {
    fn from(addr: NetAddress) -> Self {
        SocketAddr::V4(addr.0)
    }
}

impl TryFrom<SocketAddr> for NetAddress {
    type Error = AddressError;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(Self(v4)),
            SocketAddr::V6(v6) => Err(AddressError::Unresolved(v6.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotted_quad() {
        let addr: NetAddress = "127.0.0.1:9999".parse().unwrap();
        assert_eq!(addr.ip(), Ipv4Addr::LOCALHOST);
        assert_eq!(addr.port(), 9999);
        assert_eq!(addr.to_string(), "127.0.0.1:9999");
    }

    #[test]
    fn test_equality_uses_ip_and_port() {
        let a = NetAddress::loopback(1000);
        assert_eq!(a, "127.0.0.1:1000".parse().unwrap());
        assert_ne!(a, NetAddress::loopback(1001));
        assert_ne!(a, NetAddress::new(Ipv4Addr::new(10, 0, 0, 1), 1000));
    }

    #[test]
    fn test_missing_port_is_rejected() {
        assert!(matches!(
            "127.0.0.1".parse::<NetAddress>(),
            Err(AddressError::Malformed(_))
        ));
        assert!(matches!(
            "localhost:notaport".parse::<NetAddress>(),
            Err(AddressError::Malformed(_))
        ));
    }

    #[test]
    fn test_localhost_name_resolves() {
        let addr: NetAddress = "localhost:4000".parse().unwrap();
        assert!(addr.is_loopback());
        assert_eq!(addr.port(), 4000);
    }

    #[test]
    fn test_local_address_keeps_port() {
        let addr = NetAddress::local(1234);
        assert_eq!(addr.port(), 1234);
        assert!(!addr.ip().is_unspecified());
    }
}

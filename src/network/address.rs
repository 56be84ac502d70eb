use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::error::TorError;

/// Remote or local endpoint: an IP socket address or a hostname and port
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetAddress {
    Socket(SocketAddr),
    Host { hostname: String, port: u16 },
}

impl NetAddress {
    pub fn new(hostname: &str, port: u16) -> Self {
        match hostname.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
            Ok(ip) => NetAddress::Socket(SocketAddr::new(ip, port)),
            Err(_) => NetAddress::Host {
                hostname: hostname.to_ascii_lowercase(),
                port,
            },
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            NetAddress::Socket(addr) => addr.port(),
            NetAddress::Host { port, .. } => *port,
        }
    }

    /// Hostname, or the IP in text form
    pub fn hostname(&self) -> String {
        match self {
            NetAddress::Socket(addr) => addr.ip().to_string(),
            NetAddress::Host { hostname, .. } => hostname.clone(),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            NetAddress::Socket(addr) => Some(addr.ip()),
            NetAddress::Host { .. } => None,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            NetAddress::Socket(addr) => Some(*addr),
            NetAddress::Host { .. } => None,
        }
    }

    pub fn is_onion(&self) -> bool {
        matches!(self, NetAddress::Host { hostname, .. } if hostname.ends_with(".onion"))
    }

    /// Target string used in RELAY_BEGIN (`host:port`, IPv6 in brackets)
    pub fn to_begin_target(&self) -> String {
        match self {
            NetAddress::Socket(SocketAddr::V6(addr)) => format!("[{}]:{}", addr.ip(), addr.port()),
            other => other.to_string(),
        }
    }
}

impl From<SocketAddr> for NetAddress {
    fn from(addr: SocketAddr) -> Self {
        NetAddress::Socket(addr)
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetAddress::Socket(addr) => write!(f, "{}", addr),
            NetAddress::Host { hostname, port } => write!(f, "{}:{}", hostname, port),
        }
    }
}

impl FromStr for NetAddress {
    type Err = TorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(NetAddress::Socket(addr));
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TorError::InvalidConfig(format!("address without port: {}", s)))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TorError::InvalidConfig(format!("bad port in {}", s)))?;
        if host.is_empty() {
            return Err(TorError::InvalidConfig(format!("empty host in {}", s)));
        }
        Ok(NetAddress::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_variants() {
        let ip: NetAddress = "10.0.0.1:443".parse().unwrap();
        assert_eq!(ip.port(), 443);
        assert!(ip.ip().is_some());

        let host: NetAddress = "Example.COM:80".parse().unwrap();
        assert_eq!(host.hostname(), "example.com");
        assert!(host.ip().is_none());

        let v6: NetAddress = "[2001:db8::1]:9001".parse().unwrap();
        assert_eq!(v6.to_begin_target(), "[2001:db8::1]:9001");

        assert!("nohost".parse::<NetAddress>().is_err());
        assert!("host:notaport".parse::<NetAddress>().is_err());
    }

    #[test]
    fn test_onion_detection() {
        let addr = NetAddress::new("abcdefghijklmnop.onion", 80);
        assert!(addr.is_onion());
        assert!(!NetAddress::new("example.org", 80).is_onion());
    }
}

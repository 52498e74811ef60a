//! Endpoint type for transports

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use crate::error::Error;

/// Network endpoint representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Host name with port, resolved at connect time
    Host(String, u16),
}

impl Endpoint {
    /// Create an unspecified endpoint (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Endpoint::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Loopback endpoint on the given port
    pub fn localhost(port: u16) -> Self {
        Endpoint::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// Create from host name and port
    pub fn host(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Host(host.into(), port)
    }

    /// Create from socket address
    pub fn socket(addr: SocketAddr) -> Self {
        Endpoint::Socket(addr)
    }

    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Socket(addr) => addr.port(),
            Endpoint::Host(_, port) => *port,
        }
    }

    /// Host part as string
    pub fn host_name(&self) -> String {
        match self {
            Endpoint::Socket(addr) => addr.ip().to_string(),
            Endpoint::Host(host, _) => host.clone(),
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Endpoint::Host(_, _))
    }

    /// Socket address if already resolved
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Socket(addr) => Some(*addr),
            Endpoint::Host(_, _) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    /// Accepts `ip:port`, `[v6]:port` and `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Endpoint::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Config(format!("Missing port in endpoint: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("Invalid port in endpoint: {}", s)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(Error::Config(format!("Missing host in endpoint: {}", s)));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Endpoint::Socket(SocketAddr::new(ip, port)));
        }

        Ok(Endpoint::Host(host.to_string(), port))
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Socket(addr) => write!(f, "{}", addr),
            Endpoint::Host(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Endpoint::Socket(addr)
    }
}

impl From<(&str, u16)> for Endpoint {
    fn from((host, port): (&str, u16)) -> Self {
        Endpoint::Host(host.to_string(), port)
    }
}

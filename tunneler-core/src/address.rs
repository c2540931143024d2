use std::fmt::{self, Display, Formatter};
use std::net::SocketAddr;
use std::str::FromStr;

use crate::{Result, TunnelError};

/// Transport protocol carried by a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            actual => Err(TunnelError::MalformedSpec(format!(
                "unknown protocol '{}', expected tcp or udp",
                actual
            ))),
        }
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Unresolved `host:port` pair. Name resolution happens at dial/listen time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    host: String,
    port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Resolves the pair into socket addresses.
    pub async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .collect();

        if addrs.is_empty() {
            return Err(TunnelError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} did not resolve to any address", self),
            )));
        }

        Ok(addrs)
    }
}

impl From<SocketAddr> for HostPort {
    fn from(addr: SocketAddr) -> Self {
        HostPort::new(addr.ip().to_string(), addr.port())
    }
}

impl Display for HostPort {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for HostPort {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = match s.strip_prefix('[') {
            Some(rest) => {
                let (host, rest) = rest
                    .split_once(']')
                    .ok_or_else(|| malformed_address(s))?;
                let port = rest.strip_prefix(':').ok_or_else(|| malformed_address(s))?;
                (host, port)
            }
            None => s.rsplit_once(':').ok_or_else(|| malformed_address(s))?,
        };

        if host.is_empty() {
            return Err(malformed_address(s));
        }

        Ok(HostPort::new(host, parse_port(port)?))
    }
}

/// Protocol plus address; the wire form is `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    protocol: Protocol,
    address: HostPort,
}

impl Destination {
    pub fn new(protocol: Protocol, address: HostPort) -> Self {
        Self { protocol, address }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn address(&self) -> &HostPort {
        &self.address
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

impl FromStr for Destination {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let (protocol, address) = s
            .split_once("://")
            .ok_or_else(|| TunnelError::MalformedFrame(format!("invalid destination '{}'", s)))?;

        let protocol = protocol
            .parse::<Protocol>()
            .map_err(|err| TunnelError::MalformedFrame(err.to_string()))?;
        let address = address
            .parse::<HostPort>()
            .map_err(|err| TunnelError::MalformedFrame(err.to_string()))?;

        Ok(Destination::new(protocol, address))
    }
}

pub(crate) fn parse_port(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .map_err(|_| TunnelError::MalformedSpec(format!("invalid port '{}'", value)))
}

fn malformed_address(value: &str) -> TunnelError {
    TunnelError::MalformedSpec(format!("invalid address '{}', expected host:port", value))
}

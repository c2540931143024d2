use std::fmt::{self, Display, Formatter};

use crate::address::{parse_port, Destination, HostPort, Protocol};
use crate::{Result, TunnelError};

/// Host used for the bind side when the spec omits it.
pub const WILDCARD_HOST: &str = "0.0.0.0";

/// Parsed form of `[bindHost:]bindPort:targetHost:targetPort`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    protocol: Protocol,
    bind: HostPort,
    target: HostPort,
}

impl TunnelSpec {
    pub fn new(protocol: Protocol, bind: HostPort, target: HostPort) -> Self {
        Self {
            protocol,
            bind,
            target,
        }
    }

    /// Parses a protocol token and a tunnel description.
    ///
    /// No name resolution happens here; hosts are kept as written.
    pub fn parse(protocol: &str, spec: &str) -> Result<Self> {
        let protocol = protocol.parse::<Protocol>()?;
        let fields = split_fields(spec)?;

        let (bind_host, bind_port, target_host, target_port) = match fields.as_slice() {
            [bind_port, target_host, target_port] => {
                (WILDCARD_HOST, *bind_port, *target_host, *target_port)
            }
            [bind_host, bind_port, target_host, target_port] => {
                (*bind_host, *bind_port, *target_host, *target_port)
            }
            _ => {
                return Err(TunnelError::MalformedSpec(format!(
                    "'{}' has {} fields, expected [bindHost:]bindPort:targetHost:targetPort",
                    spec,
                    fields.len()
                )))
            }
        };

        if bind_host.is_empty() || target_host.is_empty() {
            return Err(TunnelError::MalformedSpec(format!(
                "'{}' contains an empty host",
                spec
            )));
        }

        Ok(Self {
            protocol,
            bind: HostPort::new(bind_host, parse_port(bind_port)?),
            target: HostPort::new(target_host, parse_port(target_port)?),
        })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn bind(&self) -> &HostPort {
        &self.bind
    }

    pub fn target(&self) -> &HostPort {
        &self.target
    }

    pub fn bind_destination(&self) -> Destination {
        Destination::new(self.protocol, self.bind.clone())
    }

    pub fn target_destination(&self) -> Destination {
        Destination::new(self.protocol, self.target.clone())
    }
}

impl Display for TunnelSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.protocol, self.bind, self.target)
    }
}

/// Splits on `:` while keeping bracketed IPv6 hosts in one field.
fn split_fields(spec: &str) -> Result<Vec<&str>> {
    let mut fields = Vec::new();
    let mut rest = spec;

    loop {
        let (field, remainder) = match rest.strip_prefix('[') {
            Some(bracketed) => {
                let end = bracketed.find(']').ok_or_else(|| {
                    TunnelError::MalformedSpec(format!("unterminated '[' in '{}'", spec))
                })?;
                let after = &bracketed[end + 1..];
                if !after.is_empty() && !after.starts_with(':') {
                    return Err(TunnelError::MalformedSpec(format!(
                        "unexpected characters after ']' in '{}'",
                        spec
                    )));
                }

                (&bracketed[..end], after.strip_prefix(':'))
            }
            None => match rest.split_once(':') {
                Some((field, remainder)) => (field, Some(remainder)),
                None => (rest, None),
            },
        };

        fields.push(field);
        match remainder {
            Some(remainder) => rest = remainder,
            None => return Ok(fields),
        }
    }
}

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error};

use crate::address::{Destination, HostPort, Protocol};
use crate::relay::{tcp_endpoint, udp_connected_endpoint, BoxedEndpoint};
use crate::{Result, TunnelError};

/// Accepts the next connection, retrying transient failures with exponential backoff.
pub async fn accept_with_backoff(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    let mut backoff = 1;
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("new socket {} connected.", addr);
                return Ok((socket, addr));
            }
            Err(err) => {
                if backoff > 64 {
                    error!("failed to accept new socket. aborting.. {}", err);
                    return Err(err.into());
                }

                error!("failed to accept new socket. retrying in {}s.. {}", backoff, err);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff *= 2;
            }
        }
    }
}

/// Binds a TCP listener on the first address `bind` resolves to that accepts it.
pub async fn bind_tcp(bind: &HostPort) -> Result<TcpListener> {
    let mut last_error = None;
    for addr in bind.resolve().await? {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => last_error = Some(err),
        }
    }

    Err(exhausted(bind, last_error))
}

/// Binds a UDP socket on the first address `bind` resolves to that accepts it.
pub async fn bind_udp(bind: &HostPort) -> Result<UdpSocket> {
    let mut last_error = None;
    for addr in bind.resolve().await? {
        match UdpSocket::bind(addr).await {
            Ok(socket) => return Ok(socket),
            Err(err) => last_error = Some(err),
        }
    }

    Err(exhausted(bind, last_error))
}

/// Connects to the first reachable address of `target`.
pub async fn dial_tcp(target: &HostPort) -> Result<TcpStream> {
    let mut last_error = None;
    for addr in target.resolve().await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("connected to {} ({}).", target, addr);
                return Ok(stream);
            }
            Err(err) => last_error = Some(err),
        }
    }

    Err(exhausted(target, last_error))
}

/// Creates a UDP socket connected to `target`, so it only exchanges datagrams with it.
pub async fn dial_udp(target: &HostPort) -> Result<UdpSocket> {
    let mut last_error = None;
    for addr in target.resolve().await? {
        let local = if addr.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        let socket = match UdpSocket::bind(local).await {
            Ok(socket) => socket,
            Err(err) => {
                last_error = Some(err);
                continue;
            }
        };

        match socket.connect(addr).await {
            Ok(()) => return Ok(socket),
            Err(err) => last_error = Some(err),
        }
    }

    Err(exhausted(target, last_error))
}

/// Dials a destination and wraps the connection as relay endpoints.
pub async fn dial_endpoint(destination: &Destination) -> Result<BoxedEndpoint> {
    match destination.protocol() {
        Protocol::Tcp => Ok(tcp_endpoint(dial_tcp(destination.address()).await?)),
        Protocol::Udp => Ok(udp_connected_endpoint(
            dial_udp(destination.address()).await?,
        )),
    }
}

fn exhausted(address: &HostPort, last_error: Option<std::io::Error>) -> TunnelError {
    match last_error {
        Some(err) => TunnelError::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {}", address, err),
        )),
        None => TunnelError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("{} did not resolve to any address", address),
        )),
    }
}

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{validate, TunnelController};
use crate::address::{Destination, Protocol};
use crate::net::{accept_with_backoff, bind_tcp, bind_udp};
use crate::relay::{tcp_endpoint, udp_association_endpoint, RelayPump, UDP_BUFFER_SIZE};
use crate::session::Session;
use crate::tunnel_spec::TunnelSpec;
use crate::{Result, TunnelError};

/// The socket a local tunnel accepts traffic on.
pub enum LocalListener {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
}

impl LocalListener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self {
            LocalListener::Tcp(listener) => Ok(listener.local_addr()?),
            LocalListener::Udp(socket) => Ok(socket.local_addr()?),
        }
    }
}

/// Listens on this machine and carries every accepted connection to the
/// target through a stream opened on the session.
pub struct LocalTunnel {
    shutdown: CancellationToken,
}

impl LocalTunnel {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }

    pub async fn bind(spec: &TunnelSpec) -> Result<LocalListener> {
        validate(spec)?;

        match spec.protocol() {
            Protocol::Tcp => Ok(LocalListener::Tcp(bind_tcp(spec.bind()).await?)),
            Protocol::Udp => Ok(LocalListener::Udp(Arc::new(bind_udp(spec.bind()).await?))),
        }
    }

    pub async fn serve(
        &self,
        session: Session,
        spec: TunnelSpec,
        listener: LocalListener,
    ) -> Result<()> {
        let target = spec.target_destination();

        match listener {
            LocalListener::Tcp(listener) => self.serve_tcp(session, target, listener).await,
            LocalListener::Udp(socket) => self.serve_udp(session, target, socket).await,
        }
    }

    async fn serve_tcp(
        &self,
        session: Session,
        target: Destination,
        listener: TcpListener,
    ) -> Result<()> {
        loop {
            let (socket, origin) = tokio::select! {
                accepted = accept_with_backoff(&listener) => accepted?,
                _ = self.shutdown.cancelled() => {
                    info!("local tunnel to {} shutting down.", target);
                    return Ok(());
                }
                _ = session.closed() => return Err(TunnelError::SessionClosed),
            };

            let session = session.clone();
            let target = target.clone();
            let token = self.shutdown.child_token();
            tokio::spawn(async move {
                if let Err(err) = forward_connection(session, &target, socket, token).await {
                    warn!(%origin, "connection to {} failed: {}", target, err);
                }
            });
        }
    }

    /// Local UDP traffic is one association: the first datagram opens a
    /// stream, and replies go to whichever local address sent last.
    async fn serve_udp(
        &self,
        session: Session,
        target: Destination,
        socket: Arc<UdpSocket>,
    ) -> Result<()> {
        let mut buffer = vec![0u8; UDP_BUFFER_SIZE];

        loop {
            let (len, source) = tokio::select! {
                received = socket.recv_from(&mut buffer) => received?,
                _ = self.shutdown.cancelled() => {
                    info!("local tunnel to {} shutting down.", target);
                    return Ok(());
                }
                _ = session.closed() => return Err(TunnelError::SessionClosed),
            };

            debug!(%source, "first datagram for {}, opening stream.", target);
            let first = Bytes::copy_from_slice(&buffer[..len]);
            let token = self.shutdown.child_token();
            if let Err(err) =
                forward_datagrams(&session, &target, socket.clone(), source, first, token).await
            {
                if session.is_closed() {
                    return Err(TunnelError::SessionClosed);
                }
                warn!(%source, "datagram relay to {} failed: {}", target, err);
            }
        }
    }
}

#[async_trait]
impl TunnelController for LocalTunnel {
    async fn start(&self, session: Session, spec: TunnelSpec) -> Result<()> {
        let listener = Self::bind(&spec).await?;
        info!(
            "forwarding {} {} to {} through the peer.",
            spec.protocol(),
            listener.local_addr()?,
            spec.target()
        );

        self.serve(session, spec, listener).await
    }
}

async fn forward_connection(
    session: Session,
    target: &Destination,
    socket: TcpStream,
    token: CancellationToken,
) -> Result<()> {
    let mut stream = session.open_stream(target).await?;
    stream.opened().await?;

    let (reader, writer) = tcp_endpoint(socket);
    let stats = RelayPump::new(token).run(reader, writer, stream).await?;
    debug!("connection to {} finished: {:?}", target, stats);

    Ok(())
}

async fn forward_datagrams(
    session: &Session,
    target: &Destination,
    socket: Arc<UdpSocket>,
    source: SocketAddr,
    first: Bytes,
    token: CancellationToken,
) -> Result<()> {
    let mut stream = session.open_stream(target).await?;
    stream.opened().await?;
    stream.send(first).await?;

    let (reader, writer) = udp_association_endpoint(socket, source);
    let stats = RelayPump::new(token).run(reader, writer, stream).await?;
    debug!("datagram relay to {} finished: {:?}", target, stats);

    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::address::HostPort;
    use crate::is_type;
    use crate::session::SessionConfig;
    use crate::test_util::session_pair;

    #[tokio::test]
    async fn bind_rejects_target_port_zero() {
        // Arrange
        let spec = TunnelSpec::parse("tcp", "127.0.0.1:0:localhost:0").unwrap();

        // Act
        let result = LocalTunnel::bind(&spec).await;

        // Assert
        assert!(is_type!(result, Err(TunnelError::InvalidTunnel(_))));
    }

    #[tokio::test]
    async fn accepted_connection_opens_stream_to_target() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        let spec = TunnelSpec::new(
            Protocol::Tcp,
            HostPort::new("127.0.0.1", 0),
            HostPort::new("example.internal", 80),
        );
        let listener = LocalTunnel::bind(&spec).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let tunnel = LocalTunnel::new(shutdown.clone());
        let serving = tokio::spawn(async move { tunnel.serve(client, spec, listener).await });

        // Act
        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket.write_all(b"ping").await.unwrap();
        let (mut stream, destination) = server.accept_incoming().await.unwrap();
        let request = stream.receive().await.unwrap();
        stream.send(Bytes::from_static(b"pong")).await.unwrap();
        let mut reply = [0u8; 4];
        socket.read_exact(&mut reply).await.unwrap();
        shutdown.cancel();
        let result = serving.await.unwrap();

        // Assert
        assert_eq!("tcp://example.internal:80", destination.to_string());
        assert_eq!(Some(Bytes::from_static(b"ping")), request);
        assert_eq!(b"pong", &reply);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn serving_ends_when_session_closes() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        let spec = TunnelSpec::new(
            Protocol::Udp,
            HostPort::new("127.0.0.1", 0),
            HostPort::new("127.0.0.1", 53),
        );
        let listener = LocalTunnel::bind(&spec).await.unwrap();
        let tunnel = LocalTunnel::new(CancellationToken::new());

        // Act
        server.close();
        let result = tunnel.serve(client, spec, listener).await;

        // Assert
        assert!(is_type!(result, Err(TunnelError::SessionClosed)));
    }
}

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::{Destination, Protocol};
use crate::net::{accept_with_backoff, bind_tcp, bind_udp, dial_endpoint};
use crate::relay::{tcp_endpoint, RelayPump, UDP_BUFFER_SIZE};
use crate::session::{
    HostedListener, IncomingListen, Session, StreamHandle, StreamId, StreamReceiver,
    StreamSender,
};
use crate::{Result, TunnelError};

/// Serves the peer of a tunnel client: dials the destinations of incoming
/// streams and hosts the listeners the peer asks for.
pub struct Responder {
    session: Session,
    token: CancellationToken,
}

impl Responder {
    pub fn new(session: Session) -> Self {
        let token = session.child_token();
        Self { session, token }
    }

    /// Runs until the session ends.
    pub async fn run(self) -> Result<()> {
        tokio::try_join!(self.serve_streams(), self.serve_listens())?;
        debug!("responder finished.");

        Ok(())
    }

    async fn serve_streams(&self) -> Result<()> {
        loop {
            let (stream, destination) = match self.session.accept_incoming().await {
                Ok(incoming) => incoming,
                Err(TunnelError::SessionClosed) => return Ok(()),
                Err(err) => return Err(err),
            };

            let token = self.token.child_token();
            tokio::spawn(serve_stream(stream, destination, token));
        }
    }

    async fn serve_listens(&self) -> Result<()> {
        loop {
            let request = match self.session.accept_listen_request().await {
                Ok(request) => request,
                Err(TunnelError::SessionClosed) => return Ok(()),
                Err(err) => return Err(err),
            };

            let id = request.id();
            let token = self.token.child_token();
            tokio::spawn(async move {
                if let Err(err) = host_listener(request, token).await {
                    warn!(listen = id, "hosted listener ended: {}", err);
                }
            });
        }
    }
}

async fn serve_stream(
    mut stream: StreamHandle,
    destination: Destination,
    token: CancellationToken,
) {
    let id = stream.id();
    let (reader, writer) = match dial_endpoint(&destination).await {
        Ok(endpoint) => endpoint,
        Err(err) => {
            warn!(stream = id, target = %destination, "failed to reach target: {}", err);
            stream.reset(&err.to_string()).await;
            return;
        }
    };

    match RelayPump::new(token).run(reader, writer, stream).await {
        Ok(stats) => debug!(stream = id, target = %destination, "relay done: {:?}", stats),
        Err(err) => debug!(stream = id, target = %destination, "relay failed: {}", err),
    }
}

async fn host_listener(request: IncomingListen, token: CancellationToken) -> Result<()> {
    let bind = request.destination().clone();

    match bind.protocol() {
        Protocol::Tcp => {
            let listener = match bind_tcp(bind.address()).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(listen = request.id(), %bind, "cannot listen: {}", err);
                    return request.reject(&err.to_string()).await;
                }
            };

            let bound = listener.local_addr()?;
            let hosted = request.ack(&bound.to_string()).await?;
            host_tcp(hosted, listener, token).await
        }
        Protocol::Udp => {
            let socket = match bind_udp(bind.address()).await {
                Ok(socket) => socket,
                Err(err) => {
                    warn!(listen = request.id(), %bind, "cannot listen: {}", err);
                    return request.reject(&err.to_string()).await;
                }
            };

            let bound = socket.local_addr()?;
            let hosted = request.ack(&bound.to_string()).await?;
            host_udp(hosted, Arc::new(socket), token).await
        }
    }
}

async fn host_tcp(
    hosted: HostedListener,
    listener: TcpListener,
    token: CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            accepted = accept_with_backoff(&listener) => accepted,
            _ = hosted.cancelled() => {
                info!(listen = hosted.id(), "hosted listener stopped.");
                return Ok(());
            }
        };

        let (socket, origin) = match accepted {
            Ok(accepted) => accepted,
            Err(err) => {
                let _ = hosted.fail(&err.to_string()).await;
                return Err(err);
            }
        };

        let stream = hosted.notify_accept(&origin.to_string()).await?;
        let id = stream.id();
        let pump = RelayPump::new(token.child_token());
        tokio::spawn(async move {
            let (reader, writer) = tcp_endpoint(socket);
            match pump.run(reader, writer, stream).await {
                Ok(stats) => debug!(stream = id, %origin, "relay done: {:?}", stats),
                Err(err) => debug!(stream = id, %origin, "relay failed: {}", err),
            }
        });
    }
}

/// Every new source address gets its own stream. A source whose stream can
/// no longer carry data gets a fresh one on its next datagram, and an
/// association is forgotten once its reply stream ends.
async fn host_udp(
    hosted: HostedListener,
    socket: Arc<UdpSocket>,
    token: CancellationToken,
) -> Result<()> {
    let mut buffer = vec![0u8; UDP_BUFFER_SIZE];
    let mut associations: HashMap<SocketAddr, StreamSender> = HashMap::new();
    let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<(SocketAddr, StreamId)>();

    loop {
        let received = tokio::select! {
            received = socket.recv_from(&mut buffer) => received,
            Some((source, id)) = ended_rx.recv() => {
                if associations.get(&source).map(StreamSender::id) == Some(id) {
                    debug!(stream = id, %source, "association finished");
                    associations.remove(&source);
                }
                continue;
            }
            _ = hosted.cancelled() => {
                info!(listen = hosted.id(), "hosted listener stopped.");
                return Ok(());
            }
        };

        let (len, source) = match received {
            Ok(received) => received,
            Err(err) => {
                let _ = hosted.fail(&err.to_string()).await;
                return Err(err.into());
            }
        };
        let datagram = Bytes::copy_from_slice(&buffer[..len]);

        if let Some(sender) = associations.get_mut(&source) {
            match sender.send(datagram.clone()).await {
                Ok(()) => continue,
                Err(err) => {
                    debug!(stream = sender.id(), %source, "association ended: {}", err);
                    associations.remove(&source);
                }
            }
        }

        let stream = hosted.notify_accept(&source.to_string()).await?;
        let (mut sender, receiver) = stream.into_split();
        if let Err(err) = sender.send(datagram).await {
            warn!(stream = sender.id(), %source, "failed to forward datagram: {}", err);
            continue;
        }

        let ended = ended_tx.clone();
        let reply = reply_datagrams(socket.clone(), source, receiver, token.child_token());
        tokio::spawn(async move {
            let id = reply.await;
            let _ = ended.send((source, id));
        });
        associations.insert(source, sender);
    }
}

/// Sends the stream's payloads back to `source` until the stream ends.
async fn reply_datagrams(
    socket: Arc<UdpSocket>,
    source: SocketAddr,
    mut receiver: StreamReceiver,
    token: CancellationToken,
) -> StreamId {
    let id = receiver.id();

    loop {
        let next = tokio::select! {
            next = receiver.receive() => next,
            _ = token.cancelled() => return id,
        };

        match next {
            Ok(Some(data)) => {
                if let Err(err) = socket.send_to(&data, source).await {
                    receiver.reset(&err.to_string()).await;
                    return id;
                }
            }
            Ok(None) => return id,
            Err(err) => {
                debug!(stream = id, %source, "reply stream ended: {}", err);
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::address::HostPort;
    use crate::session::SessionConfig;
    use crate::is_type;
    use crate::test_util::session_pair;

    #[tokio::test]
    async fn should_dial_destination_of_incoming_stream() {
        // Arrange
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let destination = Destination::new(
            Protocol::Tcp,
            HostPort::from(target.local_addr().unwrap()),
        );
        let (client, server) = session_pair(SessionConfig::default());
        tokio::spawn(Responder::new(server).run());

        // Act
        let mut stream = client.open_stream(&destination).await.unwrap();
        stream.opened().await.unwrap();
        stream.send(Bytes::from_static(b"hello")).await.unwrap();
        let (mut socket, _) = target.accept().await.unwrap();
        let mut request = [0u8; 5];
        socket.read_exact(&mut request).await.unwrap();
        socket.write_all(b"world").await.unwrap();
        let reply = stream.receive().await.unwrap();

        // Assert
        assert_eq!(b"hello", &request);
        assert_eq!(Some(Bytes::from_static(b"world")), reply);
    }

    #[tokio::test]
    async fn unreachable_destination_resets_stream() {
        // Arrange
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let destination = Destination::new(
            Protocol::Tcp,
            HostPort::from(closed.local_addr().unwrap()),
        );
        drop(closed);
        let (client, server) = session_pair(SessionConfig::default());
        tokio::spawn(Responder::new(server).run());

        // Act
        let mut stream = client.open_stream(&destination).await.unwrap();
        let _ = stream.opened().await;
        let result = stream.receive().await;

        // Assert
        assert!(matches!(
            result,
            Err(TunnelError::StreamReset { .. }) | Err(TunnelError::StreamRejected { .. })
        ));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn should_host_tcp_listener_for_peer() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        tokio::spawn(Responder::new(server).run());
        let bind = Destination::new(Protocol::Tcp, HostPort::new("127.0.0.1", 0));

        // Act
        let mut listener = client.listen_request(&bind).await.unwrap();
        let bound: SocketAddr = listener.bound_address().parse().unwrap();
        let mut inbound = TcpStream::connect(bound).await.unwrap();
        inbound.write_all(b"knock").await.unwrap();
        let (mut stream, origin) = listener.accept_notification().await.unwrap();
        let data = stream.receive().await.unwrap();

        // Assert
        assert_ne!(0, bound.port());
        assert_eq!(inbound.local_addr().unwrap().to_string(), origin);
        assert_eq!(Some(Bytes::from_static(b"knock")), data);
    }

    #[tokio::test]
    async fn should_reject_listen_on_occupied_port() {
        // Arrange
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let bind = Destination::new(
            Protocol::Tcp,
            HostPort::from(occupied.local_addr().unwrap()),
        );
        let (client, server) = session_pair(SessionConfig::default());
        tokio::spawn(Responder::new(server).run());

        // Act
        let result = client.listen_request(&bind).await;

        // Assert
        assert!(is_type!(result, Err(TunnelError::ListenRejected(_))));
    }

    #[tokio::test]
    async fn each_udp_source_gets_its_own_stream() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        tokio::spawn(Responder::new(server).run());
        let bind = Destination::new(Protocol::Udp, HostPort::new("127.0.0.1", 0));
        let mut listener = client.listen_request(&bind).await.unwrap();
        let bound: SocketAddr = listener.bound_address().parse().unwrap();
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Act
        first.send_to(b"one", bound).await.unwrap();
        let (mut first_stream, first_origin) = listener.accept_notification().await.unwrap();
        let first_data = first_stream.receive().await.unwrap();
        first.send_to(b"again", bound).await.unwrap();
        let first_again = first_stream.receive().await.unwrap();
        second.send_to(b"two", bound).await.unwrap();
        let (mut second_stream, second_origin) = listener.accept_notification().await.unwrap();
        let second_data = second_stream.receive().await.unwrap();
        second_stream
            .send(Bytes::from_static(b"reply"))
            .await
            .unwrap();
        let mut buffer = [0u8; 16];
        let len = second.recv(&mut buffer).await.unwrap();

        // Assert
        assert_eq!(first.local_addr().unwrap().to_string(), first_origin);
        assert_eq!(second.local_addr().unwrap().to_string(), second_origin);
        assert_ne!(first_stream.id(), second_stream.id());
        assert_eq!(Some(Bytes::from_static(b"one")), first_data);
        assert_eq!(Some(Bytes::from_static(b"again")), first_again);
        assert_eq!(Some(Bytes::from_static(b"two")), second_data);
        assert_eq!(b"reply", &buffer[..len]);
    }

    #[tokio::test]
    async fn run_returns_when_session_closes() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        let responder = tokio::spawn(Responder::new(server).run());

        // Act
        client.close();
        let result = responder.await.unwrap();

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn finished_udp_association_releases_its_stream() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        tokio::spawn(Responder::new(server.clone()).run());
        let bind = Destination::new(Protocol::Udp, HostPort::new("127.0.0.1", 0));
        let mut listener = client.listen_request(&bind).await.unwrap();
        let bound: SocketAddr = listener.bound_address().parse().unwrap();
        let source = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        source.send_to(b"one", bound).await.unwrap();
        let (mut stream, _) = listener.accept_notification().await.unwrap();
        assert_eq!(Some(Bytes::from_static(b"one")), stream.receive().await.unwrap());

        // Act
        stream.close().await.unwrap();
        let end = tokio::time::timeout(std::time::Duration::from_secs(5), stream.receive())
            .await
            .unwrap()
            .unwrap();

        // Assert
        assert_eq!(None, end);
        assert_eq!(0, client.stream_count());
        assert_eq!(0, server.stream_count());
    }
}

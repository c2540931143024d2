use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use mockall::automock;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::Result;

/// Largest chunk read from a byte stream before it becomes one `Data` frame.
pub const RELAY_CHUNK_SIZE: usize = 16 * 1024;

/// Large enough for any UDP datagram.
pub const UDP_BUFFER_SIZE: usize = 64 * 1024;

#[automock]
#[async_trait]
pub trait EndpointReader: Send {
    /// Next chunk from the network, or `None` at end of data.
    async fn read(&mut self) -> Result<Option<Bytes>>;
}

#[automock]
#[async_trait]
pub trait EndpointWriter: Send {
    async fn write(&mut self, data: Bytes) -> Result<()>;

    /// Signals that no more data will be written.
    async fn shutdown(&mut self) -> Result<()>;
}

pub struct StreamEndpointReader<R> {
    buffer: BytesMut,
    inner: R,
}

impl<R> StreamEndpointReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(inner: R) -> Self {
        Self {
            buffer: BytesMut::with_capacity(RELAY_CHUNK_SIZE),
            inner,
        }
    }
}

#[async_trait]
impl<R> EndpointReader for StreamEndpointReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read(&mut self) -> Result<Option<Bytes>> {
        self.buffer.reserve(RELAY_CHUNK_SIZE);
        let bytes_read = self.inner.read_buf(&mut self.buffer).await?;

        trace!("read {} bytes from connection.", bytes_read);
        if 0 == bytes_read {
            return Ok(None);
        }

        Ok(Some(self.buffer.split_to(bytes_read).freeze()))
    }
}

pub struct StreamEndpointWriter<W> {
    inner: W,
}

impl<W> StreamEndpointWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<W> EndpointWriter for StreamEndpointWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write(&mut self, data: Bytes) -> Result<()> {
        self.inner.write_all(&data).await?;
        self.inner.flush().await?;

        trace!("written {} bytes to connection.", data.len());
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

pub type BoxedEndpoint = (Box<dyn EndpointReader>, Box<dyn EndpointWriter>);

/// Splits a TCP connection into relay endpoints. Shutdown half-closes the socket.
pub fn tcp_endpoint(stream: TcpStream) -> BoxedEndpoint {
    let (reader, writer) = stream.into_split();
    (
        Box::new(StreamEndpointReader::new(reader)),
        Box::new(StreamEndpointWriter::new(writer)),
    )
}

/// Splits any byte stream into relay endpoints.
pub fn stream_endpoint<S>(stream: S) -> BoxedEndpoint
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (
        Box::new(StreamEndpointReader::new(reader)),
        Box::new(StreamEndpointWriter::new(writer)),
    )
}

/// Where outgoing datagrams of an association go.
#[derive(Clone)]
enum UdpPeer {
    /// The socket is connected; the kernel filters and addresses datagrams.
    Connected,
    /// The most recent source address seen on an unconnected socket.
    Learned(Arc<Mutex<Option<SocketAddr>>>),
}

/// One datagram per read and per write. Shutting the writer down ends the
/// reader too, since a datagram socket has no end of data of its own.
pub struct UdpEndpointReader {
    socket: Arc<UdpSocket>,
    peer: UdpPeer,
    finished: CancellationToken,
    buffer: Vec<u8>,
}

pub struct UdpEndpointWriter {
    socket: Arc<UdpSocket>,
    peer: UdpPeer,
    finished: CancellationToken,
}

/// Endpoints over a connected UDP socket.
pub fn udp_connected_endpoint(socket: UdpSocket) -> BoxedEndpoint {
    udp_endpoint(Arc::new(socket), UdpPeer::Connected)
}

/// Endpoints over an unconnected UDP socket, replying to `peer` and then to
/// whichever address sent the latest datagram.
pub fn udp_association_endpoint(socket: Arc<UdpSocket>, peer: SocketAddr) -> BoxedEndpoint {
    udp_endpoint(socket, UdpPeer::Learned(Arc::new(Mutex::new(Some(peer)))))
}

fn udp_endpoint(socket: Arc<UdpSocket>, peer: UdpPeer) -> BoxedEndpoint {
    let finished = CancellationToken::new();
    (
        Box::new(UdpEndpointReader {
            socket: socket.clone(),
            peer: peer.clone(),
            finished: finished.clone(),
            buffer: vec![0u8; UDP_BUFFER_SIZE],
        }),
        Box::new(UdpEndpointWriter {
            socket,
            peer,
            finished,
        }),
    )
}

#[async_trait]
impl EndpointReader for UdpEndpointReader {
    async fn read(&mut self) -> Result<Option<Bytes>> {
        let received = tokio::select! {
            received = receive(&self.socket, &self.peer, &mut self.buffer) => received?,
            _ = self.finished.cancelled() => return Ok(None),
        };

        Ok(Some(Bytes::copy_from_slice(&self.buffer[..received])))
    }
}

async fn receive(socket: &UdpSocket, peer: &UdpPeer, buffer: &mut [u8]) -> Result<usize> {
    match peer {
        UdpPeer::Connected => Ok(socket.recv(buffer).await?),
        UdpPeer::Learned(latest) => {
            let (len, source) = socket.recv_from(buffer).await?;
            *latest.lock() = Some(source);
            Ok(len)
        }
    }
}

#[async_trait]
impl EndpointWriter for UdpEndpointWriter {
    async fn write(&mut self, data: Bytes) -> Result<()> {
        match self.peer {
            UdpPeer::Connected => {
                self.socket.send(&data).await?;
            }
            UdpPeer::Learned(ref latest) => {
                let target = *latest.lock();
                match target {
                    Some(target) => {
                        self.socket.send_to(&data, target).await?;
                    }
                    None => trace!("no peer for datagram yet, dropping {} bytes.", data.len()),
                }
            }
        }

        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.finished.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::io::Builder;

    use super::*;

    #[tokio::test]
    async fn should_read_chunks_until_end_of_stream() {
        // Arrange
        let mock = Builder::new().read(b"GET / ").read(b"HTTP/1.1").build();
        let mut reader = StreamEndpointReader::new(mock);

        // Act
        let first = reader.read().await.unwrap();
        let second = reader.read().await.unwrap();
        let end = reader.read().await.unwrap();

        // Assert
        assert_eq!(Some(Bytes::from_static(b"GET / ")), first);
        assert_eq!(Some(Bytes::from_static(b"HTTP/1.1")), second);
        assert_eq!(None, end);
    }

    #[tokio::test]
    async fn should_write_whole_payload() {
        // Arrange
        let mock = Builder::new().write(b"HTTP/1.1 200 OK\r\n").build();
        let mut writer = StreamEndpointWriter::new(mock);

        // Act
        let result = writer
            .write(Bytes::from_static(b"HTTP/1.1 200 OK\r\n"))
            .await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn read_error_is_reported() {
        // Arrange
        let mock = Builder::new()
            .read_error(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset",
            ))
            .build();
        let mut reader = StreamEndpointReader::new(mock);

        // Act
        let result = reader.read().await;

        // Assert
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn udp_association_replies_to_latest_source() {
        // Arrange
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let local = socket.local_addr().unwrap();
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (mut reader, mut writer) =
            udp_association_endpoint(socket, first.local_addr().unwrap());

        // Act
        second.send_to(b"hi", local).await.unwrap();
        let datagram = reader.read().await.unwrap();
        writer.write(Bytes::from_static(b"reply")).await.unwrap();
        let mut buffer = [0u8; 16];
        let len = second.recv(&mut buffer).await.unwrap();

        // Assert
        assert_eq!(Some(Bytes::from_static(b"hi")), datagram);
        assert_eq!(b"reply", &buffer[..len]);
    }

    #[tokio::test]
    async fn udp_shutdown_ends_the_reader() {
        // Arrange
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let peer = "127.0.0.1:9".parse().unwrap();
        let (mut reader, mut writer) = udp_association_endpoint(socket, peer);

        // Act
        writer.shutdown().await.unwrap();
        let result = reader.read().await.unwrap();

        // Assert
        assert_eq!(None, result);
    }
}

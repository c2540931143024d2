use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::trace;

use super::{TransportReader, TransportWriter};
use crate::{Result, TunnelError};

pub struct MemoryReader {
    receiver: Receiver<Bytes>,
}

pub struct MemoryWriter {
    sender: Option<Sender<Bytes>>,
}

/// One end of an in-process transport.
pub struct MemoryTransport {
    pub reader: MemoryReader,
    pub writer: MemoryWriter,
}

impl MemoryTransport {
    /// Creates two connected ends. Messages written on one end are read on the other.
    pub fn pair(capacity: usize) -> (MemoryTransport, MemoryTransport) {
        let (left_tx, left_rx) = mpsc::channel(capacity);
        let (right_tx, right_rx) = mpsc::channel(capacity);

        let left = MemoryTransport {
            reader: MemoryReader { receiver: right_rx },
            writer: MemoryWriter {
                sender: Some(left_tx),
            },
        };
        let right = MemoryTransport {
            reader: MemoryReader { receiver: left_rx },
            writer: MemoryWriter {
                sender: Some(right_tx),
            },
        };

        (left, right)
    }

    pub fn split(self) -> (MemoryReader, MemoryWriter) {
        (self.reader, self.writer)
    }
}

#[async_trait]
impl TransportReader for MemoryReader {
    async fn next(&mut self) -> Result<Option<Bytes>> {
        Ok(self.receiver.recv().await)
    }
}

#[async_trait]
impl TransportWriter for MemoryWriter {
    async fn send(&mut self, message: Bytes) -> Result<()> {
        let sender = match self.sender {
            Some(ref sender) => sender,
            None => return Err(TunnelError::SessionClosed),
        };

        trace!("writing {} bytes to memory transport.", message.len());
        sender
            .send(message)
            .await
            .map_err(|_| TunnelError::SessionClosed)
    }

    async fn close(&mut self) -> Result<()> {
        self.sender.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_deliver_messages_to_the_other_end() {
        // Arrange
        let (left, right) = MemoryTransport::pair(4);
        let (_, mut left_writer) = left.split();
        let (mut right_reader, _) = right.split();

        // Act
        left_writer.send(Bytes::from_static(b"one")).await.unwrap();
        left_writer.send(Bytes::from_static(b"two")).await.unwrap();

        // Assert
        assert_eq!(Some(Bytes::from_static(b"one")), right_reader.next().await.unwrap());
        assert_eq!(Some(Bytes::from_static(b"two")), right_reader.next().await.unwrap());
    }

    #[tokio::test]
    async fn close_should_end_the_other_reader() {
        // Arrange
        let (left, right) = MemoryTransport::pair(4);
        let (_left_reader, mut left_writer) = left.split();
        let (mut right_reader, _right_writer) = right.split();

        // Act
        left_writer.close().await.unwrap();

        // Assert
        assert_eq!(None, right_reader.next().await.unwrap());
        assert!(left_writer.send(Bytes::from_static(b"late")).await.is_err());
    }
}

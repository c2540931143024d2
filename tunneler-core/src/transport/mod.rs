mod memory;
mod websocket;

pub use memory::*;
pub use websocket::*;

use async_trait::async_trait;
use bytes::Bytes;
use mockall::automock;

use crate::Result;

/// Receiving half of the duplex message channel carrying every frame.
#[automock]
#[async_trait]
pub trait TransportReader: Send {
    /// Waits for the next whole message. `None` means the peer closed the channel cleanly.
    async fn next(&mut self) -> Result<Option<Bytes>>;
}

/// Sending half of the duplex message channel. Only the session writer task calls it.
#[automock]
#[async_trait]
pub trait TransportWriter: Send {
    async fn send(&mut self, message: Bytes) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

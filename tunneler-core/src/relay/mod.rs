mod endpoint;

pub use endpoint::*;

use std::io;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::session::{StreamHandle, StreamReceiver, StreamSender};
use crate::{Result, TunnelError};

/// Bytes moved by one finished relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Network to stream.
    pub sent: u64,
    /// Stream to network.
    pub received: u64,
}

/// Copies bytes both ways between one network endpoint and one stream.
///
/// The two directions end independently: end of data on either side only
/// half-closes the other, so in-flight data in the open direction still
/// arrives. An error in either direction cancels both. Cancelling the
/// pump's token closes the stream gracefully, and tearing down the stream's
/// session cancels it the same way.
pub struct RelayPump {
    token: CancellationToken,
}

impl RelayPump {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Runs until both directions finished.
    pub async fn run(
        &self,
        reader: Box<dyn EndpointReader>,
        writer: Box<dyn EndpointWriter>,
        stream: StreamHandle,
    ) -> Result<RelayStats> {
        let id = stream.id();
        let session = stream.session().clone();
        let token = self.token.child_token();
        let (sender, receiver) = stream.into_split();

        let upstream = tokio::spawn(network_to_stream(reader, sender, token.clone()));
        let downstream = tokio::spawn(stream_to_network(receiver, writer, token.clone()));
        let relays = async move { tokio::join!(upstream, downstream) };
        tokio::pin!(relays);

        let (upstream, downstream) = tokio::select! {
            joined = &mut relays => joined,
            _ = session.closed() => {
                debug!(stream = id, "session closed, stopping relay");
                token.cancel();
                relays.await
            }
        };

        let sent = flatten(upstream);
        let received = flatten(downstream);
        debug!(stream = id, ?sent, ?received, "relay finished");

        Ok(RelayStats {
            sent: sent?,
            received: received?,
        })
    }
}

fn flatten(joined: std::result::Result<Result<u64>, tokio::task::JoinError>) -> Result<u64> {
    match joined {
        Ok(result) => result,
        Err(err) => Err(TunnelError::Io(io::Error::new(io::ErrorKind::Other, err))),
    }
}

async fn network_to_stream(
    mut reader: Box<dyn EndpointReader>,
    mut sender: StreamSender,
    token: CancellationToken,
) -> Result<u64> {
    let mut sent = 0u64;

    loop {
        let read = tokio::select! {
            read = reader.read() => read,
            _ = token.cancelled() => {
                let _ = sender.close().await;
                return Ok(sent);
            }
        };

        match read {
            Ok(Some(data)) => {
                sent += data.len() as u64;
                if let Err(err) = sender.send(data).await {
                    token.cancel();
                    return Err(err);
                }
            }
            Ok(None) => {
                trace!(stream = sender.id(), "network reached end of data");
                if let Err(err) = sender.close().await {
                    token.cancel();
                    return Err(err);
                }
                return Ok(sent);
            }
            Err(err) => {
                sender.reset(&err.to_string()).await;
                token.cancel();
                return Err(err);
            }
        }
    }
}

async fn stream_to_network(
    mut receiver: StreamReceiver,
    mut writer: Box<dyn EndpointWriter>,
    token: CancellationToken,
) -> Result<u64> {
    let mut received = 0u64;

    loop {
        let next = tokio::select! {
            next = receiver.receive() => next,
            _ = token.cancelled() => return Ok(received),
        };

        match next {
            Ok(Some(data)) => {
                received += data.len() as u64;
                if let Err(err) = writer.write(data).await {
                    receiver.reset(&err.to_string()).await;
                    token.cancel();
                    return Err(err);
                }
            }
            Ok(None) => {
                trace!(stream = receiver.id(), "stream reached end of data");
                let _ = writer.shutdown().await;
                return Ok(received);
            }
            Err(err) => {
                token.cancel();
                return Err(err);
            }
        }
    }
}

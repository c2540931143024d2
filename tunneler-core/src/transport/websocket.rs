use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::trace;

use super::{TransportReader, TransportWriter};
use crate::{Result, TunnelError};

pub struct WebSocketReader<S> {
    stream: SplitStream<WebSocketStream<S>>,
}

pub struct WebSocketWriter<S> {
    sink: SplitSink<WebSocketStream<S>, Message>,
}

/// Splits an established websocket into transport halves. Every frame travels as one binary message.
pub fn websocket_transport<S>(socket: WebSocketStream<S>) -> (WebSocketReader<S>, WebSocketWriter<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (sink, stream) = socket.split();
    (WebSocketReader { stream }, WebSocketWriter { sink })
}

#[async_trait]
impl<S> TransportReader for WebSocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Text(_))) => {
                    return Err(TunnelError::MalformedFrame(
                        "unexpected text message on transport".into(),
                    ))
                }
                Some(Ok(other)) => {
                    trace!("skipping websocket control message {:?}", other);
                    continue;
                }
                Some(Err(tungstenite::Error::ConnectionClosed)) => return Ok(None),
                Some(Err(err)) => return Err(websocket_error(err)),
            }
        }
    }
}

#[async_trait]
impl<S> TransportWriter for WebSocketWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, message: Bytes) -> Result<()> {
        self.sink
            .send(Message::Binary(message))
            .await
            .map_err(websocket_error)
    }

    async fn close(&mut self) -> Result<()> {
        match self.sink.close().await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(err) => Err(websocket_error(err)),
        }
    }
}

fn websocket_error(err: tungstenite::Error) -> TunnelError {
    match err {
        tungstenite::Error::Io(err) => TunnelError::Io(err),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TunnelError::SessionClosed
        }
        other => TunnelError::Io(io::Error::new(io::ErrorKind::Other, other)),
    }
}

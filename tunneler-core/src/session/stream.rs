use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use super::inbox::InboxReceiver;
use super::{Session, StreamId, StreamState};
use crate::{Result, TunnelError};

/// One logical stream. The session owns its table entry; this is only the
/// capability to send, receive and close through it.
pub struct StreamHandle {
    sender: StreamSender,
    receiver: StreamReceiver,
    opened: Option<oneshot::Receiver<Result<()>>>,
}

impl StreamHandle {
    pub(crate) fn new(
        session: Session,
        id: StreamId,
        inbox: InboxReceiver,
        opened: Option<oneshot::Receiver<Result<()>>>,
    ) -> Self {
        Self {
            sender: StreamSender {
                session: session.clone(),
                id,
                finished: false,
            },
            receiver: StreamReceiver { session, id, inbox },
            opened,
        }
    }

    pub fn id(&self) -> StreamId {
        self.sender.id
    }

    pub fn state(&self) -> StreamState {
        self.sender.state()
    }

    pub(crate) fn session(&self) -> &Session {
        &self.sender.session
    }

    /// Waits until the peer acknowledged the open. Streams the peer opened are
    /// already open. A missing ack within the session's open timeout discards
    /// the stream.
    pub async fn opened(&mut self) -> Result<()> {
        let ack = match self.opened.take() {
            Some(ack) => ack,
            None => return Ok(()),
        };

        let timeout = self.sender.session.config().open_timeout;
        match tokio::time::timeout(timeout, ack).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TunnelError::SessionClosed),
            Err(_) => {
                debug!(stream = self.id(), "open was not acknowledged in {:?}", timeout);
                self.sender.reset("open timed out").await;
                Err(TunnelError::OpenTimeout(self.id(), timeout))
            }
        }
    }

    pub async fn send(&mut self, data: Bytes) -> Result<()> {
        self.sender.send(data).await
    }

    pub async fn receive(&mut self) -> Result<Option<Bytes>> {
        self.receiver.receive().await
    }

    pub async fn close(&mut self) -> Result<()> {
        self.sender.close().await
    }

    pub async fn reset(&mut self, reason: &str) {
        self.sender.reset(reason).await
    }

    pub fn into_split(self) -> (StreamSender, StreamReceiver) {
        (self.sender, self.receiver)
    }
}

/// Sending half of a stream. Dropping it without `close` half-closes the stream.
pub struct StreamSender {
    session: Session,
    id: StreamId,
    finished: bool,
}

impl StreamSender {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.session.stream_state(self.id)
    }

    /// Sends bytes as one or more `Data` frames, in order.
    pub async fn send(&mut self, data: Bytes) -> Result<()> {
        self.session.send_data(self.id, data).await
    }

    /// Half-closes the stream. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        self.finished = true;
        match self.session.begin_close(self.id)? {
            Some(frame) => self.session.send_frame(frame).await,
            None => Ok(()),
        }
    }

    /// Abandons both directions and tells the peer why.
    pub async fn reset(&mut self, reason: &str) {
        self.finished = true;
        if let Some(frame) = self.session.begin_reset(self.id, reason) {
            let _ = self.session.send_frame(frame).await;
        }
    }
}

impl Drop for StreamSender {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        if let Ok(Some(frame)) = self.session.begin_close(self.id) {
            self.session.send_frame_detached(frame);
        }
    }
}

/// Receiving half of a stream.
pub struct StreamReceiver {
    session: Session,
    id: StreamId,
    inbox: InboxReceiver,
}

impl StreamReceiver {
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Next payload in arrival order. `None` once the peer closed its side or
    /// the session ended.
    pub async fn receive(&mut self) -> Result<Option<Bytes>> {
        match self.inbox.recv().await {
            Some(Ok(data)) => Ok(Some(data)),
            Some(Err(err)) => Err(err),
            None => Ok(None),
        }
    }

    /// Abandons the stream from the receiving side, e.g. when the local socket failed.
    pub async fn reset(&mut self, reason: &str) {
        if let Some(frame) = self.session.begin_reset(self.id, reason) {
            let _ = self.session.send_frame(frame).await;
        }
    }
}

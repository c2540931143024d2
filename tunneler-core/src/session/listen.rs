use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::inbox::InboxReceiver;
use super::table::{StreamSlot, StreamState};
use super::{ListenId, Session, StreamHandle, StreamId};
use crate::address::Destination;
use crate::frame::Frame;
use crate::{Result, TunnelError};

/// A stream the peer announced with `Accept` for one of our remote listeners.
pub(crate) struct AcceptedStream {
    pub(crate) id: StreamId,
    pub(crate) origin: String,
    pub(crate) inbox: InboxReceiver,
}

/// A `ListenRequest` waiting for `accept_listen_request`.
pub(crate) struct PendingListen {
    pub(crate) id: ListenId,
    pub(crate) destination: Destination,
}

/// A listener the peer runs on our behalf. Dropping it asks the peer to stop.
pub struct RemoteListener {
    session: Session,
    id: ListenId,
    bound: String,
    accepts: UnboundedReceiver<Result<AcceptedStream>>,
}

impl RemoteListener {
    pub(crate) fn new(
        session: Session,
        id: ListenId,
        bound: String,
        accepts: UnboundedReceiver<Result<AcceptedStream>>,
    ) -> Self {
        Self {
            session,
            id,
            bound,
            accepts,
        }
    }

    pub fn id(&self) -> ListenId {
        self.id
    }

    /// The address the peer actually bound, as reported in its `ListenAck`.
    pub fn bound_address(&self) -> &str {
        &self.bound
    }

    /// Waits for the peer to accept an inbound connection. Returns the stream
    /// carrying it and the inbound client's address.
    ///
    /// Fails with `ListenRejected` when the peer reports the listener failed
    /// and with `SessionClosed` when the session ends.
    pub async fn accept_notification(&mut self) -> Result<(StreamHandle, String)> {
        match self.accepts.recv().await {
            Some(Ok(accepted)) => {
                let handle =
                    StreamHandle::new(self.session.clone(), accepted.id, accepted.inbox, None);
                Ok((handle, accepted.origin))
            }
            Some(Err(err)) => Err(err),
            None => Err(TunnelError::SessionClosed),
        }
    }
}

impl Drop for RemoteListener {
    fn drop(&mut self) {
        let registered = self.session.table().lock().listens.remove(&self.id).is_some();
        if registered {
            debug!(listen = self.id, "releasing remote listener");
            self.session.send_frame_detached(Frame::close(self.id));
        }
    }
}

/// A peer's request to listen on its behalf. Answer it with [`ack`](Self::ack)
/// or [`reject`](Self::reject); dropping it unanswered rejects it.
pub struct IncomingListen {
    session: Session,
    id: ListenId,
    destination: Destination,
    answered: bool,
}

impl IncomingListen {
    pub(crate) fn new(session: Session, id: ListenId, destination: Destination) -> Self {
        Self {
            session,
            id,
            destination,
            answered: false,
        }
    }

    pub fn id(&self) -> ListenId {
        self.id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Reports the bound address to the requester and starts hosting.
    pub async fn ack(mut self, bound: &str) -> Result<HostedListener> {
        self.answered = true;

        let token = {
            let table = self.session.table().lock();
            match table.hosted.get(&self.id) {
                Some(token) => token.clone(),
                None if table.closed => return Err(TunnelError::SessionClosed),
                None => {
                    return Err(TunnelError::ListenRejected(
                        "request withdrawn by the peer".into(),
                    ))
                }
            }
        };

        self.session
            .send_frame(Frame::listen_ack(self.id, bound))
            .await?;
        info!(listen = self.id, bound, "hosting listener for peer");

        Ok(HostedListener {
            session: self.session.clone(),
            id: self.id,
            token,
            finished: false,
        })
    }

    pub async fn reject(mut self, reason: &str) -> Result<()> {
        self.answered = true;
        debug!(listen = self.id, reason, "rejecting listen request");

        match self.session.end_hosted(self.id, reason) {
            Some(frame) => self.session.send_frame(frame).await,
            None => Ok(()),
        }
    }
}

impl Drop for IncomingListen {
    fn drop(&mut self) {
        if self.answered {
            return;
        }

        if let Some(frame) = self.session.end_hosted(self.id, "listen request dropped") {
            self.session.send_frame_detached(frame);
        }
    }
}

/// A listener this side runs for the peer. Its token is cancelled when the
/// peer sends `Close` for it or the session ends.
pub struct HostedListener {
    session: Session,
    id: ListenId,
    token: CancellationToken,
    finished: bool,
}

impl HostedListener {
    pub fn id(&self) -> ListenId {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Allocates a stream for an inbound connection and announces it with `Accept`.
    pub async fn notify_accept(&self, origin: &str) -> Result<StreamHandle> {
        let (inbox_tx, inbox_rx) = self.session.inbox();

        let stream_id = {
            let mut table = self.session.table().lock();
            if !table.hosted.contains_key(&self.id) {
                return Err(if table.closed {
                    TunnelError::SessionClosed
                } else {
                    TunnelError::ListenRejected("listener closed by the peer".into())
                });
            }

            let stream_id = table.allocate_id()?;
            table.streams.insert(
                stream_id,
                StreamSlot::new(StreamState::Open, inbox_tx, None),
            );
            stream_id
        };

        debug!(listen = self.id, stream = stream_id, origin, "announcing inbound connection");
        self.session
            .send_frame(Frame::accept(stream_id, self.id, origin))
            .await?;

        Ok(StreamHandle::new(self.session.clone(), stream_id, inbox_rx, None))
    }

    /// Stops hosting and tells the peer the listener failed.
    pub async fn fail(mut self, reason: &str) -> Result<()> {
        self.finished = true;

        match self.session.end_hosted(self.id, reason) {
            Some(frame) => self.session.send_frame(frame).await,
            None => Ok(()),
        }
    }
}

impl Drop for HostedListener {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        if let Some(frame) = self.session.end_hosted(self.id, "listener stopped") {
            self.session.send_frame_detached(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::address::{HostPort, Protocol};
    use crate::session::SessionConfig;
    use crate::test_util::session_pair;

    fn bind() -> Destination {
        Destination::new(Protocol::Tcp, HostPort::new("0.0.0.0", 8080))
    }

    #[tokio::test]
    async fn should_ack_listen_and_announce_accepts() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        let requester = tokio::spawn(async move {
            let listener = client.listen_request(&bind()).await;
            (client, listener)
        });

        // Act
        let request = server.accept_listen_request().await.unwrap();
        assert_eq!(&bind(), request.destination());
        let hosted = request.ack("0.0.0.0:8080").await.unwrap();
        let (client, listener) = requester.await.unwrap();
        let mut listener = listener.unwrap();
        let mut inbound = hosted.notify_accept("203.0.113.5:40000").await.unwrap();
        let (mut notified, origin) = listener.accept_notification().await.unwrap();

        // Assert
        assert_eq!("0.0.0.0:8080", listener.bound_address());
        assert_eq!("203.0.113.5:40000", origin);
        assert_eq!(inbound.id(), notified.id());
        assert_eq!(0, inbound.id() % 2);

        inbound.send(Bytes::from_static(b"SSH-2.0")).await.unwrap();
        assert_eq!(
            Some(Bytes::from_static(b"SSH-2.0")),
            notified.receive().await.unwrap()
        );
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn rejected_listen_surfaces_the_reason() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        let requester = tokio::spawn(async move { client.listen_request(&bind()).await });

        // Act
        let request = server.accept_listen_request().await.unwrap();
        request.reject("address in use").await.unwrap();
        let result = requester.await.unwrap();

        // Assert
        match result {
            Err(TunnelError::ListenRejected(reason)) => assert_eq!("address in use", reason),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("listen should have been rejected"),
        }
    }

    #[tokio::test]
    async fn dropping_the_remote_listener_stops_the_hosted_one() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        let requester = tokio::spawn(async move { client.listen_request(&bind()).await });
        let request = server.accept_listen_request().await.unwrap();
        let hosted = request.ack("0.0.0.0:8080").await.unwrap();
        let listener = requester.await.unwrap().unwrap();

        // Act
        drop(listener);
        hosted.cancelled().await;

        // Assert
        assert!(matches!(
            hosted.notify_accept("198.51.100.1:1234").await,
            Err(TunnelError::ListenRejected(_))
        ));
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn hosted_failure_ends_accept_notifications() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        let requester = tokio::spawn(async move { client.listen_request(&bind()).await });
        let request = server.accept_listen_request().await.unwrap();
        let hosted = request.ack("0.0.0.0:8080").await.unwrap();
        let mut listener = requester.await.unwrap().unwrap();

        // Act
        hosted.fail("accept failed").await.unwrap();
        let result = listener.accept_notification().await;

        // Assert
        assert!(matches!(result, Err(TunnelError::ListenRejected(_))));
    }

    #[tokio::test]
    async fn session_teardown_ends_accept_notifications() {
        // Arrange
        let (client, server) = session_pair(SessionConfig::default());
        let requester = tokio::spawn(async move { client.listen_request(&bind()).await });
        let request = server.accept_listen_request().await.unwrap();
        let hosted = request.ack("0.0.0.0:8080").await.unwrap();
        let mut listener = requester.await.unwrap().unwrap();

        // Act
        server.close();
        let result = listener.accept_notification().await;

        // Assert
        assert!(matches!(result, Err(TunnelError::SessionClosed)));
        assert!(hosted.token().is_cancelled());
    }
}

use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::inbox::Push;
use super::listen::{AcceptedStream, PendingListen};
use super::table::{ListenSlot, StreamSlot, StreamState, StreamTable};
use super::{IncomingStream, Role, Session, StreamId};
use crate::frame::{Frame, FrameType, SESSION_STREAM_ID};
use crate::transport::TransportReader;
use crate::{Result, TunnelError};

const RECEIVE_BUFFER_FULL: &str = "receive buffer full";

/// The only consumer of the transport's receiving half.
pub(crate) struct FrameReader {
    session: Session,
    reader: Box<dyn TransportReader>,
}

impl FrameReader {
    pub(crate) fn new<R>(session: Session, reader: R) -> Self
    where
        R: TransportReader + 'static,
    {
        Self {
            session,
            reader: Box::new(reader),
        }
    }

    pub(crate) fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            match self.start().await {
                Ok(()) => debug!("frame reader reached end of transport."),
                Err(TunnelError::SessionClosed) => debug!("peer ended the session."),
                Err(err) => {
                    if matches!(
                        err,
                        TunnelError::ProtocolViolation(_) | TunnelError::MalformedFrame(_)
                    ) {
                        self.session
                            .send_frame_detached(Frame::error(SESSION_STREAM_ID, &err.to_string()));
                    }
                    error!("session failed: {}", err);
                }
            }

            self.session.teardown();
        })
    }

    async fn start(&mut self) -> Result<()> {
        let token = self.session.token().clone();

        loop {
            let message = tokio::select! {
                message = self.reader.next() => message?,
                _ = token.cancelled() => return Ok(()),
            };

            let message = match message {
                Some(message) => message,
                None => return Ok(()),
            };

            let frame = Frame::decode(message)?;
            trace!("received frame {}", frame);

            match frame.kind() {
                FrameType::Open => self.on_open(frame).await?,
                FrameType::OpenAck => self.on_open_ack(frame.stream_id())?,
                FrameType::Data => self.on_data(frame).await?,
                FrameType::Close => self.on_close(frame.stream_id())?,
                FrameType::Error => self.on_error(frame)?,
                FrameType::ListenRequest => self.on_listen_request(frame).await?,
                FrameType::ListenAck => self.on_listen_ack(frame).await?,
                FrameType::Accept => self.on_accept(frame).await?,
            }
        }
    }

    async fn on_open(&mut self, frame: Frame) -> Result<()> {
        let id = frame.stream_id();
        let destination = frame.destination()?;
        let (inbox_tx, inbox_rx) = self.session.inbox();

        let rejection = {
            let mut table = self.session.table().lock();
            table.check_peer_id(id)?;

            if self.session.role() == Role::Client {
                table.retired.insert(id);
                Some("client sessions do not accept streams")
            } else {
                let incoming = IncomingStream {
                    id,
                    destination,
                    inbox: inbox_rx,
                };
                let queued = match table.incoming {
                    Some(ref queue) => queue.send(incoming).is_ok(),
                    None => false,
                };

                if queued {
                    table
                        .streams
                        .insert(id, StreamSlot::new(StreamState::Open, inbox_tx, None));
                    None
                } else {
                    table.retired.insert(id);
                    Some("session is closing")
                }
            }
        };

        match rejection {
            Some(reason) => {
                warn!(stream = id, reason, "refusing stream opened by peer");
                self.session.send_frame(Frame::error(id, reason)).await
            }
            None => Ok(()),
        }
    }

    fn on_open_ack(&mut self, id: StreamId) -> Result<()> {
        let mut table = self.session.table().lock();
        if !table.streams.contains_key(&id) {
            return unknown_id(&table, id, FrameType::OpenAck);
        }

        if let Some(slot) = table.streams.get_mut(&id) {
            match slot.state.on_ack() {
                Some(next) => {
                    slot.state = next;
                    if let Some(ack) = slot.pending_ack.take() {
                        let _ = ack.send(Ok(()));
                    }
                }
                None => {
                    return Err(TunnelError::ProtocolViolation(format!(
                        "OpenAck for stream {} in state {:?}",
                        id, slot.state
                    )))
                }
            }
        }

        Ok(())
    }

    async fn on_data(&mut self, frame: Frame) -> Result<()> {
        let id = frame.stream_id();
        let overflow = {
            let table = self.session.table().lock();
            let slot = match table.streams.get(&id) {
                Some(slot) => slot,
                None => return unknown_id(&table, id, FrameType::Data),
            };

            if !slot.state.can_receive() {
                return Err(TunnelError::ProtocolViolation(format!(
                    "Data for stream {} in state {:?}",
                    id, slot.state
                )));
            }

            match slot.inbox {
                Some(ref inbox) => match inbox.push(frame.into_payload()) {
                    Push::Queued => false,
                    Push::Discarded => {
                        trace!(stream = id, "receiver is gone, discarding data");
                        false
                    }
                    Push::Overflow => true,
                },
                None => false,
            }
        };

        if overflow {
            warn!(stream = id, "receiver fell behind, resetting stream");
            if let Some(frame) = self.session.begin_reset(id, RECEIVE_BUFFER_FULL) {
                self.session.send_frame(frame).await?;
            }
        }

        Ok(())
    }

    fn on_close(&mut self, id: StreamId) -> Result<()> {
        let mut table = self.session.table().lock();

        if let Some(token) = table.hosted.remove(&id) {
            info!(listen = id, "peer released hosted listener");
            token.cancel();
            return Ok(());
        }

        let state = match table.streams.get(&id) {
            Some(slot) => slot.state,
            None => return unknown_id(&table, id, FrameType::Close),
        };

        match state.on_remote_close() {
            Some(StreamState::Closed) => {
                table.streams.remove(&id);
                debug!(stream = id, "stream closed by both sides");
            }
            Some(next) => {
                if let Some(slot) = table.streams.get_mut(&id) {
                    slot.state = next;
                    slot.inbox.take();
                }
            }
            None => {
                return Err(TunnelError::ProtocolViolation(format!(
                    "Close for stream {} in state {:?}",
                    id, state
                )))
            }
        }

        Ok(())
    }

    fn on_error(&mut self, frame: Frame) -> Result<()> {
        let id = frame.stream_id();
        let reason = frame.reason();

        if id == SESSION_STREAM_ID {
            error!(%reason, "peer reported a fatal session error");
            return Err(TunnelError::SessionClosed);
        }

        let mut table = self.session.table().lock();

        if let Some(slot) = table.streams.remove(&id) {
            debug!(stream = id, %reason, "stream reset by peer");
            let error = if slot.pending_ack.is_some() {
                TunnelError::StreamRejected { id, reason }
            } else {
                TunnelError::StreamReset { id, reason }
            };
            slot.fail(error);
            return Ok(());
        }

        if let Some(slot) = table.listens.remove(&id) {
            match slot {
                ListenSlot::Pending { ack, .. } => {
                    let _ = ack.send(Err(TunnelError::ListenRejected(reason)));
                }
                ListenSlot::Active(accepts) => {
                    warn!(listen = id, %reason, "remote listener failed");
                    let _ = accepts.send(Err(TunnelError::ListenRejected(reason)));
                }
            }
            return Ok(());
        }

        if let Some(token) = table.hosted.remove(&id) {
            token.cancel();
            return Ok(());
        }

        debug!(id, %reason, "ignoring error for unknown id");
        Ok(())
    }

    async fn on_listen_request(&mut self, frame: Frame) -> Result<()> {
        let id = frame.stream_id();
        let destination = frame.destination()?;

        let rejection = {
            let mut table = self.session.table().lock();
            table.check_peer_id(id)?;

            if self.session.role() == Role::Client {
                table.retired.insert(id);
                Some("client sessions do not host listeners")
            } else {
                let token = self.session.token().child_token();
                let queued = match table.listen_requests {
                    Some(ref queue) => queue.send(PendingListen { id, destination }).is_ok(),
                    None => false,
                };

                if queued {
                    table.hosted.insert(id, token);
                    None
                } else {
                    table.retired.insert(id);
                    Some("session is closing")
                }
            }
        };

        match rejection {
            Some(reason) => {
                warn!(listen = id, reason, "refusing listen request");
                self.session.send_frame(Frame::error(id, reason)).await
            }
            None => Ok(()),
        }
    }

    async fn on_listen_ack(&mut self, frame: Frame) -> Result<()> {
        let id = frame.stream_id();
        let bound = frame.bound_address()?;

        let abandoned = {
            let mut table = self.session.table().lock();
            match table.listens.remove(&id) {
                Some(ListenSlot::Pending { ack, accepts }) => {
                    if ack.send(Ok(bound)).is_ok() {
                        table.listens.insert(id, ListenSlot::Active(accepts));
                        false
                    } else {
                        table.retired.insert(id);
                        true
                    }
                }
                Some(active) => {
                    table.listens.insert(id, active);
                    return Err(TunnelError::ProtocolViolation(format!(
                        "duplicate ListenAck for listen {}",
                        id
                    )));
                }
                None => return unknown_id(&table, id, FrameType::ListenAck),
            }
        };

        if abandoned {
            debug!(listen = id, "listen request was abandoned, releasing it");
            self.session.send_frame(Frame::close(id)).await?;
        }

        Ok(())
    }

    async fn on_accept(&mut self, frame: Frame) -> Result<()> {
        let stream_id = frame.stream_id();
        let (listen_id, origin) = frame.accept_parts()?;
        let (inbox_tx, inbox_rx) = self.session.inbox();

        let delivered = {
            let mut table = self.session.table().lock();
            table.check_peer_id(stream_id)?;

            let accepted = AcceptedStream {
                id: stream_id,
                origin,
                inbox: inbox_rx,
            };
            let delivered = match table.listens.get(&listen_id) {
                Some(ListenSlot::Active(accepts)) => accepts.send(Ok(accepted)).is_ok(),
                Some(ListenSlot::Pending { .. }) => {
                    return Err(TunnelError::ProtocolViolation(format!(
                        "Accept for listen {} before its ListenAck",
                        listen_id
                    )))
                }
                None => false,
            };

            if delivered {
                table
                    .streams
                    .insert(stream_id, StreamSlot::new(StreamState::Open, inbox_tx, None));
            } else {
                table.retired.insert(stream_id);
            }
            delivered
        };

        if !delivered {
            debug!(listen = listen_id, stream = stream_id, "no listener for accepted stream");
            self.session
                .send_frame(Frame::error(stream_id, "listener is closed"))
                .await?;
        }

        Ok(())
    }
}

/// Frames for ids we reset may still be in flight; anything else is a violation.
fn unknown_id(table: &StreamTable, id: StreamId, kind: FrameType) -> Result<()> {
    if table.retired.contains(id) {
        trace!(id, "discarding late {:?} for a reset id", kind);
        return Ok(());
    }

    Err(TunnelError::ProtocolViolation(format!(
        "{:?} for unknown id {}",
        kind, id
    )))
}

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tokio_util::sync::CancellationToken;

use super::inbox::InboxSender;
use super::listen::{AcceptedStream, PendingListen};
use super::{IncomingStream, ListenId, Role, StreamId};
use crate::{Result, TunnelError};

/// How many reset ids are remembered for discarding late frames.
pub(crate) const RETIRED_CAPACITY: usize = 4096;

/// Lifecycle of one logical stream as seen from this side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// `Open` sent, waiting for the peer's `OpenAck`.
    Opening,
    Open,
    /// We sent `Close`; the peer may still send data.
    HalfClosedLocal,
    /// The peer sent `Close`; we may still send data.
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    pub fn can_send(self) -> bool {
        matches!(
            self,
            StreamState::Opening | StreamState::Open | StreamState::HalfClosedRemote
        )
    }

    pub fn can_receive(self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub(crate) fn on_ack(self) -> Option<StreamState> {
        match self {
            StreamState::Opening => Some(StreamState::Open),
            _ => None,
        }
    }

    pub(crate) fn on_local_close(self) -> StreamState {
        match self {
            StreamState::Opening => StreamState::Closed,
            StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        }
    }

    pub(crate) fn on_remote_close(self) -> Option<StreamState> {
        match self {
            StreamState::Open => Some(StreamState::HalfClosedRemote),
            StreamState::HalfClosedLocal => Some(StreamState::Closed),
            _ => None,
        }
    }
}

pub(crate) struct StreamSlot {
    pub(crate) state: StreamState,
    /// Dropping the sender is how the receiving side observes end of stream.
    pub(crate) inbox: Option<InboxSender>,
    pub(crate) pending_ack: Option<oneshot::Sender<Result<()>>>,
}

impl StreamSlot {
    pub(crate) fn new(
        state: StreamState,
        inbox: InboxSender,
        pending_ack: Option<oneshot::Sender<Result<()>>>,
    ) -> Self {
        Self {
            state,
            inbox: Some(inbox),
            pending_ack,
        }
    }

    /// Fails the stream for whoever is waiting on it: the open, or the reader.
    pub(crate) fn fail(mut self, error: TunnelError) {
        match self.pending_ack.take() {
            Some(ack) => {
                let _ = ack.send(Err(error));
            }
            None => {
                if let Some(inbox) = self.inbox.take() {
                    inbox.fail(error);
                }
            }
        }
    }
}

pub(crate) enum ListenSlot {
    Pending {
        ack: oneshot::Sender<Result<String>>,
        accepts: UnboundedSender<Result<AcceptedStream>>,
    },
    Active(UnboundedSender<Result<AcceptedStream>>),
}

/// Bounded memory of ids this side reset.
#[derive(Default)]
pub(crate) struct RetiredIds {
    order: VecDeque<u32>,
    ids: HashSet<u32>,
}

impl RetiredIds {
    pub(crate) fn insert(&mut self, id: u32) {
        if !self.ids.insert(id) {
            return;
        }

        self.order.push_back(id);
        if self.order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    pub(crate) fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }
}

/// Every mutable piece of session state. Guarded by one lock, never held across an await.
pub(crate) struct StreamTable {
    role: Role,
    next_id: u32,
    pub(crate) streams: HashMap<StreamId, StreamSlot>,
    pub(crate) listens: HashMap<ListenId, ListenSlot>,
    pub(crate) hosted: HashMap<ListenId, CancellationToken>,
    pub(crate) retired: RetiredIds,
    pub(crate) incoming: Option<UnboundedSender<IncomingStream>>,
    pub(crate) listen_requests: Option<UnboundedSender<PendingListen>>,
    pub(crate) closed: bool,
}

impl StreamTable {
    pub(crate) fn new(
        role: Role,
        incoming: UnboundedSender<IncomingStream>,
        listen_requests: UnboundedSender<PendingListen>,
    ) -> Self {
        Self {
            role,
            next_id: role.first_id(),
            streams: HashMap::new(),
            listens: HashMap::new(),
            hosted: HashMap::new(),
            retired: RetiredIds::default(),
            incoming: Some(incoming),
            listen_requests: Some(listen_requests),
            closed: false,
        }
    }

    /// Hands out the next local id. Streams and listens share the counter.
    pub(crate) fn allocate_id(&mut self) -> Result<u32> {
        if self.closed {
            return Err(TunnelError::SessionClosed);
        }

        let id = self.next_id;
        self.next_id = id.checked_add(2).ok_or_else(|| {
            TunnelError::ProtocolViolation("local stream id space exhausted".into())
        })?;

        Ok(id)
    }

    /// Validates an id the peer chose for a new stream or listen.
    pub(crate) fn check_peer_id(&self, id: u32) -> Result<()> {
        if id == 0 || self.role.owns(id) {
            return Err(TunnelError::ProtocolViolation(format!(
                "peer allocated id {} with the wrong parity",
                id
            )));
        }

        if self.streams.contains_key(&id) || self.hosted.contains_key(&id) {
            return Err(TunnelError::ProtocolViolation(format!(
                "peer reused id {} while it is still active",
                id
            )));
        }

        if self.retired.contains(id) {
            return Err(TunnelError::ProtocolViolation(format!(
                "peer reused id {} after it was reset",
                id
            )));
        }

        Ok(())
    }

    /// Removes a stream this side is resetting and remembers its id.
    pub(crate) fn retire_stream(&mut self, id: StreamId) -> Option<StreamSlot> {
        self.retired.insert(id);
        self.streams.remove(&id)
    }

    /// Error for an operation on an id that is no longer in the table.
    pub(crate) fn missing(&self, id: StreamId) -> TunnelError {
        if self.closed {
            TunnelError::SessionClosed
        } else {
            TunnelError::StreamClosed(id)
        }
    }

    pub(crate) fn state(&self, id: StreamId) -> StreamState {
        self.streams
            .get(&id)
            .map(|slot| slot.state)
            .unwrap_or(StreamState::Closed)
    }

    /// Drops every registration. Receivers observe end of stream, waiters observe `SessionClosed`.
    pub(crate) fn shutdown(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        for (_, mut slot) in self.streams.drain() {
            if let Some(ack) = slot.pending_ack.take() {
                let _ = ack.send(Err(TunnelError::SessionClosed));
            }
            slot.inbox.take();
        }

        for (_, slot) in self.listens.drain() {
            if let ListenSlot::Pending { ack, .. } = slot {
                let _ = ack.send(Err(TunnelError::SessionClosed));
            }
        }

        for (_, token) in self.hosted.drain() {
            token.cancel();
        }

        self.incoming.take();
        self.listen_requests.take();

        true
    }
}

//! The multiplexed session: many logical streams over one transport connection.
//!
//! One reader task owns the transport's receiving half and is the only place
//! that demultiplexes incoming frames. One writer task owns the sending half and
//! drains a bounded queue of outbound frames, so frames from concurrent relays
//! never interleave. All bookkeeping lives in a single [`StreamTable`] behind a
//! synchronous lock that is never held across an await point.

mod inbox;
mod listen;
mod reader;
mod stream;
mod table;
mod writer;

pub use listen::{HostedListener, IncomingListen, RemoteListener};
pub use stream::{StreamHandle, StreamReceiver, StreamSender};
pub use table::StreamState;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError, UnboundedReceiver};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::address::Destination;
use crate::frame::{Frame, MAX_PAYLOAD_LEN};
use crate::transport::{TransportReader, TransportWriter};
use crate::util::spawn_detached;
use crate::{Result, TunnelError};

use inbox::{inbox, InboxReceiver, InboxSender};
use listen::{AcceptedStream, PendingListen};
use reader::FrameReader;
use table::{ListenSlot, StreamSlot, StreamTable};
use writer::FrameWriter;

pub type StreamId = u32;
pub type ListenId = u32;

pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 1024;
pub const DEFAULT_STREAM_BUFFER_LIMIT: usize = 8 * MAX_PAYLOAD_LEN;

/// Which end of the transport this session is. Decides id parity and which
/// peer-initiated requests are honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Allocates odd ids and refuses peer `Open`/`ListenRequest` frames.
    Client,
    /// Allocates even ids and serves peer requests.
    Server,
}

impl Role {
    pub(crate) fn first_id(self) -> u32 {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    /// Whether `id` is one this role would allocate.
    pub(crate) fn owns(self, id: u32) -> bool {
        match self {
            Role::Client => id % 2 == 1,
            Role::Server => id != 0 && id % 2 == 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an `Open` or `ListenRequest` may wait for its acknowledgement.
    pub open_timeout: Duration,
    /// Capacity of the outbound frame queue in front of the writer task.
    pub outbound_capacity: usize,
    /// Bytes a stream may hold received but not yet consumed. A peer that
    /// sends past it gets the stream reset.
    pub stream_buffer_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            stream_buffer_limit: DEFAULT_STREAM_BUFFER_LIMIT,
        }
    }
}

/// A peer `Open` waiting for `accept_incoming`.
pub(crate) struct IncomingStream {
    id: StreamId,
    destination: Destination,
    inbox: InboxReceiver,
}

struct Shared {
    role: Role,
    config: SessionConfig,
    table: Mutex<StreamTable>,
    outbound: mpsc::Sender<Frame>,
    token: CancellationToken,
    incoming: AsyncMutex<UnboundedReceiver<IncomingStream>>,
    listen_requests: AsyncMutex<UnboundedReceiver<PendingListen>>,
}

/// Cheaply cloneable handle to one multiplexed session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl Session {
    /// Starts the reader and writer tasks over an established transport.
    pub fn spawn<R, W>(role: Role, config: SessionConfig, reader: R, writer: W) -> Session
    where
        R: TransportReader + 'static,
        W: TransportWriter + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (listen_tx, listen_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let session = Session {
            shared: Arc::new(Shared {
                role,
                config,
                table: Mutex::new(StreamTable::new(role, incoming_tx, listen_tx)),
                outbound: outbound_tx,
                token: token.clone(),
                incoming: AsyncMutex::new(incoming_rx),
                listen_requests: AsyncMutex::new(listen_rx),
            }),
        };

        FrameWriter::new(outbound_rx, writer, token).spawn();
        FrameReader::new(session.clone(), reader).spawn();

        debug!("started {:?} session.", role);
        session
    }

    pub fn role(&self) -> Role {
        self.shared.role
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn is_closed(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Resolves once the session has been torn down.
    pub async fn closed(&self) {
        self.shared.token.cancelled().await
    }

    /// A token cancelled when the session is torn down.
    pub fn child_token(&self) -> CancellationToken {
        self.shared.token.child_token()
    }

    /// Tears the session down: every stream observes end of stream and the
    /// transport is closed once queued frames are written.
    pub fn close(&self) {
        info!("closing session.");
        self.teardown();
    }

    /// Number of streams currently registered, in any state but `Closed`.
    pub fn stream_count(&self) -> usize {
        self.shared.table.lock().streams.len()
    }

    /// Sends `Open` for a fresh stream and returns without waiting for the ack.
    /// Use [`StreamHandle::opened`] to wait for it.
    pub async fn open_stream(&self, destination: &Destination) -> Result<StreamHandle> {
        let (inbox_tx, inbox_rx) = self.inbox();
        let (ack_tx, ack_rx) = oneshot::channel();

        let id = {
            let mut table = self.shared.table.lock();
            let id = table.allocate_id()?;
            table.streams.insert(
                id,
                StreamSlot::new(StreamState::Opening, inbox_tx, Some(ack_tx)),
            );
            id
        };

        debug!(stream = id, %destination, "opening stream");
        if let Err(err) = self.send_frame(Frame::open(id, destination)).await {
            self.shared.table.lock().streams.remove(&id);
            return Err(err);
        }

        Ok(StreamHandle::new(self.clone(), id, inbox_rx, Some(ack_rx)))
    }

    /// Waits for the peer to open a stream, acknowledges it and returns it with
    /// the destination the peer asked for.
    pub async fn accept_incoming(&self) -> Result<(StreamHandle, Destination)> {
        loop {
            let incoming = {
                let mut queue = self.shared.incoming.lock().await;
                queue.recv().await
            };

            let incoming = match incoming {
                Some(incoming) => incoming,
                None => return Err(TunnelError::SessionClosed),
            };

            if !self.shared.table.lock().streams.contains_key(&incoming.id) {
                debug!(stream = incoming.id, "peer abandoned stream before it was accepted");
                continue;
            }

            self.send_frame(Frame::open_ack(incoming.id)).await?;
            debug!(stream = incoming.id, destination = %incoming.destination, "accepted stream");

            let handle = StreamHandle::new(self.clone(), incoming.id, incoming.inbox, None);
            return Ok((handle, incoming.destination));
        }
    }

    /// Asks the peer to listen on `bind` on our behalf and waits for its answer.
    pub async fn listen_request(&self, bind: &Destination) -> Result<RemoteListener> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (accepts_tx, accepts_rx) = mpsc::unbounded_channel();

        let id = {
            let mut table = self.shared.table.lock();
            let id = table.allocate_id()?;
            table.listens.insert(
                id,
                ListenSlot::Pending {
                    ack: ack_tx,
                    accepts: accepts_tx,
                },
            );
            id
        };

        info!(listen = id, %bind, "requesting remote listener");
        if let Err(err) = self.send_frame(Frame::listen_request(id, bind)).await {
            self.shared.table.lock().listens.remove(&id);
            return Err(err);
        }

        let timeout = self.shared.config.open_timeout;
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(Ok(bound))) => Ok(RemoteListener::new(self.clone(), id, bound, accepts_rx)),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(_)) => Err(TunnelError::SessionClosed),
            Err(_) => {
                {
                    let mut table = self.shared.table.lock();
                    table.listens.remove(&id);
                    table.retired.insert(id);
                }
                let _ = self.send_frame(Frame::close(id)).await;
                Err(TunnelError::OpenTimeout(id, timeout))
            }
        }
    }

    /// Waits for the next `ListenRequest` from the peer.
    pub async fn accept_listen_request(&self) -> Result<IncomingListen> {
        let pending = {
            let mut queue = self.shared.listen_requests.lock().await;
            queue.recv().await
        };

        match pending {
            Some(pending) => Ok(IncomingListen::new(
                self.clone(),
                pending.id,
                pending.destination,
            )),
            None => Err(TunnelError::SessionClosed),
        }
    }

    pub(crate) fn inbox(&self) -> (InboxSender, InboxReceiver) {
        inbox(self.shared.config.stream_buffer_limit)
    }

    pub(crate) fn table(&self) -> &Mutex<StreamTable> {
        &self.shared.table
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.shared
            .outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::SessionClosed)
    }

    /// Queues a frame from a synchronous context, such as `Drop`.
    pub(crate) fn send_frame_detached(&self, frame: Frame) {
        match self.shared.outbound.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                let outbound = self.shared.outbound.clone();
                spawn_detached(async move {
                    let _ = outbound.send(frame).await;
                });
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub(crate) fn teardown(&self) {
        if self.shared.table.lock().shutdown() {
            debug!("session torn down.");
        }
        self.shared.token.cancel();
    }

    pub(crate) fn stream_state(&self, id: StreamId) -> StreamState {
        self.shared.table.lock().state(id)
    }

    pub(crate) async fn send_data(&self, id: StreamId, mut data: Bytes) -> Result<()> {
        {
            let table = self.shared.table.lock();
            match table.streams.get(&id) {
                Some(slot) if slot.state.can_send() => {}
                Some(_) => return Err(TunnelError::StreamClosed(id)),
                None => return Err(table.missing(id)),
            }
        }

        loop {
            let chunk = data.split_to(data.len().min(MAX_PAYLOAD_LEN));
            self.send_frame(Frame::data(id, chunk)).await?;

            if data.is_empty() {
                return Ok(());
            }
        }
    }

    /// Applies a local close to the table and returns the frame announcing it.
    pub(crate) fn begin_close(&self, id: StreamId) -> Result<Option<Frame>> {
        let mut table = self.shared.table.lock();
        let state = match table.streams.get(&id) {
            Some(slot) => slot.state,
            None => return Err(table.missing(id)),
        };

        match state {
            StreamState::Opening => {
                if let Some(slot) = table.retire_stream(id) {
                    slot.fail(TunnelError::StreamClosed(id));
                }
                Ok(Some(Frame::error(id, "open cancelled")))
            }
            StreamState::Open | StreamState::HalfClosedRemote => {
                match state.on_local_close() {
                    StreamState::Closed => {
                        table.streams.remove(&id);
                    }
                    next => {
                        if let Some(slot) = table.streams.get_mut(&id) {
                            slot.state = next;
                        }
                    }
                }
                Ok(Some(Frame::close(id)))
            }
            StreamState::HalfClosedLocal | StreamState::Closed => Ok(None),
        }
    }

    /// Removes a stream this side is giving up on and returns the `Error` frame for the peer.
    pub(crate) fn begin_reset(&self, id: StreamId, reason: &str) -> Option<Frame> {
        let slot = self.shared.table.lock().retire_stream(id)?;
        slot.fail(TunnelError::StreamReset {
            id,
            reason: reason.to_string(),
        });

        Some(Frame::error(id, reason))
    }

    /// Stops hosting a listener and returns the `Error` frame reporting it, if it was still hosted.
    pub(crate) fn end_hosted(&self, id: ListenId, reason: &str) -> Option<Frame> {
        let mut table = self.shared.table.lock();
        let token = table.hosted.remove(&id)?;
        token.cancel();
        table.retired.insert(id);

        Some(Frame::error(id, reason))
    }
}

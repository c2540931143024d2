use std::fmt::{self, Display, Formatter};
use std::io::Cursor;

use bytes::{BufMut, Bytes, BytesMut};

use crate::address::Destination;
use crate::io::{get_u32, get_u8, get_utf8};
use crate::session::{ListenId, StreamId};
use crate::{Result, TunnelError};

/// Type tag plus big-endian stream id.
pub const HEADER_LEN: usize = 5;

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Stream id used by session-level control frames.
pub const SESSION_STREAM_ID: StreamId = 0;

pub mod frame_types {
    pub const OPEN: u8 = 1;
    pub const OPEN_ACK: u8 = 2;
    pub const DATA: u8 = 3;
    pub const CLOSE: u8 = 4;
    pub const ERROR: u8 = 5;
    pub const LISTEN_REQUEST: u8 = 6;
    pub const LISTEN_ACK: u8 = 7;
    pub const ACCEPT: u8 = 8;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Open,
    OpenAck,
    Data,
    Close,
    Error,
    ListenRequest,
    ListenAck,
    Accept,
}

impl FrameType {
    pub fn tag(self) -> u8 {
        use frame_types::*;

        match self {
            FrameType::Open => OPEN,
            FrameType::OpenAck => OPEN_ACK,
            FrameType::Data => DATA,
            FrameType::Close => CLOSE,
            FrameType::Error => ERROR,
            FrameType::ListenRequest => LISTEN_REQUEST,
            FrameType::ListenAck => LISTEN_ACK,
            FrameType::Accept => ACCEPT,
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self> {
        use frame_types::*;

        let kind = match value {
            OPEN => FrameType::Open,
            OPEN_ACK => FrameType::OpenAck,
            DATA => FrameType::Data,
            CLOSE => FrameType::Close,
            ERROR => FrameType::Error,
            LISTEN_REQUEST => FrameType::ListenRequest,
            LISTEN_ACK => FrameType::ListenAck,
            ACCEPT => FrameType::Accept,
            actual => {
                return Err(TunnelError::MalformedFrame(format!(
                    "invalid frame type {}",
                    actual
                )))
            }
        };

        Ok(kind)
    }
}

/// One transport message: `[type][stream id][payload...]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    kind: FrameType,
    stream_id: StreamId,
    payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameType, stream_id: StreamId, payload: Bytes) -> Self {
        Self {
            kind,
            stream_id,
            payload,
        }
    }

    pub fn open(stream_id: StreamId, destination: &Destination) -> Self {
        Self::new(FrameType::Open, stream_id, destination.to_string().into())
    }

    pub fn open_ack(stream_id: StreamId) -> Self {
        Self::new(FrameType::OpenAck, stream_id, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, payload)
    }

    pub fn close(stream_id: StreamId) -> Self {
        Self::new(FrameType::Close, stream_id, Bytes::new())
    }

    pub fn error(stream_id: StreamId, reason: &str) -> Self {
        Self::new(
            FrameType::Error,
            stream_id,
            Bytes::copy_from_slice(reason.as_bytes()),
        )
    }

    pub fn listen_request(listen_id: ListenId, bind: &Destination) -> Self {
        Self::new(FrameType::ListenRequest, listen_id, bind.to_string().into())
    }

    pub fn listen_ack(listen_id: ListenId, bound: &str) -> Self {
        Self::new(
            FrameType::ListenAck,
            listen_id,
            Bytes::copy_from_slice(bound.as_bytes()),
        )
    }

    pub fn accept(stream_id: StreamId, listen_id: ListenId, origin: &str) -> Self {
        let mut payload = BytesMut::with_capacity(4 + origin.len());
        payload.put_u32(listen_id);
        payload.put_slice(origin.as_bytes());

        Self::new(FrameType::Accept, stream_id, payload.freeze())
    }

    pub fn kind(&self) -> FrameType {
        self.kind
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Encodes the frame into one transport message.
    pub fn encode(&self) -> Bytes {
        let mut buffer = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buffer.put_u8(self.kind.tag());
        buffer.put_u32(self.stream_id);
        buffer.put_slice(&self.payload);

        buffer.freeze()
    }

    /// Decodes one transport message. The payload shares the message buffer.
    pub fn decode(message: Bytes) -> Result<Frame> {
        if message.len() < HEADER_LEN {
            return Err(TunnelError::MalformedFrame(format!(
                "message of {} bytes is shorter than the {} byte header",
                message.len(),
                HEADER_LEN
            )));
        }

        if message.len() - HEADER_LEN > MAX_PAYLOAD_LEN {
            return Err(TunnelError::MalformedFrame(format!(
                "payload of {} bytes exceeds {}",
                message.len() - HEADER_LEN,
                MAX_PAYLOAD_LEN
            )));
        }

        let mut cursor = Cursor::new(&message[..]);
        let kind = FrameType::try_from(get_u8(&mut cursor)?)?;
        let stream_id = get_u32(&mut cursor)?;

        Ok(Frame {
            kind,
            stream_id,
            payload: message.slice(HEADER_LEN..),
        })
    }

    /// Destination carried by `Open` and `ListenRequest` frames.
    pub fn destination(&self) -> Result<Destination> {
        self.text()?.parse::<Destination>()
    }

    /// Reason carried by `Error` frames; invalid utf-8 is replaced, not rejected.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Bound address carried by `ListenAck` frames.
    pub fn bound_address(&self) -> Result<String> {
        self.text()
    }

    /// Listen id and origin address carried by `Accept` frames.
    pub fn accept_parts(&self) -> Result<(ListenId, String)> {
        let mut cursor = Cursor::new(&self.payload[..]);
        let listen_id = get_u32(&mut cursor)?;
        let origin = get_utf8(&mut cursor)?;

        Ok((listen_id, origin))
    }

    fn text(&self) -> Result<String> {
        let mut cursor = Cursor::new(&self.payload[..]);
        get_utf8(&mut cursor)
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.kind {
            FrameType::Data => write!(
                f,
                "Data[stream = {}, size = {}]",
                self.stream_id,
                self.payload.len()
            ),
            FrameType::Error => write!(
                f,
                "Error[stream = {}, reason = {}]",
                self.stream_id,
                self.reason()
            ),
            kind => write!(f, "{:?}[stream = {}]", kind, self.stream_id),
        }
    }
}

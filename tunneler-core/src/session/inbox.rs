use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{Result, TunnelError};

/// Creates the queue between the frame reader and one stream's receiver.
///
/// The queue never blocks the reader. Instead it counts the payload bytes
/// that were delivered but not yet received, and refuses a push that would
/// take that count past `limit`.
pub(crate) fn inbox(limit: usize) -> (InboxSender, InboxReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));

    (
        InboxSender {
            tx,
            buffered: buffered.clone(),
            limit,
        },
        InboxReceiver { rx, buffered },
    )
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Push {
    Queued,
    /// The receiver is gone; the payload was dropped.
    Discarded,
    /// The receiver fell too far behind; the payload was dropped.
    Overflow,
}

pub(crate) struct InboxSender {
    tx: UnboundedSender<Result<Bytes>>,
    buffered: Arc<AtomicUsize>,
    limit: usize,
}

impl InboxSender {
    pub(crate) fn push(&self, data: Bytes) -> Push {
        let len = data.len();
        if self.buffered.load(Ordering::Acquire) + len > self.limit {
            return Push::Overflow;
        }

        self.buffered.fetch_add(len, Ordering::AcqRel);
        if self.tx.send(Ok(data)).is_err() {
            self.buffered.fetch_sub(len, Ordering::AcqRel);
            return Push::Discarded;
        }

        Push::Queued
    }

    pub(crate) fn fail(self, error: TunnelError) {
        let _ = self.tx.send(Err(error));
    }
}

pub(crate) struct InboxReceiver {
    rx: UnboundedReceiver<Result<Bytes>>,
    buffered: Arc<AtomicUsize>,
}

impl InboxReceiver {
    pub(crate) async fn recv(&mut self) -> Option<Result<Bytes>> {
        let next = self.rx.recv().await;
        if let Some(Ok(ref data)) = next {
            self.buffered.fetch_sub(data.len(), Ordering::AcqRel);
        }

        next
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }
}

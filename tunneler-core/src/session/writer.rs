use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::frame::Frame;
use crate::transport::TransportWriter;
use crate::Result;

/// Drains the outbound queue into the transport. Being the only task that
/// writes is what keeps frames from interleaving.
pub(crate) struct FrameWriter {
    receiver: Receiver<Frame>,
    writer: Box<dyn TransportWriter>,
    token: CancellationToken,
}

impl FrameWriter {
    pub(crate) fn new<W>(receiver: Receiver<Frame>, writer: W, token: CancellationToken) -> Self
    where
        W: TransportWriter + 'static,
    {
        Self {
            receiver,
            writer: Box::new(writer),
            token,
        }
    }

    pub(crate) fn spawn(mut self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(err) = self.start().await {
                warn!("failed to write to transport: {}", err);
            }

            self.token.cancel();
            self.receiver.close();
            if let Err(err) = self.writer.close().await {
                debug!("failed to close transport: {}", err);
            }
        })
    }

    async fn start(&mut self) -> Result<()> {
        loop {
            let frame = tokio::select! {
                biased;
                frame = self.receiver.recv() => frame,
                _ = self.token.cancelled() => break,
            };

            match frame {
                Some(frame) => self.write(frame).await?,
                None => break,
            }
        }

        // frames queued before teardown, such as a final session error
        while let Ok(frame) = self.receiver.try_recv() {
            self.write(frame).await?;
        }

        debug!("reached end of outbound frames.");
        Ok(())
    }

    async fn write(&mut self, frame: Frame) -> Result<()> {
        trace!("writing frame {}", frame);
        self.writer.send(frame.encode()).await
    }
}

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{validate, TunnelController};
use crate::address::Destination;
use crate::net::dial_endpoint;
use crate::relay::RelayPump;
use crate::session::{RemoteListener, Session, StreamHandle};
use crate::tunnel_spec::TunnelSpec;
use crate::Result;

/// Has the peer listen on its side and dials the target from here for every
/// connection the peer accepts.
pub struct RemoteTunnel {
    shutdown: CancellationToken,
}

impl RemoteTunnel {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self { shutdown }
    }

    pub async fn listen(&self, session: &Session, spec: &TunnelSpec) -> Result<RemoteListener> {
        validate(spec)?;

        let listener = session.listen_request(&spec.bind_destination()).await?;
        info!(
            "peer listening on {} {}, forwarding to {}.",
            spec.protocol(),
            listener.bound_address(),
            spec.target()
        );

        Ok(listener)
    }

    pub async fn serve(&self, spec: TunnelSpec, mut listener: RemoteListener) -> Result<()> {
        let target = spec.target_destination();

        loop {
            let (stream, origin) = tokio::select! {
                accepted = listener.accept_notification() => accepted?,
                _ = self.shutdown.cancelled() => {
                    info!("remote tunnel to {} shutting down.", target);
                    return Ok(());
                }
            };

            debug!(stream = stream.id(), %origin, "peer accepted connection for {}.", target);
            let target = target.clone();
            let token = self.shutdown.child_token();
            tokio::spawn(async move {
                if let Err(err) = forward_accepted(&target, stream, token).await {
                    warn!(%origin, "connection to {} failed: {}", target, err);
                }
            });
        }
    }
}

#[async_trait]
impl TunnelController for RemoteTunnel {
    async fn start(&self, session: Session, spec: TunnelSpec) -> Result<()> {
        let listener = self.listen(&session, &spec).await?;
        self.serve(spec, listener).await
    }
}

async fn forward_accepted(
    target: &Destination,
    mut stream: StreamHandle,
    token: CancellationToken,
) -> Result<()> {
    let (reader, writer) = match dial_endpoint(target).await {
        Ok(endpoint) => endpoint,
        Err(err) => {
            stream.reset(&err.to_string()).await;
            return Err(err);
        }
    };

    let stats = RelayPump::new(token).run(reader, writer, stream).await?;
    debug!("connection to {} finished: {:?}", target, stats);

    Ok(())
}

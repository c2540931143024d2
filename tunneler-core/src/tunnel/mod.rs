mod local;
mod remote;

pub use local::*;
pub use remote::*;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::session::Session;
use crate::tunnel_spec::TunnelSpec;
use crate::{Result, TunnelError};

/// Runs one tunnel over a session until it is shut down or fails.
///
/// Returns `Ok(())` after a requested shutdown, `Err(SessionClosed)` when the
/// session ended underneath it, and the setup error when the tunnel could not
/// be established.
#[async_trait]
pub trait TunnelController: Send + Sync {
    async fn start(&self, session: Session, spec: TunnelSpec) -> Result<()>;
}

/// Which side of the session listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Listen here, reach the target from the peer.
    Local,
    /// Listen on the peer, reach the target from here.
    Remote,
}

impl Direction {
    pub fn controller(self, shutdown: CancellationToken) -> Box<dyn TunnelController> {
        match self {
            Direction::Local => Box::new(LocalTunnel::new(shutdown)),
            Direction::Remote => Box::new(RemoteTunnel::new(shutdown)),
        }
    }
}

pub(crate) fn validate(spec: &TunnelSpec) -> Result<()> {
    if spec.target().port() == 0 {
        return Err(TunnelError::InvalidTunnel(format!(
            "target port of {} must not be 0",
            spec
        )));
    }

    Ok(())
}

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tunneler_core::session::{Role, Session};
use tunneler_core::transport::websocket_transport;
use tunneler_core::TunnelError;

use crate::config::ClientConfig;
use crate::connect::connect;
use crate::logging::init_logging;
use crate::{ClientArgs, Result};

/// represents main app logic.
pub struct App {
    args: ClientArgs,
}

impl App {
    pub fn new(args: ClientArgs) -> Self {
        Self { args }
    }

    /// loads config, connects to the server and runs the requested tunnel
    /// until ctrl-c or until the session ends.
    pub async fn start(&self) -> Result<()> {
        let config = ClientConfig::load(self.args.config_path())?;
        init_logging(config.log_level())?;

        let (direction, spec) = self.args.tunnel()?;
        info!("starting {:?} tunnel {}", direction, spec);

        let socket = connect(&config).await?;
        let (reader, writer) = websocket_transport(socket);
        let session = Session::spawn(Role::Client, config.session_config(), reader, writer);

        let shutdown = CancellationToken::new();
        let controller = direction.controller(shutdown.clone());
        let tunnel = controller.start(session.clone(), spec);
        tokio::pin!(tunnel);

        let result = tokio::select! {
            result = &mut tunnel => result,
            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down..");
                shutdown.cancel();
                tunnel.await
            }
        };

        session.close();
        match result {
            Ok(()) => {
                debug!("tunnel finished.");
                Ok(())
            }
            Err(TunnelError::SessionClosed) => {
                error!("connection to the server was lost.");
                Err(TunnelError::SessionClosed.into())
            }
            Err(err) => {
                error!("tunnel failed: {}", err);
                Err(err.into())
            }
        }
    }
}

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;

use tunneler_core::session::SessionConfig;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct AppArguments {
    /// Address the websocket endpoint listens on.
    #[clap(short, long, value_parser, default_value = "0.0.0.0:9000")]
    listen: SocketAddr,

    /// Bearer token clients must present.
    #[clap(short, long, env = "TUNNELERD_TOKEN", hide_env_values = true)]
    token: String,

    /// How long opens and listen requests wait for the client's answer.
    #[clap(long, value_parser = clap::value_parser!(u64).range(1..), default_value = "10")]
    open_timeout_secs: u64,
}

impl AppArguments {
    pub fn new(listen: SocketAddr, token: &str) -> Self {
        Self {
            listen,
            token: token.to_string(),
            open_timeout_secs: 10,
        }
    }

    pub fn listen(&self) -> SocketAddr {
        self.listen
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            open_timeout: Duration::from_secs(self.open_timeout_secs),
            ..SessionConfig::default()
        }
    }
}

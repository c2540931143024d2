use std::path::{Path, PathBuf};

use clap::Parser;

use tunneler_core::{Direction, TunnelSpec};

use crate::Result;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct ClientArgs {
    /// Listen here and reach the target through the server: [bindHost:]bindPort:targetHost:targetPort
    #[clap(short = 'L', long = "local-tunnel", value_name = "SPEC")]
    local_tunnel: Option<String>,

    /// Have the server listen and reach the target from here: [bindHost:]bindPort:targetHost:targetPort
    #[clap(short = 'R', long = "remote-tunnel", value_name = "SPEC")]
    remote_tunnel: Option<String>,

    /// Tunnel protocol.
    #[clap(short, long, default_value = "tcp", value_parser = ["tcp", "udp"])]
    protocol: String,

    /// Config file to use instead of searching the default locations.
    #[clap(short, long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl ClientArgs {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// The one tunnel requested on the command line.
    pub fn tunnel(&self) -> Result<(Direction, TunnelSpec)> {
        match (&self.local_tunnel, &self.remote_tunnel) {
            (Some(_), Some(_)) => {
                Err("unable to create local and remote tunnel at the same time".into())
            }
            (None, None) => Err("need at least one type of tunnel (-L or -R)".into()),
            (Some(spec), None) => Ok((Direction::Local, TunnelSpec::parse(&self.protocol, spec)?)),
            (None, Some(spec)) => Ok((Direction::Remote, TunnelSpec::parse(&self.protocol, spec)?)),
        }
    }
}

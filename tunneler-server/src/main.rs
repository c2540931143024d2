use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tunneler_server::{AppArguments, DefaultListener, Result, Server};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = AppArguments::parse();
    let shutdown_signal = signal::ctrl_c();
    let listener = DefaultListener::bind(args.listen()).await?;

    Server::new(args, Box::new(listener))
        .run(shutdown_signal)
        .await?;

    info!("server stopped");
    Ok(())
}

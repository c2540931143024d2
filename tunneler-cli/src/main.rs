use clap::Parser;
use tunneler_cli::{App, ClientArgs, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let args = ClientArgs::parse();
    App::new(args)
        .start()
        .await?;

    Ok(())
}

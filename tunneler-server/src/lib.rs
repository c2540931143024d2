mod args;
mod server;

pub use args::AppArguments;
pub use server::*;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

mod app;
mod args;

pub mod config;
pub mod connect;
pub mod logging;

pub use app::*;
pub use args::*;

pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Result<T> = std::result::Result<T, Error>;

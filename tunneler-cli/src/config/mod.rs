mod client_config;
mod config_error;
mod directory_resolver;

pub use client_config::*;
pub use config_error::ConfigError;
pub use directory_resolver::*;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found, looked in: {0:?}")]
    NotFound(Vec<PathBuf>),
    #[error("failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("need to specify Token in configuration")]
    MissingToken,
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

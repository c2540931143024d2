use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use tunneler_core::session::SessionConfig;

use crate::config::{config_candidates, resolve_config_file, ConfigError};

type Result<T> = std::result::Result<T, ConfigError>;

pub const DEFAULT_LOG_LEVEL: &str = "INFO";
pub const DEFAULT_SERVER: &str = "ws://127.0.0.1:9000";
pub const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 10;

pub const ENV_SERVER: &str = "TUNNELERC_SERVER";
pub const ENV_TOKEN: &str = "TUNNELERC_TOKEN";
pub const ENV_PROXY: &str = "TUNNELERC_PROXY";
pub const ENV_LOG_LEVEL: &str = "TUNNELERC_LOG_LEVEL";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientConfig {
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_server")]
    server: String,
    token: Option<String>,
    proxy: Option<String>,
    write_buffer_size: Option<usize>,
    read_buffer_size: Option<usize>,
    #[serde(default = "default_open_timeout_secs")]
    open_timeout_secs: u64,
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_server() -> String {
    DEFAULT_SERVER.to_string()
}

fn default_open_timeout_secs() -> u64 {
    DEFAULT_OPEN_TIMEOUT_SECS
}

impl ClientConfig {
    /// Reads the first config file found, applies `TUNNELERC_*` overrides and
    /// validates the result.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match resolve_config_file(explicit) {
            Some(path) => path,
            None => return Err(ConfigError::NotFound(config_candidates(explicit))),
        };

        debug!("reading config from {:?}", path);
        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;

        let mut config = Self::from_yaml(&contents)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        Ok(serde_yaml::from_str::<Self>(contents)?)
    }

    /// Replaces values with the ones `lookup` finds for the `TUNNELERC_*` keys.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(server) = lookup(ENV_SERVER) {
            self.server = server;
        }
        if let Some(token) = lookup(ENV_TOKEN) {
            self.token = Some(token);
        }
        if let Some(proxy) = lookup(ENV_PROXY) {
            self.proxy = Some(proxy);
        }
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.token.as_deref() {
            Some(token) if !token.trim().is_empty() => {}
            _ => return Err(ConfigError::MissingToken),
        }

        if self.open_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "OpenTimeoutSecs",
                value: self.open_timeout_secs.to_string(),
            });
        }

        Ok(())
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn proxy(&self) -> Option<&str> {
        self.proxy.as_deref()
    }

    pub fn write_buffer_size(&self) -> Option<usize> {
        self.write_buffer_size
    }

    pub fn read_buffer_size(&self) -> Option<usize> {
        self.read_buffer_size
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            open_timeout: Duration::from_secs(self.open_timeout_secs),
            ..SessionConfig::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: default_server(),
            token: None,
            proxy: None,
            write_buffer_size: None,
            read_buffer_size: None,
            open_timeout_secs: DEFAULT_OPEN_TIMEOUT_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::PathBuf;

    use uuid::Uuid;

    use super::*;

    #[test]
    fn should_read_from_file() {
        // Arrange
        let file_name = create_file_name();
        fs::write(&file_name, "Token: secret\nServer: wss://tunnel.example.com/ws\n").unwrap();

        // Act
        let config = ClientConfig::load(Some(&file_name));

        // Assert
        remove_file(&file_name);
        let config = config.unwrap();
        assert_eq!(Some("secret"), config.token());
        assert_eq!(DEFAULT_LOG_LEVEL, config.log_level());
    }

    #[test]
    fn missing_file_is_not_found() {
        // Arrange
        let file_name = create_file_name();

        // Act
        let result = ClientConfig::load(Some(&file_name));

        // Assert
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn should_apply_defaults() {
        // Act
        let config = ClientConfig::from_yaml("Token: abc").unwrap();

        // Assert
        assert_eq!("ws://127.0.0.1:9000", config.server());
        assert_eq!("INFO", config.log_level());
        assert_eq!(None, config.proxy());
        assert_eq!(None, config.read_buffer_size());
        assert_eq!(
            Duration::from_secs(10),
            config.session_config().open_timeout
        );
    }

    #[test]
    fn should_read_every_key() {
        // Arrange
        let yaml = "LogLevel: FINE\n\
                    Server: ws://10.0.0.2:9000\n\
                    Token: abc\n\
                    Proxy: http://proxy.local:3128\n\
                    WriteBufferSize: 4096\n\
                    ReadBufferSize: 8192\n\
                    OpenTimeoutSecs: 3\n";

        // Act
        let config = ClientConfig::from_yaml(yaml).unwrap();

        // Assert
        assert_eq!("FINE", config.log_level());
        assert_eq!("ws://10.0.0.2:9000", config.server());
        assert_eq!(Some("http://proxy.local:3128"), config.proxy());
        assert_eq!(Some(4096), config.write_buffer_size());
        assert_eq!(Some(8192), config.read_buffer_size());
        assert_eq!(Duration::from_secs(3), config.session_config().open_timeout);
    }

    #[test]
    fn missing_token_fails_validation() {
        // Arrange
        let config = ClientConfig::from_yaml("Server: ws://127.0.0.1:9000").unwrap();

        // Act
        let result = config.validate();

        // Assert
        assert!(matches!(result, Err(ConfigError::MissingToken)));
    }

    #[test]
    fn environment_overrides_file_values() {
        // Arrange
        let mut config = ClientConfig::from_yaml("Server: ws://127.0.0.1:9000").unwrap();
        let env: HashMap<&str, &str> = [
            (ENV_TOKEN, "from-env"),
            (ENV_SERVER, "wss://override.example.com"),
            (ENV_LOG_LEVEL, "DEBUG"),
        ]
        .into_iter()
        .collect();

        // Act
        config.apply_overrides(|key| env.get(key).map(|value| value.to_string()));

        // Assert
        assert!(config.validate().is_ok());
        assert_eq!(Some("from-env"), config.token());
        assert_eq!("wss://override.example.com", config.server());
        assert_eq!("DEBUG", config.log_level());
        assert_eq!(None, config.proxy());
    }

    fn create_file_name() -> PathBuf {
        let file_id = Uuid::new_v4();
        std::env::temp_dir().join(format!("{}.yaml", file_id))
    }

    fn remove_file(path: &Path) {
        let _ = fs::remove_file(path);
    }
}

use std::env;
use std::path::PathBuf;

use thiserror::Error;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;

const HOST_KEY: &str = "HOST";
const PORT_KEY: &str = "PORT";
const DATA_DIR_KEY: &str = "DATA_DIR";
const WALLET_SECRET_KEY_KEY: &str = "WALLET_SECRET_KEY";

/// Errors that can occur while reading the configuration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid port {0:?}")]
    InvalidPort(String),

    #[error("Invalid wallet secret key: {0}")]
    InvalidSecretKey(String),
}

/// Startup settings of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,

    /// Enables persistence when set
    pub data_dir: Option<PathBuf>,

    /// ed25519 secret key of the node wallet; a fresh wallet is generated when unset
    pub wallet_secret_key: Option<[u8; 32]>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            data_dir: None,
            wallet_secret_key: None,
        }
    }
}

impl NodeConfig {
    /// Reads the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`
    ///
    /// Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = NodeConfig::default();

        if let Some(host) = get(HOST_KEY) {
            config.host = host;
        }

        if let Some(port) = get(PORT_KEY) {
            config.port = port
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidPort(port.clone()))?;
        }

        config.data_dir = get(DATA_DIR_KEY).map(PathBuf::from);

        if let Some(secret) = get(WALLET_SECRET_KEY_KEY) {
            let bytes = hex::decode(secret.trim())
                .map_err(|e| ConfigError::InvalidSecretKey(e.to_string()))?;
            let key: [u8; 32] = bytes.try_into().map_err(|bytes: Vec<u8>| {
                ConfigError::InvalidSecretKey(format!("expected 32 bytes, got {}", bytes.len()))
            })?;
            config.wallet_secret_key = Some(key);
        }

        Ok(config)
    }

    /// The `host:port` pair to bind the HTTP server to
    pub fn bind_address(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

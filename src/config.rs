//! On-disk configuration (spec §4.1).
//!
//! Grounded on `Data.go`'s `Config`/`fetchConfig`: a single `port` field,
//! read from `config.json` next to the running executable, written back
//! with the default value the first time the file is missing.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ProxyError, Result};
use crate::protocol::constants::DEFAULT_RELAY_PORT;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_RELAY_PORT,
        }
    }
}

impl Config {
    /// Loads `config.json` from the directory containing the current
    /// executable, creating it with default values if absent.
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        match std::fs::read(&path) {
            Ok(bytes) => {
                let config: Config = serde_json::from_slice(&bytes)
                    .map_err(|e| ProxyError::Config(format!("parsing {}: {e}", path.display())))?;
                info!(path = %path.display(), port = config.port, "loaded config");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                warn!(path = %path.display(), "config file not found, writing default");
                config.write(&path)?;
                Ok(config)
            }
            Err(e) => Err(ProxyError::Config(format!("reading {}: {e}", path.display()))),
        }
    }

    fn write(&self, path: &std::path::Path) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| ProxyError::Config(format!("serializing default config: {e}")))?;
        std::fs::write(path, bytes)
            .map_err(|e| ProxyError::Config(format!("writing {}: {e}", path.display())))
    }
}

fn config_path() -> Result<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| ProxyError::Config(format!("locating executable: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| ProxyError::Config("executable has no parent directory".to_string()))?;
    Ok(dir.join("config.json"))
}

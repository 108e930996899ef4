use std::path::PathBuf;

use portal_common::ConfigError;
use serde::{Deserialize, Serialize};

/// Where session records live.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// One JSON document per controller under `data_dir/sessions`.
    #[default]
    File,
    /// Process memory only. Nothing survives a restart.
    Memory,
}

/// Durable session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Empty = platform data directory.
    pub data_dir: String,
    /// Upper bound for one durable write (valid range: 50-60000).
    pub write_timeout_ms: u32,
    /// Delay before the single retry of a failed write (valid range: 0-10000).
    pub retry_backoff_ms: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            data_dir: String::new(),
            write_timeout_ms: 2000,
            retry_backoff_ms: 200,
        }
    }
}

impl StoreConfig {
    /// Resolve `data_dir`, falling back to `<platform data dir>/portal-relay`.
    pub fn resolved_data_dir(&self) -> Result<PathBuf, ConfigError> {
        if !self.data_dir.is_empty() {
            return Ok(PathBuf::from(&self.data_dir));
        }
        let base = dirs::data_dir()
            .ok_or_else(|| ConfigError::ParseError("could not determine data directory".into()))?;
        Ok(base.join("portal-relay"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_data_dir_wins() {
        let config = StoreConfig {
            data_dir: "/var/lib/portal".into(),
            ..StoreConfig::default()
        };
        assert_eq!(
            config.resolved_data_dir().unwrap(),
            PathBuf::from("/var/lib/portal")
        );
    }

    #[test]
    fn empty_data_dir_uses_platform_default() {
        // dirs::data_dir can be None on minimal CI images
        if let Ok(path) = StoreConfig::default().resolved_data_dir() {
            assert!(path.ends_with("portal-relay"));
        }
    }

    #[test]
    fn backend_parses_lowercase() {
        let backend: StoreBackend = serde_json::from_str("\"memory\"").unwrap();
        assert_eq!(backend, StoreBackend::Memory);
    }
}

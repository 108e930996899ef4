//! Reading the relay's TOML file, and seeding one on first run.

use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use portal_common::ConfigError;

use super::template::default_config_toml;
use crate::schema::RelayConfig;

/// `<platform config dir>/portal-relay/config.toml`.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("portal-relay").join("config.toml"))
        .ok_or_else(|| ConfigError::ParseError("no platform config directory".into()))
}

/// Parse `path`. Absent keys fall back to their defaults; validation is the
/// caller's job, after CLI flags have been applied.
pub fn load_from_path(path: &Path) -> Result<RelayConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ConfigError::FileNotFound(path.to_path_buf()),
        _ => ConfigError::ParseError(format!("cannot read {}: {e}", path.display())),
    })?;

    let config: RelayConfig = toml::from_str(&content)
        .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;

    tracing::info!(path = %path.display(), "Config loaded");
    Ok(config)
}

/// Load from [`default_config_path`], writing the commented template there
/// first if nothing exists yet.
pub fn load_default() -> Result<RelayConfig, ConfigError> {
    let path = default_config_path()?;
    match load_from_path(&path) {
        Err(ConfigError::FileNotFound(_)) => {
            create_default_config(&path)?;
            Ok(RelayConfig::default())
        }
        other => other,
    }
}

/// Write the commented template to `path`. An existing file is left as is.
pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
    let write_error =
        |e: std::io::Error| ConfigError::ParseError(format!("cannot write {}: {e}", path.display()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_error)?;
    }

    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            tracing::debug!(path = %path.display(), "Config already present, not overwriting");
            return Ok(());
        }
        Err(e) => return Err(write_error(e)),
    };
    file.write_all(default_config_toml().as_bytes())
        .map_err(write_error)?;

    tracing::info!(path = %path.display(), "Wrote default config");
    Ok(())
}

//! Server configuration and on-disk state under `~/.ccr`.
//!
//! The config file holds the listen address and the token-signing secret.
//! Everything here is plain persistence; the interesting state (sessions,
//! scrollback) lives only in the running server.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 3100;
/// Default bind host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHome,

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Optional TLS material, loaded from disk when present.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Persisted server configuration (`~/.ccr/config.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// TCP port for HTTP + WebSocket.
    pub port: u16,
    /// Bind host.
    pub host: String,
    /// Hex-encoded 32-byte secret used to sign access tokens.
    pub jwt_secret: String,
    /// Child program spawned for each session. Defaults to `claude`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// TLS certificate/key paths; plain TCP when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

impl Config {
    /// Fresh config with a newly minted signing secret.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            jwt_secret: crate::auth::generate_secret(),
            command: None,
            tls: None,
        }
    }

    /// Load the config from `<home>/config.json`, creating and persisting a
    /// fresh one (with a new secret) if the file does not exist yet.
    pub fn load_or_create(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join("config.json");
        if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&raw).map_err(|source| ConfigError::Parse { path, source })
        } else {
            let config = Self::generate();
            config.save(home)?;
            Ok(config)
        }
    }

    /// Persist the config to `<home>/config.json` (mode 0o600 on unix).
    pub fn save(&self, home: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(home).map_err(|source| ConfigError::Write {
            path: home.to_path_buf(),
            source,
        })?;
        let path = home.join("config.json");
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&path, json).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&path, perms).map_err(|source| ConfigError::Write {
                path,
                source,
            })?;
        }

        Ok(())
    }
}

/// Resolve the state directory: `$CCR_HOME` if set, otherwise `~/.ccr`.
pub fn default_home() -> Result<PathBuf, ConfigError> {
    if let Ok(dir) = std::env::var("CCR_HOME") {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".ccr"))
        .ok_or(ConfigError::NoHome)
}

/// Path of the persisted access token.
#[must_use]
pub fn token_path(home: &Path) -> PathBuf {
    home.join("token")
}

/// Path of the server pid file.
#[must_use]
pub fn pid_path(home: &Path) -> PathBuf {
    home.join("server.pid")
}

/// Base directory for per-session sandboxes.
#[must_use]
pub fn sessions_dir(home: &Path) -> PathBuf {
    home.join("sessions")
}

/// Write the current token to `<home>/token`.
pub fn save_token(home: &Path, token: &str) -> Result<(), ConfigError> {
    std::fs::create_dir_all(home).map_err(|source| ConfigError::Write {
        path: home.to_path_buf(),
        source,
    })?;
    let path = token_path(home);
    std::fs::write(&path, token).map_err(|source| ConfigError::Write { path, source })
}

/// Read the persisted token, if any.
#[must_use]
pub fn load_token(home: &Path) -> Option<String> {
    std::fs::read_to_string(token_path(home))
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|token| !token.is_empty())
}

/// Write the current pid to `<home>/server.pid`.
pub fn write_pid(home: &Path) -> Result<(), ConfigError> {
    let path = pid_path(home);
    std::fs::write(&path, std::process::id().to_string())
        .map_err(|source| ConfigError::Write { path, source })
}

/// Remove the pid file. Missing files are ignored.
pub fn remove_pid(home: &Path) {
    std::fs::remove_file(pid_path(home)).ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_persists_secret() {
        let dir = tempfile::tempdir().unwrap();
        let first = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(first.port, DEFAULT_PORT);
        assert_eq!(first.jwt_secret.len(), 64);

        // Second load reads the same secret back.
        let second = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(first.jwt_secret, second.jwt_secret);
    }

    #[test]
    fn test_config_json_field_names() {
        let config = Config::generate();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"jwtSecret\""));
        assert!(json.contains("\"port\""));
        assert!(json.contains("\"host\""));
    }

    #[test]
    fn test_token_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_token(dir.path()).is_none());
        save_token(dir.path(), "abc.def.ghi\n").unwrap();
        assert_eq!(load_token(dir.path()).as_deref(), Some("abc.def.ghi"));
    }
}

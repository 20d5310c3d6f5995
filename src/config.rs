//! Configuration management with XDG paths
//!
//! ~/.config/chatline/config.json   - backend URL, store override (0600)
//! ~/.local/state/chatline/store/   - sessions and conversations
//! ~/.local/state/chatline/*.log    - tracing output

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

const APP_NAME: &str = "chatline";

/// Backend used when nothing else is configured
pub const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Environment override for the backend URL
pub const API_URL_ENV: &str = "CHATLINE_API_URL";

/// Get config directory (~/.config/chatline/)
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
        .context("Could not determine config directory")?;
    Ok(base.join(APP_NAME))
}

/// Get state directory (~/.local/state/chatline/)
pub fn state_dir() -> Result<PathBuf> {
    let base = dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/state")))
        .context("Could not determine state directory")?;
    Ok(base.join(APP_NAME))
}

/// Get config file path
pub fn config_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("config.json"))
}

/// Ensure all directories exist
pub fn ensure_dirs() -> Result<()> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(state_dir()?)?;
    Ok(())
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Chat backend base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    /// Where the local store lives (defaults under the state dir)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_dir: Option<PathBuf>,
}

impl Config {
    /// Load config from disk, or return defaults
    pub fn load() -> Result<Self> {
        ensure_dirs()?;
        let path = config_path()?;

        if path.exists() {
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save config to disk, owner read/write only
    pub fn save(&self) -> Result<()> {
        ensure_dirs()?;
        let path = config_path()?;

        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, &content)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        let mut perms = fs::metadata(&path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(&path, perms)?;

        Ok(())
    }

    /// Resolved store directory
    pub fn store_dir(&self) -> Result<PathBuf> {
        match &self.store_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(state_dir()?.join("store")),
        }
    }

    /// Backend URL: CLI flag, then environment, then config file, then default
    pub fn api_url(&self, cli: Option<&str>) -> String {
        let env = std::env::var(API_URL_ENV).ok();
        pick_api_url(cli, env.as_deref(), self.api_url.as_deref())
    }
}

fn pick_api_url(cli: Option<&str>, env: Option<&str>, file: Option<&str>) -> String {
    [cli, env, file]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or(DEFAULT_API_URL)
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let cfg = Config::default();
        assert!(cfg.api_url.is_none());
        assert!(cfg.store_dir.is_none());
    }

    #[test]
    fn test_config_serialize() {
        let cfg = Config {
            api_url: Some("http://chat.internal:9000".to_string()),
            ..Default::default()
        };

        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("chat.internal"));
        assert!(!json.contains("store_dir"));
    }

    #[test]
    fn test_api_url_precedence() {
        assert_eq!(
            pick_api_url(Some("http://cli"), Some("http://env"), Some("http://file")),
            "http://cli"
        );
        assert_eq!(
            pick_api_url(None, Some("http://env"), Some("http://file")),
            "http://env"
        );
        assert_eq!(pick_api_url(None, Some("  "), Some("http://file/")), "http://file");
        assert_eq!(pick_api_url(None, None, None), DEFAULT_API_URL);
    }

    #[test]
    fn test_store_dir_override() {
        let cfg = Config {
            store_dir: Some(PathBuf::from("/tmp/chatline-store")),
            ..Default::default()
        };
        assert_eq!(cfg.store_dir().unwrap(), PathBuf::from("/tmp/chatline-store"));
    }
}

//! Settings file for the command line tool.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use skyshard_crypto::KdfParams;
use skyshard_storage::gdrive::AuthConfig;
use skyshard_transfer::TransferConfig;

const APP_DIR: &str = "skyshard";

/// Everything read from `config.json`. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SQLite database holding accounts, the file index and jobs.
    pub catalog_path: PathBuf,
    /// OAuth client registered for Drive access.
    pub auth: AuthConfig,
    /// Argon2 preset for newly sealed credentials.
    pub kdf_strength: String,
    pub transfer: TransferConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self {
            catalog_path: data.join("catalog.db"),
            auth: AuthConfig::default(),
            kdf_strength: "moderate".to_string(),
            transfer: TransferConfig::default(),
        }
    }
}

impl AppConfig {
    /// `<config dir>/skyshard/config.json`.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("No configuration directory on this platform")?;
        Ok(dir.join(APP_DIR).join("config.json"))
    }

    /// Read `path`, or the defaults if it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let config: Self = match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("Invalid configuration in {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.kdf_params()?;
        self.transfer
            .validate()
            .context("Invalid transfer settings")?;
        Ok(())
    }

    pub fn kdf_params(&self) -> Result<KdfParams> {
        KdfParams::from_strength(&self.kdf_strength).context("Invalid kdf_strength")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.json");

        let mut config = AppConfig::default();
        config.kdf_strength = "interactive".to_string();
        config.transfer.max_workers = 8;
        config.save(&path).unwrap();

        assert_eq!(AppConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{ "transfer": { "per_account_concurrency": 2 } }"#).unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.transfer.per_account_concurrency, 2);
        assert_eq!(config.transfer.max_workers, 4);
        assert_eq!(config.kdf_strength, "moderate");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        std::fs::write(&path, r#"{ "kdf_strength": "weak" }"#).unwrap();
        assert!(AppConfig::load(&path).is_err());

        std::fs::write(&path, r#"{ "transfer": { "upload": { "chunk_size": 1000 } } }"#).unwrap();
        assert!(AppConfig::load(&path).is_err());

        std::fs::write(&path, "not json").unwrap();
        assert!(AppConfig::load(&path).is_err());
    }
}

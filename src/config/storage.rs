//! Config file on disk
//!
//! `~/.dockbridge/config.json` (`%APPDATA%\Dockbridge` on Windows), next to
//! `hosts.json` with the host credentials.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::types::{EngineAccessConfig, CONFIG_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("Dockbridge"));
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".dockbridge"))
        .ok_or(StorageError::NoConfigDir)
}

pub fn config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// JSON array of host credentials, see `StaticCredentialResolver::load_default`
pub fn hosts_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("hosts.json"))
}

/// Bring a config written by an older release up to `CONFIG_VERSION`
///
/// Returns whether anything changed. Version 0 files predate the version
/// field being written and may carry a swapped relay port range.
pub fn migrate(config: &mut EngineAccessConfig) -> bool {
    if config.version >= CONFIG_VERSION {
        return false;
    }
    let from = config.version;

    if from < 1 && config.tunnel.relay_port_min > config.tunnel.relay_port_max {
        std::mem::swap(
            &mut config.tunnel.relay_port_min,
            &mut config.tunnel.relay_port_max,
        );
    }

    config.version = CONFIG_VERSION;
    info!("Migrated config from version {} to {}", from, CONFIG_VERSION);
    true
}

fn validate(config: &EngineAccessConfig) -> Result<(), StorageError> {
    if config.version > CONFIG_VERSION {
        return Err(StorageError::VersionTooNew {
            found: config.version,
            supported: CONFIG_VERSION,
        });
    }
    if config.tunnel.relay_port_min > config.tunnel.relay_port_max {
        return Err(StorageError::Invalid(format!(
            "relay port range {}..{} is empty",
            config.tunnel.relay_port_min, config.tunnel.relay_port_max
        )));
    }
    if config.tunnel.relay_port_min == 0 {
        return Err(StorageError::Invalid("relay port 0 is not usable".to_string()));
    }
    Ok(())
}

pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Storage at `~/.dockbridge/config.json`
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: config_file()?,
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Load the config
    ///
    /// Missing file: defaults. Unparseable file: backed up, defaults.
    /// Older version: migrated and written back (old file kept as a backup).
    pub async fn load(&self) -> Result<EngineAccessConfig, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {:?}, using defaults", self.path);
                return Ok(EngineAccessConfig::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut config = match serde_json::from_str::<EngineAccessConfig>(&contents) {
            Ok(config) => config,
            Err(e) => {
                warn!("Config file {:?} corrupted: {}", self.path, e);
                match self.backup().await {
                    Ok(backup) => warn!("Corrupted config saved as {:?}, using defaults", backup),
                    Err(backup_err) => error!("Failed to back up corrupted config: {}", backup_err),
                }
                return Ok(EngineAccessConfig::default());
            }
        };

        if config.version > CONFIG_VERSION {
            return Err(StorageError::VersionTooNew {
                found: config.version,
                supported: CONFIG_VERSION,
            });
        }

        if migrate(&mut config) {
            // 迁移失败不影响本次加载
            if let Err(e) = self.backup().await {
                warn!("Failed to back up pre-migration config: {}", e);
            } else if let Err(e) = self.save(&config).await {
                warn!("Failed to write migrated config: {}", e);
            }
        }

        validate(&config)?;
        Ok(config)
    }

    /// Atomic write: temp file, fsync, rename
    pub async fn save(&self, config: &EngineAccessConfig) -> Result<(), StorageError> {
        validate(config)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        debug!("Config saved to {:?}", self.path);
        Ok(())
    }

    /// Copy the current file to `config.json.backup.<stamp>`
    pub async fn backup(&self) -> Result<PathBuf, StorageError> {
        let backup_path = self.path.with_extension(format!(
            "json.backup.{}",
            chrono::Utc::now().format("%Y%m%d_%H%M%S")
        ));

        if self.exists().await {
            fs::copy(&self.path, &backup_path).await?;
        }

        Ok(backup_path)
    }
}

//! n8n backup config
//!

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::ArchiveFormat;

/// Environment variable overriding [`Config::backup_directory`].
pub const BACKUP_DIR_VAR: &str = "N8N_BACKUP_DIR";

/// The tool's config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The directory backups are written to and restored from.
    pub backup_directory: PathBuf,

    /// The directory log files are written to.
    pub log_directory: PathBuf,

    /// The number of backups to keep, older backups are pruned after each backup.
    pub retention_count: usize,

    /// The format new backups are written in.
    pub archive_format: ArchiveFormat,

    /// The name filter used to find n8n containers.
    pub container_pattern: String,

    /// The user n8n commands are executed as inside a container.
    pub docker_user: String,

    /// If the resolved encryption key is written into new backups.
    pub embed_encryption_key: bool,

    /// The user that owns imported workflows on n8n 2 and later.
    pub owner_user_id: Option<String>,

    /// If a container is restarted after a restore.
    pub restart_after_restore: bool,

    /// The n8n config file of a native instance, defaults to `~/.n8n/config`.
    pub n8n_config_path: Option<PathBuf>,

    /// The n8n config file inside a container.
    pub container_n8n_config_path: String,

    /// A standalone file holding only the encryption key.
    pub custom_key_file: PathBuf,

    /// The SQLite database of a native instance, defaults to `~/.n8n/database.sqlite`.
    pub database_path: Option<PathBuf>,

    /// The SQLite database inside a container.
    pub container_database_path: String,

    /// The image used to snapshot and restore docker volumes.
    pub volume_helper_image: String,
}

impl Config {
    /// Tries to load a config from a toml file.
    pub fn load_toml(file_path: &Path) -> Result<Self, LoadConfigError> {
        if !file_path.exists() {
            return Err(LoadConfigError::NoFile);
        }

        let contents = fs::read_to_string(file_path).map_err(LoadConfigError::Read)?;
        let config = toml::from_str(&contents)?;

        Ok(config)
    }

    /// Loads a config from a toml file, falling back to the defaults if there is no file.
    pub fn load_or_default(file_path: &Path) -> Result<Self, LoadConfigError> {
        match Self::load_toml(file_path) {
            Ok(config) => Ok(config),
            Err(LoadConfigError::NoFile) => Ok(Self::default()),
            Err(error) => Err(error),
        }
    }

    /// Apply overrides from the environment.
    pub fn apply_environment(&mut self) {
        if let Some(directory) = env::var_os(BACKUP_DIR_VAR) {
            if !directory.is_empty() {
                self.backup_directory = PathBuf::from(directory);
            }
        }
    }

    /// The native n8n config file.
    pub fn n8n_config_path(&self) -> Option<PathBuf> {
        self.n8n_config_path
            .clone()
            .or_else(|| home_directory().map(|home| home.join(".n8n").join("config")))
    }

    /// The native n8n SQLite database.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| home_directory().map(|home| home.join(".n8n").join("database.sqlite")))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_directory: PathBuf::from("backups"),
            log_directory: PathBuf::from("logs"),
            retention_count: 10,
            archive_format: ArchiveFormat::TarGz,
            container_pattern: "n8n".to_string(),
            docker_user: "node".to_string(),
            embed_encryption_key: true,
            owner_user_id: None,
            restart_after_restore: true,
            n8n_config_path: None,
            container_n8n_config_path: "/home/node/.n8n/config".to_string(),
            custom_key_file: PathBuf::from("config").join(".n8n_encryption_key"),
            database_path: None,
            container_database_path: "/home/node/.n8n/database.sqlite".to_string(),
            volume_helper_image: "alpine:3".to_string(),
        }
    }
}

fn home_directory() -> Option<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("The file does not exist.")]
    NoFile,

    #[error("Failed to read the file:\n{0}")]
    Read(#[source] std::io::Error),

    #[error("Failed to deserialize the file:\n{0}")]
    Deserialize(#[from] toml::de::Error),
}

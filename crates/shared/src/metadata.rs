use std::{fs, io, path::Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::InstanceKind;

/// Metadata describing a backup, stored as `backup_metadata.json` in the backup root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Where and when the backup was taken.
    pub backup_info: BackupInfo,

    /// What the backup contains.
    pub backup_contents: BackupContents,
}

/// Where and when a backup was taken.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    /// The timestamp embedded in the backup name, `%Y%m%d_%H%M%S`.
    pub timestamp: String,

    /// When the backup was created.
    pub created_at: DateTime<Utc>,

    /// The kind of instance the backup was taken from.
    pub instance_type: InstanceKind,

    /// The container the backup was taken from, if any.
    #[serde(default)]
    pub container_name: Option<String>,

    /// The n8n version reported by the instance.
    #[serde(default)]
    pub n8n_version: Option<String>,

    /// The version of the tool that wrote the backup.
    pub tool_version: String,

    /// The size of the backup contents in bytes, excluding this file.
    #[serde(default)]
    pub size_bytes: u64,
}

/// What a backup contains.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupContents {
    /// The number of exported workflow files.
    pub workflows_count: usize,

    /// If `credentials.json` was exported.
    pub credentials_file_exists: bool,

    /// If the encryption key was embedded in the backup.
    #[serde(default)]
    pub encryption_key_included: bool,

    /// Names of the docker volumes snapshotted into `volumes/`.
    #[serde(default)]
    pub volumes: Vec<String>,
}

impl BackupMetadata {
    /// The metadata file name inside a backup root.
    pub const FILE_NAME: &'static str = "backup_metadata.json";

    /// Tries to load the metadata from a backup root.
    pub fn load(backup_root: &Path) -> Result<Self, MetadataError> {
        let contents = fs::read(backup_root.join(Self::FILE_NAME))
            .map_err(|e| MetadataError::Io(e, "read metadata"))?;

        Self::from_slice(&contents)
    }

    /// Tries to parse the metadata from raw JSON.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, MetadataError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Writes the metadata into a backup root.
    pub fn save(&self, backup_root: &Path) -> Result<(), MetadataError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(backup_root.join(Self::FILE_NAME), contents)
            .map_err(|e| MetadataError::Io(e, "write metadata"))?;

        Ok(())
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Failed to (de)serialize metadata: {0}")]
    Json(#[from] serde_json::Error),
}

//! The backups stored in the backup directory.
//!

use std::{
    fs::{self, File},
    io::{self, BufReader, ErrorKind, Read},
    path::{Component, Path, PathBuf},
};

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::read::GzDecoder;
use shared::{BackupMetadata, InstanceKind, MetadataError};
use thiserror::Error;
use tracing::{info, warn};
use zip::ZipArchive;

use crate::archive::{self, ArchiveFormat};

/// The format of the timestamp in a backup name.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

const NAME_MARKER: &str = "_backup_";

/// A backup in the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupSummary {
    /// The file or directory name.
    pub name: String,

    /// The full path.
    pub path: PathBuf,

    /// How the backup is stored.
    pub format: ArchiveFormat,

    /// The size on disk in bytes.
    pub size_bytes: u64,

    /// When the backup was last modified.
    pub modified: Option<DateTime<Utc>>,

    /// The timestamp in the backup name.
    pub timestamp: Option<NaiveDateTime>,

    /// The instance kind, guessed from the name.
    pub instance_type: Option<InstanceKind>,

    /// The metadata, when it could be read.
    pub metadata: Option<BackupMetadata>,
}

impl BackupSummary {
    /// If the backup is an archive rather than a directory.
    pub fn is_compressed(&self) -> bool {
        self.format != ArchiveFormat::Directory
    }

    /// The number of workflows, if known.
    pub fn workflows(&self) -> Option<usize> {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.backup_contents.workflows_count)
    }

    /// If the backup holds credentials, if known.
    pub fn has_credentials(&self) -> Option<bool> {
        self.metadata
            .as_ref()
            .map(|metadata| metadata.backup_contents.credentials_file_exists)
    }

    /// The ordering key, the name timestamp or else the modification time.
    fn sort_key(&self) -> Option<NaiveDateTime> {
        self.timestamp
            .or_else(|| self.modified.map(|modified| modified.naive_utc()))
    }
}

/// Storage used by the catalog.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageUsage {
    /// The backup directory.
    pub directory: PathBuf,

    /// The number of backups.
    pub backups: usize,

    /// The total size in bytes.
    pub total_bytes: u64,
}

/// The backups in a directory.
#[derive(Clone, Debug)]
pub struct Catalog {
    directory: PathBuf,
}

impl Catalog {
    /// Create a catalog over a directory.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    /// The backup directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The name for a new backup taken at `now`.
    pub fn new_backup_name(kind: InstanceKind, now: DateTime<Utc>) -> String {
        format!("{kind}{NAME_MARKER}{}", now.format(TIMESTAMP_FORMAT))
    }

    /// Every backup, newest first.
    pub fn list(&self) -> Result<Vec<BackupSummary>, CatalogError> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(CatalogError::Io(error, "read backup directory")),
        };

        let mut backups: Vec<BackupSummary> = entries
            .filter_map(|entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(error) => {
                        warn!("Could not read entry: {error}");
                        return None;
                    }
                };

                summarize(&entry.path())
            })
            .collect();

        // Newest first.
        backups.sort_by(|a, b| b.sort_key().cmp(&a.sort_key()).then_with(|| b.name.cmp(&a.name)));

        Ok(backups)
    }

    /// Find a backup by name.
    ///
    /// The exact name is tried first, so directory backups and full file names
    /// match directly, then the name with `.tar.gz` and then `.zip` appended.
    pub fn find(&self, name: &str) -> Result<PathBuf, CatalogError> {
        let candidates = [
            self.directory.join(name),
            self.directory.join(format!("{name}.tar.gz")),
            self.directory.join(format!("{name}.zip")),
        ];

        candidates
            .into_iter()
            .find(|path| path.exists())
            .ok_or_else(|| CatalogError::NotFound(name.to_string()))
    }

    /// A backup with its metadata.
    pub fn details(&self, name: &str) -> Result<BackupSummary, CatalogError> {
        let path = self.find(name)?;
        summarize(&path).ok_or(CatalogError::NotABackup(path))
    }

    /// Delete a backup.
    pub fn delete(&self, name: &str) -> Result<PathBuf, CatalogError> {
        let path = self.find(name)?;

        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(|e| CatalogError::Io(e, "delete backup"))?;
        } else {
            fs::remove_file(&path).map_err(|e| CatalogError::Io(e, "delete backup"))?;
        }

        info!("Deleted backup {path:?}");
        Ok(path)
    }

    /// The storage used by every backup.
    pub fn usage(&self) -> Result<StorageUsage, CatalogError> {
        let backups = self.list()?;

        Ok(StorageUsage {
            directory: self.directory.clone(),
            backups: backups.len(),
            total_bytes: backups.iter().map(|backup| backup.size_bytes).sum(),
        })
    }

    /// Remove all but the `keep` newest backups, returning the removed paths.
    ///
    /// Only entries named like `{instance}_backup_{timestamp}` take part, ordered
    /// by the name timestamp. Anything else in the directory is left alone.
    pub fn prune(&self, keep: usize) -> Result<Vec<PathBuf>, CatalogError> {
        let mut backups: Vec<(NaiveDateTime, BackupSummary)> = self
            .list()?
            .into_iter()
            .filter_map(|backup| {
                let (_, timestamp) = parse_backup_name(&backup.name)?;
                Some((timestamp, backup))
            })
            .collect();

        // Newest first.
        backups.sort_by(|(a_time, a), (b_time, b)| {
            b_time.cmp(a_time).then_with(|| b.name.cmp(&a.name))
        });

        let mut removed = Vec::new();
        for (_, backup) in backups.into_iter().skip(keep) {
            let result = if backup.path.is_dir() {
                fs::remove_dir_all(&backup.path)
            } else {
                fs::remove_file(&backup.path)
            };

            match result {
                Ok(()) => {
                    info!("Pruned backup {}", backup.name);
                    removed.push(backup.path);
                }
                Err(error) => warn!("Could not remove backup {:?}: {error}", backup.path),
            }
        }

        Ok(removed)
    }
}

/// The timestamp in a backup name such as `docker_backup_20240101_120000.tar.gz`.
pub fn backup_timestamp(name: &str) -> Option<NaiveDateTime> {
    let (_, rest) = name.rsplit_once(NAME_MARKER)?;
    let timestamp = rest.get(..15)?;

    NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()
}

/// The instance kind and timestamp of a name this tool gives its backups.
///
/// Accepts `docker_backup_20240101_120000` with an optional `.tar.gz` or `.zip`
/// extension and nothing else.
pub fn parse_backup_name(name: &str) -> Option<(InstanceKind, NaiveDateTime)> {
    let (kind, rest) = name.split_once(NAME_MARKER)?;
    let kind = kind.parse::<InstanceKind>().ok()?;

    let timestamp = rest.get(..15)?;
    let extension = rest.get(15..)?;
    if !["", ArchiveFormat::TarGz.extension(), ArchiveFormat::Zip.extension()].contains(&extension)
    {
        return None;
    }

    let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
    Some((kind, timestamp))
}

fn summarize(path: &Path) -> Option<BackupSummary> {
    let name = path.file_name()?.to_str()?.to_string();
    let format = ArchiveFormat::detect(path)?;

    if format == ArchiveFormat::Directory && !name.contains("backup") {
        return None;
    }

    let modified = fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .map(DateTime::<Utc>::from);

    let metadata = match read_metadata(path, format) {
        Ok(metadata) => metadata,
        Err(error) => {
            warn!("Could not read metadata of {name}: {error}");
            None
        }
    };

    Some(BackupSummary {
        timestamp: backup_timestamp(&name),
        instance_type: InstanceKind::from_backup_name(&name),
        size_bytes: archive::size_on_disk(path),
        path: path.to_path_buf(),
        format,
        modified,
        metadata,
        name,
    })
}

/// Read `backup_metadata.json` without unpacking the backup.
pub fn read_metadata(
    path: &Path,
    format: ArchiveFormat,
) -> Result<Option<BackupMetadata>, CatalogError> {
    let contents = match format {
        ArchiveFormat::Directory => match archive::locate_backup_root(path) {
            Ok(root) => read_file(&root.join(BackupMetadata::FILE_NAME))?,
            Err(_) => read_file(&path.join(BackupMetadata::FILE_NAME))?,
        },
        ArchiveFormat::TarGz => read_tar_metadata(path)?,
        ArchiveFormat::Zip => read_zip_metadata(path)?,
    };

    match contents {
        Some(contents) => Ok(Some(BackupMetadata::from_slice(&contents)?)),
        None => Ok(None),
    }
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, CatalogError> {
    match fs::read(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(CatalogError::Io(error, "read metadata")),
    }
}

/// If an archive entry is the metadata file at the top level or one level down.
fn is_metadata_entry(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name == BackupMetadata::FILE_NAME)
        && path
            .components()
            .filter(|component| matches!(component, Component::Normal(_)))
            .count()
            <= 2
}

fn read_tar_metadata(path: &Path) -> Result<Option<Vec<u8>>, CatalogError> {
    let file = File::open(path).map_err(|e| CatalogError::Io(e, "open archive"))?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let entries = archive
        .entries()
        .map_err(|e| CatalogError::Io(e, "read archive"))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CatalogError::Io(e, "read archive entry"))?;
        let entry_path = entry
            .path()
            .map_err(|e| CatalogError::Io(e, "read archive entry path"))?
            .into_owned();

        if is_metadata_entry(&entry_path) {
            let mut contents = Vec::new();
            entry
                .read_to_end(&mut contents)
                .map_err(|e| CatalogError::Io(e, "read metadata"))?;
            return Ok(Some(contents));
        }
    }

    Ok(None)
}

fn read_zip_metadata(path: &Path) -> Result<Option<Vec<u8>>, CatalogError> {
    let file = File::open(path).map_err(|e| CatalogError::Io(e, "open archive"))?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;

    let Some(name) = archive
        .file_names()
        .find(|name| is_metadata_entry(Path::new(name)))
        .map(str::to_string)
    else {
        return Ok(None);
    };

    let mut entry = archive.by_name(&name)?;
    let mut contents = Vec::new();
    entry
        .read_to_end(&mut contents)
        .map_err(|e| CatalogError::Io(e, "read metadata"))?;

    Ok(Some(contents))
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Backup '{0}' was not found")]
    NotFound(String),

    #[error("{0:?} is not a backup")]
    NotABackup(PathBuf),

    #[error("Invalid metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

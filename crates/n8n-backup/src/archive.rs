//! Packing and unpacking backups.
//!

use core::{fmt, str::FromStr};
use std::{
    fs::{self, File},
    io::{self, BufReader, BufWriter},
    path::{Path, PathBuf},
};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;
use zip::{CompressionMethod, ZipArchive, ZipWriter, write::SimpleFileOptions};

/// The directory every valid backup root contains.
pub const WORKFLOWS_DIR: &str = "workflows";

/// The credentials export inside a backup root.
pub const CREDENTIALS_FILE: &str = "credentials.json";

/// How a backup is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    /// A gzipped tarball, `.tar.gz`.
    TarGz,

    /// A zip file, `.zip`.
    Zip,

    /// A plain directory.
    Directory,
}

impl ArchiveFormat {
    /// The file extension including the leading dot, empty for directories.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::TarGz => ".tar.gz",
            Self::Zip => ".zip",
            Self::Directory => "",
        }
    }

    /// Detect the format of an existing backup.
    pub fn detect(path: &Path) -> Option<Self> {
        if path.is_dir() {
            return Some(Self::Directory);
        }

        let name = path.file_name()?.to_str()?.to_lowercase();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TarGz => "tar-gz",
            Self::Zip => "zip",
            Self::Directory => "directory",
        };

        f.write_str(name)
    }
}

impl FromStr for ArchiveFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tar-gz" | "tar.gz" | "tgz" => Ok(Self::TarGz),
            "zip" => Ok(Self::Zip),
            "directory" | "dir" => Ok(Self::Directory),
            _ => Err(format!(
                "invalid archive format '{s}', expected 'tar-gz', 'zip' or 'directory'"
            )),
        }
    }
}

/// Pack a backup directory next to itself, returning the archive path.
///
/// The directory becomes the single top-level entry of the archive. For
/// [`ArchiveFormat::Directory`] the directory itself is returned.
pub fn create(source: &Path, format: ArchiveFormat) -> Result<PathBuf, ArchiveError> {
    if !source.is_dir() {
        return Err(ArchiveError::NotDirectory(source.to_path_buf()));
    }

    let name = source
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ArchiveError::InvalidName(source.to_path_buf()))?
        .to_string();

    let destination = source.with_file_name(format!("{name}{}", format.extension()));

    match format {
        ArchiveFormat::Directory => return Ok(source.to_path_buf()),
        ArchiveFormat::TarGz => create_tar_gz(source, &name, &destination)?,
        ArchiveFormat::Zip => create_zip(source, &name, &destination)?,
    }

    Ok(destination)
}

fn create_tar_gz(source: &Path, name: &str, destination: &Path) -> Result<(), ArchiveError> {
    let file = File::create(destination).map_err(|e| ArchiveError::Io(e, "create archive"))?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());

    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(name, source)
        .map_err(|e| ArchiveError::Io(e, "append to archive"))?;

    let writer = builder
        .into_inner()
        .and_then(GzEncoder::finish)
        .map_err(|e| ArchiveError::Io(e, "finish archive"))?;

    finish_file(writer)
}

fn create_zip(source: &Path, name: &str, destination: &Path) -> Result<(), ArchiveError> {
    let file = File::create(destination).map_err(|e| ArchiveError::Io(e, "create archive"))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| ArchiveError::InvalidName(entry.path().to_path_buf()))?;

        // Zip entries always use forward slashes.
        let mut entry_name = name.to_string();
        for component in relative.components() {
            let component = component
                .as_os_str()
                .to_str()
                .ok_or_else(|| ArchiveError::InvalidName(entry.path().to_path_buf()))?;
            entry_name.push('/');
            entry_name.push_str(component);
        }

        if entry.file_type().is_dir() {
            zip.add_directory(entry_name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(entry_name, options)?;
            let mut reader = File::open(entry.path()).map_err(|e| ArchiveError::Io(e, "open file"))?;
            io::copy(&mut reader, &mut zip).map_err(|e| ArchiveError::Io(e, "write zip entry"))?;
        }
    }

    let writer = zip.finish()?;

    finish_file(writer)
}

/// Flush the buffered tail of an archive and sync it to disk.
fn finish_file(writer: BufWriter<File>) -> Result<(), ArchiveError> {
    let file = writer
        .into_inner()
        .map_err(|e| ArchiveError::Io(e.into_error(), "finish archive"))?;

    file.sync_all()
        .map_err(|e| ArchiveError::Io(e, "sync archive"))
}

/// Unpack a backup into `destination`, returning the backup root.
///
/// Directory backups are used in place and `destination` is left untouched.
pub fn extract(backup: &Path, destination: &Path) -> Result<PathBuf, ArchiveError> {
    let format =
        ArchiveFormat::detect(backup).ok_or_else(|| ArchiveError::UnknownFormat(backup.to_path_buf()))?;

    match format {
        ArchiveFormat::Directory => return locate_backup_root(backup),
        ArchiveFormat::TarGz => {
            let file = File::open(backup).map_err(|e| ArchiveError::Io(e, "open archive"))?;
            let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
            archive
                .unpack(destination)
                .map_err(|e| ArchiveError::Io(e, "unpack archive"))?;
        }
        ArchiveFormat::Zip => {
            let file = File::open(backup).map_err(|e| ArchiveError::Io(e, "open archive"))?;
            let mut archive = ZipArchive::new(BufReader::new(file))?;
            archive.extract(destination)?;
        }
    }

    locate_backup_root(destination)
}

/// Find the directory holding `workflows/`, either `directory` itself or one of its children.
pub fn locate_backup_root(directory: &Path) -> Result<PathBuf, ArchiveError> {
    if directory.join(WORKFLOWS_DIR).is_dir() {
        return Ok(directory.to_path_buf());
    }

    let entries = fs::read_dir(directory).map_err(|e| ArchiveError::Io(e, "read directory"))?;
    for entry in entries {
        let path = entry.map_err(|e| ArchiveError::Io(e, "read entry"))?.path();
        if path.is_dir() && path.join(WORKFLOWS_DIR).is_dir() {
            return Ok(path);
        }
    }

    Err(ArchiveError::MissingWorkflows(directory.to_path_buf()))
}

/// Count the workflow files in a backup root.
pub fn count_workflows(backup_root: &Path) -> Result<usize, ArchiveError> {
    let directory = backup_root.join(WORKFLOWS_DIR);
    if !directory.is_dir() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in fs::read_dir(directory).map_err(|e| ArchiveError::Io(e, "read workflows"))? {
        let path = entry.map_err(|e| ArchiveError::Io(e, "read entry"))?.path();
        if path.is_file() && path.extension().is_some_and(|extension| extension == "json") {
            count += 1;
        }
    }

    Ok(count)
}

/// The total size of every file under `path`.
pub fn size_on_disk(path: &Path) -> u64 {
    if path.is_file() {
        return fs::metadata(path).map(|metadata| metadata.len()).unwrap_or(0);
    }

    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("{0:?} is not a directory")]
    NotDirectory(PathBuf),

    #[error("{0:?} has an invalid name")]
    InvalidName(PathBuf),

    #[error("{0:?} is not a .tar.gz, .zip or directory backup")]
    UnknownFormat(PathBuf),

    #[error("No workflows/ directory found in {0:?}, this is not a valid backup")]
    MissingWorkflows(PathBuf),

    #[error("Failed to walk directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

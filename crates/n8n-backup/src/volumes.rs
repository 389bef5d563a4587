//! Snapshots of the docker volumes mounted into an n8n container.
//!

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    context::Context,
    instance::{InstanceError, checked, path_str},
    runner::{CommandRunner, CommandSpec},
};

/// The directory inside a backup root holding volume snapshots.
pub const VOLUMES_DIR: &str = "volumes";

const SNAPSHOT_EXTENSION: &str = ".tar.gz";

#[derive(Debug, Deserialize)]
struct Mount {
    #[serde(rename = "Type", default)]
    kind: String,

    #[serde(rename = "Name", default)]
    name: Option<String>,
}

/// The named volumes mounted into a container.
pub fn named_volumes(
    runner: &dyn CommandRunner,
    container: &str,
) -> Result<Vec<String>, VolumeError> {
    let command = CommandSpec::new(
        "docker",
        ["inspect", "--format", "{{json .Mounts}}", container],
    );
    let output = checked(runner, &command)?;

    let mounts: Vec<Mount> = serde_json::from_str(output.stdout.trim())?;

    Ok(mounts
        .into_iter()
        .filter(|mount| mount.kind == "volume")
        .filter_map(|mount| mount.name)
        .collect())
}

/// Snapshot every named volume of `container` into `backup_root/volumes/`.
///
/// A volume that fails to snapshot is skipped with a warning. Returns the
/// names of the volumes that were written.
pub fn snapshot(
    runner: &dyn CommandRunner,
    container: &str,
    helper_image: &str,
    backup_root: &Path,
    context: &mut Context,
) -> Result<Vec<String>, VolumeError> {
    context.current_context = "Volumes";

    let volumes = named_volumes(runner, container)?;
    if volumes.is_empty() {
        info!("{context}No named volumes are mounted into {container}");
        return Ok(Vec::new());
    }

    let directory = absolute_directory(&backup_root.join(VOLUMES_DIR))?;
    let backup_mount = format!("{}:/backup", path_str(&directory)?);

    let mut snapshotted = Vec::new();
    for volume in volumes {
        info!("{context}Snapshotting volume {volume}");

        let volume_mount = format!("{volume}:/volume:ro");
        let archive = format!("/backup/{volume}{SNAPSHOT_EXTENSION}");
        let command = CommandSpec::new(
            "docker",
            [
                "run",
                "--rm",
                "-v",
                volume_mount.as_str(),
                "-v",
                backup_mount.as_str(),
                helper_image,
                "tar",
                "czf",
                archive.as_str(),
                "-C",
                "/volume",
                ".",
            ],
        );

        match checked(runner, &command) {
            Ok(_) => snapshotted.push(volume),
            Err(error) => warn!("{context}Could not snapshot volume {volume}: {error}"),
        }
    }

    Ok(snapshotted)
}

/// The volume snapshots in a backup root.
pub fn snapshots(backup_root: &Path) -> Result<Vec<String>, VolumeError> {
    let directory = backup_root.join(VOLUMES_DIR);
    if !directory.is_dir() {
        return Ok(Vec::new());
    }

    let mut volumes = Vec::new();
    for entry in fs::read_dir(directory).map_err(|e| VolumeError::Io(e, "read volumes"))? {
        let path = entry.map_err(|e| VolumeError::Io(e, "read entry"))?.path();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(SNAPSHOT_EXTENSION));

        if let Some(name) = name {
            volumes.push(name.to_string());
        }
    }
    volumes.sort();

    Ok(volumes)
}

/// Replace the contents of each snapshotted volume with its snapshot.
///
/// The container using the volumes must be stopped first.
pub fn restore(
    runner: &dyn CommandRunner,
    helper_image: &str,
    backup_root: &Path,
    context: &mut Context,
) -> Result<Vec<String>, VolumeError> {
    context.current_context = "Volumes";

    let volumes = snapshots(backup_root)?;
    if volumes.is_empty() {
        info!("{context}The backup has no volume snapshots");
        return Ok(volumes);
    }

    let directory = absolute_directory(&backup_root.join(VOLUMES_DIR))?;
    let backup_mount = format!("{}:/backup:ro", path_str(&directory)?);

    for volume in &volumes {
        info!("{context}Restoring volume {volume}");

        let volume_mount = format!("{volume}:/volume");
        let script = format!(
            "find /volume -mindepth 1 -delete && tar xzf /backup/{volume}{SNAPSHOT_EXTENSION} -C /volume"
        );
        let command = CommandSpec::new(
            "docker",
            [
                "run",
                "--rm",
                "-v",
                volume_mount.as_str(),
                "-v",
                backup_mount.as_str(),
                helper_image,
                "sh",
                "-c",
                script.as_str(),
            ],
        );

        checked(runner, &command)?;
    }

    Ok(volumes)
}

fn absolute_directory(directory: &Path) -> Result<PathBuf, VolumeError> {
    fs::create_dir_all(directory).map_err(|e| VolumeError::Io(e, "create volumes directory"))?;
    fs::canonicalize(directory).map_err(|e| VolumeError::Io(e, "resolve volumes directory"))
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Failed to parse container mounts: {0}")]
    Mounts(#[from] serde_json::Error),

    #[error(transparent)]
    Instance(#[from] InstanceError),
}

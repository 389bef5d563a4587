//! Taking a backup.
//!

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use shared::{BackupContents, BackupInfo, BackupMetadata, InstanceKind, MetadataError};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    archive::{self, ArchiveError, ArchiveFormat},
    catalog::{Catalog, TIMESTAMP_FORMAT},
    config::Config,
    context::Context,
    export::{self, ExportError},
    instance::Instance,
    key::{self, EncryptionKey, KeyError, KeyResolver, KeySource, ResolvedKey},
    locator::{self, LocateError},
    runner::CommandRunner,
    version,
    volumes::{self, VolumeError},
};

/// What to back up and how.
#[derive(Clone, Debug)]
pub struct BackupOptions {
    /// The kind of instance to back up.
    pub kind: InstanceKind,

    /// The container to back up, otherwise the only running match is used.
    pub container: Option<String>,

    /// The archive format, otherwise the configured format.
    pub format: Option<ArchiveFormat>,

    /// If docker volumes are snapshotted into the backup.
    pub include_volumes: bool,

    /// The key from the environment, if any.
    pub environment_key: Option<EncryptionKey>,
}

/// The result of a backup.
#[derive(Clone, Debug)]
pub struct BackupReport {
    /// The backup name.
    pub name: String,

    /// The archive or directory that was written.
    pub path: PathBuf,

    /// The instance that was backed up.
    pub instance: Instance,

    /// The metadata written into the backup.
    pub metadata: BackupMetadata,

    /// Where the encryption key came from, if one was found.
    pub key_source: Option<KeySource>,

    /// Older backups removed by retention.
    pub pruned: Vec<PathBuf>,
}

/// Back up an instance into the backup directory.
pub fn run_backup(
    runner: &dyn CommandRunner,
    config: &Config,
    options: &BackupOptions,
    now: DateTime<Utc>,
) -> Result<BackupReport, BackupError> {
    let instance =
        locator::resolve_instance(runner, options.kind, options.container.as_deref(), config)?;

    let mut context = Context::new(instance.to_string());
    context.current_context = "Backup";
    info!("{context}Starting backup");

    let version = version::detect(runner, &instance, &context);
    let resolved = resolve_key(runner, &instance, config, options, &context);
    match &resolved {
        Some(resolved) => info!(
            "{context}Using encryption key {} from {}",
            resolved.key, resolved.source
        ),
        None => warn!(
            "{context}No encryption key found, credentials can only be restored into an instance with the same key"
        ),
    }

    let name = Catalog::new_backup_name(instance.kind(), now);
    fs::create_dir_all(&config.backup_directory)
        .map_err(|e| BackupError::Io(e, "create backup directory"))?;

    let staging = config.backup_directory.join(&name);
    if staging.exists() {
        return Err(BackupError::AlreadyExists(staging));
    }

    let format = options.format.unwrap_or(config.archive_format);
    let step = Step {
        runner,
        config,
        options,
        instance: &instance,
        key: resolved.as_ref(),
        n8n_version: version.map(|version| version.to_string()),
        now,
    };

    let (path, metadata) = match step.write(&staging, format, &mut context) {
        Ok(result) => result,
        Err(error) => {
            remove_partial(&staging, format);
            return Err(error);
        }
    };

    context.current_context = "Cleanup";
    let pruned = if config.retention_count == 0 {
        Vec::new()
    } else {
        match Catalog::new(&config.backup_directory).prune(config.retention_count) {
            Ok(pruned) => pruned,
            Err(error) => {
                warn!("{context}Could not prune old backups: {error}");
                Vec::new()
            }
        }
    };

    info!("{context}Backup written to {path:?}");

    Ok(BackupReport {
        name,
        path,
        instance,
        metadata,
        key_source: resolved.map(|resolved| resolved.source),
        pruned,
    })
}

fn resolve_key(
    runner: &dyn CommandRunner,
    instance: &Instance,
    config: &Config,
    options: &BackupOptions,
    context: &Context,
) -> Option<ResolvedKey> {
    let custom = key::read_key_file(&config.custom_key_file).unwrap_or_else(|error| {
        warn!("{context}Could not read {:?}: {error}", config.custom_key_file);
        None
    });

    KeyResolver::new()
        .with(
            KeySource::ConfigFile,
            key::read_instance_config(runner, instance, config),
        )
        .with(KeySource::CustomFile, custom)
        .with(KeySource::Environment, options.environment_key.clone())
        .resolve(context)
}

/// Everything needed to write the backup once the instance is known.
struct Step<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a Config,
    options: &'a BackupOptions,
    instance: &'a Instance,
    key: Option<&'a ResolvedKey>,
    n8n_version: Option<String>,
    now: DateTime<Utc>,
}

impl Step<'_> {
    fn write(
        &self,
        staging: &Path,
        format: ArchiveFormat,
        context: &mut Context,
    ) -> Result<(PathBuf, BackupMetadata), BackupError> {
        let key = self.key.map(|resolved| &resolved.key);
        let summary = export::export(self.runner, self.instance, staging, key, context)?;

        context.current_context = "Backup";
        let encryption_key_included = match key {
            Some(key) if self.config.embed_encryption_key => {
                key::write_embedded(staging, key)?;
                info!("{context}Embedded the encryption key");
                true
            }
            _ => false,
        };

        let volumes = match (self.options.include_volumes, self.instance.container()) {
            (true, Some(container)) => volumes::snapshot(
                self.runner,
                container,
                &self.config.volume_helper_image,
                staging,
                context,
            )?,
            (true, None) => {
                warn!("{context}Volumes can only be included for docker instances");
                Vec::new()
            }
            (false, _) => Vec::new(),
        };

        context.current_context = "Archive";
        let metadata = BackupMetadata {
            backup_info: BackupInfo {
                timestamp: self.now.format(TIMESTAMP_FORMAT).to_string(),
                created_at: self.now,
                instance_type: self.instance.kind(),
                container_name: self.instance.container().map(str::to_string),
                n8n_version: self.n8n_version.clone(),
                tool_version: env!("CARGO_PKG_VERSION").to_string(),
                size_bytes: archive::size_on_disk(staging),
            },
            backup_contents: BackupContents {
                workflows_count: summary.workflows,
                credentials_file_exists: summary.credentials,
                encryption_key_included,
                volumes,
            },
        };
        metadata.save(staging)?;

        let path = archive::create(staging, format)?;
        if format != ArchiveFormat::Directory {
            fs::remove_dir_all(staging).map_err(|e| BackupError::Io(e, "remove staging directory"))?;
        }
        info!("{context}Packed backup as {format}");

        Ok((path, metadata))
    }
}

/// Remove whatever a failed backup left behind.
fn remove_partial(staging: &Path, format: ArchiveFormat) {
    if staging.exists() {
        if let Err(error) = fs::remove_dir_all(staging) {
            warn!("Could not remove {staging:?}: {error}");
        }
    }

    if format != ArchiveFormat::Directory {
        let mut archive = staging.as_os_str().to_owned();
        archive.push(format.extension());
        let archive = PathBuf::from(archive);

        if archive.exists() {
            if let Err(error) = fs::remove_file(&archive) {
                warn!("Could not remove {archive:?}: {error}");
            }
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Backup {0:?} already exists")]
    AlreadyExists(PathBuf),

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),

    #[error("Failed to embed the encryption key: {0}")]
    Key(#[from] KeyError),

    #[error("Failed to snapshot volumes: {0}")]
    Volume(#[from] VolumeError),

    #[error("Failed to write metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Failed to archive the backup: {0}")]
    Archive(#[from] ArchiveError),
}

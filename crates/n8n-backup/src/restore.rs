//! Restoring a backup into an instance.
//!

use std::{io, path::Path};

use shared::InstanceKind;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::{
    archive::{self, ArchiveError, CREDENTIALS_FILE, WORKFLOWS_DIR},
    catalog::{Catalog, CatalogError},
    config::Config,
    context::Context,
    instance::{CONTAINER_RESTORE_DIR, Instance, InstanceError},
    key::{self, EncryptionKey, KeyError, KeyResolver, KeySource, ResolvedKey},
    locator::{self, LocateError},
    runner::{CommandOutput, CommandRunner, RunError},
    version::{self, ImportStrategy, N8nVersion},
    volumes::{self, VolumeError},
};

/// What to restore and where.
#[derive(Clone, Debug)]
pub struct RestoreOptions {
    /// The kind of instance to restore into.
    pub kind: InstanceKind,

    /// The backup name, with or without its extension.
    pub backup: String,

    /// The container to restore into, otherwise the only running match is used.
    pub container: Option<String>,

    /// If docker volume snapshots in the backup are restored.
    pub restore_volumes: bool,

    /// If a container is restarted afterwards.
    pub restart: bool,

    /// The key from the environment, if any.
    pub environment_key: Option<EncryptionKey>,
}

/// What the n8n CLI reported while importing workflows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ImportOutcome {
    /// The count from `Successfully imported N workflows`, if reported.
    pub imported: Option<usize>,

    /// The number of `Could not find workflow` lines.
    pub missing: usize,

    /// If the output complained about the owner or user.
    pub owner_problem: bool,
}

impl ImportOutcome {
    /// Scan the output of `import:workflow`.
    pub fn parse(output: &str) -> Self {
        let mut outcome = Self::default();

        for line in output.lines() {
            let lower = line.to_lowercase();

            if let Some(index) = lower.find("successfully imported") {
                let rest = lower.get(index + "successfully imported".len()..).unwrap_or_default();
                let count = rest
                    .split_whitespace()
                    .next()
                    .and_then(|count| count.parse().ok());
                outcome.imported = Some(count.unwrap_or(0));
            }

            if lower.contains("could not find workflow") {
                outcome.missing += 1;
            }

            if (lower.contains("owner") || lower.contains("user"))
                && (lower.contains("error") || lower.contains("not found") || lower.contains("failed"))
            {
                outcome.owner_problem = true;
            }
        }

        outcome
    }
}

/// The result of a restore.
#[derive(Clone, Debug)]
pub struct RestoreReport {
    /// The instance that was restored into.
    pub instance: Instance,

    /// The detected n8n version.
    pub version: Option<N8nVersion>,

    /// Where the encryption key came from, if one was found.
    pub key_source: Option<KeySource>,

    /// How workflows were imported.
    pub strategy: ImportStrategy,

    /// If credentials were imported.
    pub credentials_imported: bool,

    /// What the workflow import reported.
    pub workflows: ImportOutcome,

    /// Volumes restored from snapshots.
    pub volumes: Vec<String>,

    /// If the container was restarted.
    pub restarted: bool,
}

/// Restore a backup from the catalog into an instance.
///
/// The backup is validated before the instance is touched, a backup without a
/// `workflows/` directory never reaches the n8n CLI.
pub fn run_restore(
    runner: &dyn CommandRunner,
    config: &Config,
    options: &RestoreOptions,
) -> Result<RestoreReport, RestoreError> {
    let backup = Catalog::new(&config.backup_directory).find(&options.backup)?;
    info!("Restoring {backup:?}");

    let staging = tempfile::Builder::new()
        .prefix("n8n_restore_")
        .tempdir()
        .map_err(|e| RestoreError::Io(e, "create staging directory"))?;
    let backup_root = archive::extract(&backup, staging.path())?;

    let instance =
        locator::resolve_instance(runner, options.kind, options.container.as_deref(), config)?;
    let mut context = Context::new(instance.to_string());
    context.current_context = "Restore";

    let embedded = key::read_embedded(&backup_root)?;
    let custom = key::read_key_file(&config.custom_key_file).unwrap_or_else(|error| {
        warn!("{context}Could not read {:?}: {error}", config.custom_key_file);
        None
    });
    let resolved = KeyResolver::new()
        .with(KeySource::Backup, embedded)
        .with(
            KeySource::ConfigFile,
            key::read_instance_config(runner, &instance, config),
        )
        .with(KeySource::CustomFile, custom)
        .with(KeySource::Environment, options.environment_key.clone())
        .resolve(&context);
    if resolved.is_none() {
        warn!("{context}No encryption key found, credentials may fail to decrypt");
    }

    let version = version::detect(runner, &instance, &context);
    let database = match &instance {
        Instance::Native => config
            .database_path()
            .and_then(|path| path.to_str().map(str::to_string)),
        Instance::Docker { .. } => Some(config.container_database_path.clone()),
    };
    let strategy = version::strategy_for(
        version.as_ref(),
        config.owner_user_id.as_deref(),
        || {
            database
                .as_deref()
                .and_then(|database| version::discover_owner_id(runner, &instance, database))
        },
        &context,
    );

    let work_directory = instance.work_directory(&backup_root, CONTAINER_RESTORE_DIR)?;
    let result = import(
        runner,
        &instance,
        &backup_root,
        &work_directory,
        resolved.as_ref(),
        &strategy,
        &mut context,
    );
    instance.remove_directory(runner, &work_directory);
    let (credentials_imported, workflows) = result?;

    let mut volumes = Vec::new();
    let mut restarted = false;
    if options.restore_volumes {
        if instance.container().is_some() {
            instance.stop(runner)?;
            let restored = volumes::restore(
                runner,
                &config.volume_helper_image,
                &backup_root,
                &mut context,
            );
            // The container is started again even if a volume failed.
            instance.start(runner)?;
            volumes = restored?;
            restarted = true;
        } else {
            warn!("{context}Volumes can only be restored into docker instances");
        }
    }

    context.current_context = "Restart";
    if options.restart && !restarted && instance.container().is_some() {
        match instance.restart(runner) {
            Ok(()) => {
                info!("{context}Restarted the container");
                restarted = true;
            }
            Err(error) => warn!("{context}Could not restart the container: {error}"),
        }
    }

    info!("{context}Restore complete");

    Ok(RestoreReport {
        instance,
        version,
        key_source: resolved.map(|resolved| resolved.source),
        strategy,
        credentials_imported,
        workflows,
        volumes,
        restarted,
    })
}

fn import(
    runner: &dyn CommandRunner,
    instance: &Instance,
    backup_root: &Path,
    work_directory: &str,
    resolved: Option<&ResolvedKey>,
    strategy: &ImportStrategy,
    context: &mut Context,
) -> Result<(bool, ImportOutcome), RestoreError> {
    context.current_context = "Import";
    let key = resolved.map(|resolved| &resolved.key);

    instance.copy_in(
        runner,
        backup_root,
        &[WORKFLOWS_DIR, CREDENTIALS_FILE],
        work_directory,
    )?;

    let mut credentials_imported = false;
    if backup_root.join(CREDENTIALS_FILE).is_file() {
        info!("{context}Importing credentials");
        let input = format!("--input={work_directory}/{CREDENTIALS_FILE}");
        let command = instance.n8n(&["import:credentials", input.as_str()], key);

        match runner.run(&command) {
            Ok(output) if output.success() => credentials_imported = true,
            Ok(output) => warn!(
                "{context}Credential import failed: {}",
                output.combined().trim()
            ),
            Err(error) => warn!("{context}Credential import failed: {error}"),
        }
    } else {
        info!("{context}The backup has no credentials");
    }

    if archive::count_workflows(backup_root)? == 0 {
        info!("{context}The backup has no workflows");
        return Ok((credentials_imported, ImportOutcome::default()));
    }

    info!("{context}Importing workflows");
    let input = format!("--input={work_directory}/{WORKFLOWS_DIR}/");
    let mut args = vec!["import:workflow".to_string(), "--separate".to_string(), input];
    args.extend(strategy.workflow_args());
    let args: Vec<&str> = args.iter().map(String::as_str).collect();

    let output = runner.run(&instance.n8n(&args, key))?;
    let outcome = ImportOutcome::parse(&output.combined());
    report(&output, &outcome, context)?;

    Ok((credentials_imported, outcome))
}

fn report(
    output: &CommandOutput,
    outcome: &ImportOutcome,
    context: &Context,
) -> Result<(), RestoreError> {
    if outcome.owner_problem {
        error!(
            "{context}The import failed to assign an owner. Create the owner account in the n8n UI first, \
             or set owner_user_id in the config."
        );
    }

    if !output.success() {
        return Err(RestoreError::WorkflowImport(output.combined().trim().to_string()));
    }

    match outcome.imported {
        Some(count) => info!("{context}Successfully imported {count} workflows"),
        None => info!("{context}Imported workflows"),
    }

    if outcome.missing > 0 {
        warn!(
            "{context}{} workflows referenced missing workflows",
            outcome.missing
        );
    }

    Ok(())
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error("Failed to read the embedded key: {0}")]
    Key(#[from] KeyError),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("Failed to run the n8n CLI: {0}")]
    Run(#[from] RunError),

    #[error("Workflow import failed:\n{0}")]
    WorkflowImport(String),

    #[error("Failed to restore volumes: {0}")]
    Volume(#[from] VolumeError),
}

//! # n8n-backup
//!

use std::{
    fs,
    io::{self, BufRead, IsTerminal, Write},
    path::{Path, PathBuf},
    process::ExitCode,
};

use chrono::Utc;
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use n8n_backup::{
    api_import::{self, ApiImportError, ApiImporter},
    archive::ArchiveFormat,
    backup::{self, BackupError, BackupOptions},
    catalog::{BackupSummary, Catalog, CatalogError},
    config::Config,
    credential_fix::{self, FixError},
    instance::Instance,
    key::{self, EncryptionKey, KeyError, KeyLocation},
    locator::{self, LocateError},
    restore::{self, RestoreError, RestoreOptions},
    runner::SystemRunner,
};
use shared::{InstanceKind, init_logger};
use thiserror::Error;
use tracing::{Level, error, info, warn};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Back up and restore n8n workflows and credentials.
#[derive(Debug, Parser)]
#[command(name = "n8n-backup", version)]
struct Cli {
    /// Path to the config file.
    #[arg(long, global = true, default_value = "./config.toml")]
    config: PathBuf,

    /// Log debug output.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Replace an existing config file.
        #[arg(long)]
        force: bool,
    },

    /// Back up an instance.
    Backup {
        /// The kind of instance, `native` or `docker`.
        kind: InstanceKind,

        /// The container to back up, otherwise the only running n8n container.
        container: Option<String>,

        /// The archive format, `tar-gz`, `zip` or `directory`.
        #[arg(long)]
        format: Option<ArchiveFormat>,

        /// Snapshot the container's named volumes into the backup.
        #[arg(long)]
        include_volumes: bool,

        /// Never prompt.
        #[arg(long)]
        non_interactive: bool,
    },

    /// Restore a backup into an instance.
    Restore {
        /// The kind of instance, `native` or `docker`.
        kind: InstanceKind,

        /// The backup name, with or without its extension.
        backup: String,

        /// The container to restore into, otherwise the only running n8n container.
        container: Option<String>,

        /// Restore without asking for confirmation.
        #[arg(long)]
        non_interactive: bool,

        /// Restore the container's named volumes from the backup.
        #[arg(long)]
        restore_volumes: bool,

        /// Do not restart the container afterwards.
        #[arg(long)]
        no_restart: bool,
    },

    /// List backups, newest first.
    List,

    /// Show a backup's details.
    Details {
        /// The backup name.
        backup: String,
    },

    /// Delete a backup.
    Delete {
        /// The backup name.
        backup: String,
    },

    /// Remove all but the newest backups.
    Prune {
        /// How many backups to keep, defaults to the configured retention.
        #[arg(long)]
        keep: Option<usize>,
    },

    /// Show the storage used by backups.
    Storage,

    /// List n8n containers.
    Containers,

    /// Manage the encryption key.
    Key {
        #[command(subcommand)]
        command: KeyCommand,
    },

    /// Remap credential ids in exported workflows.
    FixCredentials {
        /// The credential export of the old instance.
        old_credentials: PathBuf,

        /// The credential export of the new instance.
        new_credentials: PathBuf,

        /// The directory of workflow files.
        workflows: PathBuf,

        /// Where to write the fixed workflows, defaults to `<workflows>_fixed`.
        output: Option<PathBuf>,
    },

    /// Import workflow files through the n8n REST API.
    ApiImport {
        /// The directory of workflow files.
        workflows: PathBuf,

        /// The n8n API key.
        #[arg(long, env = "N8N_API_KEY", hide_env_values = true)]
        api_key: String,

        /// The n8n URL.
        #[arg(long, default_value = api_import::DEFAULT_URL)]
        url: String,
    },
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    /// Show the current key, masked.
    Show,

    /// Generate a new key.
    Generate,

    /// Check a candidate key.
    Validate {
        /// The key to check.
        key: String,
    },

    /// Save a key.
    Save {
        /// The key to save.
        key: String,

        /// Where to save it, `custom` or `n8n-config`.
        #[arg(long, default_value = "custom")]
        location: KeyLocation,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = Config::load_or_default(&cli.config);
    let log_directory = match &config {
        Ok(config) => config.log_directory.clone(),
        Err(_) => Config::default().log_directory,
    };
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let _logger = match init_logger(&log_directory, level) {
        Ok(logger) => logger,
        Err(error) => {
            eprintln!("Could not create logger in {log_directory:?}: {error}");
            return ExitCode::FAILURE;
        }
    };

    let mut config = match config {
        Ok(config) => config,
        Err(error) => {
            error!("Could not load config {:?}: {error}", cli.config);
            return ExitCode::FAILURE;
        }
    };
    config.apply_environment();

    match run(cli.command, &cli.config, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{error}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command, config_path: &Path, config: &Config) -> Result<(), CliError> {
    let runner = SystemRunner;

    match command {
        Command::Init { force } => {
            if !force && config_path.exists() {
                return Err(CliError::ConfigExists(config_path.to_path_buf()));
            }

            let contents = toml::to_string_pretty(&Config::default())?;
            fs::write(config_path, contents).map_err(|e| CliError::Io(e, "write config file"))?;
            info!("Wrote default config to {config_path:?}");
        }

        Command::Backup {
            kind,
            container,
            format,
            include_volumes,
            non_interactive,
        } => {
            let interactive = !non_interactive && io::stdin().is_terminal();
            let target = describe_target(kind, container.as_deref());
            if interactive && !confirm(&format!("Back up {target}?"))? {
                return Err(CliError::Cancelled);
            }

            let options = BackupOptions {
                kind,
                container,
                format,
                include_volumes,
                environment_key: key::from_environment(),
            };
            let report = backup::run_backup(&runner, config, &options, Utc::now())?;

            println!("Backup:     {}", report.name);
            println!("Path:       {}", report.path.display());
            println!("Workflows:  {}", report.metadata.backup_contents.workflows_count);
            println!(
                "Credentials: {}",
                yes_no(report.metadata.backup_contents.credentials_file_exists)
            );
            println!(
                "Key:        {}",
                report
                    .key_source
                    .map_or_else(|| "not found".to_string(), |source| source.to_string())
            );
            if !report.pruned.is_empty() {
                println!("Pruned:     {} old backups", report.pruned.len());
            }
        }

        Command::Restore {
            kind,
            backup,
            container,
            non_interactive,
            restore_volumes,
            no_restart,
        } => {
            if !non_interactive {
                let target = describe_target(kind, container.as_deref());
                let question = format!(
                    "Restore {backup} into {target}? Existing workflows and credentials with the same ids are overwritten."
                );
                if !confirm(&question)? {
                    return Err(CliError::Cancelled);
                }
            }

            let options = RestoreOptions {
                kind,
                backup,
                container,
                restore_volumes,
                restart: config.restart_after_restore && !no_restart,
                environment_key: key::from_environment(),
            };
            let report = restore::run_restore(&runner, config, &options)?;

            println!("Restored into {}", report.instance);
            if let Some(version) = report.version {
                println!("n8n version: {version}");
            }
            println!("Credentials: {}", yes_no(report.credentials_imported));
            match report.workflows.imported {
                Some(count) => println!("Workflows:   {count} imported"),
                None => println!("Workflows:   imported"),
            }
            if !report.volumes.is_empty() {
                println!("Volumes:     {}", report.volumes.join(", "));
            }
            if report.restarted {
                println!("Container restarted");
            }
        }

        Command::List => {
            let backups = Catalog::new(&config.backup_directory).list()?;
            if backups.is_empty() {
                println!("No backups in {}", config.backup_directory.display());
            }
            for backup in &backups {
                print_summary(backup);
            }
        }

        Command::Details { backup } => {
            let summary = Catalog::new(&config.backup_directory).details(&backup)?;
            print_summary(&summary);

            match &summary.metadata {
                Some(metadata) => println!("{}", serde_json::to_string_pretty(metadata)?),
                None => println!("No metadata found"),
            }
        }

        Command::Delete { backup } => {
            let path = Catalog::new(&config.backup_directory).delete(&backup)?;
            println!("Deleted {}", path.display());
        }

        Command::Prune { keep } => {
            let keep = keep.unwrap_or(config.retention_count);
            let removed = Catalog::new(&config.backup_directory).prune(keep)?;
            println!("Removed {} backups, kept at most {keep}", removed.len());
        }

        Command::Storage => {
            let usage = Catalog::new(&config.backup_directory).usage()?;
            println!("Directory: {}", usage.directory.display());
            println!("Backups:   {}", usage.backups);
            println!("Total:     {}", human_size(usage.total_bytes));
        }

        Command::Containers => {
            if !locator::docker_available(&runner) {
                return Err(LocateError::DockerNotFound.into());
            }

            let containers = locator::list_containers(&runner, &config.container_pattern)?;
            if containers.is_empty() {
                println!("No containers match '{}'", config.container_pattern);
            }
            for container in containers {
                println!(
                    "{:<30} {:<10} {}",
                    container.name, container.state, container.image
                );
            }
        }

        Command::Key { command } => run_key(command, config)?,

        Command::FixCredentials {
            old_credentials,
            new_credentials,
            workflows,
            output,
        } => {
            let report = credential_fix::fix_directory(
                &old_credentials,
                &new_credentials,
                &workflows,
                output.as_deref(),
            )?;

            println!("Credentials mapped: {}", report.mapped);
            println!("Workflows updated:  {}", report.updated);
            println!("Workflows failed:   {}", report.failed.len());
            println!("Output directory:   {}", report.output.display());

            if !report.failed.is_empty() {
                return Err(CliError::Incomplete(report.failed.len()));
            }
        }

        Command::ApiImport {
            workflows,
            api_key,
            url,
        } => {
            let importer = ApiImporter::new(&url, api_key)?;
            let report = importer.import_directory(&workflows)?;

            println!("Total:    {}", report.total);
            println!("Imported: {}", report.imported);
            println!("Failed:   {}", report.failures.len());
            for failure in &report.failures {
                println!("  {}: {}", failure.file.display(), failure.reason);
            }

            if !report.failures.is_empty() {
                return Err(CliError::Incomplete(report.failures.len()));
            }
        }
    }

    Ok(())
}

fn run_key(command: KeyCommand, config: &Config) -> Result<(), CliError> {
    match command {
        KeyCommand::Show => match key::current(&SystemRunner, &Instance::Native, config) {
            Some(resolved) => {
                println!("Key:    {}", resolved.key.masked());
                println!("Source: {}", resolved.source);
                println!("Length: {}", resolved.key.len());
                println!("Valid:  {}", yes_no(resolved.key.is_valid()));
            }
            None => {
                warn!("No encryption key found");
                println!("No encryption key found");
            }
        },

        KeyCommand::Generate => {
            let key = key::generate();
            // Printed in full so it can be saved.
            println!("{}", key.expose());
        }

        KeyCommand::Validate { key } => {
            let validation = key::validate(key.trim());
            println!("Length: {} (expected {})", validation.length, validation.expected_length);
            println!("Hex:    {}", yes_no(validation.is_hex));
            println!("Valid:  {}", yes_no(validation.valid));

            if !validation.valid {
                return Err(KeyError::InvalidLength(validation.length).into());
            }
        }

        KeyCommand::Save { key, location } => {
            let key = EncryptionKey::new(key).ok_or(KeyError::InvalidLength(0))?;
            let path = key::save(&key, location, config)?;
            println!("Saved key {} to {}", key.masked(), path.display());
        }
    }

    Ok(())
}

fn describe_target(kind: InstanceKind, container: Option<&str>) -> String {
    match (kind, container) {
        (InstanceKind::Docker, Some(container)) => format!("docker container '{container}'"),
        (InstanceKind::Docker, None) => "the running n8n container".to_string(),
        (InstanceKind::Native, _) => "the native n8n install".to_string(),
    }
}

fn confirm(question: &str) -> Result<bool, CliError> {
    print!("{question} [y/N] ");
    io::stdout()
        .flush()
        .map_err(|e| CliError::Io(e, "write prompt"))?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .map_err(|e| CliError::Io(e, "read answer"))?;

    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_summary(backup: &BackupSummary) {
    let created = backup
        .timestamp
        .map(|timestamp| timestamp.format("%Y-%m-%d %H:%M:%S").to_string())
        .or_else(|| {
            backup
                .modified
                .map(|modified| modified.format("%Y-%m-%d %H:%M:%S").to_string())
        })
        .unwrap_or_default();
    let kind = backup
        .instance_type
        .map_or("unknown", |kind| kind.as_str());
    let workflows = backup
        .workflows()
        .map_or_else(|| "?".to_string(), |count| count.to_string());

    println!(
        "{:<45} {:<20} {:<8} {:>10} {:>5} workflows{}",
        backup.name,
        created,
        kind,
        human_size(backup.size_bytes),
        workflows,
        if backup.has_credentials() == Some(true) { ", credentials" } else { "" }
    );
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];

    let mut size = bytes;
    let mut remainder = 0;
    let mut unit = 0;
    while size >= 1024 && unit + 1 < UNITS.len() {
        remainder = size % 1024;
        size /= 1024;
        unit += 1;
    }

    let tenths = remainder * 10 / 1024;
    let unit = UNITS.get(unit).copied().unwrap_or("B");
    if unit == "B" {
        format!("{size} {unit}")
    } else {
        format!("{size}.{tenths} {unit}")
    }
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[derive(Debug, Error)]
enum CliError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Cancelled")]
    Cancelled,

    #[error("{0:?} already exists, pass --force to replace it")]
    ConfigExists(PathBuf),

    #[error("{0} workflows failed")]
    Incomplete(usize),

    #[error("Failed to serialize config: {0}")]
    Toml(#[from] toml::ser::Error),

    #[error("Failed to serialize metadata: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("Restore failed: {0}")]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Locate(#[from] LocateError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Credential fix failed: {0}")]
    Fix(#[from] FixError),

    #[error("API import failed: {0}")]
    ApiImport(#[from] ApiImportError),
}

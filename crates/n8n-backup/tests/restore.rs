//! Tests for restoring backups
//!

use std::{fs, path::PathBuf};

use common::{FakeRunner, KEY, OTHER_KEY, test_config, write_export};
use n8n_backup::{
    archive::ArchiveError,
    config::Config,
    key::{self, ENCRYPTION_KEY_VAR, EncryptionKey, KeySource},
    restore::{self, ImportOutcome, RestoreError, RestoreOptions},
    runner::CommandOutput,
    version::{ImportStrategy, PLACEHOLDER_USER_ID},
};
use shared::{InstanceKind, test::init_test_logger};

mod common;

const BACKUP: &str = "native_backup_20240101_120000";
const OWNER: &str = "3f2b8c1e-6d4a-4b7e-9c1f-2a5d8e7b6c40";

/// Write a directory backup into the config's backup directory.
fn write_backup(config: &Config) -> PathBuf {
    let root = config.backup_directory.join(BACKUP);
    write_export(&root);
    root
}

fn native_options() -> RestoreOptions {
    RestoreOptions {
        kind: InstanceKind::Native,
        backup: BACKUP.to_string(),
        container: None,
        restore_volumes: false,
        restart: true,
        environment_key: None,
    }
}

fn docker_options() -> RestoreOptions {
    RestoreOptions {
        kind: InstanceKind::Docker,
        container: Some("n8n".to_string()),
        ..native_options()
    }
}

#[test]
fn backup_without_workflows_never_reaches_n8n() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let backup = config.backup_directory.join(BACKUP);
    fs::create_dir_all(&backup).unwrap();
    fs::write(backup.join("credentials.json"), "[]").unwrap();

    let runner = FakeRunner::new();
    let result = restore::run_restore(&runner, &config, &native_options());

    assert!(matches!(
        result,
        Err(RestoreError::Archive(ArchiveError::MissingWorkflows(_)))
    ));
    assert!(runner.calls().is_empty());
}

#[test]
fn unknown_backup_is_not_found() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());

    let runner = FakeRunner::new();
    let result = restore::run_restore(&runner, &config, &native_options());

    assert!(matches!(result, Err(RestoreError::Catalog(_))));
    assert!(runner.calls().is_empty());
}

#[test]
fn v1_imports_without_user_id() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    write_backup(&config);

    let runner = FakeRunner::new()
        .on_args(&["--version"], CommandOutput::ok("1.64.0\n"))
        .on_args(
            &["import:workflow"],
            CommandOutput::ok("Successfully imported 3 workflows."),
        );

    let report = restore::run_restore(&runner, &config, &native_options()).unwrap();

    assert_eq!(report.strategy, ImportStrategy::Plain);
    assert_eq!(report.workflows.imported, Some(3));
    assert!(report.credentials_imported);
    // Native instances are never restarted.
    assert!(!report.restarted);

    let import = runner.call_with("import:workflow").unwrap();
    assert!(import.has_arg("--separate"));
    assert!(import.arg_with_prefix("--userId=").is_none());
    let input = import.arg_with_prefix("--input=").unwrap();
    assert!(input.ends_with("/workflows/"));
}

#[test]
fn v2_uses_configured_owner() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = Config {
        owner_user_id: Some(OWNER.to_string()),
        ..test_config(root.path())
    };
    write_backup(&config);

    let runner = FakeRunner::new().on_args(&["--version"], CommandOutput::ok("2.0.1\n"));

    restore::run_restore(&runner, &config, &native_options()).unwrap();

    let import = runner.call_with("import:workflow").unwrap();
    assert_eq!(import.arg_with_prefix("--userId="), Some(OWNER));
    assert!(!runner.calls().iter().any(|call| call.program == "sqlite3"));
}

#[test]
fn v2_discovers_owner_from_database() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    write_backup(&config);

    let runner = FakeRunner::new()
        .on_args(&["--version"], CommandOutput::ok("2.0.1\n"))
        .on(
            |command| command.program == "sqlite3",
            |_| Ok(CommandOutput::ok(format!("{OWNER}\n"))),
        );

    let report = restore::run_restore(&runner, &config, &native_options()).unwrap();

    assert_eq!(
        report.strategy,
        ImportStrategy::OwnerAssigned {
            user_id: OWNER.to_string()
        }
    );

    let query = runner
        .calls()
        .into_iter()
        .find(|call| call.program == "sqlite3")
        .unwrap();
    let database = config.database_path.unwrap();
    assert_eq!(query.args[0], database.to_str().unwrap());
}

#[test]
fn v2_falls_back_to_placeholder_owner() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    write_backup(&config);

    let runner = FakeRunner::new().on_args(&["--version"], CommandOutput::ok("2.0.1\n"));

    restore::run_restore(&runner, &config, &native_options()).unwrap();

    let import = runner.call_with("import:workflow").unwrap();
    assert_eq!(import.arg_with_prefix("--userId="), Some(PLACEHOLDER_USER_ID));
}

#[test]
fn embedded_key_reaches_import() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let backup = write_backup(&config);
    key::write_embedded(&backup, &EncryptionKey::new(KEY).unwrap()).unwrap();

    let runner = FakeRunner::new();
    let options = RestoreOptions {
        environment_key: EncryptionKey::new(OTHER_KEY),
        ..native_options()
    };

    let report = restore::run_restore(&runner, &config, &options).unwrap();

    assert_eq!(report.key_source, Some(KeySource::Backup));
    for subcommand in ["import:credentials", "import:workflow"] {
        let call = runner.call_with(subcommand).unwrap();
        assert_eq!(
            call.env,
            vec![(ENCRYPTION_KEY_VAR.to_string(), KEY.to_string())]
        );
        assert!(!call.args.iter().any(|arg| arg.contains(KEY)));
    }
}

#[test]
fn owner_error_fails_the_restore() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    write_backup(&config);

    let runner = FakeRunner::new()
        .on_args(&["--version"], CommandOutput::ok("2.0.1\n"))
        .on_args(
            &["import:workflow"],
            CommandOutput::failed("Error: Failed to find owner user with id"),
        );

    let result = restore::run_restore(&runner, &config, &native_options());

    assert!(matches!(result, Err(RestoreError::WorkflowImport(_))));
}

#[test]
fn credential_import_failure_is_tolerated() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    write_backup(&config);

    let runner = FakeRunner::new().on_args(
        &["import:credentials"],
        CommandOutput::failed("Credentials could not be decrypted"),
    );

    let report = restore::run_restore(&runner, &config, &native_options()).unwrap();

    assert!(!report.credentials_imported);
    assert!(runner.call_with("import:workflow").is_some());
}

#[test]
fn backup_without_credentials_skips_credential_import() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let backup = write_backup(&config);
    fs::remove_file(backup.join("credentials.json")).unwrap();

    let runner = FakeRunner::new();
    let report = restore::run_restore(&runner, &config, &native_options()).unwrap();

    assert!(!report.credentials_imported);
    assert!(runner.call_with("import:credentials").is_none());
}

fn docker_runner() -> FakeRunner {
    FakeRunner::new().on_args(&["{{.State.Running}}"], CommandOutput::ok("true\n"))
}

fn position(runner: &FakeRunner, first_arg: &str) -> usize {
    runner
        .calls()
        .iter()
        .position(|call| {
            call.program == "docker" && call.args.first().is_some_and(|arg| arg == first_arg)
        })
        .unwrap()
}

#[test]
fn docker_restore_copies_in_and_restarts() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let backup = write_backup(&config);
    fs::write(backup.join(".n8n_encryption_key"), KEY).unwrap();

    let runner = docker_runner();
    let report = restore::run_restore(&runner, &config, &docker_options()).unwrap();

    assert!(report.restarted);
    assert_eq!(report.instance.container(), Some("n8n"));

    let import = runner.call_with("import:workflow").unwrap();
    assert_eq!(
        import.arg_with_prefix("--input="),
        Some("/tmp/n8n_restore/workflows/")
    );
    let credentials = runner.call_with("import:credentials").unwrap();
    assert_eq!(
        credentials.arg_with_prefix("--input="),
        Some("/tmp/n8n_restore/credentials.json")
    );

    assert!(position(&runner, "cp") < position(&runner, "restart"));

    // Only what the n8n CLI reads goes into the container.
    let copied: Vec<String> = runner
        .calls()
        .into_iter()
        .filter(|call| {
            call.program == "docker" && call.args.first().is_some_and(|arg| arg == "cp")
        })
        .map(|call| call.args[2].clone())
        .collect();
    assert_eq!(
        copied,
        [
            "n8n:/tmp/n8n_restore/workflows",
            "n8n:/tmp/n8n_restore/credentials.json",
        ]
    );
}

#[test]
fn docker_restore_without_restart() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    write_backup(&config);

    let runner = docker_runner();
    let options = RestoreOptions {
        restart: false,
        ..docker_options()
    };
    let report = restore::run_restore(&runner, &config, &options).unwrap();

    assert!(!report.restarted);
    assert!(runner.call_with("restart").is_none());
}

#[test]
fn volumes_are_restored_while_stopped() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let backup = write_backup(&config);
    let volumes = backup.join("volumes");
    fs::create_dir_all(&volumes).unwrap();
    fs::write(volumes.join("n8n_data.tar.gz"), "snapshot").unwrap();

    let runner = docker_runner();
    let options = RestoreOptions {
        restore_volumes: true,
        ..docker_options()
    };
    let report = restore::run_restore(&runner, &config, &options).unwrap();

    assert_eq!(report.volumes, ["n8n_data"]);
    assert!(report.restarted);

    let stop = position(&runner, "stop");
    let run = position(&runner, "run");
    let start = position(&runner, "start");
    assert!(stop < run && run < start);
    assert!(runner.call_with("restart").is_none());
}

#[test]
fn import_output_parsing() {
    let outcome = ImportOutcome::parse(
        "Importing 4 workflows...\n\
         Could not find workflow 12\n\
         Successfully imported 4 workflows.",
    );
    assert_eq!(
        outcome,
        ImportOutcome {
            imported: Some(4),
            missing: 1,
            owner_problem: false,
        }
    );

    let outcome = ImportOutcome::parse("Error: owner user not found");
    assert!(outcome.owner_problem);
    assert_eq!(outcome.imported, None);

    assert_eq!(ImportOutcome::parse(""), ImportOutcome::default());
}

#[test]
fn restore_leaves_backup_in_place() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let config = test_config(root.path());
    let backup = write_backup(&config);
    let before = common::file_set(&backup);

    restore::run_restore(&FakeRunner::new(), &config, &native_options()).unwrap();

    assert_eq!(common::file_set(&backup), before);
}

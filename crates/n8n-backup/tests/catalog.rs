//! Tests for the backup catalog
//!

use std::{fs, path::Path};

use chrono::{NaiveDate, TimeZone, Utc};
use common::write_export;
use n8n_backup::{
    archive::{self, ArchiveFormat},
    catalog::{self, Catalog, CatalogError},
};
use shared::{BackupContents, BackupInfo, BackupMetadata, InstanceKind, test::init_test_logger};

mod common;

fn metadata(workflows: usize) -> BackupMetadata {
    BackupMetadata {
        backup_info: BackupInfo {
            timestamp: "20240101_120000".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            instance_type: InstanceKind::Docker,
            container_name: Some("n8n".to_string()),
            n8n_version: Some("1.64.0".to_string()),
            tool_version: "0.1.0".to_string(),
            size_bytes: 100,
        },
        backup_contents: BackupContents {
            workflows_count: workflows,
            credentials_file_exists: true,
            ..BackupContents::default()
        },
    }
}

fn write_backup(directory: &Path, name: &str, format: ArchiveFormat) {
    let source = directory.join(name);
    write_export(&source);
    metadata(3).save(&source).unwrap();

    archive::create(&source, format).unwrap();
    if format != ArchiveFormat::Directory {
        fs::remove_dir_all(&source).unwrap();
    }
}

#[test]
fn prune_keeps_most_recent() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let catalog = Catalog::new(root.path());

    // Written newest first so modification times disagree with the names.
    for minute in (0..15).rev() {
        let name = format!("docker_backup_20240101_12{minute:02}00.tar.gz");
        fs::write(root.path().join(name), "archive").unwrap();
    }

    let removed = catalog.prune(10).unwrap();
    assert_eq!(removed.len(), 5);

    let mut remaining: Vec<String> = fs::read_dir(root.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    remaining.sort();

    let expected: Vec<String> = (5..15)
        .map(|minute| format!("docker_backup_20240101_12{minute:02}00.tar.gz"))
        .collect();
    assert_eq!(remaining, expected);
}

#[test]
fn prune_removes_directories_and_mixed_formats() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let catalog = Catalog::new(root.path());

    write_backup(root.path(), "native_backup_20240101_000000", ArchiveFormat::Directory);
    write_backup(root.path(), "native_backup_20240102_000000", ArchiveFormat::Zip);
    write_backup(root.path(), "docker_backup_20240103_000000", ArchiveFormat::TarGz);

    let removed = catalog.prune(1).unwrap();
    assert_eq!(removed.len(), 2);

    let remaining = catalog.list().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].name, "docker_backup_20240103_000000.tar.gz");
}

#[test]
fn prune_leaves_foreign_entries_alone() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let catalog = Catalog::new(root.path());

    for minute in 0..3 {
        let name = format!("docker_backup_20240101_12{minute:02}00.tar.gz");
        fs::write(root.path().join(name), "archive").unwrap();
    }
    // Written last, so their modification times are the newest.
    fs::write(root.path().join("family_photos.zip"), "photos").unwrap();
    fs::write(root.path().join("docker_backup_notes.tar.gz"), "notes").unwrap();
    fs::create_dir_all(root.path().join("my_backup_notes")).unwrap();

    let removed = catalog.prune(1).unwrap();

    assert_eq!(
        removed,
        [
            root.path().join("docker_backup_20240101_120100.tar.gz"),
            root.path().join("docker_backup_20240101_120000.tar.gz"),
        ]
    );
    assert!(root.path().join("docker_backup_20240101_120200.tar.gz").exists());
    assert!(root.path().join("family_photos.zip").exists());
    assert!(root.path().join("docker_backup_notes.tar.gz").exists());
    assert!(root.path().join("my_backup_notes").is_dir());
}

#[test]
fn list_is_newest_first() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();

    write_backup(root.path(), "docker_backup_20240102_000000", ArchiveFormat::TarGz);
    write_backup(root.path(), "native_backup_20240103_000000", ArchiveFormat::Directory);
    write_backup(root.path(), "docker_backup_20240101_000000", ArchiveFormat::Zip);
    fs::write(root.path().join("notes.txt"), "not a backup").unwrap();
    fs::create_dir_all(root.path().join("scratch")).unwrap();

    let backups = Catalog::new(root.path()).list().unwrap();
    let names: Vec<&str> = backups.iter().map(|backup| backup.name.as_str()).collect();

    assert_eq!(
        names,
        [
            "native_backup_20240103_000000",
            "docker_backup_20240102_000000.tar.gz",
            "docker_backup_20240101_000000.zip",
        ]
    );
    assert_eq!(backups[0].instance_type, Some(InstanceKind::Native));
    assert!(!backups[0].is_compressed());
    assert!(backups[1].is_compressed());
}

#[test]
fn missing_directory_lists_nothing() {
    let root = tempfile::tempdir().unwrap();
    let catalog = Catalog::new(root.path().join("missing"));

    assert!(catalog.list().unwrap().is_empty());
    assert!(catalog.prune(10).unwrap().is_empty());
}

#[test]
fn find_tries_extensions() {
    let root = tempfile::tempdir().unwrap();
    let catalog = Catalog::new(root.path());

    write_backup(root.path(), "docker_backup_20240101_000000", ArchiveFormat::TarGz);
    write_backup(root.path(), "docker_backup_20240102_000000", ArchiveFormat::Zip);
    write_backup(root.path(), "docker_backup_20240103_000000", ArchiveFormat::Directory);

    assert_eq!(
        catalog.find("docker_backup_20240101_000000").unwrap(),
        root.path().join("docker_backup_20240101_000000.tar.gz")
    );
    assert_eq!(
        catalog.find("docker_backup_20240101_000000.tar.gz").unwrap(),
        root.path().join("docker_backup_20240101_000000.tar.gz")
    );
    assert_eq!(
        catalog.find("docker_backup_20240102_000000").unwrap(),
        root.path().join("docker_backup_20240102_000000.zip")
    );
    assert_eq!(
        catalog.find("docker_backup_20240103_000000").unwrap(),
        root.path().join("docker_backup_20240103_000000")
    );
    assert!(matches!(
        catalog.find("docker_backup_20240104_000000"),
        Err(CatalogError::NotFound(_))
    ));
}

#[test]
fn details_read_metadata_in_place() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let catalog = Catalog::new(root.path());

    for (name, format) in [
        ("docker_backup_20240101_000000", ArchiveFormat::TarGz),
        ("docker_backup_20240102_000000", ArchiveFormat::Zip),
        ("docker_backup_20240103_000000", ArchiveFormat::Directory),
    ] {
        write_backup(root.path(), name, format);

        let details = catalog.details(name).unwrap();
        assert_eq!(details.format, format);
        assert_eq!(details.metadata, Some(metadata(3)));
        assert_eq!(details.workflows(), Some(3));
        assert_eq!(details.has_credentials(), Some(true));
    }

    // Extraction must not have happened.
    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 3);
}

#[test]
fn delete_removes_files_and_directories() {
    let _logger = init_test_logger();
    let root = tempfile::tempdir().unwrap();
    let catalog = Catalog::new(root.path());

    write_backup(root.path(), "docker_backup_20240101_000000", ArchiveFormat::TarGz);
    write_backup(root.path(), "docker_backup_20240102_000000", ArchiveFormat::Directory);

    catalog.delete("docker_backup_20240101_000000").unwrap();
    catalog.delete("docker_backup_20240102_000000").unwrap();

    assert_eq!(fs::read_dir(root.path()).unwrap().count(), 0);
    assert!(catalog.delete("docker_backup_20240101_000000").is_err());
}

#[test]
fn usage_totals() {
    let root = tempfile::tempdir().unwrap();
    fs::write(root.path().join("docker_backup_20240101_000000.tar.gz"), [0_u8; 100]).unwrap();
    fs::write(root.path().join("docker_backup_20240102_000000.zip"), [0_u8; 50]).unwrap();

    let usage = Catalog::new(root.path()).usage().unwrap();

    assert_eq!(usage.backups, 2);
    assert_eq!(usage.total_bytes, 150);
}

#[test]
fn timestamps_from_names() {
    let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_opt(3, 4, 5)
        .unwrap();

    assert_eq!(
        catalog::backup_timestamp("docker_backup_20240102_030405.tar.gz"),
        Some(expected)
    );
    assert_eq!(
        catalog::backup_timestamp("native_backup_20240102_030405"),
        Some(expected)
    );
    assert_eq!(catalog::backup_timestamp("backup.tar.gz"), None);
    assert_eq!(catalog::backup_timestamp("docker_backup_2024.zip"), None);
}

#[test]
fn only_tool_names_are_backup_names() {
    let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
        .unwrap()
        .and_hms_opt(3, 4, 5)
        .unwrap();

    for name in [
        "docker_backup_20240102_030405",
        "docker_backup_20240102_030405.tar.gz",
        "docker_backup_20240102_030405.zip",
    ] {
        assert_eq!(
            catalog::parse_backup_name(name),
            Some((InstanceKind::Docker, expected)),
            "{name}"
        );
    }
    assert_eq!(
        catalog::parse_backup_name("native_backup_20240102_030405"),
        Some((InstanceKind::Native, expected))
    );

    for name in [
        "family_photos.zip",
        "my_backup_notes",
        "docker_backup_notes.tar.gz",
        "old_docker_backup_20240102_030405.tar.gz",
        "docker_backup_20240102_030405.tar.gz.bak",
        "docker_backup_20240102_030405_copy",
    ] {
        assert_eq!(catalog::parse_backup_name(name), None, "{name}");
    }
}

#[test]
fn new_backup_names() {
    let now = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();

    assert_eq!(
        Catalog::new_backup_name(InstanceKind::Docker, now),
        "docker_backup_20240102_030405"
    );
    assert_eq!(
        Catalog::new_backup_name(InstanceKind::Native, now),
        "native_backup_20240102_030405"
    );
}

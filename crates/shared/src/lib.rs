//! # Shared
//! Types and ambient plumbing shared by the n8n backup tooling.
//!

#![warn(missing_docs)]

mod instance_kind;
mod logger;
mod metadata;

pub use instance_kind::InstanceKind;
pub use logger::{LoggerError, init_logger};
pub use metadata::{BackupContents, BackupInfo, BackupMetadata, MetadataError};

//! # n8n-backup
//! Backs up and restores n8n workflows and credentials from native installs and
//! Docker containers.
//!

pub mod api_import;
pub mod archive;
pub mod backup;
pub mod catalog;
pub mod config;
pub mod context;
pub mod credential_fix;
pub mod export;
pub mod instance;
pub mod key;
pub mod locator;
pub mod restore;
pub mod runner;
pub mod version;
pub mod volumes;

//! Importing workflows through the n8n public REST API.
//!

use std::{
    fs,
    path::{Path, PathBuf},
};

use reqwest::blocking::Client;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::credential_fix::{self, FixError};

/// The URL of a local n8n instance.
pub const DEFAULT_URL: &str = "http://localhost:5678";

/// The header carrying the API key.
pub const API_KEY_HEADER: &str = "X-N8N-API-KEY";

/// The workflow fields the API accepts.
const ACCEPTED_FIELDS: [&str; 5] = ["name", "nodes", "connections", "settings", "staticData"];

/// Reduce an exported workflow to what the API accepts, filling in required fields.
pub fn sanitize_workflow(workflow: Value, fallback_name: &str) -> Value {
    let mut clean: Map<String, Value> = match workflow {
        Value::Object(object) => object
            .into_iter()
            .filter(|(key, _)| ACCEPTED_FIELDS.contains(&key.as_str()))
            .collect(),
        _ => Map::new(),
    };

    let has_name = clean
        .get("name")
        .and_then(Value::as_str)
        .is_some_and(|name| !name.is_empty());
    if !has_name {
        clean.insert("name".to_string(), Value::String(fallback_name.to_string()));
    }

    clean
        .entry("nodes")
        .or_insert_with(|| Value::Array(Vec::new()));
    clean
        .entry("connections")
        .or_insert_with(|| Value::Object(Map::new()));

    if !clean.get("settings").is_some_and(Value::is_object) {
        clean.insert("settings".to_string(), Value::Object(Map::new()));
    }

    Value::Object(clean)
}

/// A workflow the API rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportFailure {
    /// The workflow file.
    pub file: PathBuf,

    /// Why it failed.
    pub reason: String,
}

/// The result of importing a directory.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiImportReport {
    /// The number of workflow files found.
    pub total: usize,

    /// The number imported.
    pub imported: usize,

    /// The workflows that failed.
    pub failures: Vec<ImportFailure>,
}

/// Posts workflows to an n8n instance.
#[derive(Debug, Clone)]
pub struct ApiImporter {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl ApiImporter {
    /// Create an importer for the instance at `base_url`.
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ApiImportError> {
        let client = Client::builder()
            .user_agent(concat!("n8n-backup/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/api/v1/workflows", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
        })
    }

    /// Import a single workflow file.
    pub fn import_file(&self, file: &Path) -> Result<(), ApiImportError> {
        let contents = fs::read_to_string(file).map_err(ApiImportError::Read)?;
        let workflow: Value = serde_json::from_str(&contents)?;

        let fallback_name = file
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("workflow");
        let body = sanitize_workflow(workflow, fallback_name);

        let response = self
            .client
            .post(&self.endpoint)
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()?;

        let status = response.status();
        if matches!(status.as_u16(), 200 | 201) {
            return Ok(());
        }

        let body = response.text().unwrap_or_default();
        let body: String = body.chars().take(200).collect();
        Err(ApiImportError::Rejected(status.as_u16(), body))
    }

    /// Import every `*.json` file in a directory, continuing past failures.
    pub fn import_directory(&self, directory: &Path) -> Result<ApiImportReport, ApiImportError> {
        let files = credential_fix::workflow_files(directory)?;

        let mut report = ApiImportReport {
            total: files.len(),
            ..ApiImportReport::default()
        };
        info!("Importing {} workflows into {}", report.total, self.endpoint);

        for (index, file) in files.into_iter().enumerate() {
            match self.import_file(&file) {
                Ok(()) => {
                    info!("[{}/{}] Imported {file:?}", index + 1, report.total);
                    report.imported += 1;
                }
                Err(error) => {
                    warn!("[{}/{}] Could not import {file:?}: {error}", index + 1, report.total);
                    report.failures.push(ImportFailure {
                        file,
                        reason: error.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ApiImportError {
    #[error("Failed to read the workflow: {0}")]
    Read(#[source] std::io::Error),

    #[error("Invalid workflow JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("The API responded with HTTP {0}: {1}")]
    Rejected(u16, String),

    #[error(transparent)]
    Directory(#[from] FixError),
}

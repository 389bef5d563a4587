//! Remapping credential ids inside exported workflows.
//!
//! Importing credentials into a fresh instance can give them new ids while the
//! exported workflows still reference the old ones. Credentials are matched
//! across the two exports by name and type.

use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

/// Workflow fields that tie a workflow to the instance it was exported from.
const INSTANCE_FIELDS: [&str; 6] = ["id", "createdAt", "updatedAt", "isArchived", "tags", "usedBy"];

/// A credential as it appears in an export.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CredentialRef {
    /// The credential id.
    pub id: String,

    /// The credential name.
    pub name: String,

    /// The credential type, e.g. `httpBasicAuth`.
    pub kind: String,
}

impl CredentialRef {
    fn from_value(value: &Value) -> Option<Self> {
        let field = |name: &str| value.get(name).and_then(Value::as_str).map(str::to_string);

        Some(Self {
            id: field("id")?,
            name: field("name").unwrap_or_default(),
            kind: field("type").unwrap_or_default(),
        })
    }

    fn match_key(&self) -> String {
        format!("{}|{}", self.name, self.kind)
    }
}

/// Parse a credential export: an array, a single object, or `{"credentials": [...]}`.
pub fn parse_credentials(contents: &str) -> Result<Vec<CredentialRef>, FixError> {
    let value: Value = serde_json::from_str(contents)?;

    let credentials = match value {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove("credentials") {
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
            None => vec![Value::Object(object)],
        },
        _ => return Err(FixError::UnexpectedShape),
    };

    Ok(credentials.iter().filter_map(CredentialRef::from_value).collect())
}

/// Map each old credential id to the id of the new credential with the same name and type.
pub fn map_ids(old: &[CredentialRef], new: &[CredentialRef]) -> HashMap<String, String> {
    let by_key: HashMap<String, &CredentialRef> = new
        .iter()
        .map(|credential| (credential.match_key(), credential))
        .collect();

    let mut mapping = HashMap::new();
    for credential in old {
        match by_key.get(&credential.match_key()) {
            Some(matched) => {
                info!(
                    "Mapped {} ({}): {} -> {}",
                    credential.name, credential.kind, credential.id, matched.id
                );
                mapping.insert(credential.id.clone(), matched.id.clone());
            }
            None => warn!(
                "No new credential matches {} ({})",
                credential.name, credential.kind
            ),
        }
    }

    mapping
}

/// Strip instance specific fields from a workflow and remap its credential references.
///
/// Only the workflow's own top-level fields are removed, nested node ids are kept.
/// Returns the number of references that were remapped.
pub fn fix_workflow(workflow: &mut Value, mapping: &HashMap<String, String>) -> usize {
    if let Value::Object(object) = workflow {
        for field in INSTANCE_FIELDS {
            object.remove(field);
        }
    }

    remap(workflow, mapping)
}

fn remap(value: &mut Value, mapping: &HashMap<String, String>) -> usize {
    match value {
        Value::Object(object) => {
            let mut remapped = 0;

            if let Some(Value::Object(credentials)) = object.get_mut("credentials") {
                for credential in credentials.values_mut() {
                    let Some(id) = credential.get_mut("id") else {
                        continue;
                    };

                    let new_id = id.as_str().and_then(|old| mapping.get(old));
                    if let Some(new_id) = new_id {
                        *id = Value::String(new_id.clone());
                        remapped += 1;
                    }
                }
            }

            remapped
                + object
                    .values_mut()
                    .map(|child| remap(child, mapping))
                    .sum::<usize>()
        }
        Value::Array(items) => items.iter_mut().map(|item| remap(item, mapping)).sum(),
        _ => 0,
    }
}

/// The `*.json` files directly inside a directory, sorted by name.
pub fn workflow_files(directory: &Path) -> Result<Vec<PathBuf>, FixError> {
    let mut files = Vec::new();

    for entry in fs::read_dir(directory).map_err(|e| FixError::Io(e, "read workflow directory"))? {
        let path = entry.map_err(|e| FixError::Io(e, "read entry"))?.path();
        if path.is_file() && path.extension().is_some_and(|extension| extension == "json") {
            files.push(path);
        }
    }
    files.sort();

    Ok(files)
}

/// The output directory used when none is given, `<directory>_fixed`.
pub fn default_output(directory: &Path) -> PathBuf {
    let mut output = directory.as_os_str().to_owned();
    output.push("_fixed");
    PathBuf::from(output)
}

/// The result of fixing a directory of workflows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FixReport {
    /// The number of credentials that were matched.
    pub mapped: usize,

    /// The number of workflows written.
    pub updated: usize,

    /// Workflows that could not be fixed.
    pub failed: Vec<PathBuf>,

    /// Where the workflows were written.
    pub output: PathBuf,
}

/// Fix every workflow in `workflows` using two credential exports.
pub fn fix_directory(
    old_credentials: &Path,
    new_credentials: &Path,
    workflows: &Path,
    output: Option<&Path>,
) -> Result<FixReport, FixError> {
    let old = read_credentials(old_credentials)?;
    let new = read_credentials(new_credentials)?;
    info!("Loaded {} old and {} new credentials", old.len(), new.len());

    let mapping = map_ids(&old, &new);

    let output = output.map_or_else(|| default_output(workflows), Path::to_path_buf);
    fs::create_dir_all(&output).map_err(|e| FixError::Io(e, "create output directory"))?;

    let mut report = FixReport {
        mapped: mapping.len(),
        output,
        ..FixReport::default()
    };

    for file in workflow_files(workflows)? {
        match fix_file(&file, &report.output, &mapping) {
            Ok(remapped) => {
                info!("Fixed {file:?}, {remapped} credential references updated");
                report.updated += 1;
            }
            Err(error) => {
                warn!("Could not fix {file:?}: {error}");
                report.failed.push(file);
            }
        }
    }

    Ok(report)
}

fn read_credentials(path: &Path) -> Result<Vec<CredentialRef>, FixError> {
    let contents = fs::read_to_string(path).map_err(|e| FixError::Io(e, "read credentials"))?;
    parse_credentials(&contents)
}

fn fix_file(
    file: &Path,
    output: &Path,
    mapping: &HashMap<String, String>,
) -> Result<usize, FixError> {
    let contents = fs::read_to_string(file).map_err(|e| FixError::Io(e, "read workflow"))?;
    let mut workflow: Value = serde_json::from_str(&contents)?;

    let remapped = fix_workflow(&mut workflow, mapping);

    let name = file.file_name().ok_or(FixError::UnexpectedShape)?;
    let contents = serde_json::to_string_pretty(&workflow)?;
    fs::write(output.join(name), contents).map_err(|e| FixError::Io(e, "write workflow"))?;

    Ok(remapped)
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum FixError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Expected a credential array or object")]
    UnexpectedShape,
}

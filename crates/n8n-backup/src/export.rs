//! Exporting workflows and credentials through the n8n CLI.
//!

use std::{fs, io, path::Path};

use thiserror::Error;
use tracing::{info, warn};

use crate::{
    archive::{self, ArchiveError, CREDENTIALS_FILE, WORKFLOWS_DIR},
    context::Context,
    instance::{CONTAINER_EXPORT_DIR, Instance, InstanceError},
    key::EncryptionKey,
    runner::{CommandRunner, RunError},
};

/// What an export produced.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportSummary {
    /// The number of workflow files exported.
    pub workflows: usize,

    /// If `credentials.json` was exported.
    pub credentials: bool,
}

/// Export every workflow and credential of `instance` into `staging`.
///
/// Docker instances export into [`CONTAINER_EXPORT_DIR`] which is copied out and
/// removed afterwards, even when the export fails.
pub fn export(
    runner: &dyn CommandRunner,
    instance: &Instance,
    staging: &Path,
    key: Option<&EncryptionKey>,
    context: &mut Context,
) -> Result<ExportSummary, ExportError> {
    context.current_context = "Export";

    fs::create_dir_all(staging).map_err(|e| ExportError::Io(e, "create staging directory"))?;
    let work_directory = instance.work_directory(staging, CONTAINER_EXPORT_DIR)?;

    let result = export_into(runner, instance, &work_directory, key, context).and_then(|()| {
        instance
            .copy_out(runner, &work_directory, staging)
            .map_err(ExportError::from)
    });
    instance.remove_directory(runner, &work_directory);
    result?;

    // An empty export still yields a workflows directory.
    fs::create_dir_all(staging.join(WORKFLOWS_DIR))
        .map_err(|e| ExportError::Io(e, "create workflows directory"))?;

    let summary = ExportSummary {
        workflows: archive::count_workflows(staging)?,
        credentials: staging.join(CREDENTIALS_FILE).is_file(),
    };

    info!(
        "{context}Exported {} workflows, credentials {}",
        summary.workflows,
        if summary.credentials { "included" } else { "not included" }
    );

    Ok(summary)
}

fn export_into(
    runner: &dyn CommandRunner,
    instance: &Instance,
    work_directory: &str,
    key: Option<&EncryptionKey>,
    context: &Context,
) -> Result<(), ExportError> {
    let workflows_directory = format!("{work_directory}/{WORKFLOWS_DIR}");
    instance.prepare_directory(runner, work_directory)?;
    instance.prepare_directory(runner, &workflows_directory)?;

    info!("{context}Exporting workflows");
    let output_arg = format!("--output={workflows_directory}/");
    let command = instance.n8n(
        &["export:workflow", "--all", "--separate", output_arg.as_str()],
        key,
    );
    let output = runner.run(&command)?;

    if output.mentions("No workflows found") {
        info!("{context}The instance has no workflows");
    } else if !output.success() {
        return Err(ExportError::WorkflowExport(output.combined().trim().to_string()));
    }

    info!("{context}Exporting credentials");
    let output_arg = format!("--output={work_directory}/{CREDENTIALS_FILE}");
    let command = instance.n8n(
        &["export:credentials", "--all", "--decrypted", output_arg.as_str()],
        key,
    );

    match runner.run(&command) {
        Ok(output) if output.success() => {}
        Ok(output) => warn!(
            "{context}Credential export failed, continuing without credentials: {}",
            output.combined().trim()
        ),
        Err(error) => warn!(
            "{context}Credential export failed, continuing without credentials: {error}"
        ),
    }

    Ok(())
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Failed to run the n8n CLI: {0}")]
    Run(#[from] RunError),

    #[error("Workflow export failed:\n{0}")]
    WorkflowExport(String),

    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

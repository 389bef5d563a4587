//! n8n instances and how commands reach them.
//!

use core::fmt;
use std::{
    fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use shared::InstanceKind;
use thiserror::Error;
use tracing::warn;

use crate::{
    key::{ENCRYPTION_KEY_VAR, EncryptionKey},
    runner::{CommandOutput, CommandRunner, CommandSpec, RunError},
};

/// Scratch directory inside a container that exports are written to.
pub const CONTAINER_EXPORT_DIR: &str = "/tmp/n8n_backup_export";

/// Scratch directory inside a container that backups are copied to before import.
pub const CONTAINER_RESTORE_DIR: &str = "/tmp/n8n_restore";

/// An n8n instance to back up or restore into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instance {
    /// n8n installed locally, the `n8n` CLI is on `PATH`.
    Native,

    /// n8n running in a Docker container.
    Docker {
        /// The container name.
        container: String,

        /// The user n8n commands are executed as.
        user: String,
    },
}

impl Instance {
    /// Create a docker instance.
    pub fn docker(container: impl Into<String>, user: impl Into<String>) -> Self {
        Self::Docker {
            container: container.into(),
            user: user.into(),
        }
    }

    /// The kind of this instance.
    pub fn kind(&self) -> InstanceKind {
        match self {
            Self::Native => InstanceKind::Native,
            Self::Docker { .. } => InstanceKind::Docker,
        }
    }

    /// The container name for docker instances.
    pub fn container(&self) -> Option<&str> {
        match self {
            Self::Native => None,
            Self::Docker { container, .. } => Some(container),
        }
    }

    /// Build an `n8n` CLI command against this instance.
    ///
    /// The key is passed through the environment, never as an argument.
    pub fn n8n(&self, args: &[&str], key: Option<&EncryptionKey>) -> CommandSpec {
        self.exec("n8n", args, key)
    }

    /// Build a command that runs `program` where the instance lives.
    pub fn exec(&self, program: &str, args: &[&str], key: Option<&EncryptionKey>) -> CommandSpec {
        let command = match self {
            Self::Native => CommandSpec::new(program, args.iter().copied()),
            Self::Docker { container, user } => {
                let mut docker_args = vec!["exec".to_string(), "-u".to_string(), user.clone()];
                if key.is_some() {
                    docker_args.push("-e".to_string());
                    docker_args.push(ENCRYPTION_KEY_VAR.to_string());
                }
                docker_args.push(container.clone());
                docker_args.push(program.to_string());
                docker_args.extend(args.iter().map(|arg| arg.to_string()));

                CommandSpec::new("docker", docker_args)
            }
        };

        match key {
            Some(key) => command.with_env(ENCRYPTION_KEY_VAR, key.expose()),
            None => command,
        }
    }

    /// Build a command that runs `program` as root inside a container.
    fn exec_as_root(container: &str, program: &str, args: &[&str]) -> CommandSpec {
        let mut docker_args = vec![
            "exec".to_string(),
            "-u".to_string(),
            "root".to_string(),
            container.to_string(),
            program.to_string(),
        ];
        docker_args.extend(args.iter().map(|arg| arg.to_string()));

        CommandSpec::new("docker", docker_args)
    }

    /// The directory the n8n CLI should read from or write to.
    ///
    /// Native instances work directly in the local staging directory, containers in
    /// `container_directory`.
    pub fn work_directory(
        &self,
        staging: &Path,
        container_directory: &str,
    ) -> Result<String, InstanceError> {
        match self {
            Self::Native => Ok(path_str(staging)?.to_string()),
            Self::Docker { .. } => Ok(container_directory.to_string()),
        }
    }

    /// Create an empty work directory.
    pub fn prepare_directory(
        &self,
        runner: &dyn CommandRunner,
        directory: &str,
    ) -> Result<(), InstanceError> {
        match self {
            Self::Native => {
                fs::create_dir_all(directory).map_err(|e| InstanceError::Io(e, "create directory"))
            }
            Self::Docker { container, .. } => {
                let remove = Self::exec_as_root(container, "rm", &["-rf", directory]);
                checked(runner, &remove)?;

                let create = self.exec("mkdir", &["-p", directory], None);
                checked(runner, &create)?;

                Ok(())
            }
        }
    }

    /// Copy the contents of a work directory into the local staging directory.
    pub fn copy_out(
        &self,
        runner: &dyn CommandRunner,
        directory: &str,
        staging: &Path,
    ) -> Result<(), InstanceError> {
        match self {
            Self::Native => Ok(()),
            Self::Docker { container, .. } => {
                let source = format!("{container}:{directory}/.");
                let command =
                    CommandSpec::new("docker", ["cp", source.as_str(), path_str(staging)?]);
                checked(runner, &command)?;

                Ok(())
            }
        }
    }

    /// Copy `entries` of the local staging directory into an emptied work directory.
    ///
    /// Entries missing from `staging` are skipped.
    pub fn copy_in(
        &self,
        runner: &dyn CommandRunner,
        staging: &Path,
        entries: &[&str],
        directory: &str,
    ) -> Result<(), InstanceError> {
        let Self::Docker { container, .. } = self else {
            return Ok(());
        };

        self.prepare_directory(runner, directory)?;

        for entry in entries {
            let source = staging.join(entry);
            if !source.exists() {
                continue;
            }

            let destination = format!("{container}:{directory}/{entry}");
            let command =
                CommandSpec::new("docker", ["cp", path_str(&source)?, destination.as_str()]);
            checked(runner, &command)?;
        }

        Ok(())
    }

    /// Remove a container work directory. Failures are only logged.
    pub fn remove_directory(&self, runner: &dyn CommandRunner, directory: &str) {
        let Self::Docker { container, .. } = self else {
            return;
        };

        let command = Self::exec_as_root(container, "rm", &["-rf", directory]);
        if let Err(error) = checked(runner, &command) {
            warn!("Could not remove {directory} from {container}: {error}");
        }
    }

    /// Read a text file from where the instance lives, `None` if it cannot be read.
    pub fn read_file(
        &self,
        runner: &dyn CommandRunner,
        path: &str,
    ) -> Result<Option<String>, InstanceError> {
        match self {
            Self::Native => match fs::read_to_string(path) {
                Ok(contents) => Ok(Some(contents)),
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
                Err(error) => Err(InstanceError::Io(error, "read file")),
            },
            Self::Docker { .. } => {
                let output = runner.run(&self.exec("cat", &[path], None))?;
                if output.success() {
                    Ok(Some(output.stdout))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Stop the container.
    pub fn stop(&self, runner: &dyn CommandRunner) -> Result<(), InstanceError> {
        self.container_command(runner, "stop")
    }

    /// Start the container.
    pub fn start(&self, runner: &dyn CommandRunner) -> Result<(), InstanceError> {
        self.container_command(runner, "start")
    }

    /// Restart the container.
    pub fn restart(&self, runner: &dyn CommandRunner) -> Result<(), InstanceError> {
        self.container_command(runner, "restart")
    }

    fn container_command(
        &self,
        runner: &dyn CommandRunner,
        action: &str,
    ) -> Result<(), InstanceError> {
        let container = self.container().ok_or(InstanceError::NotDocker)?;
        checked(runner, &CommandSpec::new("docker", [action, container]))?;

        Ok(())
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Docker { container, .. } => write!(f, "docker:{container}"),
        }
    }
}

/// Run a command and turn a non-zero exit into an error.
pub fn checked(
    runner: &dyn CommandRunner,
    command: &CommandSpec,
) -> Result<CommandOutput, InstanceError> {
    let output = runner.run(command)?;

    if output.success() {
        Ok(output)
    } else {
        Err(InstanceError::CommandErrored(
            command.to_string(),
            output.combined().trim().to_string(),
        ))
    }
}

/// Borrow a path as UTF-8 so it can be passed to a command.
pub fn path_str(path: &Path) -> Result<&str, InstanceError> {
    path.to_str()
        .ok_or_else(|| InstanceError::NotUnicode(path.to_path_buf()))
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("Failed to run command: {0}")]
    Run(#[from] RunError),

    #[error("Command '{0}' failed:\n{1}")]
    CommandErrored(String, String),

    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Path {0:?} was invalid unicode")]
    NotUnicode(PathBuf),

    #[error("The instance is not a docker container")]
    NotDocker,
}

//! Finding the n8n instance to operate on.
//!

use serde::{Deserialize, Serialize};
use shared::InstanceKind;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::Config,
    instance::Instance,
    runner::{CommandRunner, CommandSpec, RunError},
};

/// A container as listed by `docker ps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    /// The container id.
    #[serde(rename = "ID", default)]
    pub id: String,

    /// The container name.
    #[serde(rename = "Names", default)]
    pub name: String,

    /// The container state, e.g. `running` or `exited`.
    #[serde(rename = "State", default)]
    pub state: String,

    /// The image the container runs.
    #[serde(rename = "Image", default)]
    pub image: String,
}

impl ContainerSummary {
    /// If the container is running.
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }
}

/// If the docker CLI can be run.
pub fn docker_available(runner: &dyn CommandRunner) -> bool {
    runner
        .run(&CommandSpec::new("docker", ["--version"]))
        .is_ok_and(|output| output.success())
}

/// List containers whose name matches `pattern`.
pub fn list_containers(
    runner: &dyn CommandRunner,
    pattern: &str,
) -> Result<Vec<ContainerSummary>, LocateError> {
    let filter = format!("name={pattern}");
    let command = CommandSpec::new(
        "docker",
        ["ps", "-a", "--format", "{{json .}}", "--filter", filter.as_str()],
    );

    let output = runner.run(&command).map_err(docker_error)?;
    if !output.success() {
        return Err(LocateError::CommandErrored(output.combined().trim().to_string()));
    }

    let containers = output
        .stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(container) => Some(container),
            Err(error) => {
                warn!("Could not parse container listing '{line}': {error}");
                None
            }
        })
        .collect();

    Ok(containers)
}

/// Choose a container, either the one requested or the only running match.
pub fn select_container(
    runner: &dyn CommandRunner,
    requested: Option<&str>,
    pattern: &str,
) -> Result<String, LocateError> {
    if let Some(name) = requested {
        let command = CommandSpec::new(
            "docker",
            ["inspect", "--format", "{{.State.Running}}", name],
        );
        let output = runner.run(&command).map_err(docker_error)?;

        if !output.success() {
            return Err(LocateError::ContainerNotFound(name.to_string()));
        }
        if output.stdout.trim() != "true" {
            return Err(LocateError::ContainerNotRunning(name.to_string()));
        }

        return Ok(name.to_string());
    }

    let containers = list_containers(runner, pattern)?;
    let running: Vec<&ContainerSummary> = containers.iter().filter(|c| c.is_running()).collect();

    match running.as_slice() {
        [container] => {
            info!("Using container {}", container.name);
            Ok(container.name.clone())
        }
        [] => Err(LocateError::NoRunningContainer(
            pattern.to_string(),
            describe(&containers),
        )),
        _ => Err(LocateError::AmbiguousContainer(describe(&containers))),
    }
}

/// Resolve the instance to operate on.
pub fn resolve_instance(
    runner: &dyn CommandRunner,
    kind: InstanceKind,
    container: Option<&str>,
    config: &Config,
) -> Result<Instance, LocateError> {
    match kind {
        InstanceKind::Native => {
            match runner.run(&CommandSpec::new("n8n", ["--version"])) {
                Ok(output) if output.success() => Ok(Instance::Native),
                Ok(output) => Err(LocateError::CommandErrored(
                    output.combined().trim().to_string(),
                )),
                Err(RunError::NotFound(_)) => Err(LocateError::N8nNotFound),
                Err(error) => Err(LocateError::Run(error)),
            }
        }
        InstanceKind::Docker => {
            if !docker_available(runner) {
                return Err(LocateError::DockerNotFound);
            }

            let name = select_container(runner, container, &config.container_pattern)?;
            Ok(Instance::docker(name, config.docker_user.clone()))
        }
    }
}

fn describe(containers: &[ContainerSummary]) -> String {
    if containers.is_empty() {
        return "none".to_string();
    }

    containers
        .iter()
        .map(|c| format!("{} ({}, {})", c.name, c.state, c.image))
        .collect::<Vec<_>>()
        .join(", ")
}

fn docker_error(error: RunError) -> LocateError {
    match error {
        RunError::NotFound(_) => LocateError::DockerNotFound,
        error => LocateError::Run(error),
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum LocateError {
    #[error("The n8n CLI was not found on PATH")]
    N8nNotFound,

    #[error("Docker is not installed or not on PATH")]
    DockerNotFound,

    #[error("Container '{0}' does not exist")]
    ContainerNotFound(String),

    #[error("Container '{0}' is not running")]
    ContainerNotRunning(String),

    #[error("No running container matches '{0}', found: {1}")]
    NoRunningContainer(String, String),

    #[error("Several running containers match, pass a container name. Found: {0}")]
    AmbiguousContainer(String),

    #[error("Command output was error:\n{0}")]
    CommandErrored(String),

    #[error("Failed to run command: {0}")]
    Run(#[source] RunError),
}

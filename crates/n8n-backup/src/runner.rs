//! Running external commands.
//!

use core::fmt;
use std::{
    io::{self, ErrorKind},
    process::Command,
};

use thiserror::Error;
use tracing::debug;

/// A command to run.
///
/// Environment values are never included in the [`Display`](fmt::Display) output,
/// secrets must be passed through `env` rather than `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// The program to run.
    pub program: String,

    /// The arguments to the program.
    pub args: Vec<String>,

    /// Extra environment variables for the process.
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    /// Create a new command.
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Returns if any argument equals `arg`.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// The remainder of the first argument starting with `prefix`.
    pub fn arg_with_prefix(&self, prefix: &str) -> Option<&str> {
        self.args
            .iter()
            .find_map(|arg| arg.strip_prefix(prefix))
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }

        Ok(())
    }
}

/// The captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit code, `None` if the process was terminated by a signal.
    pub status: Option<i32>,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// A successful output with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// A failed output with the given stderr.
    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            status: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// If the command exited with status 0.
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Case insensitive search over stdout and stderr.
    pub fn mentions(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.stdout.to_lowercase().contains(&needle) || self.stderr.to_lowercase().contains(&needle)
    }
}

/// Runs commands, blocking until they finish.
pub trait CommandRunner {
    /// Run a command and capture its output.
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, RunError>;
}

/// Runs commands as child processes of this process.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandSpec) -> Result<CommandOutput, RunError> {
        debug!("Running: {command}");

        let output = Command::new(&command.program)
            .args(&command.args)
            .envs(command.env.iter().map(|(key, value)| (key, value)))
            .output()
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    RunError::NotFound(command.program.clone())
                } else {
                    RunError::Spawn(error, command.program.clone())
                }
            })?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum RunError {
    #[error("'{0}' was not found, is it installed and on PATH?")]
    NotFound(String),

    #[error("Failed to run '{1}': {0}")]
    Spawn(#[source] io::Error, String),
}

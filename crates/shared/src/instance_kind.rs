use core::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// The kind of n8n instance a backup was taken from or is restored into.
#[derive(Hash, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    /// n8n installed locally and invoked through the `n8n` CLI.
    Native,

    /// n8n running inside a Docker container.
    Docker,
}

impl InstanceKind {
    /// The lowercase name used in backup names and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Docker => "docker",
        }
    }

    /// Guess the instance kind from a backup name.
    pub fn from_backup_name(name: &str) -> Option<Self> {
        let name = name.to_lowercase();

        if name.contains("docker") {
            Some(Self::Docker)
        } else if name.contains("native") {
            Some(Self::Native)
        } else {
            None
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "docker" => Ok(Self::Docker),
            _ => Err(format!("invalid instance type '{s}', expected 'native' or 'docker'")),
        }
    }
}

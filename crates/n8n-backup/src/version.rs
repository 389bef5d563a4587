//! n8n version detection and the import strategy it implies.
//!

use core::{fmt, str::FromStr};

use tracing::{debug, info, warn};

use crate::{context::Context, instance::Instance, runner::CommandRunner};

/// Owner id used on n8n 2+ when no real user can be found.
///
/// Importing with this id fails if no owner account has been created yet.
pub const PLACEHOLDER_USER_ID: &str = "00000000-0000-0000-0000-000000000000";

/// An n8n version as reported by `n8n --version`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct N8nVersion {
    /// Major version.
    pub major: u64,
    /// Minor version.
    pub minor: u64,
    /// Patch version.
    pub patch: u64,
}

impl N8nVersion {
    /// If imported workflows must be assigned to a user.
    pub fn requires_owner(&self) -> bool {
        self.major >= 2
    }

    fn parse_token(token: &str) -> Option<Self> {
        let token = token.trim_start_matches(['v', 'V']);
        // Drop pre-release and build suffixes.
        let token = token.split(['-', '+']).next()?;

        let mut parts = token.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(patch) => patch.parse().ok()?,
            None => 0,
        };

        Some(Self {
            major,
            minor,
            patch,
        })
    }
}

impl FromStr for N8nVersion {
    type Err = String;

    /// Finds the first version-like token in the CLI output.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split_whitespace()
            .find_map(Self::parse_token)
            .ok_or_else(|| format!("no version found in '{}'", s.trim()))
    }
}

impl fmt::Display for N8nVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Ask the instance for its version, `None` if it cannot be determined.
pub fn detect(
    runner: &dyn CommandRunner,
    instance: &Instance,
    context: &Context,
) -> Option<N8nVersion> {
    let output = match runner.run(&instance.n8n(&["--version"], None)) {
        Ok(output) => output,
        Err(error) => {
            warn!("{context}Could not detect the n8n version: {error}");
            return None;
        }
    };

    if !output.success() {
        warn!(
            "{context}Could not detect the n8n version: {}",
            output.combined().trim()
        );
        return None;
    }

    match output.stdout.parse::<N8nVersion>() {
        Ok(version) => {
            info!("{context}Detected n8n {version}");
            Some(version)
        }
        Err(error) => {
            warn!("{context}Could not parse the n8n version: {error}");
            None
        }
    }
}

/// How workflows are imported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportStrategy {
    /// n8n 1.x, workflows are imported as-is.
    Plain,

    /// n8n 2+, workflows must be assigned to a user.
    OwnerAssigned {
        /// The owning user's id.
        user_id: String,
    },
}

impl ImportStrategy {
    /// Extra arguments for `import:workflow`.
    pub fn workflow_args(&self) -> Vec<String> {
        match self {
            Self::Plain => Vec::new(),
            Self::OwnerAssigned { user_id } => vec![format!("--userId={user_id}")],
        }
    }
}

/// Choose the import strategy for a target version.
///
/// The owner is the configured id, then whatever `discover` finds, then
/// [`PLACEHOLDER_USER_ID`]. Undetected versions are treated as 1.x.
pub fn strategy_for(
    version: Option<&N8nVersion>,
    configured_user: Option<&str>,
    discover: impl FnOnce() -> Option<String>,
    context: &Context,
) -> ImportStrategy {
    let Some(version) = version else {
        warn!("{context}Unknown n8n version, importing without a user id");
        return ImportStrategy::Plain;
    };

    if !version.requires_owner() {
        return ImportStrategy::Plain;
    }

    if let Some(user_id) = configured_user.filter(|id| !id.trim().is_empty()) {
        return ImportStrategy::OwnerAssigned {
            user_id: user_id.trim().to_string(),
        };
    }

    if let Some(user_id) = discover() {
        info!("{context}Assigning imported workflows to user {user_id}");
        return ImportStrategy::OwnerAssigned { user_id };
    }

    warn!(
        "{context}No n8n user found, using placeholder user id {PLACEHOLDER_USER_ID}. \
         The import may fail if no owner account has been created."
    );
    ImportStrategy::OwnerAssigned {
        user_id: PLACEHOLDER_USER_ID.to_string(),
    }
}

/// Query the instance's SQLite database for the first (owner) user.
pub fn discover_owner_id(
    runner: &dyn CommandRunner,
    instance: &Instance,
    database: &str,
) -> Option<String> {
    let query = r#"SELECT id FROM "user" ORDER BY "createdAt" ASC LIMIT 1;"#;
    let command = instance.exec("sqlite3", &[database, query], None);

    let output = match runner.run(&command) {
        Ok(output) => output,
        Err(error) => {
            debug!("Could not query {database} for an owner: {error}");
            return None;
        }
    };

    if !output.success() {
        debug!(
            "Could not query {database} for an owner: {}",
            output.combined().trim()
        );
        return None;
    }

    let id = output.stdout.lines().next()?.trim();
    if looks_like_uuid(id) {
        Some(id.to_string())
    } else {
        None
    }
}

fn looks_like_uuid(value: &str) -> bool {
    value.len() == 36
        && value
            .chars()
            .enumerate()
            .all(|(index, c)| match index {
                8 | 13 | 18 | 23 => c == '-',
                _ => c.is_ascii_hexdigit(),
            })
}

//! Encryption key resolution and management.
//!
//! The key is never used for cryptography here, it is only handed to the n8n CLI.
//! When several sources provide a key the highest precedence source wins:
//! backup-embedded, then the n8n config file, then the custom key file, then the
//! environment. Disagreeing sources are warned about and never reconciled.

use core::{fmt, str::FromStr};
use std::{
    env, fs,
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    config::Config,
    context::Context,
    instance::{Instance, path_str},
    runner::CommandRunner,
};

/// Environment variable holding the encryption key.
pub const ENCRYPTION_KEY_VAR: &str = "N8N_ENCRYPTION_KEY";

/// File inside a backup root holding the embedded key.
pub const EMBEDDED_KEY_FILE: &str = ".n8n_encryption_key";

/// The expected key length.
pub const KEY_LENGTH: usize = 32;

/// An n8n encryption key. Formatting always masks the value.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey(String);

impl EncryptionKey {
    /// Create a key, `None` if it is empty after trimming.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into().trim().to_string();
        if key.is_empty() { None } else { Some(Self(key)) }
    }

    /// The raw key.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The key masked for display.
    pub fn masked(&self) -> String {
        mask(&self.0)
    }

    /// The number of characters in the key.
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    /// If the key has the expected length.
    pub fn is_valid(&self) -> bool {
        self.len() == KEY_LENGTH
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EncryptionKey").field(&self.masked()).finish()
    }
}

impl fmt::Display for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Mask a key, keeping the first and last 8 characters of long keys.
pub fn mask(key: &str) -> String {
    let length = key.chars().count();
    if length <= 16 {
        return "*".repeat(length);
    }

    let head: String = key.chars().take(8).collect();
    let tail: String = key.chars().skip(length - 8).collect();
    format!("{head}...{tail}")
}

/// Where a key came from, ordered by precedence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeySource {
    /// Embedded in the backup being restored.
    Backup,

    /// The n8n config file of the instance.
    ConfigFile,

    /// The tool's custom key file.
    CustomFile,

    /// The `N8N_ENCRYPTION_KEY` environment variable.
    Environment,
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Backup => "backup",
            Self::ConfigFile => "n8n config file",
            Self::CustomFile => "custom key file",
            Self::Environment => "environment",
        };

        f.write_str(name)
    }
}

/// A lower precedence source that disagreed with the chosen key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyMismatch {
    /// The source that won.
    pub chosen: KeySource,

    /// The source that was ignored.
    pub ignored: KeySource,
}

/// The key chosen by a [`KeyResolver`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedKey {
    /// The key.
    pub key: EncryptionKey,

    /// Where the key came from.
    pub source: KeySource,

    /// Lower precedence sources with a different key.
    pub mismatches: Vec<KeyMismatch>,
}

/// Chooses the authoritative key from the available sources.
#[derive(Clone, Debug, Default)]
pub struct KeyResolver {
    candidates: Vec<(KeySource, EncryptionKey)>,
}

impl KeyResolver {
    /// Create a resolver with no candidates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a candidate key if there is one.
    pub fn with(mut self, source: KeySource, key: Option<EncryptionKey>) -> Self {
        if let Some(key) = key {
            self.candidates.push((source, key));
        }
        self
    }

    /// Choose the highest precedence key, warning about any disagreement.
    pub fn resolve(&self, context: &Context) -> Option<ResolvedKey> {
        let mut candidates = self.candidates.clone();
        candidates.sort_by_key(|(source, _)| *source);

        let mut candidates = candidates.into_iter();
        let (source, key) = candidates.next()?;

        let mut mismatches = Vec::new();
        for (other_source, other_key) in candidates {
            if other_key != key {
                warn!(
                    "{context}Encryption key from {source} ({}) differs from {other_source} ({}), using the {source} key",
                    key.masked(),
                    other_key.masked()
                );
                mismatches.push(KeyMismatch {
                    chosen: source,
                    ignored: other_source,
                });
            }
        }

        if !key.is_valid() {
            warn!(
                "{context}Encryption key from {source} is {} characters, expected {KEY_LENGTH}",
                key.len()
            );
        }

        debug!("{context}Using encryption key {key} from {source}");

        Some(ResolvedKey {
            key,
            source,
            mismatches,
        })
    }
}

/// The key in `N8N_ENCRYPTION_KEY`.
pub fn from_environment() -> Option<EncryptionKey> {
    env::var(ENCRYPTION_KEY_VAR).ok().and_then(EncryptionKey::new)
}

/// The `encryptionKey` field of an n8n config file.
pub fn parse_n8n_config(contents: &str) -> Option<EncryptionKey> {
    let config: Value = serde_json::from_str(contents).ok()?;
    config
        .get("encryptionKey")
        .and_then(Value::as_str)
        .and_then(EncryptionKey::new)
}

/// The key in the instance's n8n config file.
pub fn read_instance_config(
    runner: &dyn CommandRunner,
    instance: &Instance,
    config: &Config,
) -> Option<EncryptionKey> {
    let path = match instance {
        Instance::Native => {
            let path = config.n8n_config_path()?;
            path_str(&path).ok()?.to_string()
        }
        Instance::Docker { .. } => config.container_n8n_config_path.clone(),
    };

    match instance.read_file(runner, &path) {
        Ok(Some(contents)) => parse_n8n_config(&contents),
        Ok(None) => None,
        Err(error) => {
            debug!("Could not read n8n config {path}: {error}");
            None
        }
    }
}

/// The key in a plain key file.
pub fn read_key_file(path: &Path) -> Result<Option<EncryptionKey>, KeyError> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(EncryptionKey::new(contents)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(KeyError::Io(error, "read key file")),
    }
}

/// The key embedded in a backup root.
pub fn read_embedded(backup_root: &Path) -> Result<Option<EncryptionKey>, KeyError> {
    read_key_file(&backup_root.join(EMBEDDED_KEY_FILE))
}

/// Embed a key in a backup root.
pub fn write_embedded(backup_root: &Path, key: &EncryptionKey) -> Result<(), KeyError> {
    write_key_file(&backup_root.join(EMBEDDED_KEY_FILE), key)
}

fn write_key_file(path: &Path, key: &EncryptionKey) -> Result<(), KeyError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| KeyError::Io(e, "create key directory"))?;
        }
    }

    fs::write(path, key.expose()).map_err(|e| KeyError::Io(e, "write key file"))?;
    restrict_permissions(path)?;

    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .map_err(|e| KeyError::Io(e, "restrict key file permissions"))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}

/// The current key of the local environment, ignoring backups.
pub fn current(
    runner: &dyn CommandRunner,
    instance: &Instance,
    config: &Config,
) -> Option<ResolvedKey> {
    let custom = read_key_file(&config.custom_key_file).unwrap_or_else(|error| {
        warn!("Could not read {:?}: {error}", config.custom_key_file);
        None
    });

    KeyResolver::new()
        .with(KeySource::ConfigFile, read_instance_config(runner, instance, config))
        .with(KeySource::CustomFile, custom)
        .with(KeySource::Environment, from_environment())
        .resolve(&Context::new(instance.to_string()))
}

/// The result of validating a candidate key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyValidation {
    /// If the key has the expected length.
    pub valid: bool,

    /// The key's length.
    pub length: usize,

    /// The expected length.
    pub expected_length: usize,

    /// If every character is a hex digit.
    pub is_hex: bool,
}

/// Validate a candidate key.
pub fn validate(key: &str) -> KeyValidation {
    let length = key.chars().count();

    KeyValidation {
        valid: length == KEY_LENGTH,
        length,
        expected_length: KEY_LENGTH,
        is_hex: key.chars().all(|c| c.is_ascii_hexdigit()),
    }
}

/// Generate a new 32 character hex key.
pub fn generate() -> EncryptionKey {
    let bytes: [u8; KEY_LENGTH / 2] = rand::random();
    let hex: String = bytes.iter().map(|byte| format!("{byte:02x}")).collect();

    EncryptionKey(hex)
}

/// Where a key can be saved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyLocation {
    /// The tool's custom key file.
    Custom,

    /// The `encryptionKey` field of the native n8n config file.
    N8nConfig,
}

impl FromStr for KeyLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "custom" => Ok(Self::Custom),
            "n8n-config" | "n8n_config" => Ok(Self::N8nConfig),
            _ => Err(format!("invalid key location '{s}', expected 'custom' or 'n8n-config'")),
        }
    }
}

/// Save a key, returning the file it was written to.
pub fn save(
    key: &EncryptionKey,
    location: KeyLocation,
    config: &Config,
) -> Result<PathBuf, KeyError> {
    if !key.is_valid() {
        return Err(KeyError::InvalidLength(key.len()));
    }

    match location {
        KeyLocation::Custom => {
            write_key_file(&config.custom_key_file, key)?;
            Ok(config.custom_key_file.clone())
        }
        KeyLocation::N8nConfig => {
            let path = config.n8n_config_path().ok_or(KeyError::NoHome)?;

            let mut n8n_config = match fs::read_to_string(&path) {
                Ok(contents) => match serde_json::from_str::<Value>(&contents)? {
                    Value::Object(map) => map,
                    _ => return Err(KeyError::NotAnObject(path)),
                },
                Err(error) if error.kind() == ErrorKind::NotFound => Map::new(),
                Err(error) => return Err(KeyError::Io(error, "read n8n config")),
            };

            n8n_config.insert(
                "encryptionKey".to_string(),
                Value::String(key.expose().to_string()),
            );

            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| KeyError::Io(e, "create n8n directory"))?;
            }
            let contents = serde_json::to_string_pretty(&Value::Object(n8n_config))?;
            fs::write(&path, contents).map_err(|e| KeyError::Io(e, "write n8n config"))?;

            Ok(path)
        }
    }
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Failed to {1}: {0}")]
    Io(#[source] io::Error, &'static str),

    #[error("Invalid key length {0}, must be {KEY_LENGTH} characters")]
    InvalidLength(usize),

    #[error("Could not determine the home directory")]
    NoHome,

    #[error("n8n config {0:?} is not a JSON object")]
    NotAnObject(PathBuf),

    #[error("Failed to (de)serialize n8n config: {0}")]
    Json(#[from] serde_json::Error),
}

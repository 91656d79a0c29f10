use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Text encoding used for keys inside the persisted file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringEncoding {
    #[default]
    Utf8,
    Utf16,
}

impl StringEncoding {
    /// Bytes charged per key byte when estimating the serialized size of an entry.
    pub fn unit_size(self) -> usize {
        match self {
            StringEncoding::Utf8 => 1,
            StringEncoding::Utf16 => 2,
        }
    }
}

impl FromStr for StringEncoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(StringEncoding::Utf8),
            "utf16" | "utf-16" => Ok(StringEncoding::Utf16),
            other => Err(format!("unknown string encoding '{}'", other)),
        }
    }
}

impl fmt::Display for StringEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StringEncoding::Utf8 => f.write_str("utf8"),
            StringEncoding::Utf16 => f.write_str("utf16"),
        }
    }
}

/// Everything a [`Database`](crate::engine::Database) needs to know at construction.
///
/// Case sensitivity, encoding and the whole-file encryption key are fixed for the
/// lifetime of a store; changing them means re-creating it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Backing file. `None` (or an empty path) keeps the store in memory only.
    pub path: Option<PathBuf>,
    /// Compare keys case-insensitively.
    pub ignore_case: bool,
    /// Encoding of keys inside the persisted file.
    pub string_encoding: StringEncoding,
    /// Write a full snapshot after every drained batch, removal and clear.
    pub serialize_on_update: bool,
    /// Publish a [`ChangeEvent`](crate::engine::ChangeEvent) for every mutation.
    pub trigger_update_events: bool,
    /// Whole-file encryption passphrase. `None` (or empty) disables encryption.
    pub encryption_key: Option<String>,
    /// Fail loading when the file cannot be decrypted instead of starting empty.
    pub strict_decryption: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            ignore_case: false,
            string_encoding: StringEncoding::Utf8,
            serialize_on_update: false,
            trigger_update_events: false,
            encryption_key: None,
            strict_decryption: false,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("path", &self.path)
            .field("ignore_case", &self.ignore_case)
            .field("string_encoding", &self.string_encoding)
            .field("serialize_on_update", &self.serialize_on_update)
            .field("trigger_update_events", &self.trigger_update_events)
            .field("encryption_key", &self.encryption_key().map(|_| "[REDACTED]"))
            .field("strict_decryption", &self.strict_decryption)
            .finish()
    }
}

impl DatabaseConfig {
    /// A store that never touches the disk.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A store backed by the file at `path`.
    pub fn file<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    pub fn with_ignore_case(mut self, ignore_case: bool) -> Self {
        self.ignore_case = ignore_case;
        self
    }

    pub fn with_string_encoding(mut self, encoding: StringEncoding) -> Self {
        self.string_encoding = encoding;
        self
    }

    pub fn with_serialize_on_update(mut self, enabled: bool) -> Self {
        self.serialize_on_update = enabled;
        self
    }

    pub fn with_update_events(mut self, enabled: bool) -> Self {
        self.trigger_update_events = enabled;
        self
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_strict_decryption(mut self, strict: bool) -> Self {
        self.strict_decryption = strict;
        self
    }

    /// The backing file, if the store is persisted.
    pub fn file_path(&self) -> Option<&Path> {
        self.path
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    pub fn is_in_memory(&self) -> bool {
        self.file_path().is_none()
    }

    /// The whole-file passphrase, if encryption is enabled.
    pub fn encryption_key(&self) -> Option<&str> {
        self.encryption_key.as_deref().filter(|k| !k.is_empty())
    }

    /// Loads a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Builds a configuration from `QUIVER_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().apply_env()
    }

    /// Overrides fields with any `QUIVER_*` environment variables that are set.
    ///
    /// Unparseable values are ignored with a warning rather than failing.
    pub fn apply_env(mut self) -> Self {
        if let Ok(path) = env::var("QUIVER_PATH") {
            self.path = Some(PathBuf::from(path));
        }
        if let Some(v) = env_flag("QUIVER_IGNORE_CASE") {
            self.ignore_case = v;
        }
        if let Ok(encoding) = env::var("QUIVER_ENCODING") {
            match encoding.parse() {
                Ok(e) => self.string_encoding = e,
                Err(e) => log::warn!("Ignoring QUIVER_ENCODING: {}", e),
            }
        }
        if let Some(v) = env_flag("QUIVER_SERIALIZE_ON_UPDATE") {
            self.serialize_on_update = v;
        }
        if let Some(v) = env_flag("QUIVER_UPDATE_EVENTS") {
            self.trigger_update_events = v;
        }
        if let Ok(key) = env::var("QUIVER_ENCRYPTION_KEY") {
            self.encryption_key = Some(key);
        }
        if let Some(v) = env_flag("QUIVER_STRICT_DECRYPTION") {
            self.strict_decryption = v;
        }
        self
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let raw = env::var(name).ok()?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            log::warn!("Ignoring {}: expected a boolean, got '{}'", name, raw);
            None
        }
    }
}

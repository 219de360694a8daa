//! Statement source provider.
//!
//! Maps a logical key (a DAO or domain name such as `"Order"`) plus a
//! connection name to the definition file holding that domain's statements.
//! The same key may point at different files under different connections,
//! so repository code asking for "the Order statements" does not care which
//! physical database backs them.

use crate::error::{SqlMapError, SqlMapResult};
use crate::models::DEFAULT_CONNECTION;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One `(key, connection) -> source` registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderRegistration {
    pub key: String,
    pub source: PathBuf,
    pub connection_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// Outcome of [`SqlMapProvider::add_file`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// The pair was already registered; `previous` is the replaced source.
    Replaced { previous: PathBuf },
}

/// Registry of statement sources addressed by `(key, connection)`.
///
/// A `None` connection always means the provider's default connection name,
/// both when registering and when looking up.
#[derive(Debug, Clone)]
pub struct SqlMapProvider {
    entries: BTreeMap<(String, String), ProviderRegistration>,
    default_connection: String,
}

impl Default for SqlMapProvider {
    fn default() -> Self {
        Self::with_default_connection(DEFAULT_CONNECTION)
    }
}

impl SqlMapProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose `None` connection is `name`.
    ///
    /// Pass the session factory's default connection so that registering
    /// and executing agree on which connection `None` means.
    pub fn with_default_connection(name: impl Into<String>) -> Self {
        Self {
            entries: BTreeMap::new(),
            default_connection: name.into(),
        }
    }

    pub fn default_connection(&self) -> &str {
        &self.default_connection
    }

    fn connection_or_default<'a>(&'a self, connection: Option<&'a str>) -> &'a str {
        connection.unwrap_or(&self.default_connection)
    }

    /// Register `source` for `key` under `connection` (`None` = default).
    ///
    /// Re-registering a pair replaces it; the result says which happened.
    pub fn add_file(
        &mut self,
        key: &str,
        source: impl Into<PathBuf>,
        connection: Option<&str>,
        description: Option<&str>,
    ) -> Registration {
        let connection_name = self.connection_or_default(connection).to_string();
        let registration = ProviderRegistration {
            key: key.to_string(),
            source: source.into(),
            connection_name: connection_name.clone(),
            description: description.map(String::from),
            registered_at: Utc::now(),
        };
        debug!(
            key = %key,
            connection = %connection_name,
            source = %registration.source.display(),
            "Registering SQL map"
        );

        match self
            .entries
            .insert((key.to_string(), connection_name), registration)
        {
            Some(previous) => {
                warn!(
                    key = %key,
                    connection = %previous.connection_name,
                    previous = %previous.source.display(),
                    "SQL map key re-registered; replacing previous source"
                );
                Registration::Replaced {
                    previous: previous.source,
                }
            }
            None => Registration::Added,
        }
    }

    /// Source registered for `key` under `connection`, if any.
    pub fn get_source(&self, key: &str, connection: Option<&str>) -> Option<&Path> {
        self.entry(key, connection).map(|r| r.source.as_path())
    }

    pub fn has_entry(&self, key: &str, connection: Option<&str>) -> bool {
        self.entry(key, connection).is_some()
    }

    fn entry(&self, key: &str, connection: Option<&str>) -> Option<&ProviderRegistration> {
        let connection = self.connection_or_default(connection);
        self.entries.get(&(key.to_string(), connection.to_string()))
    }

    /// Register every file in `directory` matching `pattern` under `connection`.
    ///
    /// The key of each file is its name without extension. The listing is not
    /// recursive and files are registered in name order. `pattern` supports
    /// `*` and `?` and is matched case-insensitively (default `*.xml`).
    pub fn auto_discover(
        &mut self,
        directory: impl AsRef<Path>,
        connection: Option<&str>,
        pattern: Option<&str>,
    ) -> SqlMapResult<Vec<String>> {
        let directory = directory.as_ref();
        let pattern = pattern.unwrap_or(crate::config::DEFAULT_SQL_MAP_PATTERN);
        if !directory.is_dir() {
            return Err(SqlMapError::DirectoryNotFound {
                directory: directory.to_path_buf(),
            });
        }

        let read_error = |e: std::io::Error| {
            SqlMapError::configuration(
                format!("Cannot list SQL map directory '{}': {}", directory.display(), e),
                "Check the directory permissions",
            )
        };
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in std::fs::read_dir(directory).map_err(read_error)? {
            let path = entry.map_err(read_error)?.path();
            let matches = path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| wildcard_match(pattern, n));
            if matches {
                files.push(path);
            }
        }

        if files.is_empty() {
            return Err(SqlMapError::NoMatches {
                directory: directory.to_path_buf(),
                pattern: pattern.to_string(),
            });
        }
        files.sort();

        let mut keys = Vec::with_capacity(files.len());
        for path in files {
            let Some(key) = path.file_stem().and_then(|s| s.to_str()).map(String::from) else {
                continue;
            };
            self.add_file(&key, path, connection, Some("auto-discovered"));
            keys.push(key);
        }

        info!(
            directory = %directory.display(),
            connection = %self.connection_or_default(connection),
            files = keys.len(),
            "Discovered SQL maps"
        );
        Ok(keys)
    }

    /// Distinct connection names with at least one registration, sorted.
    pub fn list_connection_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .entries
            .keys()
            .map(|(_, connection)| connection.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Registrations for one connection, ordered by key.
    pub fn list_by_connection(&self, connection: &str) -> Vec<&ProviderRegistration> {
        self.entries
            .values()
            .filter(|r| r.connection_name == connection)
            .collect()
    }

    /// All registrations, ordered by key then connection.
    pub fn registrations(&self) -> impl Iterator<Item = &ProviderRegistration> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Source for `key` under `connection`, or a configuration error saying
    /// how to register it.
    pub fn resolve(&self, key: &str, connection: Option<&str>) -> SqlMapResult<&Path> {
        self.get_source(key, connection)
            .ok_or_else(|| self.missing_keys_error(&[key], connection))
    }

    /// Sources for all `keys`; the error lists every missing key at once.
    pub fn resolve_all<S: AsRef<str>>(
        &self,
        keys: &[S],
        connection: Option<&str>,
    ) -> SqlMapResult<Vec<&Path>> {
        let mut sources = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in keys {
            match self.get_source(key.as_ref(), connection) {
                Some(source) => sources.push(source),
                None => missing.push(key.as_ref()),
            }
        }
        if !missing.is_empty() {
            return Err(self.missing_keys_error(&missing, connection));
        }
        Ok(sources)
    }

    fn missing_keys_error(&self, missing: &[&str], connection: Option<&str>) -> SqlMapError {
        let connection = self.connection_or_default(connection);
        let connection_arg = if connection == self.default_connection {
            "None".to_string()
        } else {
            format!("Some(\"{}\")", connection)
        };
        let examples: Vec<String> = missing
            .iter()
            .map(|key| {
                format!(
                    "provider.add_file(\"{key}\", \"SqlMaps/{key}.xml\", {connection_arg}, None)"
                )
            })
            .collect();

        let registered: Vec<&str> = self
            .list_by_connection(connection)
            .iter()
            .map(|r| r.key.as_str())
            .collect();
        let message = format!(
            "SQL map key(s) {} not registered for connection '{}' (registered: {})",
            missing
                .iter()
                .map(|k| format!("'{}'", k))
                .collect::<Vec<_>>()
                .join(", "),
            connection,
            if registered.is_empty() {
                "none".to_string()
            } else {
                registered.join(", ")
            }
        );
        SqlMapError::configuration(message, format!("Register them at startup: {}", examples.join("; ")))
    }
}

/// Case-insensitive glob match supporting `*` and `?`.
fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, n));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            n = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

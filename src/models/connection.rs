//! Connection-related data models.
//!
//! This module defines types for named connection configuration and session state.

use crate::config::PoolOptions;
use serde::{Deserialize, Serialize};

/// Name used when no connection is specified.
pub const DEFAULT_CONNECTION: &str = "Default";

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

/// Positional placeholder syntax understood by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` (MySQL, SQLite)
    Question,
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
}

const URL_SCHEMES: &[(&str, DatabaseType)] = &[
    ("postgres", DatabaseType::PostgreSQL),
    ("postgresql", DatabaseType::PostgreSQL),
    ("mysql", DatabaseType::MySQL),
    ("mariadb", DatabaseType::MySQL),
    ("sqlite", DatabaseType::SQLite),
];

impl DatabaseType {
    /// Backend named by the URL scheme of a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let (scheme, _) = connection_string.trim().split_once(':')?;
        URL_SCHEMES
            .iter()
            .find(|(name, _)| scheme.eq_ignore_ascii_case(name))
            .map(|(_, db_type)| *db_type)
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    pub fn placeholder_style(&self) -> PlaceholderStyle {
        match self {
            Self::PostgreSQL => PlaceholderStyle::Dollar,
            Self::MySQL | Self::SQLite => PlaceholderStyle::Question,
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Transaction isolation level requested when a session begins a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL keyword form, e.g. `READ COMMITTED`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Configuration for one named physical connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub db_type: DatabaseType,
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
    /// Connection pool configuration options.
    #[serde(default)]
    pub pool_options: PoolOptions,
}

impl ConnectionConfig {
    /// Create a new connection configuration.
    pub fn new(
        name: impl Into<String>,
        connection_string: impl Into<String>,
        pool_options: PoolOptions,
    ) -> Result<Self, ConnectionConfigError> {
        let name = name.into();
        let connection_string = connection_string.into();

        if name.trim().is_empty() {
            return Err(ConnectionConfigError::EmptyName);
        }
        if !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConnectionConfigError::InvalidName(name));
        }

        let db_type = DatabaseType::from_connection_string(&connection_string)
            .ok_or_else(|| ConnectionConfigError::UnknownDatabaseType(mask(&connection_string)))?;

        Ok(Self {
            name,
            db_type,
            connection_string,
            pool_options,
        })
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        mask(&self.connection_string)
    }
}

/// Replace the URL password, if any, with `****`.
fn mask(connection_string: &str) -> String {
    match url::Url::parse(connection_string) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("****"));
            url.to_string()
        }
        _ => connection_string.to_string(),
    }
}

/// Errors that can occur when creating a connection configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionConfigError {
    #[error("Connection name cannot be empty")]
    EmptyName,

    #[error("Connection name contains invalid characters: {0}")]
    InvalidName(String),

    #[error("Unknown database type in connection string: {0}")]
    UnknownDatabaseType(String),
}

/// Transaction sub-state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    NoTransaction,
    Active,
    Committed,
    RolledBack,
}

impl TransactionState {
    /// Check if a transaction is currently open.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

//! Error types for the SQL map layer.
//!
//! Every failure the mapping layer can produce is a variant of [`SqlMapError`],
//! split by kind so callers can match on it instead of inspecting messages.
//! Configuration problems carry a suggestion describing how to fix them.

use crate::models::StatementKind;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SqlMapError {
    #[error("Configuration error: {message}")]
    Configuration { message: String, suggestion: String },

    #[error("SQL map directory not found: {}", directory.display())]
    DirectoryNotFound { directory: PathBuf },

    #[error("No SQL map files found in '{}' matching pattern '{pattern}'", directory.display())]
    NoMatches { directory: PathBuf, pattern: String },

    #[error("SQL map file not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("Failed to parse SQL map '{origin}': {message}")]
    Parse { origin: String, message: String },

    #[error("SQL statement '{statement_id}' not found in configuration")]
    StatementNotFound { statement_id: String },

    #[error("Statement '{statement_id}' is of type '{actual}' but {expected} was expected")]
    TypeMismatch {
        statement_id: String,
        actual: StatementKind,
        expected: String,
    },

    #[error("Invalid session state: {message}")]
    InvalidState { message: String },

    #[error("Invalid parameter: {message}")]
    InvalidParameter { message: String },

    #[error("Statement '{statement_id}' failed after {elapsed_ms}ms: {source}")]
    Execution {
        statement_id: String,
        elapsed_ms: u64,
        #[source]
        source: Box<SqlMapError>,
    },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "40001" for a serialization failure
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Failed to materialize result: {message}")]
    Decode { message: String },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl SqlMapError {
    /// Create a configuration error with a corrective suggestion.
    pub fn configuration(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a parse error for the named source.
    pub fn parse(origin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            origin: origin.into(),
            message: message.into(),
        }
    }

    pub fn statement_not_found(statement_id: impl Into<String>) -> Self {
        Self::StatementNotFound {
            statement_id: statement_id.into(),
        }
    }

    pub fn type_mismatch(
        statement_id: impl Into<String>,
        actual: StatementKind,
        expected: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            statement_id: statement_id.into(),
            actual,
            expected: expected.into(),
        }
    }

    pub fn invalid_parameter(message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Wrap a driver-level failure with the statement it belongs to.
    pub fn execution(statement_id: impl Into<String>, elapsed_ms: u64, source: SqlMapError) -> Self {
        Self::Execution {
            statement_id: statement_id.into(),
            elapsed_ms,
            source: Box::new(source),
        }
    }

    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Configuration { suggestion, .. } => Some(suggestion),
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::DirectoryNotFound { .. } => {
                Some("Check the path passed to auto_discover; it is resolved against the working directory")
            }
            Self::NoMatches { .. } => Some("Check the search pattern or add SQL map files to the directory"),
            Self::Execution { source, .. } => source.suggestion(),
            _ => None,
        }
    }

    /// The statement id attached to this error, if any.
    pub fn statement_id(&self) -> Option<&str> {
        match self {
            Self::StatementNotFound { statement_id }
            | Self::TypeMismatch { statement_id, .. }
            | Self::Execution { statement_id, .. } => Some(statement_id),
            _ => None,
        }
    }

    /// Setup-time errors that retrying cannot fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration { .. }
                | Self::DirectoryNotFound { .. }
                | Self::NoMatches { .. }
                | Self::SourceNotFound { .. }
                | Self::Parse { .. }
                | Self::InvalidParameter { .. }
        )
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Execution { source, .. } => source.is_retryable(),
            _ => self.is_deadlock(),
        }
    }

    /// Deadlocks, serialization failures and busy databases.
    pub fn is_deadlock(&self) -> bool {
        match self {
            Self::Database {
                message, sql_state, ..
            } => {
                let state_matches = sql_state
                    .as_deref()
                    .is_some_and(|s| matches!(s, "40001" | "40P01" | "1213" | "1205" | "5" | "517"));
                let lower = message.to_lowercase();
                state_matches || lower.contains("deadlock") || lower.contains("database is locked")
            }
            Self::Execution { source, .. } => source.is_deadlock(),
            _ => false,
        }
    }
}

/// Suggestion for a driver error, chosen by SQLSTATE class where one is known.
fn database_suggestion(code: Option<&str>, message: &str) -> &'static str {
    let lower = message.to_lowercase();
    match code.map(|c| c.get(..2).unwrap_or(c)) {
        Some("23") => "A constraint rejected the change; check keys and NOT NULL columns",
        Some("40") => "The transaction conflicted with another one; retry it",
        Some("42") => "Check the statement text and the tables and columns it references",
        Some("22") => "A parameter value does not fit the column type",
        _ if lower.contains("constraint") => {
            "A constraint rejected the change; check keys and NOT NULL columns"
        }
        _ if lower.contains("no such") || lower.contains("syntax") => {
            "Check the statement text and the tables and columns it references"
        }
        _ => "Check the statement text and parameters",
    }
}

impl From<sqlx::Error> for SqlMapError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::Error as E;

        match err {
            E::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                let suggestion = database_suggestion(code.as_deref(), db_err.message());
                Self::database(db_err.message(), code, suggestion)
            }
            E::Configuration(msg) => {
                Self::connection(msg.to_string(), "Check the connection string and credentials")
            }
            E::Io(e) => Self::connection(
                format!("I/O error: {}", e),
                "Check network connectivity and that the database server is up",
            ),
            E::Tls(e) => Self::connection(
                format!("TLS error: {}", e),
                "Check the TLS settings and certificates",
            ),
            E::Protocol(msg) => Self::connection(
                format!("Protocol error: {}", msg),
                "Check that the server version is supported",
            ),
            E::PoolClosed => Self::connection(
                "Connection pool is closed",
                "Create a new session factory",
            ),
            E::PoolTimedOut => Self::timeout(
                "acquiring a pooled connection",
                crate::config::DEFAULT_ACQUIRE_TIMEOUT_SECS,
            ),
            E::RowNotFound => Self::decode("Statement returned no rows"),
            E::ColumnNotFound(column) => Self::decode(format!("Column '{}' not found", column)),
            E::ColumnIndexOutOfBounds { index, len } => Self::decode(format!(
                "Column index {} is out of bounds for a row of {} columns",
                index, len
            )),
            E::ColumnDecode { index, source } => {
                Self::decode(format!("Column {}: {}", index, source))
            }
            E::Decode(source) => Self::decode(source.to_string()),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Result type alias for SQL map operations.
pub type SqlMapResult<T> = Result<T, SqlMapError>;

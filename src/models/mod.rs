//! Data models for the SQL map layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod params;
pub mod statement;

// Re-export commonly used types
pub use connection::{
    ConnectionConfig, ConnectionConfigError, DEFAULT_CONNECTION, DatabaseType, IsolationLevel,
    PlaceholderStyle, TransactionState,
};
pub use params::{DEFAULT_QUERY_TIMEOUT_SECS, Param, Params};
pub use statement::{Operation, Statement, StatementKind};

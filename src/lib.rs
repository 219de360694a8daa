//! SQL Map Library
//!
//! Named SQL statements loaded from XML definition files, resolved per
//! logical key and named connection, and executed inside session-scoped
//! transactions (SQLite, PostgreSQL, MySQL).

pub mod config;
pub mod db;
pub mod error;
pub mod mapping;
pub mod models;
pub mod repository;
pub mod service;
pub mod transaction;

pub use config::{Config, ConnectionStrings};
pub use db::{Session, SessionFactory, SqlMapper};
pub use error::{SqlMapError, SqlMapResult};
pub use mapping::{SqlMapProvider, StatementRegistry};
pub use models::{Param, Params, Statement, StatementKind};
pub use repository::{SqlMapRepository, StatementSource};
pub use service::{DaoContext, MappedSession, SqlService};
pub use transaction::{RetryPolicy, run_batch, run_in_transaction, with_retry};

//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection pool management
//! - Sessions owning one connection and its transaction
//! - Statement execution with placeholder rewriting
//! - Type mappings
//! - Database dispatch macros for reducing code duplication

#[macro_use]
pub mod macros;
pub mod connection;
pub mod executor;
pub mod factory;
pub mod params;
pub mod placeholders;
pub mod pool;
pub mod session;
pub mod types;

pub use connection::{BoundCommand, Connection, ConnectionFactory, DbConnection};
pub use executor::SqlMapper;
pub use factory::SessionFactory;
pub use placeholders::{BoundSql, bind_params};
pub use pool::{DbPool, PoolConnectionFactory};
pub use session::{Command, Session, TransactionInfo};
pub use types::JsonRow;

//! Physical connection abstraction.
//!
//! A [`Connection`] is one exclusive database connection owned by a
//! [`Session`](crate::db::Session). Transaction control is expressed as plain
//! statements on that connection so the session can hold it across calls.
//!
//! # Architecture
//!
//! The sqlx implementation keeps one pooled connection per backend and uses
//! database-specific submodules for fetching and executing, the same way the
//! pool keeps one `DbPool` variant per backend.

use crate::db::params::{bind_mysql_param, bind_postgres_param, bind_sqlite_param};
use crate::db::types::{JsonRow, RowToJson};
use crate::error::{SqlMapError, SqlMapResult};
use crate::models::{ConnectionConfig, DatabaseType, IsolationLevel, Param};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use sqlx::pool::PoolConnection;
use sqlx::{MySql, Postgres, Sqlite};
use tracing::debug;

/// Driver-ready statement text with its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundCommand {
    pub statement_id: String,
    pub sql: String,
    pub params: Vec<Param>,
}

/// One exclusive physical connection.
#[async_trait]
pub trait Connection: Send {
    fn database_type(&self) -> DatabaseType;

    /// Start a transaction, optionally at a specific isolation level.
    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> SqlMapResult<()>;

    async fn commit(&mut self) -> SqlMapResult<()>;

    async fn rollback(&mut self) -> SqlMapResult<()>;

    /// Fetch rows, stopping after `limit` rows when given.
    async fn fetch_rows(
        &mut self,
        command: &BoundCommand,
        limit: Option<usize>,
    ) -> SqlMapResult<Vec<JsonRow>>;

    /// Execute a command and return the affected row count.
    async fn execute(&mut self, command: &BoundCommand) -> SqlMapResult<u64>;

    /// Release the connection. Further calls fail with `InvalidState`.
    async fn close(&mut self) -> SqlMapResult<()>;

    /// Discard the connection without returning it for reuse.
    ///
    /// Used when the connection may still hold an open transaction that
    /// could not be rolled back.
    fn abandon(&mut self);
}

/// Opens physical connections for named connection configurations.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> SqlMapResult<Box<dyn Connection>>;

    /// Shut down whatever this factory holds open. A later `connect` may
    /// open it again.
    async fn close(&self) {}
}

/// Backend-specific pooled connection.
pub(crate) enum PooledConnection {
    MySql(PoolConnection<MySql>),
    Postgres(PoolConnection<Postgres>),
    SQLite(PoolConnection<Sqlite>),
}

/// sqlx-backed [`Connection`] holding a connection checked out of a pool.
pub struct DbConnection {
    connection_name: String,
    db_type: DatabaseType,
    inner: Option<PooledConnection>,
}

impl DbConnection {
    pub(crate) fn new(connection_name: &str, inner: PooledConnection) -> Self {
        let db_type = match &inner {
            PooledConnection::MySql(_) => DatabaseType::MySQL,
            PooledConnection::Postgres(_) => DatabaseType::PostgreSQL,
            PooledConnection::SQLite(_) => DatabaseType::SQLite,
        };
        Self {
            connection_name: connection_name.to_string(),
            db_type,
            inner: Some(inner),
        }
    }

    fn inner(&mut self) -> SqlMapResult<&mut PooledConnection> {
        self.inner.as_mut().ok_or_else(|| {
            SqlMapError::invalid_state(format!(
                "Connection '{}' has already been released",
                self.connection_name
            ))
        })
    }

    /// Run transaction-control statements through the simple query protocol.
    async fn run_control(&mut self, statements: &[String]) -> SqlMapResult<()> {
        let inner = self.inner()?;
        for sql in statements {
            let sql = sql.as_str();
            impl_db_dispatch!(PooledConnection, &mut *inner, {
                MySql(c) => sqlx::Executor::execute(&mut **c, sql).await.map(|_| ()),
                Postgres(c) => sqlx::Executor::execute(&mut **c, sql).await.map(|_| ()),
                SQLite(c) => sqlx::Executor::execute(&mut **c, sql).await.map(|_| ()),
            })?;
        }
        Ok(())
    }

    /// Statements that open a transaction on this backend.
    fn begin_statements(&self, isolation: Option<IsolationLevel>) -> Vec<String> {
        match (self.db_type, isolation) {
            (DatabaseType::PostgreSQL, Some(level)) => {
                vec![format!("BEGIN ISOLATION LEVEL {}", level.as_sql())]
            }
            (DatabaseType::MySQL, Some(level)) => vec![
                format!("SET TRANSACTION ISOLATION LEVEL {}", level.as_sql()),
                "START TRANSACTION".to_string(),
            ],
            (DatabaseType::MySQL, None) => vec!["START TRANSACTION".to_string()],
            // SQLite transactions are always serializable
            (DatabaseType::PostgreSQL, None) | (DatabaseType::SQLite, _) => {
                vec!["BEGIN".to_string()]
            }
        }
    }
}

#[async_trait]
impl Connection for DbConnection {
    fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    async fn begin(&mut self, isolation: Option<IsolationLevel>) -> SqlMapResult<()> {
        let statements = self.begin_statements(isolation);
        self.run_control(&statements).await
    }

    async fn commit(&mut self) -> SqlMapResult<()> {
        self.run_control(&["COMMIT".to_string()]).await
    }

    async fn rollback(&mut self) -> SqlMapResult<()> {
        self.run_control(&["ROLLBACK".to_string()]).await
    }

    async fn fetch_rows(
        &mut self,
        command: &BoundCommand,
        limit: Option<usize>,
    ) -> SqlMapResult<Vec<JsonRow>> {
        debug!(
            statement_id = %command.statement_id,
            params = command.params.len(),
            limit = ?limit,
            "Fetching rows"
        );
        match self.inner()? {
            PooledConnection::MySql(c) => mysql::fetch_rows(c, command, limit).await,
            PooledConnection::Postgres(c) => postgres::fetch_rows(c, command, limit).await,
            PooledConnection::SQLite(c) => sqlite::fetch_rows(c, command, limit).await,
        }
    }

    async fn execute(&mut self, command: &BoundCommand) -> SqlMapResult<u64> {
        debug!(
            statement_id = %command.statement_id,
            params = command.params.len(),
            "Executing command"
        );
        match self.inner()? {
            PooledConnection::MySql(c) => mysql::execute(c, command).await,
            PooledConnection::Postgres(c) => postgres::execute(c, command).await,
            PooledConnection::SQLite(c) => sqlite::execute(c, command).await,
        }
    }

    async fn close(&mut self) -> SqlMapResult<()> {
        // Dropping a pool connection returns it to its pool
        match self.inner.take() {
            Some(_) => Ok(()),
            None => Err(SqlMapError::invalid_state(format!(
                "Connection '{}' has already been released",
                self.connection_name
            ))),
        }
    }

    fn abandon(&mut self) {
        if let Some(inner) = self.inner.take() {
            impl_db_dispatch!(PooledConnection, inner, {
                MySql(c) => drop(c.detach()),
                Postgres(c) => drop(c.detach()),
                SQLite(c) => drop(c.detach()),
            });
        }
    }
}

// =============================================================================
// Common Helper Functions
// =============================================================================

async fn collect_rows<R: RowToJson>(
    mut stream: BoxStream<'_, Result<R, sqlx::Error>>,
    limit: Option<usize>,
) -> SqlMapResult<Vec<JsonRow>> {
    let mut rows = Vec::new();
    if limit == Some(0) {
        return Ok(rows);
    }
    while let Some(row) = stream.next().await {
        rows.push(row?.to_json_map()?);
        if limit.is_some_and(|l| rows.len() >= l) {
            break;
        }
    }
    Ok(rows)
}

// =============================================================================
// Database-Specific Implementations
// =============================================================================
//
// Each module below provides the same interface adapted to its database type.
// Commands without parameters run through the simple query protocol, which
// also accepts statements that cannot be prepared (CALL on MySQL, DDL).

mod mysql {
    use super::*;
    use sqlx::MySqlConnection;

    pub async fn fetch_rows(
        conn: &mut MySqlConnection,
        command: &BoundCommand,
        limit: Option<usize>,
    ) -> SqlMapResult<Vec<JsonRow>> {
        let stream = if command.params.is_empty() {
            sqlx::Executor::fetch(conn, command.sql.as_str())
        } else {
            let mut query = sqlx::query(&command.sql);
            for param in &command.params {
                query = bind_mysql_param(query, param);
            }
            query.fetch(conn)
        };
        collect_rows(stream, limit).await
    }

    pub async fn execute(conn: &mut MySqlConnection, command: &BoundCommand) -> SqlMapResult<u64> {
        let result = if command.params.is_empty() {
            sqlx::Executor::execute(conn, command.sql.as_str()).await
        } else {
            let mut query = sqlx::query(&command.sql);
            for param in &command.params {
                query = bind_mysql_param(query, param);
            }
            query.execute(conn).await
        };
        Ok(result?.rows_affected())
    }
}

mod postgres {
    use super::*;
    use sqlx::PgConnection;

    pub async fn fetch_rows(
        conn: &mut PgConnection,
        command: &BoundCommand,
        limit: Option<usize>,
    ) -> SqlMapResult<Vec<JsonRow>> {
        let stream = if command.params.is_empty() {
            sqlx::Executor::fetch(conn, command.sql.as_str())
        } else {
            let mut query = sqlx::query(&command.sql);
            for param in &command.params {
                query = bind_postgres_param(query, param);
            }
            query.fetch(conn)
        };
        collect_rows(stream, limit).await
    }

    pub async fn execute(conn: &mut PgConnection, command: &BoundCommand) -> SqlMapResult<u64> {
        let result = if command.params.is_empty() {
            sqlx::Executor::execute(conn, command.sql.as_str()).await
        } else {
            let mut query = sqlx::query(&command.sql);
            for param in &command.params {
                query = bind_postgres_param(query, param);
            }
            query.execute(conn).await
        };
        Ok(result?.rows_affected())
    }
}

mod sqlite {
    use super::*;
    use sqlx::SqliteConnection;

    pub async fn fetch_rows(
        conn: &mut SqliteConnection,
        command: &BoundCommand,
        limit: Option<usize>,
    ) -> SqlMapResult<Vec<JsonRow>> {
        let stream = if command.params.is_empty() {
            sqlx::Executor::fetch(conn, command.sql.as_str())
        } else {
            let mut query = sqlx::query(&command.sql);
            for param in &command.params {
                query = bind_sqlite_param(query, param);
            }
            query.fetch(conn)
        };
        collect_rows(stream, limit).await
    }

    pub async fn execute(conn: &mut SqliteConnection, command: &BoundCommand) -> SqlMapResult<u64> {
        let result = if command.params.is_empty() {
            sqlx::Executor::execute(conn, command.sql.as_str()).await
        } else {
            let mut query = sqlx::query(&command.sql);
            for param in &command.params {
                query = bind_sqlite_param(query, param);
            }
            query.execute(conn).await
        };
        Ok(result?.rows_affected())
    }
}
